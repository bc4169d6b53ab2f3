//! Node-to-node delivery of encoded tasks

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::task::{ClusterTask, ClusterTaskHandler};
use crate::errors::{Result, SessionError};

/// Delivers an encoded [`ClusterTask`] to a node and returns the encoded result
#[async_trait]
pub trait ClusterTransport: Send + Sync {
    async fn dispatch(&self, node_id: &str, payload: Vec<u8>) -> Result<Vec<u8>>;
}

/// Transport connecting nodes that live in one process.
///
/// Frames still go through the codec so remote execution sees exactly what a
/// networked transport would deliver.
#[derive(Default)]
pub struct InMemoryClusterMesh {
    nodes: DashMap<String, Weak<dyn ClusterTaskHandler>>,
    latency: RwLock<Option<Duration>>,
}

impl InMemoryClusterMesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn register(&self, node_id: impl Into<String>, handler: &Arc<dyn ClusterTaskHandler>) {
        let node_id = node_id.into();
        tracing::debug!("Cluster mesh: node {} registered", node_id);
        self.nodes.insert(node_id, Arc::downgrade(handler));
    }

    pub fn unregister(&self, node_id: &str) -> bool {
        self.nodes.remove(node_id).is_some()
    }

    /// Delay every delivery, for exercising dispatch timeouts
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.write() = latency;
    }

    fn handler(&self, node_id: &str) -> Option<Arc<dyn ClusterTaskHandler>> {
        self.nodes.get(node_id).and_then(|h| h.value().upgrade())
    }
}

#[async_trait]
impl ClusterTransport for InMemoryClusterMesh {
    async fn dispatch(&self, node_id: &str, payload: Vec<u8>) -> Result<Vec<u8>> {
        let handler = self
            .handler(node_id)
            .ok_or_else(|| SessionError::transport(format!("Node {} is not reachable", node_id)))?;
        let latency = *self.latency.read();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        let task = ClusterTask::decode(&payload)?;
        tracing::trace!("Cluster mesh: delivering {} to {}", task.name(), node_id);
        handler.handle_task(task).await.encode()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::EndReason;
    use crate::cluster::task::ClusterTaskResult;

    struct Echo;

    #[async_trait]
    impl ClusterTaskHandler for Echo {
        async fn handle_task(&self, task: ClusterTask) -> ClusterTaskResult {
            ClusterTaskResult::SdpAnswer(task.queue_key().to_string())
        }
    }

    #[tokio::test]
    async fn test_dispatch_through_codec() {
        let mesh = InMemoryClusterMesh::new();
        let handler: Arc<dyn ClusterTaskHandler> = Arc::new(Echo);
        mesh.register("node-2", &handler);

        let task = ClusterTask::CloseSession {
            session_id: "room1".into(),
            reason: EndReason::SessionClosedByServer,
        };
        let bytes = mesh.dispatch("node-2", task.encode().unwrap()).await.unwrap();
        let result = ClusterTaskResult::decode(&bytes).unwrap();
        assert_eq!(result, ClusterTaskResult::SdpAnswer("room1".into()));
    }

    #[tokio::test]
    async fn test_dropped_node_is_unreachable() {
        let mesh = InMemoryClusterMesh::new();
        {
            let handler: Arc<dyn ClusterTaskHandler> = Arc::new(Echo);
            mesh.register("node-2", &handler);
        }
        let err = mesh.dispatch("node-2", vec![]).await.unwrap_err();
        assert!(matches!(err, SessionError::TransportError { .. }));
    }
}
