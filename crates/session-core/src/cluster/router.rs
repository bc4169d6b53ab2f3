//! Cluster Router
//!
//! Finds the node owning a participant and runs the action there: in-process
//! when it is this node, through the [`ClusterTransport`] otherwise. On the
//! owning node, tasks for one participant run one after another in the order
//! they were submitted.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::connection::{ClusterConnection, ClusterConnectionRegistry};
use super::task::{ClusterTask, ClusterTaskHandler, ClusterTaskResult};
use super::transport::ClusterTransport;
use crate::config::SessionCoreConfig;
use crate::coordination::KeyedTaskQueue;
use crate::errors::{Result, SessionError};

pub struct ClusterRouter {
    node_id: String,
    connections: Arc<dyn ClusterConnectionRegistry>,
    transport: Arc<dyn ClusterTransport>,
    queue: KeyedTaskQueue,
    dispatch_timeout: Duration,
    /// Runs tasks addressed to this node
    executor: RwLock<Option<Weak<dyn ClusterTaskHandler>>>,
}

impl ClusterRouter {
    pub fn new(
        config: &SessionCoreConfig,
        connections: Arc<dyn ClusterConnectionRegistry>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            connections,
            transport,
            queue: KeyedTaskQueue::new(config.participant_queue_capacity),
            dispatch_timeout: config.cluster_dispatch_timeout(),
            executor: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn connections(&self) -> &Arc<dyn ClusterConnectionRegistry> {
        &self.connections
    }

    /// Set the handler that executes tasks owned by this node
    pub fn bind_executor(&self, executor: &Arc<dyn ClusterTaskHandler>) {
        *self.executor.write() = Some(Arc::downgrade(executor));
    }

    /// Record a new connection as living on this node
    pub async fn register_connection(&self, public_id: &str, private_id: &str) -> Result<()> {
        self.connections
            .upsert(ClusterConnection::new(public_id, private_id, self.node_id.as_str()))
            .await
    }

    pub async fn join_session(&self, public_id: &str, session_id: &str) -> Result<()> {
        if !self.connections.set_session(public_id, Some(session_id.to_string())).await? {
            return Err(SessionError::transport(format!("No cluster connection for {}", public_id)));
        }
        tracing::debug!("Cluster: {} joined {} on {}", public_id, session_id, self.node_id);
        Ok(())
    }

    pub async fn leave_session(&self, public_id: &str) -> Result<()> {
        self.connections.set_session(public_id, None).await?;
        Ok(())
    }

    pub async fn session_connections(&self, session_id: &str) -> Result<Vec<ClusterConnection>> {
        self.connections.session_connections(session_id).await
    }

    /// The connection is gone for good: drop its record and its queue
    pub async fn connection_closed(&self, public_id: &str) -> Result<()> {
        self.connections.remove(public_id).await?;
        self.queue.remove(public_id);
        Ok(())
    }

    pub async fn owner_of(&self, public_id: &str) -> Result<ClusterConnection> {
        self.connections
            .get(public_id)
            .await?
            .ok_or_else(|| SessionError::transport(format!("No cluster connection for {}", public_id)))
    }

    /// Run `task` on the node owning `public_id`
    pub async fn route(&self, public_id: &str, task: ClusterTask) -> Result<ClusterTaskResult> {
        let owner = self.owner_of(public_id).await?;
        if owner.node_id == self.node_id {
            tracing::debug!("Cluster: {} for {} runs locally", task.name(), public_id);
            self.run_local(task).await
        } else {
            tracing::debug!("Cluster: {} for {} dispatched to {}", task.name(), public_id, owner.node_id);
            self.dispatch(&owner.node_id, task).await
        }
    }

    /// Send `task` to every other node holding a member of `session_id`
    pub async fn broadcast_to_session(
        &self,
        session_id: &str,
        task: ClusterTask,
    ) -> Result<Vec<(String, Result<ClusterTaskResult>)>> {
        let nodes: BTreeSet<String> = self
            .session_connections(session_id)
            .await?
            .into_iter()
            .map(|c| c.node_id)
            .filter(|node| *node != self.node_id)
            .collect();

        let mut results = Vec::with_capacity(nodes.len());
        for node in nodes {
            let result = self.dispatch(&node, task.clone()).await;
            if let Err(e) = &result {
                tracing::warn!("Cluster: {} on {} failed: {}", task.name(), node, e);
            }
            results.push((node, result));
        }
        Ok(results)
    }

    /// Execute a task addressed to this node on its participant queue
    pub async fn run_local(&self, task: ClusterTask) -> Result<ClusterTaskResult> {
        let executor = self
            .executor
            .read()
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or_else(|| SessionError::transport(format!("Node {} has no task executor", self.node_id)))?;
        let key = task.queue_key().to_string();
        self.queue
            .run(&key, async move { executor.handle_task(task).await })
            .await
            .map_err(|e| SessionError::transport(e.to_string()))
    }

    async fn dispatch(&self, node_id: &str, task: ClusterTask) -> Result<ClusterTaskResult> {
        let payload = task.encode()?;
        match tokio::time::timeout(self.dispatch_timeout, self.transport.dispatch(node_id, payload)).await {
            Ok(Ok(bytes)) => ClusterTaskResult::decode(&bytes),
            Ok(Err(e)) => Err(SessionError::cluster_dispatch(node_id, e.to_string())),
            Err(_) => Err(SessionError::cluster_dispatch(
                node_id,
                format!("{} timed out after {:?}", task.name(), self.dispatch_timeout),
            )),
        }
    }
}

/// Entry point for tasks arriving from other nodes
#[async_trait]
impl ClusterTaskHandler for ClusterRouter {
    async fn handle_task(&self, task: ClusterTask) -> ClusterTaskResult {
        match self.run_local(task).await {
            Ok(result) => result,
            Err(e) => ClusterTaskResult::Failed(e),
        }
    }
}

impl std::fmt::Debug for ClusterRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterRouter")
            .field("node_id", &self.node_id)
            .field("dispatch_timeout", &self.dispatch_timeout)
            .field("active_queues", &self.queue.worker_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::EndReason;
    use crate::cluster::connection::InMemoryConnectionRegistry;
    use crate::cluster::transport::InMemoryClusterMesh;
    use parking_lot::Mutex;

    /// Records the order tasks ran in, slowing the first one down
    struct Recorder {
        node: String,
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterTaskHandler for Recorder {
        async fn handle_task(&self, task: ClusterTask) -> ClusterTaskResult {
            if let ClusterTask::ProcessSdpOffer { sdp_offer, .. } = &task {
                if sdp_offer == "slow" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                self.seen.lock().push(sdp_offer.clone());
                return ClusterTaskResult::SdpAnswer(format!("{}:{}", self.node, sdp_offer));
            }
            ClusterTaskResult::SessionClosed(true)
        }
    }

    struct Node {
        router: Arc<ClusterRouter>,
        recorder: Arc<Recorder>,
    }

    fn node(
        node_id: &str,
        timeout_ms: u64,
        registry: &Arc<InMemoryConnectionRegistry>,
        mesh: &Arc<InMemoryClusterMesh>,
    ) -> Node {
        let config = SessionCoreConfig {
            node_id: node_id.to_string(),
            cluster_dispatch_timeout_ms: timeout_ms,
            ..Default::default()
        };
        let router = Arc::new(ClusterRouter::new(&config, registry.clone(), mesh.clone()));
        let recorder = Arc::new(Recorder {
            node: node_id.to_string(),
            seen: Mutex::new(Vec::new()),
        });
        let executor: Arc<dyn ClusterTaskHandler> = recorder.clone();
        router.bind_executor(&executor);
        let entry: Arc<dyn ClusterTaskHandler> = router.clone();
        mesh.register(node_id, &entry);
        Node { router, recorder }
    }

    fn offer(public_id: &str, sdp: &str) -> ClusterTask {
        ClusterTask::ProcessSdpOffer {
            session_id: "room1".into(),
            public_id: public_id.into(),
            sdp_offer: sdp.into(),
        }
    }

    #[tokio::test]
    async fn test_local_and_remote_give_same_answer_shape() {
        let registry = InMemoryConnectionRegistry::shared();
        let mesh = InMemoryClusterMesh::shared();
        let a = node("node-a", 1000, &registry, &mesh);
        let b = node("node-b", 1000, &registry, &mesh);
        b.router.register_connection("pub-b", "priv-b").await.unwrap();

        let from_a = a.router.route("pub-b", offer("pub-b", "x")).await.unwrap();
        let from_b = b.router.route("pub-b", offer("pub-b", "x")).await.unwrap();
        assert_eq!(from_a, from_b);
        assert_eq!(from_a.into_answer().unwrap(), "node-b:x");
        assert!(a.recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_transport_error() {
        let registry = InMemoryConnectionRegistry::shared();
        let mesh = InMemoryClusterMesh::shared();
        let a = node("node-a", 1000, &registry, &mesh);
        let err = a.router.route("ghost", offer("ghost", "x")).await.unwrap_err();
        assert_eq!(err.code(), 803);
    }

    #[tokio::test]
    async fn test_dispatch_timeout() {
        let registry = InMemoryConnectionRegistry::shared();
        let mesh = InMemoryClusterMesh::shared();
        let a = node("node-a", 20, &registry, &mesh);
        let b = node("node-b", 20, &registry, &mesh);
        b.router.register_connection("pub-b", "priv-b").await.unwrap();
        mesh.set_latency(Some(Duration::from_millis(200)));

        let err = a.router.route("pub-b", offer("pub-b", "x")).await.unwrap_err();
        assert!(matches!(err, SessionError::ClusterDispatchError { .. }));
        assert!(err.is_recoverable());
    }

    #[tokio::test]
    async fn test_same_participant_runs_in_submission_order() {
        let registry = InMemoryConnectionRegistry::shared();
        let mesh = InMemoryClusterMesh::shared();
        let a = node("node-a", 1000, &registry, &mesh);
        a.router.register_connection("pub-a", "priv-a").await.unwrap();

        let first = {
            let router = a.router.clone();
            tokio::spawn(async move { router.route("pub-a", offer("pub-a", "slow")).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = a.router.route("pub-a", offer("pub-a", "fast")).await.unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(second.into_answer().unwrap(), "node-a:fast");
        assert_eq!(*a.recorder.seen.lock(), vec!["slow".to_string(), "fast".to_string()]);
    }

    #[tokio::test]
    async fn test_broadcast_skips_own_node() {
        let registry = InMemoryConnectionRegistry::shared();
        let mesh = InMemoryClusterMesh::shared();
        let a = node("node-a", 1000, &registry, &mesh);
        let b = node("node-b", 1000, &registry, &mesh);
        a.router.register_connection("pub-a", "priv-a").await.unwrap();
        b.router.register_connection("pub-b", "priv-b").await.unwrap();
        a.router.join_session("pub-a", "room1").await.unwrap();
        b.router.join_session("pub-b", "room1").await.unwrap();

        let task = ClusterTask::CloseSession {
            session_id: "room1".into(),
            reason: EndReason::SessionClosedByServer,
        };
        let results = a.router.broadcast_to_session("room1", task).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "node-b");

        a.router.connection_closed("pub-a").await.unwrap();
        assert_eq!(a.router.session_connections("room1").await.unwrap().len(), 1);
    }
}
