//! Cluster connection records
//!
//! One record per connected identity, keyed by public id, telling which node
//! owns it and which session it is in. The registry behind the trait must be
//! read-after-write consistent: a record written by one node is visible to
//! the next lookup from any node.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterConnection {
    pub public_id: String,
    pub private_id: String,
    pub node_id: String,
    pub session_id: Option<String>,
}

impl ClusterConnection {
    pub fn new(public_id: impl Into<String>, private_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            public_id: public_id.into(),
            private_id: private_id.into(),
            node_id: node_id.into(),
            session_id: None,
        }
    }

    pub fn in_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Distributed store of [`ClusterConnection`] records
#[async_trait]
pub trait ClusterConnectionRegistry: Send + Sync {
    async fn upsert(&self, connection: ClusterConnection) -> Result<()>;

    async fn get(&self, public_id: &str) -> Result<Option<ClusterConnection>>;

    async fn remove(&self, public_id: &str) -> Result<Option<ClusterConnection>>;

    /// Set or clear the session of an existing record. `false` if there is none.
    async fn set_session(&self, public_id: &str, session_id: Option<String>) -> Result<bool>;

    async fn session_connections(&self, session_id: &str) -> Result<Vec<ClusterConnection>>;
}

/// Single-process registry, shared by every node of an in-process cluster
#[derive(Debug, Default)]
pub struct InMemoryConnectionRegistry {
    connections: DashMap<String, ClusterConnection>,
}

impl InMemoryConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[async_trait]
impl ClusterConnectionRegistry for InMemoryConnectionRegistry {
    async fn upsert(&self, connection: ClusterConnection) -> Result<()> {
        tracing::trace!("Cluster connection {} on {}", connection.public_id, connection.node_id);
        self.connections.insert(connection.public_id.clone(), connection);
        Ok(())
    }

    async fn get(&self, public_id: &str) -> Result<Option<ClusterConnection>> {
        Ok(self.connections.get(public_id).map(|c| c.value().clone()))
    }

    async fn remove(&self, public_id: &str) -> Result<Option<ClusterConnection>> {
        Ok(self.connections.remove(public_id).map(|(_, c)| c))
    }

    async fn set_session(&self, public_id: &str, session_id: Option<String>) -> Result<bool> {
        match self.connections.get_mut(public_id) {
            Some(mut connection) => {
                connection.session_id = session_id;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn session_connections(&self, session_id: &str) -> Result<Vec<ClusterConnection>> {
        Ok(self
            .connections
            .iter()
            .filter(|c| c.session_id.as_deref() == Some(session_id))
            .map(|c| c.value().clone())
            .collect())
    }
}
