//! Cross-node routing of participant actions

pub mod connection;
pub mod router;
pub mod task;
pub mod transport;

pub use connection::{ClusterConnection, ClusterConnectionRegistry, InMemoryConnectionRegistry};
pub use router::ClusterRouter;
pub use task::{ClusterTask, ClusterTaskHandler, ClusterTaskResult};
pub use transport::{ClusterTransport, InMemoryClusterMesh};
