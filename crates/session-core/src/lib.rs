//! # Cloudmedia Session Core
//!
//! Control plane of a multi-party WebRTC media server.
//!
//! This crate provides:
//! - Rooms ([`MediaSession`]) and their participants, each with a publisher
//!   endpoint and one subscriber endpoint per remote publisher
//! - Endpoint wrappers that bridge asynchronous media engine creation and
//!   buffer ICE candidates until the engine object exists
//! - Filter chains between a publisher and its outward pass-through
//! - A [`SessionRegistry`] and the transport-facing [`SessionManager`]
//! - A [`ClusterRouter`] that runs participant actions on the node owning
//!   the participant
//!
//! ## Architecture
//!
//! The transport calls the [`SessionManager`], which resolves the session and
//! participant, drives the session and reports every change through a
//! [`SessionEventSink`]. The media engine and the cluster substrate are
//! traits ([`MediaEngine`], [`ClusterConnectionRegistry`],
//! [`ClusterTransport`]) with in-memory implementations for tests and
//! single-process deployments.

pub mod api;
pub mod cluster;
pub mod config;
pub mod coordination;
pub mod endpoint;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logging;
pub mod manager;
pub mod session;

pub use api::types::{
    EndReason, FilterDescriptor, IceCandidate, MediaOptions, ParticipantIdentity, ParticipantRole, PublishRequest,
    SdpType, SessionId, SessionProperties, StreamProperty, Token,
};
pub use cluster::{
    ClusterConnection, ClusterConnectionRegistry, ClusterRouter, ClusterTask, ClusterTaskHandler, ClusterTaskResult,
    ClusterTransport, InMemoryClusterMesh, InMemoryConnectionRegistry,
};
pub use config::SessionCoreConfig;
pub use endpoint::{MediaEndpoint, PublisherEndpoint, RelayEndpoint, SubscriberEndpoint};
pub use engine::{ElementId, MediaEngine};
pub use errors::{Result, SessionError};
pub use events::{NotificationLog, RpcNotifier, SessionEventSink, SessionEventsHandler};
pub use logging::{LoggingConfig, setup_logging};
pub use manager::{SessionManager, SessionRegistry};
pub use session::{JoinRoomResponse, MediaSession, Participant, ParticipantSnapshot};

use std::sync::Arc;

/// Build a standalone [`SessionManager`] from a validated config.
///
/// Installs the logging subscriber unless one is already present.
pub fn init(
    config: SessionCoreConfig,
    engine: Arc<dyn MediaEngine>,
    notifier: Arc<dyn RpcNotifier>,
) -> Result<Arc<SessionManager>> {
    config.validate()?;
    setup_logging(&config.logging)?;
    tracing::info!("Session core starting on node {}", config.node_id);

    let events: Arc<dyn SessionEventSink> = Arc::new(SessionEventsHandler::new(notifier));
    Ok(SessionManager::new(Arc::new(config), engine, events))
}

/// Like [`init`], for a node of a cluster sharing `connections` and `transport`
pub fn init_clustered(
    config: SessionCoreConfig,
    engine: Arc<dyn MediaEngine>,
    notifier: Arc<dyn RpcNotifier>,
    connections: Arc<dyn ClusterConnectionRegistry>,
    transport: Arc<dyn ClusterTransport>,
) -> Result<Arc<SessionManager>> {
    config.validate()?;
    setup_logging(&config.logging)?;
    tracing::info!("Session core starting on node {} (clustered)", config.node_id);

    let router = Arc::new(ClusterRouter::new(&config, connections, transport));
    let events: Arc<dyn SessionEventSink> = Arc::new(SessionEventsHandler::new(notifier));
    Ok(SessionManager::with_cluster(Arc::new(config), engine, events, router))
}
