//! Shared setup for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use cloudmedia_session_core::engine::mock::MockMediaEngine;
use cloudmedia_session_core::{
    ClusterTaskHandler, InMemoryClusterMesh, InMemoryConnectionRegistry, MediaOptions, NotificationLog,
    ParticipantIdentity, ParticipantRole, PublishRequest, SessionCoreConfig, SessionId, SessionManager,
    SessionProperties, Token,
};

pub struct Node {
    pub manager: Arc<SessionManager>,
    pub engine: Arc<MockMediaEngine>,
    pub log: Arc<NotificationLog>,
}

pub fn test_config(node_id: &str) -> SessionCoreConfig {
    SessionCoreConfig {
        node_id: node_id.to_string(),
        endpoint_create_timeout_ms: 1_000,
        pipeline_recreate_timeout_ms: 1_000,
        cluster_dispatch_timeout_ms: 1_000,
        ..Default::default()
    }
}

pub fn standalone() -> Node {
    let engine = MockMediaEngine::shared();
    let log = Arc::new(NotificationLog::new());
    let manager = cloudmedia_session_core::init(test_config("node-1"), engine.clone(), log.clone()).unwrap();
    Node { manager, engine, log }
}

pub fn clustered(
    node_id: &str,
    connections: &Arc<InMemoryConnectionRegistry>,
    mesh: &Arc<InMemoryClusterMesh>,
) -> Node {
    let engine = MockMediaEngine::shared();
    let log = Arc::new(NotificationLog::new());
    let mut config = test_config(node_id);
    config.cluster_enabled = true;
    let manager = cloudmedia_session_core::init_clustered(
        config,
        engine.clone(),
        log.clone(),
        connections.clone(),
        mesh.clone(),
    )
    .unwrap();
    let entry: Arc<dyn ClusterTaskHandler> = manager.cluster().unwrap().clone();
    mesh.register(node_id, &entry);
    Node { manager, engine, log }
}

pub async fn room(node: &Node, id: &str) -> SessionId {
    node.manager
        .get_or_create_session(id, SessionProperties::default())
        .await
        .unwrap()
        .session_id()
        .clone()
}

pub fn identity(room: &SessionId, name: &str, role: ParticipantRole) -> ParticipantIdentity {
    ParticipantIdentity::new(
        format!("priv-{}", name),
        format!("pub-{}", name),
        room.clone(),
        Token::generate(role),
    )
}

pub async fn join(node: &Node, room: &SessionId, name: &str, role: ParticipantRole) {
    node.manager.join_room(identity(room, name, role), false).await.unwrap();
}

/// Publish audio and video for `name` and return the stream id
pub async fn publish(node: &Node, room: &SessionId, name: &str) -> String {
    let private_id = format!("priv-{}", name);
    node.manager
        .publish_video(
            room,
            &private_id,
            PublishRequest {
                sdp_offer: "v=0".into(),
                options: MediaOptions::audio_video(),
            },
        )
        .await
        .unwrap();
    node.manager
        .get_session(room)
        .unwrap()
        .participant(&private_id)
        .and_then(|p| p.publisher_stream_id())
        .unwrap()
}

/// Poll `check` until it holds or a second has passed
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
