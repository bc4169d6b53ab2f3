//! Two nodes sharing a connection registry and an in-process mesh
//!
//! These tests verify:
//! - An action for a participant owned by another node runs on that node
//! - The remote result equals a local execution on the owning node
//! - Session close fans out to every node holding members
//! - Messages reach recipients on any node
//! - Leaving a session keeps the connection record; a closed connection drops it

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cloudmedia_session_core::engine::mock::MockMediaEngine;
use cloudmedia_session_core::{
    ClusterConnection, ClusterConnectionRegistry, ClusterTask, ClusterTaskHandler, EndReason, InMemoryClusterMesh,
    InMemoryConnectionRegistry, NotificationLog, ParticipantRole, Result, SessionError,
};
use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;

async fn join_with_relay(node: &Node, room: &cloudmedia_session_core::SessionId, name: &str) {
    node.manager
        .join_room(identity(room, name, ParticipantRole::Publisher), true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_join_registers_cluster_connection() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);

    let room = room(&a, "room1").await;
    join(&a, &room, "x", ParticipantRole::Publisher).await;

    let router = a.manager.cluster().unwrap();
    let owner = router.owner_of("pub-x").await.unwrap();
    assert_eq!(owner.node_id, "node-a");
    assert_eq!(owner.private_id, "priv-x");
    assert_eq!(owner.session_id.as_deref(), Some("room1"));

    a.manager.leave_room(&room, "priv-x", EndReason::Disconnect).await.unwrap();
    let record = router.owner_of("pub-x").await.unwrap();
    assert_eq!(record.session_id, None);
    assert!(router.session_connections("room1").await.unwrap().is_empty());

    a.manager.connection_closed("pub-x", "priv-x").await.unwrap();
    assert!(connections.is_empty());
}

#[tokio::test]
async fn test_connection_closed_leaves_session() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);

    let room = room(&a, "room1").await;
    join(&a, &room, "x", ParticipantRole::Publisher).await;
    join(&a, &room, "y", ParticipantRole::Publisher).await;

    a.manager.connection_closed("pub-x", "priv-x").await.unwrap();
    assert_eq!(a.log.methods_for("priv-y"), vec!["participantLeft".to_string()]);
    assert_eq!(a.manager.get_session(&room).unwrap().participant_count(), 1);
    assert_eq!(connections.len(), 1);
}

#[tokio::test]
async fn test_remote_offer_matches_local_execution() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let room_b = room(&b, "room1").await;
    join_with_relay(&a, &room_a, "p").await;
    join_with_relay(&b, &room_b, "q").await;

    let task = ClusterTask::ProcessSdpOffer {
        session_id: "room1".into(),
        public_id: "pub-q".into(),
        sdp_offer: "offer:from-a".into(),
    };
    let remote = a.manager.cluster().unwrap().route("pub-q", task.clone()).await.unwrap();
    let local = b.manager.cluster().unwrap().route("pub-q", task).await.unwrap();
    assert_eq!(remote, local);

    let q_relay = b
        .manager
        .get_session(&room_b)
        .unwrap()
        .participant("priv-q")
        .unwrap()
        .relay()
        .unwrap();
    let q_element = q_relay.endpoint().element().unwrap();
    assert_eq!(remote.into_answer().unwrap(), format!("answer:{}", q_element));
}

#[tokio::test]
async fn test_relay_to_remote_participant() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let room_b = room(&b, "room1").await;
    join_with_relay(&a, &room_a, "p").await;
    join_with_relay(&b, &room_b, "q").await;

    let answer = a.manager.relay_to_remote(&room_a, "priv-p", "pub-q").await.unwrap();
    assert!(answer.starts_with("answer:RtpEndpoint"));

    let p_relay = a
        .manager
        .get_session(&room_a)
        .unwrap()
        .participant("priv-p")
        .unwrap()
        .relay()
        .unwrap();
    assert_eq!(p_relay.remote_node().as_deref(), Some("node-b"));
}

#[tokio::test]
async fn test_relay_forwards_published_stream() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let room_b = room(&b, "room1").await;
    join_with_relay(&a, &room_a, "p").await;
    join_with_relay(&b, &room_b, "q").await;
    publish(&a, &room_a, "p").await;

    a.manager.relay_to_remote(&room_a, "priv-p", "pub-q").await.unwrap();

    let p = a.manager.get_session(&room_a).unwrap().participant("priv-p").unwrap();
    let passthru = p.publisher().unwrap().passthru().unwrap();
    let relay = p.relay().unwrap().endpoint().element().unwrap();
    assert!(a.engine.is_connected(&passthru, &relay));
}

#[tokio::test]
async fn test_send_message_crosses_nodes() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let room_b = room(&b, "room1").await;
    join(&a, &room_a, "p", ParticipantRole::Publisher).await;
    join(&b, &room_b, "q", ParticipantRole::Publisher).await;
    join(&b, &room_b, "r", ParticipantRole::Publisher).await;
    b.log.clear();

    a.manager
        .send_message(&room_a, "priv-p", &json!({"data": "hi", "type": "signal:chat", "to": ["pub-q"]}))
        .await
        .unwrap();
    let to_q = b.log.for_participant("priv-q");
    assert_eq!(to_q.len(), 1);
    assert_eq!(to_q[0].method, "sendMessage");
    assert_eq!(to_q[0].params["from"], "pub-p");
    assert_eq!(to_q[0].params["type"], "signal:chat");
    assert!(b.log.for_participant("priv-r").is_empty());

    // without a list: everyone on both nodes
    a.log.clear();
    b.log.clear();
    a.manager
        .send_message(&room_a, "priv-p", &json!({"data": "all"}))
        .await
        .unwrap();
    assert_eq!(a.log.count("sendMessage"), 1);
    assert_eq!(b.log.count("sendMessage"), 2);
}

#[tokio::test]
async fn test_send_message_to_unreachable_recipient() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let other = room(&b, "room2").await;
    join(&a, &room_a, "p", ParticipantRole::Publisher).await;
    join(&a, &room_a, "s", ParticipantRole::Publisher).await;
    join(&b, &other, "q", ParticipantRole::Publisher).await;
    a.log.clear();

    let err = a
        .manager
        .send_message(&room_a, "priv-p", &json!({"data": "hi", "to": ["pub-ghost", "pub-s"]}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 803);
    // the local recipient was still notified
    assert_eq!(a.log.methods_for("priv-s"), vec!["sendMessage".to_string()]);

    // known to the cluster, but in another session
    let err = a
        .manager
        .send_message(&room_a, "priv-p", &json!({"data": "hi", "to": ["pub-q"]}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), 803);
    assert!(b.log.for_participant("priv-q").is_empty());
}

/// Accepts connections but cannot record session membership
struct MembershipDown(InMemoryConnectionRegistry);

#[async_trait]
impl ClusterConnectionRegistry for MembershipDown {
    async fn upsert(&self, connection: ClusterConnection) -> Result<()> {
        self.0.upsert(connection).await
    }

    async fn get(&self, public_id: &str) -> Result<Option<ClusterConnection>> {
        self.0.get(public_id).await
    }

    async fn remove(&self, public_id: &str) -> Result<Option<ClusterConnection>> {
        self.0.remove(public_id).await
    }

    async fn set_session(&self, public_id: &str, session_id: Option<String>) -> Result<bool> {
        match session_id {
            Some(_) => Err(SessionError::transport("membership store unavailable")),
            None => self.0.set_session(public_id, None).await,
        }
    }

    async fn session_connections(&self, session_id: &str) -> Result<Vec<ClusterConnection>> {
        self.0.session_connections(session_id).await
    }
}

#[tokio::test]
async fn test_failed_cluster_registration_rolls_back_join() {
    let connections = Arc::new(MembershipDown(InMemoryConnectionRegistry::new()));
    let mesh = InMemoryClusterMesh::shared();
    let mut config = test_config("node-a");
    config.cluster_enabled = true;
    let manager = cloudmedia_session_core::init_clustered(
        config,
        MockMediaEngine::shared(),
        Arc::new(NotificationLog::new()),
        connections.clone(),
        mesh.clone(),
    )
    .unwrap();
    let entry: Arc<dyn ClusterTaskHandler> = manager.cluster().unwrap().clone();
    mesh.register("node-a", &entry);

    let room = manager
        .get_or_create_session("room1", Default::default())
        .await
        .unwrap()
        .session_id()
        .clone();
    let who = identity(&room, "x", ParticipantRole::Publisher);
    let err = manager.join_room(who.clone(), false).await.unwrap_err();
    assert_eq!(err.code(), 803);

    // the empty session was closed and pruned with its tokens
    assert!(manager.get_session(&room).is_err());
    assert_eq!(manager.registry().token_count(&room), 0);
    assert!(manager.registry().participant(&room, "pub-x").is_none());
    let record = connections.get("pub-x").await.unwrap().unwrap();
    assert_eq!(record.session_id, None);
}

#[tokio::test]
async fn test_remote_failure_keeps_its_error() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_b = room(&b, "room1").await;
    // q joins without a relay endpoint
    join(&b, &room_b, "q", ParticipantRole::Publisher).await;

    let task = ClusterTask::ProcessSdpOffer {
        session_id: "room1".into(),
        public_id: "pub-q".into(),
        sdp_offer: "v=0".into(),
    };
    let err = a
        .manager
        .cluster()
        .unwrap()
        .route("pub-q", task)
        .await
        .unwrap()
        .into_answer()
        .unwrap_err();
    assert!(matches!(err, SessionError::MediaEndpointError { .. }));
}

#[tokio::test]
async fn test_unreachable_node_times_out() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_b = room(&b, "room1").await;
    join_with_relay(&b, &room_b, "q").await;
    mesh.set_latency(Some(Duration::from_secs(5)));

    let task = ClusterTask::ProcessSdpOffer {
        session_id: "room1".into(),
        public_id: "pub-q".into(),
        sdp_offer: "v=0".into(),
    };
    let err = a.manager.cluster().unwrap().route("pub-q", task).await.unwrap_err();
    assert_eq!(err.code(), 804);
}

#[tokio::test]
async fn test_close_fans_out_to_other_nodes() {
    let connections = InMemoryConnectionRegistry::shared();
    let mesh = InMemoryClusterMesh::shared();
    let a = clustered("node-a", &connections, &mesh);
    let b = clustered("node-b", &connections, &mesh);

    let room_a = room(&a, "room1").await;
    let room_b = room(&b, "room1").await;
    join(&a, &room_a, "p", ParticipantRole::Publisher).await;
    join(&b, &room_b, "q", ParticipantRole::Publisher).await;

    assert!(a
        .manager
        .close_session(&room_a, EndReason::SessionClosedByServer)
        .await
        .unwrap());

    assert!(b.manager.get_session(&room_b).is_err());
    assert_eq!(b.log.methods_for("priv-q"), vec!["roomClosed".to_string()]);
    assert_eq!(a.log.methods_for("priv-p"), vec!["roomClosed".to_string()]);
    let router = a.manager.cluster().unwrap();
    assert!(router.session_connections("room1").await.unwrap().is_empty());
    // the connections are still open
    assert_eq!(connections.len(), 2);
}
