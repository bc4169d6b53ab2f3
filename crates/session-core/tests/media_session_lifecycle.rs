//! Session lifecycle through the manager
//!
//! These tests verify:
//! - Roster size follows joins and leaves
//! - The room1 join/publish/subscribe flow
//! - Leaving while others hold subscribers toward the leaver
//! - Recovery after a media engine restart

mod common;

use std::sync::Arc;

use cloudmedia_session_core::{EndReason, ParticipantRole, SessionError};
use common::*;
use pretty_assertions::assert_eq;

#[tokio::test]
async fn test_roster_follows_joins_and_leaves() {
    let node = standalone();
    let room = room(&node, "roster").await;
    let session = node.manager.get_session(&room).unwrap();

    let names = ["a", "b", "c", "d", "e"];
    for (i, name) in names.iter().enumerate() {
        join(&node, &room, name, ParticipantRole::Publisher).await;
        assert_eq!(session.participant_count(), i + 1);
    }

    let mut expected = names.len();
    for name in ["b", "d"] {
        node.manager
            .leave_room(&room, &format!("priv-{}", name), EndReason::Disconnect)
            .await
            .unwrap();
        expected -= 1;
        assert_eq!(session.participant_count(), expected);
    }

    // a repeated leave changes nothing
    node.manager.leave_room(&room, "priv-b", EndReason::Disconnect).await.unwrap();
    assert_eq!(session.participant_count(), expected);

    for name in ["a", "c", "e"] {
        node.manager
            .leave_room(&room, &format!("priv-{}", name), EndReason::Disconnect)
            .await
            .unwrap();
    }
    assert!(session.is_closed());
    assert_eq!(session.participant_count(), 0);
    assert!(matches!(
        node.manager.get_session(&room).unwrap_err(),
        SessionError::SessionNotFound { .. }
    ));
}

#[tokio::test]
async fn test_room1_publish_and_subscribe() {
    let node = standalone();
    let room = room(&node, "room1").await;
    let session = node.manager.get_session(&room).unwrap();

    join(&node, &room, "a", ParticipantRole::Publisher).await;
    let snapshots = session.snapshots();
    assert_eq!(snapshots.len(), 1);

    let response = node
        .manager
        .join_room(identity(&room, "b", ParticipantRole::Subscriber), false)
        .await
        .unwrap();
    assert_eq!(session.participant_count(), 2);
    assert_eq!(response.value.len(), 1);
    assert_eq!(response.value[0].public_id, "pub-a");
    assert!(response.value[0].streams.is_empty());

    // B's subscriber toward A exists before A publishes
    let b = session.participant("priv-b").unwrap();
    assert!(b.subscriber("pub-a").is_some());

    let stream_id = publish(&node, &room, "a").await;
    assert!(stream_id.starts_with("pub-a_CAMERA_"));
    assert!(node.log.methods_for("priv-b").contains(&"participantPublished".to_string()));
    assert!(!node.log.methods_for("priv-a").contains(&"participantPublished".to_string()));

    let answer = node
        .manager
        .subscribe(&room, "priv-b", &stream_id, "v=0 offer")
        .await
        .unwrap();
    assert!(answer.starts_with("answer:"));

    let subscriber = b.subscriber("pub-a").unwrap();
    assert!(subscriber.is_connected_to_publisher());
    assert_eq!(subscriber.name(), format!("pub-b_{}", stream_id));

    let a = session.participant("priv-a").unwrap();
    let passthru = a.publisher().unwrap().passthru().unwrap();
    let element = subscriber.endpoint().element().unwrap();
    assert!(node.engine.is_connected(&passthru, &element));

    // subscribing to yourself is refused
    let err = node
        .manager
        .subscribe(&room, "priv-a", &stream_id, "v=0")
        .await
        .unwrap_err();
    assert_eq!(err.code(), 105);
}

#[tokio::test]
async fn test_leave_releases_subscribers_toward_leaver() {
    let node = standalone();
    let room = room(&node, "room1").await;
    let session = node.manager.get_session(&room).unwrap();

    join(&node, &room, "a", ParticipantRole::Publisher).await;
    join(&node, &room, "b", ParticipantRole::Subscriber).await;
    let stream_id = publish(&node, &room, "a").await;
    node.manager.subscribe(&room, "priv-b", &stream_id, "v=0").await.unwrap();

    let b = session.participant("priv-b").unwrap();
    let element = b.subscriber("pub-a").unwrap().endpoint().element().unwrap();

    let left = node
        .manager
        .leave_room(&room, "priv-a", EndReason::Disconnect)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(left.public_id, "pub-a");
    assert!(b.subscriber("pub-a").is_none());
    assert!(node.engine.was_released(&element));
    assert!(node.log.methods_for("priv-b").contains(&"participantLeft".to_string()));
    assert_eq!(session.active_publishers(), 0);
    assert!(session.participant_private_id_from_stream_id(&stream_id).is_none());

    // second leave: no error, session untouched
    assert!(node
        .manager
        .leave_room(&room, "priv-a", EndReason::Disconnect)
        .await
        .unwrap()
        .is_none());
    assert!(!session.is_closed());
    assert_eq!(session.participant_count(), 1);
}

#[tokio::test]
async fn test_engine_restart_recovery() {
    let node = standalone();
    let room = room(&node, "room1").await;
    let session = node.manager.get_session(&room).unwrap();

    join(&node, &room, "a", ParticipantRole::Publisher).await;
    join(&node, &room, "b", ParticipantRole::Subscriber).await;
    let stream_id = publish(&node, &room, "a").await;
    node.manager.subscribe(&room, "priv-b", &stream_id, "v=0").await.unwrap();
    let old_publisher = session.participant("priv-a").unwrap().publisher().unwrap();
    node.log.clear();

    node.engine.simulate_restart();
    node.manager.on_media_engine_restart().await;

    for private_id in ["priv-a", "priv-b"] {
        let unpublished: Vec<_> = node
            .log
            .for_participant(private_id)
            .into_iter()
            .filter(|n| n.method == "participantUnpublished")
            .collect();
        assert_eq!(unpublished.len(), 1, "{}", private_id);
        assert_eq!(unpublished[0].params["reason"], "mediaServerDisconnect");
        assert_eq!(unpublished[0].params["connectionId"], "pub-a");
    }

    assert_eq!(node.engine.pipelines_created(), 2);
    assert_eq!(session.active_publishers(), 0);

    let a = session.participant("priv-a").unwrap();
    let fresh = a.publisher().unwrap();
    assert!(!Arc::ptr_eq(&fresh, &old_publisher));
    assert!(!fresh.is_negotiated());
    assert!(!a.is_streaming());
    // not materialized until it publishes
    assert_eq!(fresh.endpoint().state().label(), "UNCREATED");

    let b = session.participant("priv-b").unwrap();
    assert!(b.publisher().is_none());
    assert_eq!(b.subscriber_count(), 0);

    // the fresh publisher can publish again on the new pipeline
    publish(&node, &room, "a").await;
    assert_eq!(session.active_publishers(), 1);
}

#[tokio::test]
async fn test_join_into_missing_session() {
    let node = standalone();
    let room = cloudmedia_session_core::SessionId::new("nowhere");
    let err = node
        .manager
        .join_room(identity(&room, "a", ParticipantRole::Publisher), false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), 202);
}

#[tokio::test]
async fn test_failed_publish_rolls_back() {
    let node = standalone();
    let room = room(&node, "room1").await;
    let session = node.manager.get_session(&room).unwrap();
    join(&node, &room, "a", ParticipantRole::Publisher).await;
    join(&node, &room, "b", ParticipantRole::Publisher).await;

    let a = session.participant("priv-a").unwrap();
    let before = a.publisher().unwrap();

    // the publisher's filter cannot be created, so the publish fails
    node.engine.fail_element_kind("Filter", true);
    let request = cloudmedia_session_core::PublishRequest::from_params(&serde_json::json!({
        "sdpOffer": "v=0",
        "hasAudio": true,
        "hasVideo": true,
        "filter": {"type": "GStreamerFilter", "options": {"command": "videoflip"}}
    }))
    .unwrap();
    let err = node.manager.publish_video(&room, "priv-a", request).await.unwrap_err();
    assert_eq!(err.code(), 711);

    assert!(!a.is_streaming());
    assert_eq!(session.active_publishers(), 0);
    let after = a.publisher().unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert!(node.log.count("participantPublished") == 0);
}
