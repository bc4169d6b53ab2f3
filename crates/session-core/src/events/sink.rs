//! Session Event Sink
//!
//! Translates room state changes into protocol notifications. Sending is
//! fire-and-forget for the core: a peer that cannot be reached is logged and
//! skipped so the operation that triggered the notification still completes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use super::notifier::RpcNotifier;
use crate::api::protocol::*;
use crate::api::types::{EndReason, IceCandidate, SessionId, StreamProperty};
use crate::session::ParticipantSnapshot;

/// Receiver of every state change the core reports outward
#[async_trait]
pub trait SessionEventSink: Send + Sync {
    async fn on_session_created(&self, session_id: &SessionId);

    async fn on_session_closed(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        reason: EndReason,
    );

    /// `existing` is the roster snapshot taken when the joiner was added
    async fn on_participant_joined(
        &self,
        session_id: &SessionId,
        joiner: &ParticipantSnapshot,
        existing: &[ParticipantSnapshot],
    );

    async fn on_participant_left(
        &self,
        session_id: &SessionId,
        left: &ParticipantSnapshot,
        remaining: &[ParticipantSnapshot],
        reason: EndReason,
    );

    async fn on_participant_evicted(
        &self,
        session_id: &SessionId,
        evicted: &ParticipantSnapshot,
        reason: EndReason,
    );

    async fn on_publish_media(
        &self,
        session_id: &SessionId,
        publisher: &ParticipantSnapshot,
        participants: &[ParticipantSnapshot],
    );

    /// With `notify_publisher` the publisher itself is told too (forced or
    /// server-side unpublish)
    async fn on_unpublish_media(
        &self,
        session_id: &SessionId,
        publisher: &ParticipantSnapshot,
        participants: &[ParticipantSnapshot],
        reason: EndReason,
        notify_publisher: bool,
    );

    async fn on_ice_candidate(
        &self,
        session_id: &SessionId,
        participant_private_id: &str,
        sender_public_id: &str,
        endpoint_name: &str,
        candidate: &IceCandidate,
    );

    async fn on_stream_property_changed(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        owner_public_id: &str,
        stream_id: &str,
        property: StreamProperty,
        new_value: &Value,
        reason: &str,
    );

    async fn on_media_error(&self, session_id: &SessionId, participant_private_id: &str, description: &str);

    async fn on_pipeline_error(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        description: &str,
    );

    async fn on_send_message(
        &self,
        session_id: &SessionId,
        from_public_id: &str,
        data: &str,
        message_type: &str,
        recipients: &[ParticipantSnapshot],
    );
}

/// [`SessionEventSink`] that emits JSON notifications through an [`RpcNotifier`]
pub struct SessionEventsHandler {
    notifier: Arc<dyn RpcNotifier>,
}

impl SessionEventsHandler {
    pub fn new(notifier: Arc<dyn RpcNotifier>) -> Self {
        Self { notifier }
    }

    async fn notify(&self, session_id: &SessionId, to: &str, method: &str, params: Value) {
        if let Err(e) = self.notifier.send_notification(to, method, params).await {
            tracing::warn!(
                session_id = %session_id,
                participant = to,
                method,
                error = %e,
                "Notification could not be delivered, skipping"
            );
        }
    }
}

#[async_trait]
impl SessionEventSink for SessionEventsHandler {
    async fn on_session_created(&self, session_id: &SessionId) {
        tracing::info!(session_id = %session_id, "Session created");
    }

    async fn on_session_closed(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        reason: EndReason,
    ) {
        tracing::info!(session_id = %session_id, %reason, "Session closed");
        let params = json!({ ROOMCLOSED_ROOM_PARAM: session_id.as_str() });
        for p in participants {
            self.notify(session_id, &p.private_id, ROOMCLOSED_METHOD, params.clone())
                .await;
        }
    }

    async fn on_participant_joined(
        &self,
        session_id: &SessionId,
        joiner: &ParticipantSnapshot,
        existing: &[ParticipantSnapshot],
    ) {
        let params = json!({
            PARTICIPANTJOINED_USER_PARAM: joiner.public_id,
            PARTICIPANTJOINED_CREATEDAT_PARAM: joiner.created_at,
            PARTICIPANTJOINED_METADATA_PARAM: joiner.metadata,
        });
        for p in existing.iter().filter(|p| p.private_id != joiner.private_id) {
            self.notify(session_id, &p.private_id, PARTICIPANTJOINED_METHOD, params.clone())
                .await;
        }
    }

    async fn on_participant_left(
        &self,
        session_id: &SessionId,
        left: &ParticipantSnapshot,
        remaining: &[ParticipantSnapshot],
        reason: EndReason,
    ) {
        let params = json!({
            PARTICIPANTLEFT_NAME_PARAM: left.public_id,
            PARTICIPANTLEFT_REASON_PARAM: reason.as_str(),
        });
        for p in remaining.iter().filter(|p| p.private_id != left.private_id) {
            self.notify(session_id, &p.private_id, PARTICIPANTLEFT_METHOD, params.clone())
                .await;
        }
    }

    async fn on_participant_evicted(
        &self,
        session_id: &SessionId,
        evicted: &ParticipantSnapshot,
        reason: EndReason,
    ) {
        let params = json!({
            PARTICIPANTEVICTED_CONNECTIONID_PARAM: evicted.public_id,
            PARTICIPANTEVICTED_REASON_PARAM: reason.as_str(),
        });
        self.notify(session_id, &evicted.private_id, PARTICIPANTEVICTED_METHOD, params)
            .await;
    }

    async fn on_publish_media(
        &self,
        session_id: &SessionId,
        publisher: &ParticipantSnapshot,
        participants: &[ParticipantSnapshot],
    ) {
        let streams = serde_json::to_value(&publisher.streams).unwrap_or(Value::Array(Vec::new()));
        let params = json!({
            PARTICIPANTPUBLISHED_USER_PARAM: publisher.public_id,
            PARTICIPANTPUBLISHED_STREAMS_PARAM: streams,
        });
        for p in participants.iter().filter(|p| p.private_id != publisher.private_id) {
            self.notify(session_id, &p.private_id, PARTICIPANTPUBLISHED_METHOD, params.clone())
                .await;
        }
    }

    async fn on_unpublish_media(
        &self,
        session_id: &SessionId,
        publisher: &ParticipantSnapshot,
        participants: &[ParticipantSnapshot],
        reason: EndReason,
        notify_publisher: bool,
    ) {
        let params = json!({
            PARTICIPANTUNPUBLISHED_NAME_PARAM: publisher.public_id,
            PARTICIPANTUNPUBLISHED_REASON_PARAM: reason.as_str(),
        });
        for p in participants {
            if p.private_id == publisher.private_id && !notify_publisher {
                continue;
            }
            self.notify(session_id, &p.private_id, PARTICIPANTUNPUBLISHED_METHOD, params.clone())
                .await;
        }
    }

    async fn on_ice_candidate(
        &self,
        session_id: &SessionId,
        participant_private_id: &str,
        sender_public_id: &str,
        endpoint_name: &str,
        candidate: &IceCandidate,
    ) {
        let params = json!({
            ICECANDIDATE_SENDERCONNECTIONID_PARAM: sender_public_id,
            ICECANDIDATE_EPNAME_PARAM: endpoint_name,
            ICECANDIDATE_SDPMLINEINDEX_PARAM: candidate.sdp_m_line_index,
            ICECANDIDATE_SDPMID_PARAM: candidate.sdp_mid,
            ICECANDIDATE_CANDIDATE_PARAM: candidate.candidate,
        });
        self.notify(session_id, participant_private_id, ICECANDIDATE_METHOD, params)
            .await;
    }

    async fn on_stream_property_changed(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        owner_public_id: &str,
        stream_id: &str,
        property: StreamProperty,
        new_value: &Value,
        reason: &str,
    ) {
        let mut params = Map::new();
        params.insert(STREAMPROPERTYCHANGED_CONNECTIONID_PARAM.into(), json!(owner_public_id));
        params.insert(STREAMPROPERTYCHANGED_STREAMID_PARAM.into(), json!(stream_id));
        params.insert(STREAMPROPERTYCHANGED_PROPERTY_PARAM.into(), json!(property.as_str()));
        params.insert(STREAMPROPERTYCHANGED_NEWVALUE_PARAM.into(), new_value.clone());
        params.insert(STREAMPROPERTYCHANGED_REASON_PARAM.into(), json!(reason));
        let params = Value::Object(params);
        for p in participants {
            self.notify(session_id, &p.private_id, STREAMPROPERTYCHANGED_METHOD, params.clone())
                .await;
        }
    }

    async fn on_media_error(&self, session_id: &SessionId, participant_private_id: &str, description: &str) {
        let params = json!({ MEDIAERROR_ERROR_PARAM: description });
        self.notify(session_id, participant_private_id, MEDIAERROR_METHOD, params)
            .await;
    }

    async fn on_pipeline_error(
        &self,
        session_id: &SessionId,
        participants: &[ParticipantSnapshot],
        description: &str,
    ) {
        let params = json!({ MEDIAERROR_ERROR_PARAM: description });
        for p in participants {
            self.notify(session_id, &p.private_id, MEDIAERROR_METHOD, params.clone())
                .await;
        }
    }

    async fn on_send_message(
        &self,
        session_id: &SessionId,
        from_public_id: &str,
        data: &str,
        message_type: &str,
        recipients: &[ParticipantSnapshot],
    ) {
        let params = json!({
            PARTICIPANTSENDMESSAGE_DATA_PARAM: data,
            PARTICIPANTSENDMESSAGE_FROM_PARAM: from_public_id,
            PARTICIPANTSENDMESSAGE_TYPE_PARAM: message_type,
        });
        for p in recipients {
            self.notify(session_id, &p.private_id, PARTICIPANTSENDMESSAGE_METHOD, params.clone())
                .await;
        }
    }
}
