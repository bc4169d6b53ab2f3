//! Session Manager
//!
//! Transport-facing entry point. Each request names the session and the
//! private id of the connection that sent it; the manager resolves both
//! through the [`SessionRegistry`], drives the [`MediaSession`] and reports
//! the outcome through the [`SessionEventSink`]. Work targeting a participant
//! on another node goes through the [`ClusterRouter`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::registry::SessionRegistry;
use crate::api::types::{
    EndReason, FilterDescriptor, IceCandidate, ParticipantIdentity, ParticipantRole, PublishRequest, SdpType,
    SessionId, SessionProperties, StreamProperty, Token,
};
use crate::cluster::{ClusterRouter, ClusterTask, ClusterTaskHandler, ClusterTaskResult};
use crate::config::SessionCoreConfig;
use crate::engine::MediaEngine;
use crate::errors::{Result, SessionError};
use crate::events::SessionEventSink;
use crate::session::{JoinRoomResponse, MediaSession, Participant, ParticipantSnapshot};

const APPLY_FILTER_REASON: &str = "applyFilter";
const REMOVE_FILTER_REASON: &str = "removeFilter";
const EXEC_FILTER_METHOD_REASON: &str = "execFilterMethod";

pub struct SessionManager {
    config: Arc<SessionCoreConfig>,
    engine: Arc<dyn MediaEngine>,
    events: Arc<dyn SessionEventSink>,
    registry: SessionRegistry,
    cluster: Option<Arc<ClusterRouter>>,
}

impl SessionManager {
    pub fn new(
        config: Arc<SessionCoreConfig>,
        engine: Arc<dyn MediaEngine>,
        events: Arc<dyn SessionEventSink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            engine,
            events,
            registry: SessionRegistry::new(),
            cluster: None,
        })
    }

    /// A manager taking part in a cluster. Tasks the router receives for
    /// this node are executed by the returned manager.
    pub fn with_cluster(
        config: Arc<SessionCoreConfig>,
        engine: Arc<dyn MediaEngine>,
        events: Arc<dyn SessionEventSink>,
        router: Arc<ClusterRouter>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            engine,
            events,
            registry: SessionRegistry::new(),
            cluster: Some(Arc::clone(&router)),
        });
        let executor: Arc<dyn ClusterTaskHandler> = manager.clone();
        router.bind_executor(&executor);
        manager
    }

    pub fn config(&self) -> &SessionCoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn cluster(&self) -> Option<&Arc<ClusterRouter>> {
        self.cluster.as_ref()
    }

    // ---- sessions ----

    /// Create a session; fails if the id is taken
    pub async fn create_session(
        &self,
        session_id: impl Into<SessionId>,
        properties: SessionProperties,
    ) -> Result<Arc<MediaSession>> {
        let session = MediaSession::new(
            session_id.into(),
            properties,
            Arc::clone(&self.engine),
            Arc::clone(&self.events),
            Arc::clone(&self.config),
        );
        self.registry.insert_session(Arc::clone(&session))?;
        tracing::info!("Session {} created", session.session_id());
        self.events.on_session_created(session.session_id()).await;
        Ok(session)
    }

    /// The session with `session_id`, created if absent.
    ///
    /// Concurrent callers all get the same instance.
    pub async fn get_or_create_session(
        &self,
        session_id: impl Into<SessionId>,
        properties: SessionProperties,
    ) -> Result<Arc<MediaSession>> {
        let session_id = session_id.into();
        if let Some(session) = self.registry.find_session(&session_id) {
            return Ok(session);
        }
        match self.create_session(session_id.clone(), properties).await {
            Err(SessionError::SessionAlreadyExists { .. }) => self.registry.get_session(&session_id),
            other => other,
        }
    }

    pub fn get_session(&self, session_id: &SessionId) -> Result<Arc<MediaSession>> {
        self.registry.get_session(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.registry.list_sessions()
    }

    /// Issue a token for `session_id`
    pub fn generate_token(&self, session_id: &SessionId, role: ParticipantRole) -> Result<Token> {
        let token = Token::generate(role);
        self.registry.add_token(session_id, token.clone())?;
        Ok(token)
    }

    fn resolve(&self, session_id: &SessionId, private_id: &str) -> Result<(Arc<MediaSession>, Arc<Participant>)> {
        let session = self.registry.get_session(session_id)?;
        let participant = session
            .participant(private_id)
            .ok_or_else(|| SessionError::participant_not_found(session_id.as_str(), private_id))?;
        Ok((session, participant))
    }

    /// Owner of a stream, looked up by stream id and then by public id
    fn stream_owner(&self, session: &MediaSession, sender: &str) -> Result<Arc<Participant>> {
        session
            .participant_private_id_from_stream_id(sender)
            .and_then(|private_id| session.participant(&private_id))
            .or_else(|| session.participant_by_public_id(sender))
            .ok_or_else(|| SessionError::user_not_streaming(sender))
    }

    // ---- membership ----

    /// Add a connection to a session and announce it to everyone present
    pub async fn join_room(&self, identity: ParticipantIdentity, needs_relay: bool) -> Result<JoinRoomResponse> {
        let session_id = identity.session_id.clone();
        let session = self.registry.get_session(&session_id)?;
        let new_token = self.registry.token(&session_id, &identity.token.token).is_none();
        if new_token {
            self.registry.add_token(&session_id, identity.token.clone())?;
        }

        let outcome = match session.join(identity.clone(), needs_relay).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if new_token {
                    self.registry.remove_token(&session_id, &identity.token.token);
                }
                return Err(e);
            }
        };
        let participant = outcome.participant;
        self.registry.add_participant(&session_id, Arc::clone(&participant))?;

        if let Some(router) = &self.cluster {
            let registered = async {
                router
                    .register_connection(participant.public_id(), participant.private_id())
                    .await?;
                router.join_session(participant.public_id(), session_id.as_str()).await
            }
            .await;
            if let Err(e) = registered {
                tracing::error!(
                    "Session {}: cluster registration of {} failed, rolling back: {}",
                    session_id,
                    participant.public_id(),
                    e
                );
                self.registry.remove_participant(&session_id, participant.public_id());
                if let Err(leave_error) = session.leave(participant.private_id(), EndReason::NetworkDisconnect).await {
                    tracing::warn!(
                        "Session {}: rollback of {} failed to leave: {}",
                        session_id,
                        participant.public_id(),
                        leave_error
                    );
                }
                if let Err(cluster_error) = router.leave_session(participant.public_id()).await {
                    tracing::warn!(
                        "Cluster record of {} not cleared: {}",
                        participant.public_id(),
                        cluster_error
                    );
                }
                if session.occupancy() == 0 && !session.is_closed() {
                    self.close_local(&session, EndReason::LastParticipantLeft).await;
                }
                return Err(e);
            }
        }

        let joiner = participant.snapshot();
        self.events
            .on_participant_joined(&session_id, &joiner, &outcome.existing)
            .await;

        Ok(JoinRoomResponse {
            id: joiner.public_id,
            created_at: joiner.created_at,
            metadata: joiner.metadata,
            value: outcome.existing,
        })
    }

    /// Remove a connection from its session.
    ///
    /// A connection that already left is not an error: `Ok(None)`.
    pub async fn leave_room(
        &self,
        session_id: &SessionId,
        private_id: &str,
        reason: EndReason,
    ) -> Result<Option<ParticipantSnapshot>> {
        let Some(session) = self.registry.find_session(session_id) else {
            tracing::debug!("Leave of {} ignored: session {} is gone", private_id, session_id);
            return Ok(None);
        };
        match session.leave(private_id, reason).await {
            Ok(outcome) => {
                self.after_leave(&session, &outcome.snapshot, &outcome.remaining, reason).await;
                Ok(Some(outcome.snapshot))
            }
            Err(SessionError::ParticipantNotFound { .. }) => {
                tracing::warn!("Session {}: {} already left", session_id, private_id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn after_leave(
        &self,
        session: &Arc<MediaSession>,
        left: &ParticipantSnapshot,
        remaining: &[ParticipantSnapshot],
        reason: EndReason,
    ) {
        let session_id = session.session_id();
        self.registry.remove_participant(session_id, &left.public_id);
        if let Some(router) = &self.cluster {
            if let Err(e) = router.leave_session(&left.public_id).await {
                tracing::warn!("Cluster record of {} not cleared: {}", left.public_id, e);
            }
        }
        self.events
            .on_participant_left(session_id, left, remaining, reason)
            .await;

        if session.occupancy() == 0 && !session.is_closed() {
            tracing::info!("Session {}: last participant left, closing", session_id);
            self.close_local(session, EndReason::LastParticipantLeft).await;
        }
    }

    /// The transport lost the connection for good. It leaves the session it
    /// is in, if any, and its cluster record is dropped.
    pub async fn connection_closed(&self, public_id: &str, private_id: &str) -> Result<()> {
        if let Some(participant) = self.registry.participant_by_private_id(private_id) {
            let session_id = participant.session_id().clone();
            self.leave_room(&session_id, private_id, EndReason::NetworkDisconnect).await?;
        }
        if let Some(router) = &self.cluster {
            router.connection_closed(public_id).await?;
        }
        tracing::debug!("Connection {} closed", public_id);
        Ok(())
    }

    /// Remove `public_id` from the session on behalf of a moderator or the server
    pub async fn evict_participant(&self, session_id: &SessionId, public_id: &str, reason: EndReason) -> Result<()> {
        let session = self.registry.get_session(session_id)?;
        let evicted = session
            .participant_by_public_id(public_id)
            .ok_or_else(|| SessionError::participant_not_found(session_id.as_str(), public_id))?;

        tracing::info!("Session {}: evicting {} ({})", session_id, public_id, reason);
        let outcome = session.leave(evicted.private_id(), reason).await?;
        self.events
            .on_participant_evicted(session_id, &outcome.snapshot, reason)
            .await;
        self.after_leave(&session, &outcome.snapshot, &outcome.remaining, reason).await;
        Ok(())
    }

    // ---- media ----

    pub async fn publish_video(&self, session_id: &SessionId, private_id: &str, request: PublishRequest) -> Result<String> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        session
            .publish(&participant, SdpType::Offer, &request.sdp_offer, request.options)
            .await
    }

    pub async fn unpublish_video(&self, session_id: &SessionId, private_id: &str) -> Result<()> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        session.unpublish(&participant, EndReason::Unpublish, false).await
    }

    /// Stop the stream `stream_id` regardless of who asks
    pub async fn force_unpublish(&self, session_id: &SessionId, stream_id: &str, reason: EndReason) -> Result<()> {
        let session = self.registry.get_session(session_id)?;
        let owner = self.stream_owner(&session, stream_id)?;
        tracing::info!("Session {}: force unpublishing {} ({})", session_id, stream_id, reason);
        session.unpublish(&owner, reason, true).await
    }

    /// `sender` is a stream id or the public id of the publishing participant
    pub async fn subscribe(&self, session_id: &SessionId, private_id: &str, sender: &str, sdp_offer: &str) -> Result<String> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        let publisher = self.stream_owner(&session, sender)?;
        participant.receive_media_from(&publisher, sdp_offer).await
    }

    pub async fn unsubscribe(&self, session_id: &SessionId, private_id: &str, sender: &str) -> Result<()> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        let publisher_id = match self.stream_owner(&session, sender) {
            Ok(publisher) => publisher.public_id().to_string(),
            Err(_) => sender.to_string(),
        };
        if !participant
            .cancel_receiving_media(&publisher_id, EndReason::Unsubscribe)
            .await
        {
            tracing::warn!(
                "Session {}: {} was not receiving from {}",
                session_id,
                participant.public_id(),
                publisher_id
            );
        }
        Ok(())
    }

    pub async fn on_ice_candidate(
        &self,
        session_id: &SessionId,
        private_id: &str,
        endpoint_name: &str,
        candidate: IceCandidate,
    ) -> Result<()> {
        let (_, participant) = self.resolve(session_id, private_id)?;
        participant.add_ice_candidate(endpoint_name, candidate).await
    }

    /// Relay `message` (`{data, type?, to?}`) to the listed public ids, or to everyone.
    ///
    /// With cluster routing on, recipients living on other nodes get the
    /// message through their owning node. A listed recipient that no node
    /// holds in this session is a transport error; local recipients are
    /// notified before it is reported.
    pub async fn send_message(&self, session_id: &SessionId, private_id: &str, message: &Value) -> Result<()> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        let data = match message.get("data") {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let message_type = message.get("type").and_then(Value::as_str).unwrap_or("signal");

        let everyone = session.snapshots();
        let wanted: Option<Vec<&str>> = message
            .get("to")
            .and_then(Value::as_array)
            .map(|to| to.iter().filter_map(Value::as_str).collect());
        let (recipients, elsewhere): (Vec<ParticipantSnapshot>, Vec<String>) = match &wanted {
            Some(wanted) => {
                let local: Vec<ParticipantSnapshot> = everyone
                    .into_iter()
                    .filter(|p| wanted.contains(&p.public_id.as_str()))
                    .collect();
                let missing = wanted
                    .iter()
                    .filter(|id| !local.iter().any(|p| p.public_id == **id))
                    .map(|id| id.to_string())
                    .collect();
                (local, missing)
            }
            None => (everyone, Vec::new()),
        };
        self.events
            .on_send_message(session_id, participant.public_id(), &data, message_type, &recipients)
            .await;

        let Some(router) = &self.cluster else {
            if !elsewhere.is_empty() {
                tracing::warn!("Session {}: message for unknown recipients {:?} dropped", session_id, elsewhere);
            }
            return Ok(());
        };
        let remote: Vec<String> = match wanted {
            Some(_) => elsewhere,
            None => router
                .session_connections(session_id.as_str())
                .await?
                .into_iter()
                .filter(|c| c.node_id != router.node_id())
                .map(|c| c.public_id)
                .collect(),
        };

        let mut first_error = None;
        for public_id in remote {
            let delivered = self
                .deliver_remote(router, session_id, &public_id, participant.public_id(), &data, message_type)
                .await;
            if let Err(e) = delivered {
                tracing::warn!("Session {}: message to {} not delivered: {}", session_id, public_id, e);
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn deliver_remote(
        &self,
        router: &ClusterRouter,
        session_id: &SessionId,
        public_id: &str,
        from_public_id: &str,
        data: &str,
        message_type: &str,
    ) -> Result<()> {
        let owner = router.owner_of(public_id).await?;
        if owner.session_id.as_deref() != Some(session_id.as_str()) {
            return Err(SessionError::transport(format!(
                "{} is not in session {} on any node",
                public_id, session_id
            )));
        }
        let task = ClusterTask::SendMessage {
            session_id: session_id.to_string(),
            public_id: public_id.to_string(),
            from_public_id: from_public_id.to_string(),
            data: data.to_string(),
            message_type: message_type.to_string(),
        };
        router.route(public_id, task).await?.into_delivered()
    }

    /// Notify a participant of this node of a message sent from another node
    async fn deliver_local_message(
        &self,
        session_id: &str,
        public_id: &str,
        from_public_id: &str,
        data: &str,
        message_type: &str,
    ) -> Result<()> {
        let session_id = SessionId::new(session_id);
        let session = self.registry.get_session(&session_id)?;
        let recipient = session
            .participant_by_public_id(public_id)
            .ok_or_else(|| SessionError::participant_not_found(session_id.as_str(), public_id))?;
        self.events
            .on_send_message(&session_id, from_public_id, data, message_type, &[recipient.snapshot()])
            .await;
        Ok(())
    }

    pub async fn stream_property_changed(
        &self,
        session_id: &SessionId,
        private_id: &str,
        stream_id: &str,
        property: StreamProperty,
        new_value: Value,
        reason: &str,
    ) -> Result<()> {
        let (session, participant) = self.resolve(session_id, private_id)?;
        let publisher = participant
            .publisher()
            .filter(|_| participant.publisher_stream_id().as_deref() == Some(stream_id))
            .ok_or_else(|| SessionError::user_not_streaming(participant.public_id()))?;
        publisher.update_property(property, &new_value);
        self.events
            .on_stream_property_changed(
                session_id,
                &session.snapshots(),
                participant.public_id(),
                stream_id,
                property,
                &new_value,
                reason,
            )
            .await;
        Ok(())
    }

    // ---- filters ----

    fn filter_target(
        &self,
        session_id: &SessionId,
        stream_id: &str,
    ) -> Result<(Arc<MediaSession>, Arc<Participant>)> {
        let session = self.registry.get_session(session_id)?;
        let owner = session
            .participant_private_id_from_stream_id(stream_id)
            .and_then(|private_id| session.participant(&private_id))
            .filter(|p| p.is_streaming())
            .ok_or_else(|| SessionError::user_not_streaming(stream_id))?;
        Ok((session, owner))
    }

    async fn announce_filter(&self, session: &MediaSession, owner: &Participant, stream_id: &str, state: &Value, reason: &str) {
        self.events
            .on_stream_property_changed(
                session.session_id(),
                &session.snapshots(),
                owner.public_id(),
                stream_id,
                StreamProperty::Filter,
                state,
                reason,
            )
            .await;
    }

    /// Insert `filter` in front of the stream. One filter per stream.
    pub async fn apply_filter(&self, session_id: &SessionId, stream_id: &str, filter: FilterDescriptor) -> Result<Value> {
        let (session, owner) = self.filter_target(session_id, stream_id)?;
        let publisher = owner
            .publisher()
            .ok_or_else(|| SessionError::user_not_streaming(owner.public_id()))?;
        if publisher.filter_count().await > 0 {
            return Err(SessionError::filter_not_applied(format!(
                "Stream {} already has a filter",
                stream_id
            )));
        }
        let state = serde_json::to_value(&filter).map_err(|e| SessionError::filter_not_applied(e.to_string()))?;
        publisher.apply_filter(filter).await?;
        session.set_filter_state(stream_id, Some(state.clone()));
        self.announce_filter(&session, &owner, stream_id, &state, APPLY_FILTER_REASON).await;
        Ok(state)
    }

    pub async fn remove_filter(&self, session_id: &SessionId, stream_id: &str) -> Result<()> {
        let (session, owner) = self.filter_target(session_id, stream_id)?;
        let publisher = owner
            .publisher()
            .ok_or_else(|| SessionError::user_not_streaming(owner.public_id()))?;
        publisher.remove_filter().await?;
        session.set_filter_state(stream_id, None);
        self.announce_filter(&session, &owner, stream_id, &json!({}), REMOVE_FILTER_REASON).await;
        Ok(())
    }

    /// Invoke `method` on the stream's filter and record it as the last call
    pub async fn exec_filter_method(
        &self,
        session_id: &SessionId,
        stream_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let (session, owner) = self.filter_target(session_id, stream_id)?;
        let publisher = owner
            .publisher()
            .ok_or_else(|| SessionError::user_not_streaming(owner.public_id()))?;
        let result = publisher.exec_filter_method(method, &params).await?;

        let mut state = session.filter_state(stream_id).unwrap_or_else(|| json!({}));
        if let Value::Object(map) = &mut state {
            map.insert("lastExecMethod".to_string(), json!({ "method": method, "params": params }));
        }
        session.set_filter_state(stream_id, Some(state.clone()));
        self.announce_filter(&session, &owner, stream_id, &state, EXEC_FILTER_METHOD_REASON).await;
        Ok(result)
    }

    // ---- teardown ----

    /// Close a session here and on every other node holding members of it
    pub async fn close_session(&self, session_id: &SessionId, reason: EndReason) -> Result<bool> {
        let session = self.registry.get_session(session_id)?;
        if let Some(router) = &self.cluster {
            let task = ClusterTask::CloseSession {
                session_id: session_id.to_string(),
                reason,
            };
            router.broadcast_to_session(session_id.as_str(), task).await?;
        }
        Ok(self.close_local(&session, reason).await)
    }

    /// Close `session`, notify whoever is still in it and prune the registry
    async fn close_local(&self, session: &Arc<MediaSession>, reason: EndReason) -> bool {
        let members = session.snapshots();
        let closed = session.close(reason).await;
        if closed {
            self.events
                .on_session_closed(session.session_id(), &members, reason)
                .await;
            if let Some(router) = &self.cluster {
                for member in &members {
                    if let Err(e) = router.leave_session(&member.public_id).await {
                        tracing::warn!("Cluster record of {} not cleared: {}", member.public_id, e);
                    }
                }
            }
        }
        self.registry.remove_session(session.session_id());
        closed
    }

    /// Close every session, e.g. on shutdown
    pub async fn close_all(&self, reason: EndReason) {
        let sessions: Vec<Arc<MediaSession>> = self
            .registry
            .list_sessions()
            .iter()
            .filter_map(|id| self.registry.find_session(id))
            .collect();
        futures::future::join_all(sessions.iter().map(|session| self.close_local(session, reason))).await;
    }

    /// The media engine lost its state: rebuild every session on it
    pub async fn on_media_engine_restart(&self) {
        let sessions = self.registry.list_sessions();
        tracing::warn!("Media engine restarted, recovering {} sessions", sessions.len());
        for session_id in sessions {
            if let Some(session) = self.registry.find_session(&session_id) {
                session.restart_status_in_media_engine().await;
            }
        }
    }

    // ---- cross-node relay ----

    /// Connect the local relay of `private_id` with the relay of
    /// `remote_public_id`, wherever that participant lives.
    ///
    /// When `private_id` is streaming its published stream is attached to the
    /// relay. A stream published later is not attached; call this again.
    pub async fn relay_to_remote(&self, session_id: &SessionId, private_id: &str, remote_public_id: &str) -> Result<String> {
        let router = self
            .cluster
            .as_ref()
            .ok_or_else(|| SessionError::transport("Cluster routing is not enabled"))?;
        let (_, participant) = self.resolve(session_id, private_id)?;
        let relay = participant.relay().ok_or_else(|| {
            SessionError::media_endpoint(format!("Participant {} has no relay endpoint", participant.public_id()))
        })?;

        let owner = router.owner_of(remote_public_id).await?;
        let offer = relay.prepare_remote_connection().await?;
        let task = ClusterTask::ProcessSdpOffer {
            session_id: session_id.to_string(),
            public_id: remote_public_id.to_string(),
            sdp_offer: offer,
        };
        let answer = router.route(remote_public_id, task).await?.into_answer()?;
        relay.process_offer_or_answer(SdpType::Answer, &answer).await?;
        relay.set_remote_node(owner.node_id);
        if let Some(publisher) = participant.publisher().filter(|_| participant.is_streaming()) {
            relay.forward_from(&publisher).await?;
        }
        tracing::info!(
            "Session {}: relay of {} connected to {}",
            session_id,
            participant.public_id(),
            remote_public_id
        );
        Ok(answer)
    }

    async fn process_remote_offer(&self, session_id: &str, public_id: &str, sdp_offer: &str) -> Result<String> {
        let session_id = SessionId::new(session_id);
        let session = self.registry.get_session(&session_id)?;
        let participant = session
            .participant_by_public_id(public_id)
            .ok_or_else(|| SessionError::participant_not_found(session_id.as_str(), public_id))?;
        let relay = participant.relay().ok_or_else(|| {
            SessionError::media_endpoint(format!("Participant {} has no relay endpoint", public_id))
        })?;
        relay.process_offer_or_answer(SdpType::Offer, sdp_offer).await
    }
}

#[async_trait]
impl ClusterTaskHandler for SessionManager {
    async fn handle_task(&self, task: ClusterTask) -> ClusterTaskResult {
        match task {
            ClusterTask::ProcessSdpOffer {
                session_id,
                public_id,
                sdp_offer,
            } => ClusterTaskResult::from_result(
                self.process_remote_offer(&session_id, &public_id, &sdp_offer).await,
                ClusterTaskResult::SdpAnswer,
            ),
            ClusterTask::CloseSession { session_id, reason } => {
                let closed = match self.registry.find_session(&SessionId::new(session_id)) {
                    Some(session) => self.close_local(&session, reason).await,
                    None => false,
                };
                ClusterTaskResult::SessionClosed(closed)
            }
            ClusterTask::SendMessage {
                session_id,
                public_id,
                from_public_id,
                data,
                message_type,
            } => ClusterTaskResult::from_result(
                self.deliver_local_message(&session_id, &public_id, &from_public_id, &data, &message_type)
                    .await,
                |()| ClusterTaskResult::Delivered,
            ),
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("node_id", &self.config.node_id)
            .field("registry", &self.registry)
            .field("cluster", &self.cluster.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::MediaOptions;
    use crate::engine::mock::MockMediaEngine;
    use crate::events::{NotificationLog, SessionEventsHandler};
    use pretty_assertions::assert_eq;

    struct Fixture {
        manager: Arc<SessionManager>,
        log: Arc<NotificationLog>,
        room: SessionId,
    }

    async fn fixture() -> Fixture {
        let config = Arc::new(SessionCoreConfig {
            endpoint_create_timeout_ms: 500,
            ..Default::default()
        });
        let log = Arc::new(NotificationLog::new());
        let events: Arc<dyn SessionEventSink> = Arc::new(SessionEventsHandler::new(log.clone()));
        let manager = SessionManager::new(config, MockMediaEngine::shared(), events);
        let room = manager
            .create_session("room1", SessionProperties::default())
            .await
            .unwrap()
            .session_id()
            .clone();
        Fixture { manager, log, room }
    }

    fn identity(f: &Fixture, n: &str, role: ParticipantRole) -> ParticipantIdentity {
        ParticipantIdentity::new(format!("priv-{}", n), format!("pub-{}", n), f.room.clone(), Token::generate(role))
    }

    async fn publish(f: &Fixture, n: &str) -> String {
        f.manager
            .publish_video(
                &f.room,
                &format!("priv-{}", n),
                PublishRequest {
                    sdp_offer: "v=0".into(),
                    options: MediaOptions::audio_video(),
                },
            )
            .await
            .unwrap();
        let session = f.manager.get_session(&f.room).unwrap();
        session
            .participant(&format!("priv-{}", n))
            .and_then(|p| p.publisher_stream_id())
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let f = fixture().await;
        let err = f
            .manager
            .create_session("room1", SessionProperties::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), 204);
        let again = f
            .manager
            .get_or_create_session("room1", SessionProperties::default())
            .await
            .unwrap();
        assert_eq!(again.session_id(), &f.room);
    }

    #[tokio::test]
    async fn test_join_announces_to_existing_only() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        let response = f
            .manager
            .join_room(identity(&f, "b", ParticipantRole::Subscriber), false)
            .await
            .unwrap();

        assert_eq!(response.id, "pub-b");
        assert_eq!(response.value.len(), 1);
        assert_eq!(response.value[0].public_id, "pub-a");
        assert!(response.value[0].streams.is_empty());
        assert_eq!(f.log.methods_for("priv-a"), vec!["participantJoined".to_string()]);
        assert!(f.log.methods_for("priv-b").is_empty());
    }

    #[tokio::test]
    async fn test_last_leave_prunes_session() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        let left = f
            .manager
            .leave_room(&f.room, "priv-a", EndReason::Disconnect)
            .await
            .unwrap();
        assert_eq!(left.unwrap().public_id, "pub-a");
        assert!(f.manager.get_session(&f.room).is_err());

        // already gone: quiet no-op
        assert!(f
            .manager
            .leave_room(&f.room, "priv-a", EndReason::Disconnect)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_recorder_does_not_keep_session_open() {
        let f = fixture().await;
        let recorder = ParticipantIdentity::new(
            "priv-rec",
            crate::api::types::RECORDER_PARTICIPANT_PUBLIC_ID,
            f.room.clone(),
            Token::generate(ParticipantRole::Subscriber),
        );
        f.manager.join_room(recorder, false).await.unwrap();
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();

        f.manager.leave_room(&f.room, "priv-a", EndReason::Disconnect).await.unwrap();
        assert!(f.manager.get_session(&f.room).is_err());
    }

    #[tokio::test]
    async fn test_filter_lifecycle() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        f.manager.join_room(identity(&f, "b", ParticipantRole::Subscriber), false).await.unwrap();
        let stream_id = publish(&f, "a").await;

        let filter = FilterDescriptor::new("GStreamerFilter", json!({"command": "videobalance saturation=0.0"}));
        f.manager.apply_filter(&f.room, &stream_id, filter.clone()).await.unwrap();
        let err = f.manager.apply_filter(&f.room, &stream_id, filter).await.unwrap_err();
        assert_eq!(err.code(), 711);

        f.manager
            .exec_filter_method(&f.room, &stream_id, "setElementProperty", json!({"name": "saturation"}))
            .await
            .unwrap();
        let session = f.manager.get_session(&f.room).unwrap();
        let state = session.filter_state(&stream_id).unwrap();
        assert_eq!(state["lastExecMethod"]["method"], "setElementProperty");

        f.manager.remove_filter(&f.room, &stream_id).await.unwrap();
        assert!(session.filter_state(&stream_id).is_none());
        assert_eq!(f.manager.remove_filter(&f.room, &stream_id).await.unwrap_err().code(), 711);
        assert_eq!(f.log.count("streamPropertyChanged"), 6);
    }

    #[tokio::test]
    async fn test_filter_on_unknown_stream() {
        let f = fixture().await;
        let err = f
            .manager
            .apply_filter(&f.room, "nope_CAMERA_AAAAA", FilterDescriptor::new("FaceOverlayFilter", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 105);
    }

    #[tokio::test]
    async fn test_send_message_to_list() {
        let f = fixture().await;
        for n in ["a", "b", "c"] {
            f.manager.join_room(identity(&f, n, ParticipantRole::Publisher), false).await.unwrap();
        }
        f.log.clear();
        f.manager
            .send_message(&f.room, "priv-a", &json!({"data": "hi", "type": "signal:chat", "to": ["pub-c"]}))
            .await
            .unwrap();
        let sent = f.log.for_participant("priv-c");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].params["from"], "pub-a");
        assert_eq!(sent[0].params["type"], "signal:chat");
        assert!(f.log.for_participant("priv-b").is_empty());
    }

    #[tokio::test]
    async fn test_force_unpublish_tells_owner() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        f.manager.join_room(identity(&f, "b", ParticipantRole::Subscriber), false).await.unwrap();
        let stream_id = publish(&f, "a").await;
        f.log.clear();

        f.manager
            .force_unpublish(&f.room, &stream_id, EndReason::ForceUnpublishByUser)
            .await
            .unwrap();
        assert_eq!(f.log.methods_for("priv-a"), vec!["participantUnpublished".to_string()]);
        assert_eq!(f.log.methods_for("priv-b"), vec!["participantUnpublished".to_string()]);

        let err = f.manager.unpublish_video(&f.room, "priv-a").await.unwrap_err();
        assert_eq!(err.code(), 105);
    }

    #[tokio::test]
    async fn test_evict() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Moderator), false).await.unwrap();
        f.manager.join_room(identity(&f, "b", ParticipantRole::Publisher), false).await.unwrap();
        f.log.clear();

        f.manager
            .evict_participant(&f.room, "pub-b", EndReason::ForceDisconnectByUser)
            .await
            .unwrap();
        assert_eq!(f.log.methods_for("priv-b"), vec!["participantEvicted".to_string()]);
        assert_eq!(f.log.methods_for("priv-a"), vec!["participantLeft".to_string()]);
        assert_eq!(f.manager.get_session(&f.room).unwrap().participant_count(), 1);
    }

    #[tokio::test]
    async fn test_close_session_notifies_once() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        assert!(f.manager.close_session(&f.room, EndReason::SessionClosedByServer).await.unwrap());
        assert_eq!(f.log.count("roomClosed"), 1);
        assert_eq!(
            f.manager
                .close_session(&f.room, EndReason::SessionClosedByServer)
                .await
                .unwrap_err()
                .code(),
            202
        );
    }

    #[tokio::test]
    async fn test_connection_closed_leaves_room() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), false).await.unwrap();
        f.manager.join_room(identity(&f, "b", ParticipantRole::Publisher), false).await.unwrap();
        f.log.clear();

        f.manager.connection_closed("pub-a", "priv-a").await.unwrap();
        assert_eq!(f.log.methods_for("priv-b"), vec!["participantLeft".to_string()]);
        assert!(f.manager.registry().participant(&f.room, "pub-a").is_none());

        // a connection that never joined
        f.manager.connection_closed("pub-z", "priv-z").await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_requires_cluster() {
        let f = fixture().await;
        f.manager.join_room(identity(&f, "a", ParticipantRole::Publisher), true).await.unwrap();
        let err = f
            .manager
            .relay_to_remote(&f.room, "priv-a", "pub-x")
            .await
            .unwrap_err();
        assert_eq!(err.code(), 803);
    }
}
