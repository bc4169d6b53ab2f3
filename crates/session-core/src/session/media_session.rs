//! Media session (room)
//!
//! Holds the participants of one session and the media engine pipeline they
//! share. The pipeline is created lazily by the first join; concurrent joins
//! wait on the same creation. Once closed, a session rejects every mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Weak;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use super::participant::Participant;
use super::snapshot::ParticipantSnapshot;
use crate::api::types::{
    EndReason, MediaOptions, ParticipantIdentity, ParticipantRole, SdpType, SessionId,
    SessionProperties, StreamProperty,
};
use crate::config::SessionCoreConfig;
use crate::coordination::CreationState;
use crate::endpoint::{ElementSlot, EndpointContext};
use crate::engine::{ElementError, ElementId, MediaEngine};
use crate::errors::{Result, SessionError};
use crate::events::SessionEventSink;

/// Outcome of a successful join
#[derive(Debug, Clone)]
pub struct JoinOutcome {
    pub participant: Arc<Participant>,
    /// Everyone who was already present, taken together with the insert
    pub existing: Vec<ParticipantSnapshot>,
}

/// Outcome of a leave
#[derive(Debug, Clone)]
pub struct LeaveOutcome {
    pub participant: Arc<Participant>,
    pub snapshot: ParticipantSnapshot,
    pub remaining: Vec<ParticipantSnapshot>,
    /// Stream the participant was publishing, if any
    pub stopped_stream: Option<String>,
}

pub struct MediaSession {
    session_id: SessionId,
    properties: SessionProperties,
    created_at: i64,
    engine: Arc<dyn MediaEngine>,
    events: Arc<dyn SessionEventSink>,
    config: Arc<SessionCoreConfig>,
    pipeline: Mutex<Option<Arc<ElementSlot>>>,
    participants: DashMap<String, Arc<Participant>>,
    /// Serialises roster changes with the snapshots sent about them
    roster: Mutex<()>,
    active_publishers: AtomicI32,
    closed: AtomicBool,
    /// stream id -> publisher private id
    published_stream_ids: DashMap<String, String>,
    /// stream id -> filter applied to it
    filter_states: DashMap<String, Value>,
    self_ref: Weak<MediaSession>,
}

impl MediaSession {
    pub fn new(
        session_id: SessionId,
        properties: SessionProperties,
        engine: Arc<dyn MediaEngine>,
        events: Arc<dyn SessionEventSink>,
        config: Arc<SessionCoreConfig>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            session_id,
            properties,
            created_at: chrono::Utc::now().timestamp_millis(),
            engine,
            events,
            config,
            pipeline: Mutex::new(None),
            participants: DashMap::new(),
            roster: Mutex::new(()),
            active_publishers: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            published_stream_ids: DashMap::new(),
            filter_states: DashMap::new(),
            self_ref: self_ref.clone(),
        })
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn properties(&self) -> &SessionProperties {
        &self.properties
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn events(&self) -> &Arc<dyn SessionEventSink> {
        &self.events
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::session_closed(self.session_id.as_str()));
        }
        Ok(())
    }

    pub fn participant(&self, private_id: &str) -> Option<Arc<Participant>> {
        self.participants.get(private_id).map(|p| Arc::clone(p.value()))
    }

    pub fn participant_by_public_id(&self, public_id: &str) -> Option<Arc<Participant>> {
        self.participants
            .iter()
            .find(|p| p.value().public_id() == public_id)
            .map(|p| Arc::clone(p.value()))
    }

    pub fn participants(&self) -> Vec<Arc<Participant>> {
        self.participants.iter().map(|p| Arc::clone(p.value())).collect()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Participants that keep the session alive
    pub fn occupancy(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| p.value().counts_toward_occupancy())
            .count()
    }

    pub fn snapshots(&self) -> Vec<ParticipantSnapshot> {
        self.participants.iter().map(|p| p.value().snapshot()).collect()
    }

    pub fn active_publishers(&self) -> i32 {
        self.active_publishers.load(Ordering::SeqCst)
    }

    pub fn register_publisher(&self) -> i32 {
        self.active_publishers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn deregister_publisher(&self) -> i32 {
        self.active_publishers.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn participant_private_id_from_stream_id(&self, stream_id: &str) -> Option<String> {
        self.published_stream_ids.get(stream_id).map(|e| e.value().clone())
    }

    pub fn pipeline_element(&self) -> Option<ElementId> {
        self.pipeline.lock().as_ref().and_then(|slot| slot.get())
    }

    /// The session pipeline, created on first use.
    ///
    /// A failed creation is retried by the next caller.
    pub async fn pipeline(&self) -> Result<ElementId> {
        let slot = {
            let mut guard = self.pipeline.lock();
            match guard.as_ref() {
                Some(slot) if !slot.is_released() && !matches!(slot.state(), CreationState::Failed(_)) => {
                    Arc::clone(slot)
                }
                _ => {
                    let slot = Arc::new(ElementSlot::new());
                    *guard = Some(Arc::clone(&slot));
                    slot
                }
            }
        };
        if slot.begin() {
            self.spawn_pipeline_creation(Arc::clone(&slot));
        }
        let what = format!("pipeline of session {}", self.session_id);
        slot.wait(self.config.endpoint_create_timeout(), &what).await
    }

    fn spawn_pipeline_creation(&self, slot: Arc<ElementSlot>) {
        let engine = Arc::clone(&self.engine);
        let session = self.self_ref.clone();
        let session_id = self.session_id.clone();
        tokio::spawn(async move {
            let result = engine.create_pipeline().await;
            match &result {
                Ok(id) => {
                    tracing::info!("Session {}: pipeline {} created", session_id, id);
                    attach_pipeline_errors(engine.as_ref(), id, session).await;
                }
                Err(e) => tracing::error!("Session {}: pipeline creation failed: {}", session_id, e),
            }
            slot.finish(engine.as_ref(), result).await;
        });
    }

    async fn release_pipeline(&self) {
        let slot = self.pipeline.lock().take();
        if let Some(slot) = slot {
            slot.release(self.engine.as_ref()).await;
        }
    }

    fn endpoint_context(&self, identity: &ParticipantIdentity) -> EndpointContext {
        EndpointContext {
            session_id: self.session_id.clone(),
            owner_private_id: identity.private_id.clone(),
            owner_public_id: identity.public_id.clone(),
            engine: Arc::clone(&self.engine),
            events: Arc::clone(&self.events),
            create_timeout: self.config.endpoint_create_timeout(),
            bandwidth: self.config.bandwidth(),
        }
    }

    /// Add a participant and allocate its endpoints
    pub async fn join(&self, identity: ParticipantIdentity, needs_relay: bool) -> Result<JoinOutcome> {
        self.ensure_open()?;
        let pipeline = self.pipeline().await?;
        self.ensure_open()?;

        let already_joined = || {
            SessionError::transport(format!(
                "Connection {} already joined session {}",
                identity.private_id, self.session_id
            ))
        };
        if self.participants.contains_key(&identity.private_id) {
            return Err(already_joined());
        }

        let participant = Participant::new(identity.clone(), self.endpoint_context(&identity), needs_relay);
        participant.create_endpoints(pipeline);

        // close() flips `closed` before clearing the roster under the same lock
        let inserted = {
            let _roster = self.roster.lock();
            if self.is_closed() {
                Err(SessionError::session_closed(self.session_id.as_str()))
            } else if self.participants.contains_key(&identity.private_id) {
                Err(already_joined())
            } else {
                let existing = self.snapshots();
                self.participants
                    .insert(identity.private_id.clone(), Arc::clone(&participant));
                Ok(existing)
            }
        };
        let existing = match inserted {
            Ok(existing) => existing,
            Err(e) => {
                participant.close(EndReason::Disconnect, true).await;
                return Err(e);
            }
        };

        for other in self.participants() {
            if other.private_id() == participant.private_id() {
                continue;
            }
            if other.publisher().is_some() {
                participant.get_new_or_existing_subscriber(other.public_id(), other.publisher_stream_id().as_deref());
            }
        }

        self.send_filter_states(&participant).await;

        tracing::info!(
            "Session {}: participant {} joined ({} present)",
            self.session_id,
            participant.public_id(),
            self.participant_count()
        );
        Ok(JoinOutcome { participant, existing })
    }

    async fn send_filter_states(&self, joiner: &Participant) {
        let states: Vec<(String, Value)> = self
            .filter_states
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        if states.is_empty() {
            return;
        }
        let target = [joiner.snapshot()];
        for (stream_id, state) in states {
            let owner = self
                .participant_private_id_from_stream_id(&stream_id)
                .and_then(|private_id| self.participant(&private_id));
            let Some(owner) = owner else {
                continue;
            };
            tracing::debug!("Session {}: sending filter of {} to {}", self.session_id, stream_id, joiner.public_id());
            self.events
                .on_stream_property_changed(
                    &self.session_id,
                    &target,
                    owner.public_id(),
                    &stream_id,
                    StreamProperty::Filter,
                    &state,
                    "applyFilter",
                )
                .await;
        }
    }

    /// Every other participant gets (or keeps) a subscriber toward
    /// `publisher`, and its engine endpoint starts being created
    pub fn new_publisher(&self, publisher: &Participant) {
        let stream_id = publisher.publisher_stream_id();
        if let Some(id) = &stream_id {
            self.published_stream_ids
                .insert(id.clone(), publisher.private_id().to_string());
        }
        for other in self.participants() {
            if other.private_id() != publisher.private_id() {
                other.prepare_subscriber(publisher.public_id(), stream_id.as_deref());
            }
        }
        tracing::debug!(
            "Session {}: subscribers toward new publisher {} ready",
            self.session_id,
            publisher.public_id()
        );
    }

    /// Every other participant drops its subscriber toward `publisher`
    pub async fn cancel_publisher(&self, publisher: &Participant, reason: EndReason) {
        for other in self.participants() {
            if other.private_id() != publisher.private_id() && other.subscriber(publisher.public_id()).is_some() {
                other.cancel_receiving_media(publisher.public_id(), reason).await;
            }
        }
    }

    fn forget_stream(&self, stream_id: &str) {
        self.published_stream_ids.remove(stream_id);
        self.filter_states.remove(stream_id);
    }

    /// Negotiate `participant`'s publisher and announce the stream
    pub async fn publish(
        &self,
        participant: &Arc<Participant>,
        sdp_type: SdpType,
        sdp: &str,
        options: MediaOptions,
    ) -> Result<String> {
        self.ensure_open()?;
        let filter = options.filter.clone();
        let answer = participant.publish_to_room(sdp_type, sdp, options).await?;
        if self.is_closed() {
            participant.unpublish_media(EndReason::SessionClosedByServer).await;
            return Err(SessionError::session_closed(self.session_id.as_str()));
        }

        self.new_publisher(participant);
        self.register_publisher();
        if let (Some(filter), Some(stream_id)) = (filter, participant.publisher_stream_id()) {
            if let Ok(state) = serde_json::to_value(&filter) {
                self.filter_states.insert(stream_id, state);
            }
        }

        let snapshot = participant.snapshot();
        self.events
            .on_publish_media(&self.session_id, &snapshot, &self.snapshots())
            .await;
        Ok(answer)
    }

    /// Stop `participant`'s stream.
    ///
    /// `notify_owner` also tells the publisher itself (forced or server side).
    pub async fn unpublish(&self, participant: &Arc<Participant>, reason: EndReason, notify_owner: bool) -> Result<()> {
        self.ensure_open()?;
        if !participant.is_streaming() {
            return Err(SessionError::user_not_streaming(participant.public_id()));
        }
        let snapshot = participant.snapshot();
        participant.release_all_filters().await;
        if let Some(stream_id) = participant.unpublish_media(reason).await {
            self.forget_stream(&stream_id);
            self.deregister_publisher();
        }
        self.cancel_publisher(participant, reason).await;
        self.events
            .on_unpublish_media(&self.session_id, &snapshot, &self.snapshots(), reason, notify_owner)
            .await;
        Ok(())
    }

    /// Remove a participant and release everything tied to it
    pub async fn leave(&self, private_id: &str, reason: EndReason) -> Result<LeaveOutcome> {
        let (participant, snapshot, remaining) = {
            let _roster = self.roster.lock();
            let Some((_, participant)) = self.participants.remove(private_id) else {
                return Err(SessionError::participant_not_found(
                    self.session_id.as_str(),
                    private_id,
                ));
            };
            let snapshot = participant.snapshot();
            (participant, snapshot, self.snapshots())
        };

        tracing::info!(
            "Session {}: participant {} leaving ({})",
            self.session_id,
            participant.public_id(),
            reason
        );
        participant.release_all_filters().await;
        let stopped_stream = if participant.is_streaming() {
            let stream_id = participant.publisher_stream_id();
            if let Some(id) = &stream_id {
                self.forget_stream(id);
            }
            self.deregister_publisher();
            stream_id
        } else {
            None
        };
        self.cancel_publisher(&participant, reason).await;
        participant.close(reason, true).await;

        Ok(LeaveOutcome {
            participant,
            snapshot,
            remaining,
            stopped_stream,
        })
    }

    /// Close the session. Only the first caller gets `true`.
    pub async fn close(&self, reason: EndReason) -> bool {
        if self
            .closed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Session {}: already closed", self.session_id);
            return false;
        }
        tracing::info!("Session {}: closing ({})", self.session_id, reason);

        let participants: Vec<Arc<Participant>> = {
            let _roster = self.roster.lock();
            let all = self.participants();
            self.participants.clear();
            all
        };
        for participant in participants {
            participant.close(reason, true).await;
        }
        self.published_stream_ids.clear();
        self.filter_states.clear();
        self.active_publishers.store(0, Ordering::SeqCst);
        self.release_pipeline().await;
        true
    }

    /// Recover after the media engine lost every object.
    ///
    /// Streaming participants are told their stream ended, the pipeline is
    /// recreated and every participant that may publish gets a new publisher
    /// wrapper, created in the engine by its next publish.
    pub async fn restart_status_in_media_engine(&self) {
        if self.is_closed() {
            return;
        }
        tracing::warn!("Session {}: media engine restarted, rebuilding", self.session_id);
        let reason = EndReason::MediaServerDisconnect;

        let mut stopped = Vec::new();
        for participant in self.participants() {
            let was_streaming = participant.is_streaming();
            let snapshot = participant.snapshot();
            let stream_id = participant.publisher_stream_id();
            participant.close(reason, false).await;
            if was_streaming {
                if let Some(id) = &stream_id {
                    self.forget_stream(id);
                }
                self.deregister_publisher();
                stopped.push(snapshot);
            }
        }

        let everyone = self.snapshots();
        for snapshot in &stopped {
            self.events
                .on_unpublish_media(&self.session_id, snapshot, &everyone, reason, true)
                .await;
        }

        self.release_pipeline().await;
        let recreated = tokio::time::timeout(self.config.pipeline_recreate_timeout(), self.pipeline()).await;
        let pipeline = match recreated {
            Ok(Ok(pipeline)) => pipeline,
            Ok(Err(e)) => {
                tracing::error!("Session {}: pipeline could not be recreated: {}", self.session_id, e);
                return;
            }
            Err(_) => {
                tracing::error!(
                    "Session {}: pipeline recreation timed out after {:?}",
                    self.session_id,
                    self.config.pipeline_recreate_timeout()
                );
                return;
            }
        };

        for participant in self.participants() {
            participant.set_pipeline(pipeline.clone());
            if participant.role() != ParticipantRole::Subscriber {
                participant.reset_publisher().await;
            }
        }
        tracing::info!("Session {}: publishers reset on pipeline {}", self.session_id, pipeline);
    }

    /// Record the filter state of `stream_id`, or clear it with `None`
    pub fn set_filter_state(&self, stream_id: &str, state: Option<Value>) {
        match state {
            Some(state) => {
                self.filter_states.insert(stream_id.to_string(), state);
            }
            None => {
                self.filter_states.remove(stream_id);
            }
        }
    }

    pub fn filter_state(&self, stream_id: &str) -> Option<Value> {
        self.filter_states.get(stream_id).map(|e| e.value().clone())
    }

    async fn broadcast_pipeline_error(&self, error: ElementError) {
        let description = error.describe();
        tracing::warn!("Session {}: pipeline error: {}", self.session_id, description);
        self.events
            .on_pipeline_error(&self.session_id, &self.snapshots(), &description)
            .await;
    }
}

async fn attach_pipeline_errors(engine: &dyn MediaEngine, pipeline: &ElementId, session: Weak<MediaSession>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ElementError>();
    tokio::spawn(async move {
        while let Some(error) = rx.recv().await {
            let Some(session) = session.upgrade() else {
                break;
            };
            session.broadcast_pipeline_error(error).await;
        }
    });
    let listener = Arc::new(move |error: ElementError| {
        let _ = tx.send(error);
    });
    if let Err(e) = engine.set_error_listener(pipeline, listener).await {
        tracing::warn!("Could not listen for errors on pipeline {}: {}", pipeline, e);
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSession")
            .field("session_id", &self.session_id)
            .field("participants", &self.participants.len())
            .field("active_publishers", &self.active_publishers())
            .field("closed", &self.is_closed())
            .finish()
    }
}
