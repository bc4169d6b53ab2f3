//! Participant
//!
//! Owns one participant's endpoints inside a session: an optional publisher,
//! an optional relay toward other nodes, and one subscriber per remote
//! publisher it receives.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::RwLock;

use super::snapshot::{ParticipantSnapshot, StreamInfo};
use crate::api::types::{
    EndReason, IceCandidate, MediaOptions, ParticipantIdentity, ParticipantRole,
    RECORDER_PARTICIPANT_PUBLIC_ID, SdpType, SessionId,
};
use crate::endpoint::{EndpointContext, PublisherEndpoint, RelayEndpoint, SubscriberEndpoint};
use crate::engine::ElementId;
use crate::errors::{Result, SessionError};

pub struct Participant {
    identity: ParticipantIdentity,
    ctx: EndpointContext,
    pipeline: RwLock<Option<ElementId>>,
    publisher: ArcSwapOption<PublisherEndpoint>,
    relay: ArcSwapOption<RelayEndpoint>,
    /// Keyed by the sender's public id
    subscribers: DashMap<String, Arc<SubscriberEndpoint>>,
    streaming: AtomicBool,
    /// Held by the publish negotiation in flight
    publishing: AtomicBool,
    closed: AtomicBool,
}

impl Participant {
    /// `ctx` must already carry this participant's ids
    pub fn new(identity: ParticipantIdentity, ctx: EndpointContext, needs_relay: bool) -> Arc<Self> {
        let publisher = identity
            .token
            .role
            .can_publish()
            .then(|| PublisherEndpoint::new(ctx.clone()));
        let relay = needs_relay.then(|| RelayEndpoint::new(ctx.clone()));
        Arc::new(Self {
            identity,
            ctx,
            pipeline: RwLock::new(None),
            publisher: ArcSwapOption::new(publisher),
            relay: ArcSwapOption::new(relay),
            subscribers: DashMap::new(),
            streaming: AtomicBool::new(false),
            publishing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &ParticipantIdentity {
        &self.identity
    }

    pub fn private_id(&self) -> &str {
        &self.identity.private_id
    }

    pub fn public_id(&self) -> &str {
        &self.identity.public_id
    }

    pub fn session_id(&self) -> &SessionId {
        &self.identity.session_id
    }

    pub fn role(&self) -> ParticipantRole {
        self.identity.token.role
    }

    pub fn token(&self) -> &str {
        &self.identity.token.token
    }

    /// The recording participant never keeps a session alive
    pub fn counts_toward_occupancy(&self) -> bool {
        self.identity.public_id != RECORDER_PARTICIPANT_PUBLIC_ID
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn publisher(&self) -> Option<Arc<PublisherEndpoint>> {
        self.publisher.load_full()
    }

    pub fn relay(&self) -> Option<Arc<RelayEndpoint>> {
        self.relay.load_full()
    }

    pub fn subscriber(&self, sender_public_id: &str) -> Option<Arc<SubscriberEndpoint>> {
        self.subscribers.get(sender_public_id).map(|s| Arc::clone(s.value()))
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publisher_stream_id(&self) -> Option<String> {
        self.publisher().and_then(|p| p.stream_id())
    }

    pub fn snapshot(&self) -> ParticipantSnapshot {
        let mut streams = Vec::new();
        if self.is_streaming() {
            if let Some(publisher) = self.publisher() {
                if let (Some(id), Some(options)) = (publisher.stream_id(), publisher.media_options()) {
                    let created_at = publisher.negotiated_at().unwrap_or_default();
                    streams.push(StreamInfo::from_options(id, created_at, &options));
                }
            }
        }
        ParticipantSnapshot {
            private_id: self.identity.private_id.clone(),
            public_id: self.identity.public_id.clone(),
            created_at: self.identity.created_at,
            metadata: self.identity.client_metadata.clone(),
            streams,
        }
    }

    /// Attach the participant to `pipeline` and start creating its relay.
    ///
    /// The publisher is created by the first publish, subscribers by
    /// [`Participant::prepare_subscriber`].
    pub fn create_endpoints(&self, pipeline: ElementId) {
        *self.pipeline.write() = Some(pipeline.clone());
        if let Some(relay) = self.relay() {
            relay.create(pipeline);
        }
    }

    fn current_pipeline(&self) -> Option<ElementId> {
        self.pipeline.read().clone()
    }

    /// Subscriber toward `sender_public_id`, created if absent.
    ///
    /// Concurrent callers for the same sender get the same wrapper.
    pub fn get_new_or_existing_subscriber(
        &self,
        sender_public_id: &str,
        stream_id: Option<&str>,
    ) -> Arc<SubscriberEndpoint> {
        let entry = self
            .subscribers
            .entry(sender_public_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(
                    "Participant {}: new subscriber endpoint to {}",
                    self.public_id(),
                    sender_public_id
                );
                SubscriberEndpoint::new(self.ctx.clone(), sender_public_id, stream_id)
            });
        Arc::clone(entry.value())
    }

    /// Like [`Participant::get_new_or_existing_subscriber`], and the engine
    /// endpoint starts being created
    pub fn prepare_subscriber(&self, sender_public_id: &str, stream_id: Option<&str>) -> Arc<SubscriberEndpoint> {
        let subscriber = self.get_new_or_existing_subscriber(sender_public_id, stream_id);
        if let Some(pipeline) = self.current_pipeline() {
            subscriber.endpoint().create(pipeline);
        }
        subscriber
    }

    pub async fn publish_to_room(&self, sdp_type: SdpType, sdp: &str, options: MediaOptions) -> Result<String> {
        if self.is_closed() {
            return Err(SessionError::media_endpoint(format!(
                "Participant {} is closed",
                self.public_id()
            )));
        }
        let publisher = self.publisher().ok_or_else(|| {
            SessionError::media_endpoint(format!(
                "Participant {} with role {:?} cannot publish",
                self.public_id(),
                self.role()
            ))
        })?;

        if self.is_streaming() || self.publishing.swap(true, Ordering::SeqCst) {
            return Err(SessionError::media_endpoint(format!(
                "Participant {} is already publishing",
                self.public_id()
            )));
        }

        tracing::info!(
            "Participant {}: request to publish in session {} (sdp type {:?})",
            self.public_id(),
            self.session_id(),
            sdp_type
        );
        let result = match self.current_pipeline() {
            Some(pipeline) => {
                publisher.create(pipeline);
                publisher.publish(sdp_type, sdp, options).await
            }
            None => Err(SessionError::media_endpoint(format!(
                "Participant {} has no pipeline",
                self.public_id()
            ))),
        };
        let outcome = match result {
            Ok(answer) => {
                self.streaming.store(true, Ordering::SeqCst);
                Ok(answer)
            }
            Err(e) => {
                tracing::warn!("Participant {}: publish failed: {}", self.public_id(), e);
                self.reset_publisher().await;
                Err(e)
            }
        };
        self.publishing.store(false, Ordering::SeqCst);
        outcome
    }

    /// Negotiate a subscriber toward `sender`'s published stream
    pub async fn receive_media_from(&self, sender: &Participant, sdp_offer: &str) -> Result<String> {
        let sender_id = sender.public_id();
        if sender_id == self.public_id() {
            return Err(SessionError::user_not_streaming(sender_id));
        }
        let publisher = match sender.publisher() {
            Some(p) if sender.is_streaming() => p,
            _ => return Err(SessionError::user_not_streaming(sender_id)),
        };

        let stream_id = publisher.stream_id();
        let mut subscriber = self.prepare_subscriber(sender_id, stream_id.as_deref());
        if subscriber.is_connected_to_publisher() {
            tracing::warn!(
                "Participant {}: renegotiating existing subscription to {}",
                self.public_id(),
                sender_id
            );
            self.subscribers.remove(sender_id);
            subscriber.release().await;
            subscriber = self.prepare_subscriber(sender_id, stream_id.as_deref());
        }

        match subscriber.subscribe(sdp_offer, &publisher).await {
            Ok(answer) => {
                tracing::info!(
                    "Participant {}: now receiving {} in session {}",
                    self.public_id(),
                    sender_id,
                    self.session_id()
                );
                Ok(answer)
            }
            Err(e) => {
                self.subscribers.remove(sender_id);
                subscriber.release().await;
                if publisher.is_released() || matches!(e, SessionError::UserNotStreaming { .. }) {
                    tracing::warn!(
                        "Participant {}: publisher {} went away while subscribing",
                        self.public_id(),
                        sender_id
                    );
                    Err(SessionError::user_not_streaming(sender_id))
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Release the subscriber toward `sender_public_id`, if any
    pub async fn cancel_receiving_media(&self, sender_public_id: &str, reason: EndReason) -> bool {
        match self.subscribers.remove(sender_public_id) {
            Some((_, subscriber)) => {
                subscriber.release().await;
                tracing::info!(
                    "Participant {}: stopped receiving {} ({})",
                    self.public_id(),
                    sender_public_id,
                    reason
                );
                true
            }
            None => {
                tracing::warn!(
                    "Participant {}: no subscriber endpoint to {} to cancel",
                    self.public_id(),
                    sender_public_id
                );
                false
            }
        }
    }

    /// Release the publisher and leave a fresh one ready for the next publish.
    ///
    /// Returns the stream id that stopped, if the participant was streaming.
    pub async fn unpublish_media(&self, reason: EndReason) -> Option<String> {
        let was_streaming = self.streaming.swap(false, Ordering::SeqCst);
        let stream_id = self.publisher_stream_id();
        tracing::info!(
            "Participant {}: unpublishing from session {} ({})",
            self.public_id(),
            self.session_id(),
            reason
        );
        self.reset_publisher().await;
        if was_streaming { stream_id } else { None }
    }

    /// Replace the publisher wrapper with a new one. Its engine endpoint is
    /// created by the next publish.
    pub async fn reset_publisher(&self) {
        if !self.role().can_publish() {
            return;
        }
        let fresh = PublisherEndpoint::new(self.ctx.clone());
        if let Some(old) = self.publisher.swap(Some(fresh)) {
            old.release().await;
        }
        self.streaming.store(false, Ordering::SeqCst);
    }

    /// Point the participant at a new pipeline, e.g. after an engine restart
    pub(crate) fn set_pipeline(&self, pipeline: ElementId) {
        *self.pipeline.write() = Some(pipeline);
    }

    /// Route a remote candidate to the endpoint named `endpoint_name`.
    ///
    /// Candidates for a subscriber that does not exist yet allocate its
    /// wrapper, which buffers them until the subscription creates it.
    pub async fn add_ice_candidate(&self, endpoint_name: &str, candidate: IceCandidate) -> Result<()> {
        if let Some(publisher) = self.publisher() {
            if endpoint_name == self.public_id() || endpoint_name == publisher.name() {
                return publisher.add_ice_candidate(candidate).await;
            }
        }
        let existing = self
            .subscribers
            .iter()
            .find(|s| s.key() == endpoint_name || s.value().name() == endpoint_name)
            .map(|s| Arc::clone(s.value()));
        let subscriber = match existing {
            Some(s) => s,
            None => self.get_new_or_existing_subscriber(endpoint_name, None),
        };
        subscriber.add_ice_candidate(candidate).await
    }

    pub async fn release_all_filters(&self) {
        if let Some(publisher) = self.publisher() {
            publisher.release_filters().await;
        }
    }

    /// Release every endpoint.
    ///
    /// With `definitive` the participant stays closed; otherwise it can get new
    /// endpoints later (engine restart). Closing twice is a no-op.
    pub async fn close(&self, reason: EndReason, definitive: bool) {
        if self.is_closed() || (definitive && self.closed.swap(true, Ordering::SeqCst)) {
            tracing::warn!("Participant {}: already closed", self.public_id());
            return;
        }
        tracing::debug!("Participant {}: closing ({})", self.public_id(), reason);

        let senders: Vec<String> = self.subscribers.iter().map(|s| s.key().clone()).collect();
        for sender in senders {
            if let Some((_, subscriber)) = self.subscribers.remove(&sender) {
                subscriber.release().await;
            }
        }
        if let Some(publisher) = self.publisher() {
            publisher.release().await;
        }
        if let Some(relay) = self.relay() {
            relay.release().await;
        }
        self.streaming.store(false, Ordering::SeqCst);
    }
}

impl std::fmt::Debug for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("public_id", &self.identity.public_id)
            .field("session_id", &self.identity.session_id)
            .field("streaming", &self.is_streaming())
            .field("closed", &self.is_closed())
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
