//! Endpoint wrappers
//!
//! A [`MediaEndpoint`] owns one media engine endpoint on behalf of a
//! participant. Creation is asynchronous: the handle is absent until the engine
//! answers, and every caller that needs it waits on a bounded latch. Remote ICE
//! candidates that arrive before the handle exists are buffered and flushed in
//! arrival order once it does.

pub mod filter;
pub mod publisher;
pub mod relay;
pub mod subscriber;

pub use filter::FilterChain;
pub use publisher::PublisherEndpoint;
pub use relay::RelayEndpoint;
pub use subscriber::SubscriberEndpoint;

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{Mutex, mpsc};

use crate::api::types::{IceCandidate, SessionId};
use crate::coordination::{CreationLatch, CreationState, LatchError};
use crate::engine::{BandwidthLimits, ElementError, ElementId, ElementKind, EngineError, MediaEngine};
use crate::errors::{Result, SessionError};
use crate::events::SessionEventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    Publisher,
    Subscriber,
    Relay,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Publisher => write!(f, "publisher"),
            EndpointKind::Subscriber => write!(f, "subscriber"),
            EndpointKind::Relay => write!(f, "relay"),
        }
    }
}

/// Everything an endpoint needs from its owner and session
#[derive(Clone)]
pub struct EndpointContext {
    pub session_id: SessionId,
    pub owner_private_id: String,
    pub owner_public_id: String,
    pub engine: Arc<dyn MediaEngine>,
    pub events: Arc<dyn SessionEventSink>,
    pub create_timeout: Duration,
    pub bandwidth: BandwidthLimits,
}

impl fmt::Debug for EndpointContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointContext")
            .field("session_id", &self.session_id)
            .field("owner_public_id", &self.owner_public_id)
            .field("create_timeout", &self.create_timeout)
            .finish()
    }
}

/// One engine element created in the background.
///
/// If the slot is released while the engine is still creating, the element is
/// released as soon as it arrives. The element is released at most once.
#[derive(Debug, Default)]
pub(crate) struct ElementSlot {
    latch: CreationLatch<ElementId>,
    released: AtomicBool,
    freed: AtomicBool,
}

impl ElementSlot {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn begin(&self) -> bool {
        self.latch.try_begin()
    }

    pub(crate) fn get(&self) -> Option<ElementId> {
        self.latch.get()
    }

    pub(crate) fn state(&self) -> CreationState<ElementId> {
        self.latch.state()
    }

    pub(crate) fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Record the engine's answer. Returns the element only if the slot is
    /// still wanted.
    pub(crate) async fn finish(
        &self,
        engine: &dyn MediaEngine,
        result: std::result::Result<ElementId, EngineError>,
    ) -> Option<ElementId> {
        match result {
            Ok(id) => {
                self.latch.complete(Ok(id.clone()));
                if self.is_released() {
                    self.free(engine, &id).await;
                    return None;
                }
                Some(id)
            }
            Err(e) => {
                self.latch.complete(Err(e.to_string()));
                None
            }
        }
    }

    pub(crate) async fn wait(&self, timeout: Duration, what: &str) -> Result<ElementId> {
        if self.is_released() {
            return Err(SessionError::media_endpoint(format!("{} was released", what)));
        }
        match self.latch.wait(timeout).await {
            Ok(id) => Ok(id),
            Err(LatchError::Timeout) => Err(SessionError::media_endpoint_timeout(
                what,
                timeout.as_millis() as u64,
            )),
            Err(LatchError::Failed(reason)) => Err(SessionError::media_endpoint(format!(
                "{} could not be created: {}",
                what, reason
            ))),
        }
    }

    /// Mark released and free the element if it already exists
    pub(crate) async fn release(&self, engine: &dyn MediaEngine) {
        self.released.store(true, Ordering::SeqCst);
        if let Some(id) = self.latch.get() {
            self.free(engine, &id).await;
        }
    }

    async fn free(&self, engine: &dyn MediaEngine, id: &ElementId) {
        if self
            .freed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        if let Err(e) = engine.release(id).await {
            tracing::warn!("Failed to release element {}: {}", id, e);
        }
    }
}

#[derive(Debug, Default)]
struct IceBuffer {
    pending: VecDeque<IceCandidate>,
    flushed: bool,
}

enum EndpointSignal {
    Candidate(IceCandidate),
    Error(ElementError),
}

/// Engine endpoint owned by one participant
pub struct MediaEndpoint {
    kind: EndpointKind,
    name: RwLock<String>,
    ctx: EndpointContext,
    /// Public id announced as the sender of local candidates
    ice_sender: String,
    slot: ElementSlot,
    ice: Mutex<IceBuffer>,
    signals: parking_lot::Mutex<Option<mpsc::UnboundedSender<EndpointSignal>>>,
    created_at: i64,
}

impl MediaEndpoint {
    pub fn new(
        kind: EndpointKind,
        name: impl Into<String>,
        ctx: EndpointContext,
        ice_sender: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            name: RwLock::new(name.into()),
            ctx,
            ice_sender: ice_sender.into(),
            slot: ElementSlot::new(),
            ice: Mutex::new(IceBuffer::default()),
            signals: parking_lot::Mutex::new(None),
            created_at: chrono::Utc::now().timestamp_millis(),
        })
    }

    pub fn kind(&self) -> EndpointKind {
        self.kind
    }

    pub fn name(&self) -> String {
        self.name.read().clone()
    }

    pub(crate) fn set_name(&self, name: impl Into<String>) {
        *self.name.write() = name.into();
    }

    pub fn context(&self) -> &EndpointContext {
        &self.ctx
    }

    pub fn owner_public_id(&self) -> &str {
        &self.ctx.owner_public_id
    }

    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    pub fn element(&self) -> Option<ElementId> {
        self.slot.get()
    }

    pub fn state(&self) -> CreationState<ElementId> {
        self.slot.state()
    }

    pub fn is_released(&self) -> bool {
        self.slot.is_released()
    }

    fn element_kind(&self) -> ElementKind {
        match self.kind {
            EndpointKind::Publisher | EndpointKind::Subscriber => ElementKind::WebRtcEndpoint {
                bandwidth: self.ctx.bandwidth,
            },
            EndpointKind::Relay => ElementKind::RtpEndpoint,
        }
    }

    /// Start creating the engine endpoint inside `pipeline`.
    ///
    /// Only the first call does anything; it returns without waiting.
    pub fn create(self: &Arc<Self>, pipeline: ElementId) -> bool {
        if !self.slot.begin() {
            return false;
        }
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let result = this
                .ctx
                .engine
                .create_element(&pipeline, this.element_kind())
                .await;
            match &result {
                Ok(id) => this.attach_signals(id).await,
                Err(e) => tracing::warn!(
                    "Creation of {} endpoint {} failed: {}",
                    this.kind,
                    this.name(),
                    e
                ),
            }
            match this.slot.finish(this.ctx.engine.as_ref(), result).await {
                Some(id) => {
                    tracing::debug!("{} endpoint {} created as {}", this.kind, this.name(), id);
                    this.flush_ice(&id).await;
                }
                None => {
                    this.signals.lock().take();
                }
            }
        });
        true
    }

    /// Wait for the engine endpoint, bounded by the configured timeout
    pub async fn wait_created(&self) -> Result<ElementId> {
        let what = format!("{} endpoint {}", self.kind, self.name());
        self.slot.wait(self.ctx.create_timeout, &what).await
    }

    /// Forward a remote candidate, or buffer it until the endpoint exists
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut ice = self.ice.lock().await;
        if !ice.flushed {
            ice.pending.push_back(candidate);
            return Ok(());
        }
        match self.slot.get() {
            Some(id) => {
                self.ctx.engine.add_ice_candidate(&id, &candidate).await?;
                Ok(())
            }
            None => {
                ice.pending.push_back(candidate);
                Ok(())
            }
        }
    }

    async fn flush_ice(&self, id: &ElementId) {
        let mut ice = self.ice.lock().await;
        while let Some(candidate) = ice.pending.pop_front() {
            if let Err(e) = self.ctx.engine.add_ice_candidate(id, &candidate).await {
                tracing::warn!(
                    "Buffered ICE candidate rejected by endpoint {}: {}",
                    self.name(),
                    e
                );
            }
        }
        ice.flushed = true;
    }

    /// Number of candidates still waiting for the endpoint
    pub async fn pending_candidates(&self) -> usize {
        self.ice.lock().await.pending.len()
    }

    // One forwarder per endpoint keeps local candidates in engine order
    async fn attach_signals(self: &Arc<Self>, id: &ElementId) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(signal) = rx.recv().await {
                let Some(endpoint) = weak.upgrade() else {
                    break;
                };
                endpoint.dispatch_signal(signal).await;
            }
        });

        let error_tx = tx.clone();
        let listener = Arc::new(move |error: ElementError| {
            let _ = error_tx.send(EndpointSignal::Error(error));
        });
        if let Err(e) = self.ctx.engine.set_error_listener(id, listener).await {
            tracing::warn!("Could not listen for errors on {}: {}", id, e);
        }
        *self.signals.lock() = Some(tx);
    }

    async fn dispatch_signal(&self, signal: EndpointSignal) {
        match signal {
            EndpointSignal::Candidate(candidate) => {
                self.ctx
                    .events
                    .on_ice_candidate(
                        &self.ctx.session_id,
                        &self.ctx.owner_private_id,
                        &self.ice_sender,
                        &self.name(),
                        &candidate,
                    )
                    .await;
            }
            EndpointSignal::Error(error) => {
                tracing::warn!(
                    "Media error on {} endpoint {}: {}",
                    self.kind,
                    self.name(),
                    error.describe()
                );
                self.ctx
                    .events
                    .on_media_error(
                        &self.ctx.session_id,
                        &self.ctx.owner_private_id,
                        &error.describe(),
                    )
                    .await;
            }
        }
    }

    /// Send every local candidate the engine discovers to the owner
    pub(crate) async fn register_ice_listener(&self, id: &ElementId) -> Result<()> {
        let tx = self
            .signals
            .lock()
            .clone()
            .ok_or_else(|| SessionError::media_endpoint(format!("{} was released", self.name())))?;
        let listener = Arc::new(move |candidate: IceCandidate| {
            let _ = tx.send(EndpointSignal::Candidate(candidate));
        });
        self.ctx.engine.set_ice_candidate_listener(id, listener).await?;
        Ok(())
    }

    pub(crate) async fn gather_candidates(&self, id: &ElementId) -> Result<()> {
        self.ctx.engine.gather_candidates(id).await?;
        Ok(())
    }

    /// Release the engine endpoint. Safe to call more than once, and while
    /// creation is still in flight.
    pub async fn release(&self) {
        self.signals.lock().take();
        self.slot.release(self.ctx.engine.as_ref()).await;
        tracing::debug!("{} endpoint {} released", self.kind, self.name());
    }
}

impl fmt::Debug for MediaEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaEndpoint")
            .field("kind", &self.kind)
            .field("name", &*self.name.read())
            .field("state", &self.slot.state().label())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::engine::mock::MockMediaEngine;
    use crate::events::{NotificationLog, SessionEventsHandler};

    pub(crate) struct Harness {
        pub engine: Arc<MockMediaEngine>,
        pub log: Arc<NotificationLog>,
        pub pipeline: ElementId,
    }

    impl Harness {
        pub(crate) async fn new() -> Self {
            let engine = MockMediaEngine::shared();
            let pipeline = engine.create_pipeline().await.unwrap();
            Self {
                engine,
                log: Arc::new(NotificationLog::new()),
                pipeline,
            }
        }

        pub(crate) fn context(&self, private_id: &str, public_id: &str) -> EndpointContext {
            EndpointContext {
                session_id: SessionId::from("room1"),
                owner_private_id: private_id.to_string(),
                owner_public_id: public_id.to_string(),
                engine: self.engine.clone(),
                events: Arc::new(SessionEventsHandler::new(self.log.clone())),
                create_timeout: Duration::from_millis(500),
                bandwidth: BandwidthLimits::default(),
            }
        }
    }
}
