//! Media engine contract
//!
//! The session core never processes media itself. Pipelines, WebRTC/RTP
//! endpoints, pass-through hubs and filters live in an external media engine
//! reached through the [`MediaEngine`] trait. Any engine that honours these
//! calls can drive a room; [`mock::MockMediaEngine`] is an in-memory one.

pub mod mock;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::types::{FilterDescriptor, IceCandidate, MediaType};

/// Opaque handle of an object living in the media engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ElementId(pub String);

impl ElementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bandwidth hints applied to WebRTC endpoints at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BandwidthLimits {
    pub min_send_kbps: u32,
    pub max_send_kbps: u32,
    pub min_recv_kbps: u32,
    pub max_recv_kbps: u32,
}

/// Kind of element to create inside a pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    /// Browser-facing endpoint
    WebRtcEndpoint { bandwidth: BandwidthLimits },
    /// Plain RTP endpoint used for node-to-node relays
    RtpEndpoint,
    /// Hub element that fans a publisher out to its subscribers
    PassThrough,
    /// Media-shaping element from a client filter request
    Filter(FilterDescriptor),
}

impl ElementKind {
    pub fn label(&self) -> &'static str {
        match self {
            ElementKind::WebRtcEndpoint { .. } => "WebRtcEndpoint",
            ElementKind::RtpEndpoint => "RtpEndpoint",
            ElementKind::PassThrough => "PassThrough",
            ElementKind::Filter(_) => "Filter",
        }
    }
}

/// Error event raised asynchronously by an engine object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementError {
    pub element: ElementId,
    pub error_type: String,
    pub description: String,
    pub error_code: i32,
}

impl ElementError {
    /// Human readable form sent to clients in `mediaError`
    pub fn describe(&self) -> String {
        format!(
            "{}: {}(errCode={})",
            self.error_type, self.description, self.error_code
        )
    }
}

/// Errors reported by the media engine
#[derive(Debug, Clone, thiserror::Error)]
pub enum EngineError {
    #[error("Failed to create {kind}: {reason}")]
    CreationFailed { kind: String, reason: String },

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("SDP negotiation failed on {element}: {reason}")]
    Negotiation { element: String, reason: String },

    #[error("Connection {source_element} -> {sink} failed: {reason}")]
    Connection {
        source_element: String,
        sink: String,
        reason: String,
    },

    #[error("Media engine disconnected")]
    Disconnected,

    #[error("Media engine error: {0}")]
    Other(String),
}

/// Receives local ICE candidates discovered by an endpoint
pub type IceCandidateListener = Arc<dyn Fn(IceCandidate) + Send + Sync>;

/// Receives error events raised by an element
pub type ElementErrorListener = Arc<dyn Fn(ElementError) + Send + Sync>;

/// Contract with the external media-processing engine.
///
/// All calls are asynchronous. Completion of `create_*` resolves the future;
/// callers that need a synchronous-looking result bridge it through a
/// [`crate::coordination::CreationLatch`].
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a new pipeline (one per session)
    async fn create_pipeline(&self) -> Result<ElementId, EngineError>;

    /// Create an element of `kind` inside `pipeline`
    async fn create_element(
        &self,
        pipeline: &ElementId,
        kind: ElementKind,
    ) -> Result<ElementId, EngineError>;

    /// Release a pipeline or element
    async fn release(&self, element: &ElementId) -> Result<(), EngineError>;

    async fn process_offer(&self, element: &ElementId, sdp_offer: &str) -> Result<String, EngineError>;

    async fn process_answer(&self, element: &ElementId, sdp_answer: &str) -> Result<String, EngineError>;

    async fn generate_offer(&self, element: &ElementId) -> Result<String, EngineError>;

    /// Connect `source` to `sink`, optionally for one media type only
    async fn connect(
        &self,
        source: &ElementId,
        sink: &ElementId,
        media_type: Option<MediaType>,
    ) -> Result<(), EngineError>;

    async fn disconnect(
        &self,
        source: &ElementId,
        sink: &ElementId,
        media_type: Option<MediaType>,
    ) -> Result<(), EngineError>;

    /// Start ICE gathering; each local candidate goes to the registered listener
    async fn gather_candidates(&self, element: &ElementId) -> Result<(), EngineError>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(
        &self,
        element: &ElementId,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError>;

    async fn set_ice_candidate_listener(
        &self,
        element: &ElementId,
        listener: IceCandidateListener,
    ) -> Result<(), EngineError>;

    async fn set_error_listener(
        &self,
        element: &ElementId,
        listener: ElementErrorListener,
    ) -> Result<(), EngineError>;

    /// Invoke a method on a filter element
    async fn exec_filter_method(
        &self,
        filter: &ElementId,
        method: &str,
        params: &Value,
    ) -> Result<Value, EngineError>;
}
