//! Error types for the session core
//!
//! Every request-scoped failure surfaces as a [`SessionError`]. The transport
//! layer turns it into a structured error response using [`SessionError::code`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::EngineError;

/// Result type for session core operations
pub type Result<T> = std::result::Result<T, SessionError>;

/// Errors that can occur while orchestrating sessions, participants and endpoints
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
pub enum SessionError {
    /// No session registered under the given id
    #[error("Session '{session_id}' not found")]
    SessionNotFound { session_id: String },

    /// The session is closing or closed and rejects mutation
    #[error("Session '{session_id}' is closed")]
    SessionClosed { session_id: String },

    /// A session with the same id is already registered
    #[error("Session '{session_id}' already exists")]
    SessionAlreadyExists { session_id: String },

    /// No participant with the given id in the session
    #[error("Participant '{participant_id}' not found in session '{session_id}'")]
    ParticipantNotFound {
        session_id: String,
        participant_id: String,
    },

    /// The targeted participant has no active publisher
    #[error("User '{participant_id}' is not streaming media")]
    UserNotStreaming { participant_id: String },

    /// Creation or negotiation against the media engine failed
    #[error("Media endpoint error: {message}")]
    MediaEndpointError { message: String },

    /// A bounded wait for a media engine object expired
    #[error("Timed out after {timeout_ms} ms waiting for {what}")]
    MediaEndpointTimeout { what: String, timeout_ms: u64 },

    /// A cluster-dispatched unit of work failed or timed out
    #[error("Cluster dispatch to node '{node_id}' failed: {message}")]
    ClusterDispatchError { node_id: String, message: String },

    /// A filter operation could not be carried out
    #[error("Filter not applied: {message}")]
    FilterNotApplied { message: String },

    /// A referenced participant has no reachable connection
    #[error("Transport error: {message}")]
    TransportError { message: String },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl SessionError {
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    pub fn session_closed(session_id: impl Into<String>) -> Self {
        Self::SessionClosed {
            session_id: session_id.into(),
        }
    }

    pub fn session_already_exists(session_id: impl Into<String>) -> Self {
        Self::SessionAlreadyExists {
            session_id: session_id.into(),
        }
    }

    pub fn participant_not_found(
        session_id: impl Into<String>,
        participant_id: impl Into<String>,
    ) -> Self {
        Self::ParticipantNotFound {
            session_id: session_id.into(),
            participant_id: participant_id.into(),
        }
    }

    pub fn user_not_streaming(participant_id: impl Into<String>) -> Self {
        Self::UserNotStreaming {
            participant_id: participant_id.into(),
        }
    }

    pub fn media_endpoint(message: impl Into<String>) -> Self {
        Self::MediaEndpointError {
            message: message.into(),
        }
    }

    pub fn media_endpoint_timeout(what: impl Into<String>, timeout_ms: u64) -> Self {
        Self::MediaEndpointTimeout {
            what: what.into(),
            timeout_ms,
        }
    }

    pub fn cluster_dispatch(node_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ClusterDispatchError {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    pub fn filter_not_applied(message: impl Into<String>) -> Self {
        Self::FilterNotApplied {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::TransportError {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Numeric code carried in structured error responses
    pub fn code(&self) -> i32 {
        match self {
            Self::ParticipantNotFound { .. } => 102,
            Self::UserNotStreaming { .. } => 105,
            Self::SessionNotFound { .. } => 202,
            Self::SessionClosed { .. } => 203,
            Self::SessionAlreadyExists { .. } => 204,
            Self::MediaEndpointError { .. } => 303,
            Self::MediaEndpointTimeout { .. } => 304,
            Self::FilterNotApplied { .. } => 711,
            Self::TransportError { .. } => 803,
            Self::ClusterDispatchError { .. } => 804,
            Self::Configuration { .. } => 999,
        }
    }

    /// Whether the caller may retry the same request later
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ClusterDispatchError { .. } | Self::MediaEndpointTimeout { .. }
        )
    }
}

impl From<EngineError> for SessionError {
    fn from(err: EngineError) -> Self {
        SessionError::MediaEndpointError {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_distinct() {
        let errors = vec![
            SessionError::session_not_found("s"),
            SessionError::session_closed("s"),
            SessionError::session_already_exists("s"),
            SessionError::participant_not_found("s", "p"),
            SessionError::user_not_streaming("p"),
            SessionError::media_endpoint("boom"),
            SessionError::media_endpoint_timeout("pipeline", 10),
            SessionError::cluster_dispatch("node-b", "gone"),
            SessionError::filter_not_applied("none"),
            SessionError::transport("no connection"),
            SessionError::config("bad"),
        ];
        let mut codes: Vec<i32> = errors.iter().map(|e| e.code()).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn test_engine_error_maps_to_media_endpoint_error() {
        let err: SessionError = EngineError::ElementNotFound("el-1".to_string()).into();
        assert_eq!(err.code(), 303);
        assert!(err.to_string().contains("el-1"));
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(SessionError::cluster_dispatch("n", "timeout").is_recoverable());
        assert!(!SessionError::session_closed("s").is_recoverable());
    }
}
