//! Units of work shipped between nodes
//!
//! Tasks and their results travel as `bincode` frames over the
//! [`ClusterTransport`](super::ClusterTransport).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::api::types::EndReason;
use crate::errors::{Result, SessionError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterTask {
    /// Negotiate `sdp_offer` against the relay endpoint of `public_id`
    ProcessSdpOffer {
        session_id: String,
        public_id: String,
        sdp_offer: String,
    },
    CloseSession { session_id: String, reason: EndReason },
    /// Deliver a `sendMessage` payload to `public_id` on the node owning it
    SendMessage {
        session_id: String,
        public_id: String,
        from_public_id: String,
        data: String,
        message_type: String,
    },
}

impl ClusterTask {
    /// Key of the per-participant queue the task runs on
    pub fn queue_key(&self) -> &str {
        match self {
            ClusterTask::ProcessSdpOffer { public_id, .. } => public_id,
            ClusterTask::CloseSession { session_id, .. } => session_id,
            ClusterTask::SendMessage { public_id, .. } => public_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ClusterTask::ProcessSdpOffer { .. } => "processSdpOffer",
            ClusterTask::CloseSession { .. } => "closeSession",
            ClusterTask::SendMessage { .. } => "sendMessage",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SessionError::transport(format!("Cannot encode task: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| SessionError::transport(format!("Cannot decode task: {}", e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClusterTaskResult {
    SdpAnswer(String),
    /// `true` when this call closed the session
    SessionClosed(bool),
    Delivered,
    Failed(SessionError),
}

impl ClusterTaskResult {
    pub fn from_result<T>(result: Result<T>, wrap: impl FnOnce(T) -> Self) -> Self {
        match result {
            Ok(value) => wrap(value),
            Err(e) => ClusterTaskResult::Failed(e),
        }
    }

    /// The SDP answer, or the error the owning node reported
    pub fn into_answer(self) -> Result<String> {
        match self {
            ClusterTaskResult::SdpAnswer(answer) => Ok(answer),
            ClusterTaskResult::Failed(e) => Err(e),
            other => Err(SessionError::transport(format!("Unexpected task result: {:?}", other))),
        }
    }

    pub fn into_closed(self) -> Result<bool> {
        match self {
            ClusterTaskResult::SessionClosed(closed) => Ok(closed),
            ClusterTaskResult::Failed(e) => Err(e),
            other => Err(SessionError::transport(format!("Unexpected task result: {:?}", other))),
        }
    }

    pub fn into_delivered(self) -> Result<()> {
        match self {
            ClusterTaskResult::Delivered => Ok(()),
            ClusterTaskResult::Failed(e) => Err(e),
            other => Err(SessionError::transport(format!("Unexpected task result: {:?}", other))),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| SessionError::transport(format!("Cannot encode task result: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
            .map_err(|e| SessionError::transport(format!("Cannot decode task result: {}", e)))
    }
}

/// Executes tasks addressed to this node
#[async_trait]
pub trait ClusterTaskHandler: Send + Sync {
    async fn handle_task(&self, task: ClusterTask) -> ClusterTaskResult;
}
