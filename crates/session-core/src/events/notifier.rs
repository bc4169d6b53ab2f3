//! Outbound notification channel
//!
//! [`RpcNotifier`] is implemented by the transport layer; the core only hands
//! it a connection id, a method name and a JSON params object.
//! [`NotificationLog`] keeps everything in memory.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::errors::{Result, SessionError};

/// A notification addressed to one connection
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub participant_private_id: String,
    pub method: String,
    pub params: Value,
}

/// Delivers notifications to client connections
#[async_trait]
pub trait RpcNotifier: Send + Sync {
    async fn send_notification(
        &self,
        participant_private_id: &str,
        method: &str,
        params: Value,
    ) -> Result<()>;
}

/// Notifier that records every notification in order
#[derive(Debug, Default)]
pub struct NotificationLog {
    sent: Mutex<Vec<Notification>>,
    unreachable: Mutex<HashSet<String>>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `participant_private_id` fail with a transport error
    pub fn mark_unreachable(&self, participant_private_id: &str) {
        self.unreachable
            .lock()
            .insert(participant_private_id.to_string());
    }

    pub fn all(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn for_participant(&self, participant_private_id: &str) -> Vec<Notification> {
        self.sent
            .lock()
            .iter()
            .filter(|n| n.participant_private_id == participant_private_id)
            .cloned()
            .collect()
    }

    /// Method names received by one connection, in order
    pub fn methods_for(&self, participant_private_id: &str) -> Vec<String> {
        self.for_participant(participant_private_id)
            .into_iter()
            .map(|n| n.method)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.sent.lock().iter().filter(|n| n.method == method).count()
    }

    pub fn clear(&self) {
        self.sent.lock().clear();
    }
}

#[async_trait]
impl RpcNotifier for NotificationLog {
    async fn send_notification(
        &self,
        participant_private_id: &str,
        method: &str,
        params: Value,
    ) -> Result<()> {
        if self.unreachable.lock().contains(participant_private_id) {
            return Err(SessionError::transport(format!(
                "No connection for participant {}",
                participant_private_id
            )));
        }
        self.sent.lock().push(Notification {
            participant_private_id: participant_private_id.to_string(),
            method: method.to_string(),
            params,
        });
        Ok(())
    }
}
