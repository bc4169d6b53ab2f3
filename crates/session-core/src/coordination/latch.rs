//! Single-fire creation latch
//!
//! Bridges an asynchronous media engine creation into a value every waiter
//! can observe. The latch moves `Uncreated -> Creating -> Ready | Failed` and
//! never leaves a terminal state. Waits are always bounded.

use std::fmt;
use std::time::Duration;

use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreationState<T> {
    Uncreated,
    Creating,
    Ready(T),
    Failed(String),
}

impl<T> CreationState<T> {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CreationState::Ready(_) | CreationState::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            CreationState::Uncreated => "UNCREATED",
            CreationState::Creating => "CREATING",
            CreationState::Ready(_) => "READY",
            CreationState::Failed(_) => "FAILED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LatchError {
    #[error("timed out")]
    Timeout,
    #[error("creation failed: {0}")]
    Failed(String),
}

pub struct CreationLatch<T> {
    tx: watch::Sender<CreationState<T>>,
}

impl<T: Clone> CreationLatch<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(CreationState::Uncreated);
        Self { tx }
    }

    /// Claim the creation. Only the first caller gets `true`.
    pub fn try_begin(&self) -> bool {
        self.tx.send_if_modified(|state| {
            if matches!(state, CreationState::Uncreated) {
                *state = CreationState::Creating;
                true
            } else {
                false
            }
        })
    }

    /// Resolve the latch. Returns `false` if it was not in `Creating`.
    pub fn complete(&self, result: Result<T, String>) -> bool {
        self.tx.send_if_modified(move |state| {
            if !matches!(state, CreationState::Creating) {
                return false;
            }
            *state = match result {
                Ok(value) => CreationState::Ready(value),
                Err(reason) => CreationState::Failed(reason),
            };
            true
        })
    }

    pub fn state(&self) -> CreationState<T> {
        self.tx.borrow().clone()
    }

    /// The created value, without waiting
    pub fn get(&self) -> Option<T> {
        match &*self.tx.borrow() {
            CreationState::Ready(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(&*self.tx.borrow(), CreationState::Ready(_))
    }

    /// Wait for a terminal state, at most `timeout`
    pub async fn wait(&self, timeout: Duration) -> Result<T, LatchError> {
        let mut rx = self.tx.subscribe();
        let outcome = tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await;
        match outcome {
            Err(_) => Err(LatchError::Timeout),
            Ok(Err(_)) => Err(LatchError::Failed("latch closed".to_string())),
            Ok(Ok(state)) => match &*state {
                CreationState::Ready(value) => Ok(value.clone()),
                CreationState::Failed(reason) => Err(LatchError::Failed(reason.clone())),
                other => Err(LatchError::Failed(format!("unexpected state {}", other.label()))),
            },
        }
    }
}

impl<T: Clone> Default for CreationLatch<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for CreationLatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreationLatch")
            .field("state", &self.tx.borrow().label())
            .finish()
    }
}
