//! Outbound events
//!
//! The sink boundary between room orchestration and the signaling transport.

pub mod notifier;
pub mod sink;

pub use notifier::{Notification, NotificationLog, RpcNotifier};
pub use sink::{SessionEventSink, SessionEventsHandler};
