//! Session Manager Module
//!
//! The transport-facing [`SessionManager`] and the [`SessionRegistry`] it
//! resolves sessions, participants and tokens through.

pub mod registry;
pub mod session_manager;

pub use registry::{SessionRegistry, SessionRegistryStats};
pub use session_manager::SessionManager;
