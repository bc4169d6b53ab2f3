//! Public types and wire names
//!
//! Everything the transport layer needs to decode requests for the session
//! core and to encode what comes back out of it.

pub mod protocol;
pub mod types;

pub use types::*;
