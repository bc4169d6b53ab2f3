//! Coordination primitives shared by endpoints, sessions and the cluster router

pub mod latch;
pub mod queue;

pub use latch::{CreationLatch, CreationState, LatchError};
pub use queue::KeyedTaskQueue;
