//! Rooms and the participants inside them

pub mod media_session;
pub mod participant;
pub mod snapshot;

pub use media_session::{JoinOutcome, LeaveOutcome, MediaSession};
pub use participant::Participant;
pub use snapshot::{JoinRoomResponse, ParticipantSnapshot, StreamInfo};
