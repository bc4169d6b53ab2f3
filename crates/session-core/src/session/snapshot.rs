//! Point-in-time views of participants and their streams
//!
//! Notifications and join responses are built from these values, never from
//! live participant state, so a roster cannot change under a send pass.

use serde::{Deserialize, Serialize};

use crate::api::types::{FilterDescriptor, MediaOptions};

/// One published stream as seen by other participants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamInfo {
    pub id: String,
    pub created_at: i64,
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_active: bool,
    pub video_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_of_video: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_dimensions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<FilterDescriptor>,
}

impl StreamInfo {
    pub fn from_options(id: impl Into<String>, created_at: i64, options: &MediaOptions) -> Self {
        Self {
            id: id.into(),
            created_at,
            has_audio: options.has_audio,
            has_video: options.has_video,
            audio_active: options.audio_active,
            video_active: options.video_active,
            type_of_video: options.type_of_video.clone(),
            frame_rate: options.frame_rate,
            video_dimensions: options.video_dimensions.clone(),
            filter: options.filter.clone(),
        }
    }
}

/// Roster entry for one participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantSnapshot {
    #[serde(skip)]
    pub private_id: String,
    #[serde(rename = "id")]
    pub public_id: String,
    pub created_at: i64,
    pub metadata: String,
    pub streams: Vec<StreamInfo>,
}

impl ParticipantSnapshot {
    pub fn is_streaming(&self) -> bool {
        !self.streams.is_empty()
    }
}

/// Response returned to a participant that joined a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomResponse {
    pub id: String,
    pub created_at: i64,
    pub metadata: String,
    /// Everyone already in the session when the joiner was added
    pub value: Vec<ParticipantSnapshot>,
}
