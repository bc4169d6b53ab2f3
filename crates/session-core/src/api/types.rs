//! Core types shared across the session core
//!
//! Identifiers, roles, end reasons and the media descriptors carried by
//! publish requests and outbound notifications.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, SessionError};

/// Public id of the pseudo-participant used by composed recordings
pub const RECORDER_PARTICIPANT_PUBLIC_ID: &str = "RECORDER";

/// Identifier of a session (room)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Role granted by the access token a connection joined with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantRole {
    /// May only receive media
    Subscriber,
    /// May receive and publish media
    Publisher,
    /// May publish and force other participants out
    Moderator,
}

impl ParticipantRole {
    pub fn can_publish(&self) -> bool {
        !matches!(self, ParticipantRole::Subscriber)
    }

    pub fn is_moderator(&self) -> bool {
        matches!(self, ParticipantRole::Moderator)
    }
}

impl Default for ParticipantRole {
    fn default() -> Self {
        ParticipantRole::Publisher
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaMode {
    Relayed,
    #[default]
    Routed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingMode {
    Always,
    #[default]
    Manual,
}

/// Properties a session is created with
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionProperties {
    pub media_mode: MediaMode,
    pub recording_mode: RecordingMode,
    pub custom_session_id: Option<String>,
}

/// Why a stream, connection or session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Unsubscribe,
    Unpublish,
    Disconnect,
    ForceUnpublishByUser,
    ForceUnpublishByServer,
    ForceDisconnectByUser,
    ForceDisconnectByServer,
    LastParticipantLeft,
    NetworkDisconnect,
    MediaServerDisconnect,
    ServerStopped,
    RecordingStoppedByServer,
    AutomaticStop,
    SessionClosedByServer,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Unsubscribe => "unsubscribe",
            EndReason::Unpublish => "unpublish",
            EndReason::Disconnect => "disconnect",
            EndReason::ForceUnpublishByUser => "forceUnpublishByUser",
            EndReason::ForceUnpublishByServer => "forceUnpublishByServer",
            EndReason::ForceDisconnectByUser => "forceDisconnectByUser",
            EndReason::ForceDisconnectByServer => "forceDisconnectByServer",
            EndReason::LastParticipantLeft => "lastParticipantLeft",
            EndReason::NetworkDisconnect => "networkDisconnect",
            EndReason::MediaServerDisconnect => "mediaServerDisconnect",
            EndReason::ServerStopped => "serverStopped",
            EndReason::RecordingStoppedByServer => "recordingStoppedByServer",
            EndReason::AutomaticStop => "automaticStop",
            EndReason::SessionClosedByServer => "sessionClosedByServer",
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media kind used to restrict a connect/disconnect to one track type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaType {
    Audio,
    Video,
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Media-shaping element requested by a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterDescriptor {
    #[serde(rename = "type")]
    pub filter_type: String,
    #[serde(default)]
    pub options: Value,
}

impl FilterDescriptor {
    pub fn new(filter_type: impl Into<String>, options: Value) -> Self {
        Self {
            filter_type: filter_type.into(),
            options,
        }
    }

    /// Parse the `{type, options}` object clients send
    pub fn from_value(value: &Value) -> Result<Self> {
        let filter_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::filter_not_applied("'filter' parameter wrong: missing 'type'"))?;
        let options = match value.get("options") {
            Some(Value::Object(map)) => Value::Object(map.clone()),
            Some(Value::String(raw)) => serde_json::from_str(raw).map_err(|e| {
                SessionError::filter_not_applied(format!("'filter' parameter wrong: {}", e))
            })?,
            Some(Value::Null) | None => Value::Object(Default::default()),
            Some(other) => {
                return Err(SessionError::filter_not_applied(format!(
                    "'filter' parameter wrong: options must be an object, got {}",
                    other
                )));
            }
        };
        Ok(Self::new(filter_type, options))
    }
}

/// Description of the stream a publisher sends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaOptions {
    pub has_audio: bool,
    pub has_video: bool,
    pub audio_active: bool,
    pub video_active: bool,
    pub type_of_video: Option<String>,
    pub frame_rate: Option<u32>,
    pub video_dimensions: Option<String>,
    pub filter: Option<FilterDescriptor>,
    #[serde(default)]
    pub do_loopback: bool,
}

impl MediaOptions {
    pub fn audio_video() -> Self {
        Self {
            has_audio: true,
            has_video: true,
            audio_active: true,
            video_active: true,
            type_of_video: Some("CAMERA".to_string()),
            frame_rate: Some(30),
            video_dimensions: None,
            filter: None,
            do_loopback: false,
        }
    }

    pub fn audio_only() -> Self {
        Self {
            has_video: false,
            video_active: false,
            type_of_video: None,
            frame_rate: None,
            ..Self::audio_video()
        }
    }

    /// Middle segment of a stream id: the video type, or `MICRO` for audio-only
    pub fn stream_kind_label(&self) -> String {
        if self.has_video {
            self.type_of_video
                .clone()
                .unwrap_or_else(|| "CAMERA".to_string())
        } else {
            "MICRO".to_string()
        }
    }

    /// Stream id for a new publication of `public_id`
    pub fn generate_stream_id(&self, public_id: &str) -> String {
        let mut rng = rand::thread_rng();
        let suffix: String = (0..5)
            .map(|_| char::from(rng.gen_range(b'A'..=b'Z')))
            .collect();
        format!("{}_{}_{}", public_id, self.stream_kind_label(), suffix)
    }
}

/// A decoded `publishVideo` request
#[derive(Debug, Clone, PartialEq)]
pub struct PublishRequest {
    pub sdp_offer: String,
    pub options: MediaOptions,
}

impl PublishRequest {
    /// Decode the params object of a publish request.
    ///
    /// `sdpOffer`, `hasAudio` and `hasVideo` are mandatory; everything else
    /// falls back to the values implied by the mandatory flags.
    pub fn from_params(params: &Value) -> Result<Self> {
        let sdp_offer = required_str(params, "sdpOffer")?;
        let has_audio = required_bool(params, "hasAudio")?;
        let has_video = required_bool(params, "hasVideo")?;

        let filter = match params.get("filter") {
            Some(Value::Null) | None => None,
            Some(value) => Some(FilterDescriptor::from_value(value)?),
        };

        let options = MediaOptions {
            has_audio,
            has_video,
            audio_active: params
                .get("audioActive")
                .and_then(Value::as_bool)
                .unwrap_or(has_audio),
            video_active: params
                .get("videoActive")
                .and_then(Value::as_bool)
                .unwrap_or(has_video),
            type_of_video: params
                .get("typeOfVideo")
                .and_then(Value::as_str)
                .map(str::to_string),
            frame_rate: params
                .get("frameRate")
                .and_then(Value::as_u64)
                .map(|f| f as u32),
            video_dimensions: params
                .get("videoDimensions")
                .and_then(Value::as_str)
                .map(str::to_string),
            filter,
            do_loopback: params
                .get("doLoopback")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        };

        Ok(Self { sdp_offer, options })
    }
}

fn required_str(params: &Value, key: &str) -> Result<String> {
    params
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SessionError::transport(format!("Request element '{}' is missing", key)))
}

fn required_bool(params: &Value, key: &str) -> Result<bool> {
    params
        .get(key)
        .and_then(Value::as_bool)
        .ok_or_else(|| SessionError::transport(format!("Request element '{}' is missing", key)))
}

/// Access token a connection presents when joining
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub token: String,
    pub role: ParticipantRole,
    #[serde(default)]
    pub server_metadata: String,
}

impl Token {
    pub fn new(token: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            token: token.into(),
            role,
            server_metadata: String::new(),
        }
    }

    /// Token with a random id, used when the transport does not enforce tokens
    pub fn generate(role: ParticipantRole) -> Self {
        Self::new(format!("tok_{}", uuid::Uuid::new_v4().simple()), role)
    }
}

/// Identity of a connection as resolved by the transport layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantIdentity {
    pub private_id: String,
    pub public_id: String,
    pub session_id: SessionId,
    pub token: Token,
    #[serde(default)]
    pub client_metadata: String,
    /// Milliseconds since the Unix epoch
    pub created_at: i64,
}

impl ParticipantIdentity {
    pub fn new(
        private_id: impl Into<String>,
        public_id: impl Into<String>,
        session_id: impl Into<SessionId>,
        token: Token,
    ) -> Self {
        Self {
            private_id: private_id.into(),
            public_id: public_id.into(),
            session_id: session_id.into(),
            token,
            client_metadata: String::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_client_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.client_metadata = metadata.into();
        self
    }
}

/// ICE candidate exchanged with clients and the media engine
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: String,
    pub sdp_m_line_index: u32,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>, sdp_mid: impl Into<String>, sdp_m_line_index: u32) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: sdp_mid.into(),
            sdp_m_line_index,
        }
    }
}

/// Stream attribute a client may change after publishing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamProperty {
    AudioActive,
    VideoActive,
    VideoDimensions,
    Filter,
}

impl StreamProperty {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamProperty::AudioActive => "audioActive",
            StreamProperty::VideoActive => "videoActive",
            StreamProperty::VideoDimensions => "videoDimensions",
            StreamProperty::Filter => "filter",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "audioActive" => Some(StreamProperty::AudioActive),
            "videoActive" => Some(StreamProperty::VideoActive),
            "videoDimensions" => Some(StreamProperty::VideoDimensions),
            "filter" => Some(StreamProperty::Filter),
            _ => None,
        }
    }
}
