//! Session core configuration
//!
//! Loaded from YAML, then overridden by `CLOUDMEDIA_*` environment variables.
//! Every field has a default, so an empty document is a valid config.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::engine::BandwidthLimits;
use crate::errors::{Result, SessionError};
use crate::logging::LoggingConfig;

pub const ENV_PREFIX: &str = "CLOUDMEDIA_";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionCoreConfig {
    /// Identity of this node in the cluster
    pub node_id: String,
    pub endpoint_create_timeout_ms: u64,
    pub pipeline_recreate_timeout_ms: u64,
    pub cluster_dispatch_timeout_ms: u64,
    pub cluster_enabled: bool,
    pub webrtc_min_send_kbps: u32,
    pub webrtc_max_send_kbps: u32,
    pub webrtc_min_recv_kbps: u32,
    pub webrtc_max_recv_kbps: u32,
    /// Pending actions per participant on the cluster task queue
    pub participant_queue_capacity: usize,
    pub logging: LoggingConfig,
}

impl Default for SessionCoreConfig {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            endpoint_create_timeout_ms: 30_000,
            pipeline_recreate_timeout_ms: 20_000,
            cluster_dispatch_timeout_ms: 10_000,
            cluster_enabled: false,
            webrtc_min_send_kbps: 300,
            webrtc_max_send_kbps: 1000,
            webrtc_min_recv_kbps: 300,
            webrtc_max_recv_kbps: 1000,
            participant_queue_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

impl SessionCoreConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(yaml).map_err(|e| SessionError::config(format!("Parse error: {}", e)))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| SessionError::config(format!("Cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&contents)
    }

    /// Defaults plus environment overrides, validated
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from `CLOUDMEDIA_<FIELD>` variables
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Some(v) = env_var("NODE_ID") {
            self.node_id = v;
        }
        override_parsed("ENDPOINT_CREATE_TIMEOUT_MS", &mut self.endpoint_create_timeout_ms)?;
        override_parsed("PIPELINE_RECREATE_TIMEOUT_MS", &mut self.pipeline_recreate_timeout_ms)?;
        override_parsed("CLUSTER_DISPATCH_TIMEOUT_MS", &mut self.cluster_dispatch_timeout_ms)?;
        override_parsed("CLUSTER_ENABLED", &mut self.cluster_enabled)?;
        override_parsed("WEBRTC_MIN_SEND_KBPS", &mut self.webrtc_min_send_kbps)?;
        override_parsed("WEBRTC_MAX_SEND_KBPS", &mut self.webrtc_max_send_kbps)?;
        override_parsed("WEBRTC_MIN_RECV_KBPS", &mut self.webrtc_min_recv_kbps)?;
        override_parsed("WEBRTC_MAX_RECV_KBPS", &mut self.webrtc_max_recv_kbps)?;
        override_parsed("PARTICIPANT_QUEUE_CAPACITY", &mut self.participant_queue_capacity)?;
        if let Some(v) = env_var("LOG_LEVEL") {
            self.logging.level = v;
        }
        override_parsed("LOG_JSON", &mut self.logging.json)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(SessionError::config("node_id must not be empty"));
        }
        for (name, value) in [
            ("endpoint_create_timeout_ms", self.endpoint_create_timeout_ms),
            ("pipeline_recreate_timeout_ms", self.pipeline_recreate_timeout_ms),
            ("cluster_dispatch_timeout_ms", self.cluster_dispatch_timeout_ms),
        ] {
            if value == 0 {
                return Err(SessionError::config(format!("{} must be greater than zero", name)));
            }
        }
        if self.participant_queue_capacity == 0 {
            return Err(SessionError::config("participant_queue_capacity must be greater than zero"));
        }
        if self.webrtc_min_send_kbps > self.webrtc_max_send_kbps
            || self.webrtc_min_recv_kbps > self.webrtc_max_recv_kbps
        {
            return Err(SessionError::config("webrtc minimum bandwidth exceeds maximum"));
        }
        Ok(())
    }

    pub fn endpoint_create_timeout(&self) -> Duration {
        Duration::from_millis(self.endpoint_create_timeout_ms)
    }

    pub fn pipeline_recreate_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline_recreate_timeout_ms)
    }

    pub fn cluster_dispatch_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster_dispatch_timeout_ms)
    }

    pub fn bandwidth(&self) -> BandwidthLimits {
        BandwidthLimits {
            min_send_kbps: self.webrtc_min_send_kbps,
            max_send_kbps: self.webrtc_max_send_kbps,
            min_recv_kbps: self.webrtc_min_recv_kbps,
            max_recv_kbps: self.webrtc_max_recv_kbps,
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(format!("{}{}", ENV_PREFIX, name)).ok()
}

fn override_parsed<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Some(raw) = env_var(name) {
        *target = raw.trim().parse().map_err(|e| {
            SessionError::config(format!("Invalid value for {}{}: {}", ENV_PREFIX, name, e))
        })?;
    }
    Ok(())
}
