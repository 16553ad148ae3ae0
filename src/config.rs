//! Conference configuration.
//!
//! Loaded from environment variables with defaults; the binary lets
//! command-line flags override individual values.

use std::collections::HashMap;
use std::env;

use crate::error::ConfigError;

/// Default relay base URL.
pub const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8080";

/// STUN endpoints handed to every connection object.
pub const DEFAULT_STUN_SERVERS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

pub const DEFAULT_DISPLAY_NAME: &str = "Guest";

/// Depth of the channels bridging the WebSocket tasks and the room loop.
pub const DEFAULT_SIGNALING_BUFFER: usize = 100;

#[derive(Debug, Clone, PartialEq)]
pub struct ConferenceConfig {
    /// Relay base URL (`ws://` or `wss://`).
    pub signaling_url: String,
    pub stun_servers: Vec<String>,
    pub display_name: String,
    pub signaling_buffer: usize,
}

impl Default for ConferenceConfig {
    fn default() -> Self {
        Self {
            signaling_url: DEFAULT_SIGNALING_URL.to_string(),
            stun_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            signaling_buffer: DEFAULT_SIGNALING_BUFFER,
        }
    }
}

impl ConferenceConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a map (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(url) = vars.get("MESHROOM_SIGNALING_URL") {
            config.signaling_url = url.trim().to_string();
        }

        if let Some(servers) = vars.get("MESHROOM_STUN_SERVERS") {
            config.stun_servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(name) = vars.get("MESHROOM_DISPLAY_NAME") {
            config.display_name = name.trim().to_string();
        }

        if let Some(buffer) = vars.get("MESHROOM_SIGNALING_BUFFER") {
            config.signaling_buffer = buffer.parse().map_err(|_| {
                ConfigError::InvalidValue(format!("MESHROOM_SIGNALING_BUFFER={buffer}"))
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.signaling_url.starts_with("ws://") || self.signaling_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue(format!(
                "signaling url must use ws:// or wss://, got {}",
                self.signaling_url
            )));
        }
        if self.display_name.is_empty() {
            return Err(ConfigError::Missing("display name".to_string()));
        }
        if self.signaling_buffer == 0 {
            return Err(ConfigError::InvalidValue(
                "signaling buffer must be at least 1".to_string(),
            ));
        }
        if let Some(bad) = self.stun_servers.iter().find(|s| !s.starts_with("stun:")) {
            return Err(ConfigError::InvalidValue(format!("not a STUN url: {bad}")));
        }
        Ok(())
    }

    /// Per-room socket URL on the relay.
    pub fn room_url(&self, room_id: &str) -> Result<String, ConfigError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(ConfigError::Missing("room id".to_string()));
        }
        if room_id.contains('/') {
            return Err(ConfigError::InvalidValue(format!("room id {room_id}")));
        }
        Ok(format!(
            "{}/ws/meeting/{}",
            self.signaling_url.trim_end_matches('/'),
            room_id
        ))
    }
}
