//! Gateway client configuration.
//!
//! Only what the gateway connection needs: the bot token, an enabled flag,
//! the gateway host, and tuning for heartbeats and reconnects. Loaded from a
//! JSON file by the `claw-chat` binary or built in code.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, Result};
use crate::protocol::{IdentifyProperties, Intents, GATEWAY_VERSION};
use crate::reconnect::ReconnectPolicy;

fn default_enabled() -> bool {
    true
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_event_buffer() -> usize {
    256
}

/// Gateway connection configuration.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GatewayConfig {
    /// Bot token, sent as `Authorization: Bot <token>` and in Identify.
    ///
    /// May be left out of the file when supplied at load time.
    #[serde(default)]
    pub token: String,
    /// Whether the gateway may connect at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Gateway host (optionally with port), e.g. `gateway.example.com`.
    pub host: String,
    /// Event categories to subscribe to.
    #[serde(default)]
    pub intents: Intents,
    /// Client properties reported in Identify.
    #[serde(default)]
    pub properties: IdentifyProperties,
    /// Reconnect policy.
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    /// How long `connect()` waits for Ready, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Capacity of the event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
    /// Resume sessions on reconnect instead of identifying afresh.
    #[serde(default)]
    pub resume: bool,
}

impl GatewayConfig {
    /// Create a configuration with defaults for everything but token and host.
    #[must_use]
    pub fn new(token: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            enabled: default_enabled(),
            host: host.into(),
            intents: Intents::default(),
            properties: IdentifyProperties::default(),
            reconnect: ReconnectPolicy::default(),
            connect_timeout_ms: default_connect_timeout_ms(),
            event_buffer: default_event_buffer(),
            resume: false,
        }
    }

    /// Load configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed, or validated.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::load_with_token(path, None)
    }

    /// Load configuration from a JSON file, replacing its token when one is given.
    ///
    /// Validation runs after the override, so the file may omit the token.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting configuration fails validation.
    pub fn load_with_token(path: impl AsRef<Path>, token: Option<String>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            GatewayError::Config(format!(
                "failed to read config file '{}': {e}",
                path.as_ref().display()
            ))
        })?;

        let mut config = Self::parse(&content)?;
        if let Some(token) = token {
            config.token = token;
        }
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid or fails validation.
    pub fn from_json(content: &str) -> Result<Self> {
        let config = Self::parse(content)?;
        config.validate()?;
        Ok(config)
    }

    fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content).map_err(|e| GatewayError::Config(format!("invalid JSON: {e}")))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(GatewayError::Config("token cannot be empty".to_string()));
        }
        if self.token.chars().any(char::is_whitespace) {
            return Err(GatewayError::Config(
                "token cannot contain whitespace".to_string(),
            ));
        }
        if self.host.is_empty() || self.host.contains('/') {
            return Err(GatewayError::Config(format!(
                "invalid gateway host '{}'",
                self.host
            )));
        }
        let url = Url::parse(&self.gateway_url())
            .map_err(|e| GatewayError::Config(format!("invalid gateway host '{}': {e}", self.host)))?;
        if url.host_str().is_none() {
            return Err(GatewayError::Config(format!(
                "invalid gateway host '{}'",
                self.host
            )));
        }
        if self.connect_timeout_ms == 0 {
            return Err(GatewayError::Config(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(GatewayError::Config(
                "event_buffer must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.base_delay_ms == 0 {
            return Err(GatewayError::Config(
                "reconnect.base_delay_ms must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Gateway endpoint: `wss://<host>/?v=1`.
    #[must_use]
    pub fn gateway_url(&self) -> String {
        format!("wss://{}/?v={GATEWAY_VERSION}", self.host)
    }

    /// How long `connect()` waits for Ready.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Replace the token.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    /// Set the reconnect policy.
    #[must_use]
    pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Enable or disable session resume.
    #[must_use]
    pub const fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }
}

impl fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("token", &"<redacted>")
            .field("enabled", &self.enabled)
            .field("host", &self.host)
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .field("reconnect", &self.reconnect)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("event_buffer", &self.event_buffer)
            .field("resume", &self.resume)
            .finish()
    }
}

/// Ensure a gateway URL carries the protocol version marker.
///
/// # Errors
///
/// Returns an error if `raw` is not a valid URL.
pub fn versioned_url(raw: &str) -> Result<String> {
    let mut url =
        Url::parse(raw).map_err(|e| GatewayError::Config(format!("invalid URL '{raw}': {e}")))?;
    if !url.query_pairs().any(|(key, _)| key == "v") {
        url.query_pairs_mut()
            .append_pair("v", &GATEWAY_VERSION.to_string());
    }
    Ok(url.into())
}
