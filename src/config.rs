//! Client and registry configuration.

use crate::error::{InterestError, Result};
use crate::registry::SourcePriority;
use crate::types::Origin;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry policy constants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Quiet period after which an open batch for a source is closed.
    /// Zero disables time-based batching (explicit markers still apply).
    /// Default: 50ms
    pub batch_quiescence_ms: u64,

    /// Origins from highest to lowest priority when picking the winning
    /// copy of an instance. Must list each origin exactly once.
    /// Default: replicated, interested, local
    pub source_priority: Vec<Origin>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            batch_quiescence_ms: 50,
            source_priority: vec![Origin::Replicated, Origin::Interested, Origin::Local],
        }
    }
}

impl RegistryConfig {
    pub fn batch_quiescence(&self) -> Duration {
        Duration::from_millis(self.batch_quiescence_ms)
    }

    pub fn priority(&self) -> Result<SourcePriority> {
        SourcePriority::new(&self.source_priority)
    }
}

/// Interest client configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay before a failed channel is replaced.
    /// Default: 500ms
    pub retry_wait_ms: u64,

    /// Evict a channel's data as soon as it closes. When false the copies
    /// stay until the replacement channel acknowledges its first interest.
    /// Default: true
    pub evict_on_channel_failure: bool,

    /// Name given to channel sources (suffixed with the channel number).
    pub channel_name: String,

    pub registry: RegistryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            retry_wait_ms: 500,
            evict_on_channel_failure: true,
            channel_name: "interest-channel".to_string(),
            registry: RegistryConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel_name.is_empty() {
            return Err(InterestError::Config("channel_name must not be empty".to_string()));
        }
        self.registry.priority().map(|_| ())
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_millis(self.retry_wait_ms)
    }
}
