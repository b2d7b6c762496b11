//! Configuration for channels and the coordinator.
//!
//! Durations are expressed in milliseconds so a config can be written by
//! hand:
//!
//! ```toml
//! [channel]
//! response_timeout_ms = 2000
//! live_interval_ms = 250
//! chunk_size = 100
//! ```

use crate::error::{Error, Result};
use crate::model::{Anchor, StreamQuery};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one [`StreamChannel`](crate::channel::StreamChannel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// How long `load()` waits for the server to close before returning
    /// what it has and switching to live delivery.
    pub response_timeout_ms: u64,
    /// Interval of the live delivery scheduler.
    pub live_interval_ms: u64,
    /// Maximum number of items requested per subscription.
    pub chunk_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 2000,
            live_interval_ms: 250,
            chunk_size: 100,
        }
    }
}

impl ChannelConfig {
    /// Initial-response timeout.
    pub const fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Live scheduler interval.
    pub const fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    /// Reject values the channel cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for a zero chunk size or zero interval.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::Config("chunk_size must be at least 1".to_string()));
        }
        if self.live_interval_ms == 0 {
            return Err(Error::Config(
                "live_interval_ms must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for a [`StreamCoordinator`](crate::coordinator::StreamCoordinator).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Settings shared by both directional channels.
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Initial anchor; both directions scan away from it.
    #[serde(default = "default_anchor")]
    pub anchor: Anchor,
    /// Initial server-side filters.
    #[serde(default)]
    pub query: StreamQuery,
}

fn default_anchor() -> Anchor {
    Anchor::at(Utc::now())
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            channel: ChannelConfig::default(),
            anchor: default_anchor(),
            query: StreamQuery::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse and validate a TOML config.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the text does not parse or holds
    /// invalid values.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.channel.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_defaults() {
        let config = ChannelConfig::default();
        assert_eq!(config.response_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CoordinatorConfig::from_toml_str(
            r#"
            [channel]
            chunk_size = 12

            [anchor]
            timestamp = "2024-01-01T00:00:00Z"
            "#,
        )
        .unwrap();
        assert_eq!(config.channel.chunk_size, 12);
        assert_eq!(config.channel.response_timeout_ms, 2000);
        assert_eq!(config.anchor.timestamp.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert!(config.anchor.resume_from.is_none());
    }

    #[test]
    fn test_from_toml_rejects_zero_chunk() {
        let err = CoordinatorConfig::from_toml_str("[channel]\nchunk_size = 0\n").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_from_toml_rejects_garbage() {
        assert!(CoordinatorConfig::from_toml_str("channel = [").is_err());
    }
}
