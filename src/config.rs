use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Error produced when client configuration fails validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("buffer size {0} is below the protocol minimum of 8192 bytes")]
    BufferTooSmall(u32),
    #[error("renewal interval must be greater than zero")]
    ZeroRenewalInterval,
    #[error("minimum request timeout exceeds the default timeout")]
    TimeoutOrder,
    #[error("publish pipeline depth must be between 1 and max_publish_requests")]
    PipelineDepth,
    #[error("reconnect retry delay must be greater than zero")]
    ZeroRetryDelay,
    #[error("config read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Smallest buffer the connection protocol allows either side to advertise.
pub const MIN_BUFFER_SIZE: u32 = 8192;

/// Transport limits proposed in HEL and enforced on inbound traffic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransportConfig {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    /// Zero means no limit.
    pub max_message_size: u32,
    /// Zero means no limit.
    pub max_chunk_count: u32,
    pub hello_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol_version: 0,
            receive_buffer_size: 65_535,
            send_buffer_size: 65_535,
            max_message_size: 16 * 1024 * 1024,
            max_chunk_count: 0,
            hello_timeout_ms: 5_000,
        }
    }
}

impl TransportConfig {
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }
}

/// Secure channel token and request timing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChannelConfig {
    pub requested_lifetime_ms: u32,
    /// Upper bound on the token renewal delay; the effective delay is also capped at 75 %
    /// of the revised lifetime.
    pub renewal_interval_ms: u64,
    pub default_timeout_ms: u64,
    pub minimum_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            requested_lifetime_ms: 600_000,
            renewal_interval_ms: 600_000,
            default_timeout_ms: 15_000,
            minimum_timeout_ms: 100,
        }
    }
}

impl ChannelConfig {
    /// Timeout applied to a transaction given its request header hint (0 = unset).
    pub fn transaction_timeout(&self, timeout_hint_ms: u32) -> Duration {
        let hinted = if timeout_hint_ms == 0 {
            self.default_timeout_ms
        } else {
            u64::from(timeout_hint_ms)
        };
        Duration::from_millis(hinted.max(self.minimum_timeout_ms))
    }
}

/// Publish pipeline sizing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PublishConfig {
    /// Outstanding requests kept per active subscription.
    pub pipeline_depth: u32,
    /// Hard ceiling across all subscriptions.
    pub max_publish_requests: u32,
    /// How often a starved engine re-checks channel validity.
    pub channel_poll_interval_ms: u64,
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            pipeline_depth: 5,
            max_publish_requests: 25,
            channel_poll_interval_ms: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub retry_delay_ms: u64,
    /// Zero means retry until the session is closed.
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: 1_000,
            max_attempts: 0,
        }
    }
}

impl ReconnectConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Complete client configuration.
///
/// Every section falls back to its defaults, so a JSON document only needs to mention the
/// values it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    pub application_uri: String,
    pub session_name: String,
    pub session_timeout_ms: u64,
    pub transport: TransportConfig,
    pub channel: ChannelConfig,
    pub publish: PublishConfig,
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Rejects combinations the stack cannot honour.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for size in [
            self.transport.receive_buffer_size,
            self.transport.send_buffer_size,
        ] {
            if size < MIN_BUFFER_SIZE {
                return Err(ConfigError::BufferTooSmall(size));
            }
        }
        if self.channel.renewal_interval_ms == 0 {
            return Err(ConfigError::ZeroRenewalInterval);
        }
        if self.channel.minimum_timeout_ms > self.channel.default_timeout_ms {
            return Err(ConfigError::TimeoutOrder);
        }
        if self.publish.pipeline_depth == 0
            || self.publish.pipeline_depth > self.publish.max_publish_requests
        {
            return Err(ConfigError::PipelineDepth);
        }
        if self.reconnect.retry_delay_ms == 0 {
            return Err(ConfigError::ZeroRetryDelay);
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        if self.session_timeout_ms == 0 {
            Duration::from_secs(60)
        } else {
            Duration::from_millis(self.session_timeout_ms)
        }
    }
}
