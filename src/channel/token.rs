use std::time::Duration;

use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::messages::ChannelSecurityToken;

/// An installed security token. Renewal replaces it with a new value; it is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityToken {
    pub channel_id: u32,
    pub token_id: u32,
    pub created_at: Instant,
    pub requested_lifetime: Duration,
    pub revised_lifetime: Duration,
}

impl SecurityToken {
    pub fn from_response(token: &ChannelSecurityToken, requested_lifetime_ms: u32) -> Self {
        Self {
            channel_id: token.channel_id,
            token_id: token.token_id,
            created_at: Instant::now(),
            requested_lifetime: Duration::from_millis(u64::from(requested_lifetime_ms)),
            revised_lifetime: Duration::from_millis(u64::from(token.revised_lifetime)),
        }
    }

    pub fn expires_at(&self) -> Instant {
        self.created_at + self.revised_lifetime
    }

    /// `min(configured interval, 75 % of the revised lifetime)`, never below the
    /// minimum transaction timeout.
    pub fn renewal_delay(&self, config: &ChannelConfig) -> Duration {
        let configured = Duration::from_millis(config.renewal_interval_ms);
        let floor = Duration::from_millis(config.minimum_timeout_ms.max(1));
        configured
            .min(self.revised_lifetime.mul_f64(0.75))
            .max(floor)
    }
}
