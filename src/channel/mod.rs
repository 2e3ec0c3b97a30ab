//! Secure channel: token lifecycle, request correlation and timeouts on top of one
//! [`TransportConnection`](crate::transport::TransportConnection).
use async_trait::async_trait;

use crate::error::UaError;
use crate::messages::{ServiceRequest, ServiceResponse};
use crate::status::StatusCode;

pub mod connector;
pub mod pending;
pub mod secure_channel;
pub mod state;
pub mod token;

pub use connector::{ChannelConnector, SecurityConfig, TcpChannelConnector};
pub use pending::{PendingResponse, PendingTransactions};
pub use secure_channel::SecureChannel;
pub use state::{ChannelState, ChannelStateError};
pub use token::SecurityToken;

/// Notifications raised by a channel for whoever watches it.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Opened { channel_id: u32, token_id: u32 },
    TokenRenewed { token_id: u32 },
    TimedOutRequest { request_id: u32 },
    ConnectionBroken { status: StatusCode },
    Closed,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    /// Service requests answered on this channel, token requests excluded.
    pub transactions_completed: u64,
}

/// What sessions, the publish engine and the reconnection controller need from a channel.
#[async_trait]
pub trait ServiceChannel: Send + Sync {
    fn channel_id(&self) -> u32;

    /// False once the channel broke or was closed.
    fn is_valid(&self) -> bool;

    async fn perform_transaction(&self, request: ServiceRequest)
        -> Result<ServiceResponse, UaError>;

    /// Resolves with the reason once the channel can no longer carry traffic.
    async fn wait_broken(&self) -> UaError;

    async fn close(&self);
}
