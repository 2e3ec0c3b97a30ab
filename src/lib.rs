//! Client-side secure conversation stack for an industrial control protocol.
//!
//! Layers, bottom up:
//! * [`transport`]: 8-byte chunk framing over a byte stream and the HEL/ACK handshake.
//! * [`chunking`]: splitting messages into signed and optionally encrypted chunks, and
//!   verifying and reassembling them on the way back.
//! * [`channel`]: secure channel tokens (open, renew, close) and request/response
//!   correlation with per-request timeouts.
//! * [`session`], [`subscription`] and [`reconnect`]: the session, the publish loop and the
//!   controller that repairs both after channel loss.
//! * [`sdk`]: the [`UaClient`] façade.
//!
//! Service bodies are CBOR encoded. Asymmetric security uses Ed25519 signatures with an
//! X25519 + HKDF + ChaCha20-Poly1305 seal; symmetric security uses HMAC-SHA256 and
//! AES-256-CBC keys derived from the channel nonces.

pub mod binary;
pub mod channel;
pub mod chunking;
pub mod config;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod reconnect;
pub mod sdk;
pub mod session;
pub mod status;
pub mod subscription;
pub mod transport;

pub use channel::{
    ChannelConnector, ChannelEvent, SecureChannel, SecurityConfig, ServiceChannel,
    TcpChannelConnector,
};
pub use config::{ClientConfig, ConfigError};
pub use crypto::{ApplicationCredentials, Certificate, MessageSecurityMode, SecurityPolicy};
pub use error::{UaError, UaResult};
pub use messages::{ServiceRequest, ServiceResponse};
pub use reconnect::{ReconnectState, ReconnectionController};
pub use sdk::{ClientError, UaClient};
pub use session::{Session, SessionEvent, SessionState};
pub use status::StatusCode;
pub use subscription::{MonitoredItem, PublishEngine, Subscription, SubscriptionEvent};
pub use transport::TransportConnection;
