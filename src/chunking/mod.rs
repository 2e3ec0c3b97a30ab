//! Message <-> chunk conversion for OPN/MSG/CLO traffic.
//!
//! [`Chunker`] splits an outgoing body into signed (and optionally encrypted) chunks;
//! [`ChunkAssembler`] verifies incoming chunks and rebuilds message bodies. Both read the
//! shared [`ChannelSecurity`] so a token installed by the channel is picked up by the next
//! chunk in either direction.
use std::sync::Arc;

use bytes::{Buf, BufMut};
use tokio::time::Instant;

use crate::crypto::{
    ApplicationCredentials, Certificate, MessageSecurityMode, SecurityPolicy, SymmetricKeys,
};
use crate::error::UaError;
use crate::status::StatusCode;

pub mod assembler;
pub mod chunker;

pub use assembler::{Assembled, AssembledMessage, ChunkAssembler};
pub use chunker::Chunker;

/// `sequence_number | request_id`, present in every secure chunk.
pub const SEQUENCE_HEADER_SIZE: usize = 8;
/// Header plus channel id plus token id, the clear-text prefix of a symmetric chunk.
pub const SYMMETRIC_PREFIX_SIZE: usize = crate::transport::HEADER_SIZE + 8;
/// Sequence numbers above this value wrap around.
pub const SEQUENCE_WRAP_THRESHOLD: u32 = 4_294_966_271;
/// A wrapped sequence number restarts below this value.
pub const SEQUENCE_WRAP_LIMIT: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceHeader {
    pub sequence_number: u32,
    pub request_id: u32,
}

impl SequenceHeader {
    pub fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u32_le(self.sequence_number);
        buf.put_u32_le(self.request_id);
    }

    pub fn read<B: Buf>(buf: &mut B) -> Result<Self, UaError> {
        if buf.remaining() < SEQUENCE_HEADER_SIZE {
            return Err(UaError::protocol(
                StatusCode::BAD_DECODING_ERROR,
                "sequence header truncated",
            ));
        }
        Ok(Self {
            sequence_number: buf.get_u32_le(),
            request_id: buf.get_u32_le(),
        })
    }
}

/// Outgoing sequence numbers for one channel direction.
#[derive(Debug, Clone)]
pub struct SequenceCounter {
    next: u32,
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self { next: 1 }
    }
}

impl SequenceCounter {
    pub fn starting_at(next: u32) -> Self {
        Self { next }
    }

    pub fn next(&mut self) -> u32 {
        let current = self.next;
        self.next = if current >= SEQUENCE_WRAP_THRESHOLD {
            1
        } else {
            current + 1
        };
        current
    }
}

/// Incoming sequence check: each chunk must follow the previous one or wrap.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
}

impl SequenceTracker {
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    pub fn accept(&mut self, sequence_number: u32) -> Result<(), UaError> {
        if let Some(prev) = self.last {
            let follows = prev != u32::MAX && sequence_number == prev + 1;
            let wraps = prev >= SEQUENCE_WRAP_THRESHOLD && sequence_number < SEQUENCE_WRAP_LIMIT;
            if !follows && !wraps {
                return Err(UaError::security(
                    StatusCode::BAD_SEQUENCE_NUMBER_INVALID,
                    format!("sequence number {} does not follow {}", sequence_number, prev),
                ));
            }
        }
        self.last = Some(sequence_number);
        Ok(())
    }
}

/// Key material of one security token as installed in the chunk pipeline.
#[derive(Debug, Clone)]
pub struct TokenKeys {
    pub token_id: u32,
    /// `None` when the channel runs without message security.
    pub keys: Option<SymmetricKeys>,
    pub expires_at: Instant,
}

/// Everything the chunk layer needs to secure and verify traffic of one channel.
#[derive(Debug, Clone)]
pub struct ChannelSecurity {
    pub policy: SecurityPolicy,
    pub mode: MessageSecurityMode,
    pub channel_id: u32,
    local: Option<Arc<ApplicationCredentials>>,
    remote: Option<Certificate>,
    current: Option<TokenKeys>,
    previous: Option<TokenKeys>,
}

impl ChannelSecurity {
    /// Unsecured channel.
    pub fn none() -> Self {
        Self {
            policy: SecurityPolicy::None,
            mode: MessageSecurityMode::None,
            channel_id: 0,
            local: None,
            remote: None,
            current: None,
            previous: None,
        }
    }

    /// Secured channel; a signing mode requires both credentials and the peer certificate.
    pub fn new(
        policy: SecurityPolicy,
        mode: MessageSecurityMode,
        local: Option<Arc<ApplicationCredentials>>,
        remote: Option<Certificate>,
    ) -> Result<Self, UaError> {
        if mode.signs() {
            if policy == SecurityPolicy::None {
                return Err(UaError::security(
                    StatusCode::BAD_SECURITY_POLICY_REJECTED,
                    format!("{:?} requires a security policy", mode),
                ));
            }
            if local.is_none() || remote.is_none() {
                return Err(UaError::security(
                    StatusCode::BAD_CERTIFICATE_INVALID,
                    "signed channels need local credentials and the peer certificate",
                ));
            }
        }
        Ok(Self {
            policy,
            mode,
            channel_id: 0,
            local,
            remote,
            current: None,
            previous: None,
        })
    }

    pub fn local_credentials(&self) -> Option<&ApplicationCredentials> {
        self.local.as_deref()
    }

    pub fn remote_certificate(&self) -> Option<&Certificate> {
        self.remote.as_ref()
    }

    pub fn current_token(&self) -> Option<&TokenKeys> {
        self.current.as_ref()
    }

    /// Installs a freshly issued token; the one it replaces stays valid for incoming
    /// chunks until it expires.
    pub fn install_token(&mut self, token: TokenKeys) {
        if let Some(old) = self.current.take() {
            self.previous = Some(old);
        }
        self.current = Some(token);
    }

    /// Token used to verify an incoming chunk.
    pub fn receiving_token(&self, token_id: u32) -> Result<&TokenKeys, UaError> {
        if let Some(current) = self.current.as_ref().filter(|t| t.token_id == token_id) {
            return Ok(current);
        }
        match self.previous.as_ref().filter(|t| t.token_id == token_id) {
            Some(previous) if Instant::now() < previous.expires_at => Ok(previous),
            Some(_) => Err(UaError::security(
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                format!("token {} expired", token_id),
            )),
            None => Err(UaError::security(
                StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
                format!("unknown token {}", token_id),
            )),
        }
    }

    pub fn reset_tokens(&mut self) {
        self.current = None;
        self.previous = None;
        self.channel_id = 0;
    }
}
