use bytes::{BufMut, Bytes};
use tracing::debug;

use super::{ChannelSecurity, SequenceCounter, SequenceHeader, TokenKeys};
use super::{SEQUENCE_HEADER_SIZE, SYMMETRIC_PREFIX_SIZE};
use crate::binary::{byte_string_len, write_byte_string, write_string};
use crate::crypto::{asymmetric, symmetric, DerivedKeys, MessageSecurityMode, SecurityPolicy};
use crate::error::UaError;
use crate::status::StatusCode;
use crate::transport::{ChunkType, ErrorMessage, MessageHeader, MessageType, NegotiatedLimits};
use crate::transport::{RawChunk, HEADER_SIZE};

fn too_large(message: String) -> UaError {
    UaError::protocol(StatusCode::BAD_TCP_MESSAGE_TOO_LARGE, message)
}

/// Largest message body that fits in one symmetric chunk of `chunk_size` bytes.
///
/// With encryption the encrypted region is rounded down to whole cipher blocks and one byte
/// is reserved for the padding count.
pub fn max_body_size(
    chunk_size: usize,
    mode: MessageSecurityMode,
    policy: SecurityPolicy,
) -> Result<usize, UaError> {
    let signature = if mode.signs() {
        policy.symmetric_signature_size()
    } else {
        0
    };
    let available = chunk_size.saturating_sub(SYMMETRIC_PREFIX_SIZE);
    let region = if mode.encrypts() {
        let block = policy.block_size();
        (available / block) * block
    } else {
        available
    };
    let overhead = SEQUENCE_HEADER_SIZE + signature + usize::from(mode.encrypts());
    match region.checked_sub(overhead) {
        Some(body) if body > 0 => Ok(body),
        _ => Err(UaError::protocol(
            StatusCode::BAD_TCP_NOT_ENOUGH_RESOURCES,
            format!("chunk size {} leaves no room for a body", chunk_size),
        )),
    }
}

/// Splits outgoing messages into secured chunks and numbers them.
///
/// One chunker exists per channel; its sequence counter runs across every message the
/// channel sends, OPN included.
#[derive(Debug, Default)]
pub struct Chunker {
    sequence: SequenceCounter,
}

impl Chunker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sequence(sequence: SequenceCounter) -> Self {
        Self { sequence }
    }

    /// Encodes one message. OPN always yields a single asymmetric chunk; MSG and CLO are
    /// split as the peer's receive buffer requires.
    pub fn encode(
        &mut self,
        security: &ChannelSecurity,
        limits: &NegotiatedLimits,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<RawChunk>, UaError> {
        match message_type {
            MessageType::OpenChannel => Ok(vec![self.encode_asymmetric(
                security, limits, request_id, body,
            )?]),
            MessageType::Message | MessageType::CloseChannel => {
                self.encode_symmetric(security, limits, message_type, request_id, body)
            }
            other => Err(UaError::protocol(
                StatusCode::BAD_INTERNAL_ERROR,
                format!("{:?} is not a secure conversation message", other),
            )),
        }
    }

    /// Abort chunk telling the peer the rest of message `request_id` will never arrive.
    pub fn abort(
        &mut self,
        security: &ChannelSecurity,
        message_type: MessageType,
        request_id: u32,
        error: &ErrorMessage,
    ) -> Result<RawChunk, UaError> {
        let token = current_token(security)?;
        self.write_symmetric(
            security,
            token,
            message_type,
            ChunkType::Abort,
            request_id,
            &error.encode_body(),
        )
    }

    fn encode_symmetric(
        &mut self,
        security: &ChannelSecurity,
        limits: &NegotiatedLimits,
        message_type: MessageType,
        request_id: u32,
        body: &[u8],
    ) -> Result<Vec<RawChunk>, UaError> {
        let token = current_token(security)?;
        if limits.send_max_message_size != 0 && body.len() > limits.send_max_message_size as usize
        {
            return Err(too_large(format!(
                "message of {} bytes exceeds the peer limit of {}",
                body.len(),
                limits.send_max_message_size
            )));
        }
        let max_body = max_body_size(
            limits.send_chunk_size as usize,
            security.mode,
            security.policy,
        )?;
        let pieces: Vec<&[u8]> = if body.is_empty() {
            vec![body]
        } else {
            body.chunks(max_body).collect()
        };
        if limits.send_max_chunk_count != 0 && pieces.len() > limits.send_max_chunk_count as usize
        {
            return Err(too_large(format!(
                "message needs {} chunks, peer accepts {}",
                pieces.len(),
                limits.send_max_chunk_count
            )));
        }

        let last = pieces.len() - 1;
        let mut chunks = Vec::with_capacity(pieces.len());
        for (index, piece) in pieces.into_iter().enumerate() {
            let chunk_type = if index == last {
                ChunkType::Final
            } else {
                ChunkType::Intermediate
            };
            chunks.push(self.write_symmetric(
                security,
                token,
                message_type,
                chunk_type,
                request_id,
                piece,
            )?);
        }
        debug!(
            channel_id = security.channel_id,
            token_id = token.token_id,
            request_id,
            chunks = chunks.len(),
            "message chunked"
        );
        Ok(chunks)
    }

    fn write_symmetric(
        &mut self,
        security: &ChannelSecurity,
        token: &TokenKeys,
        message_type: MessageType,
        chunk_type: ChunkType,
        request_id: u32,
        payload: &[u8],
    ) -> Result<RawChunk, UaError> {
        let mode = security.mode;
        let keys = sending_keys(mode, token)?;
        let signature_size = if mode.signs() {
            security.policy.symmetric_signature_size()
        } else {
            0
        };

        let mut region = SEQUENCE_HEADER_SIZE + payload.len() + signature_size;
        let mut padding = 0usize;
        if mode.encrypts() {
            let block = security.policy.block_size();
            region += 1;
            padding = (block - region % block) % block;
            region += padding;
        }
        let total = SYMMETRIC_PREFIX_SIZE + region;

        let mut buf = Vec::with_capacity(total);
        let header = MessageHeader {
            message_type,
            chunk_type,
            message_size: total as u32,
        };
        buf.put_slice(&header.encode());
        buf.put_u32_le(security.channel_id);
        buf.put_u32_le(token.token_id);
        SequenceHeader {
            sequence_number: self.sequence.next(),
            request_id,
        }
        .write(&mut buf);
        buf.put_slice(payload);
        if mode.encrypts() {
            buf.extend(std::iter::repeat(padding as u8).take(padding + 1));
        }
        if let Some(keys) = keys {
            let signature = symmetric::sign(keys, &buf)?;
            buf.put_slice(&signature);
            if mode.encrypts() {
                symmetric::encrypt(keys, &mut buf[SYMMETRIC_PREFIX_SIZE..])?;
            }
        }
        Ok(RawChunk::new(
            message_type,
            chunk_type,
            Bytes::from(buf).slice(HEADER_SIZE..),
        ))
    }

    fn encode_asymmetric(
        &mut self,
        security: &ChannelSecurity,
        limits: &NegotiatedLimits,
        request_id: u32,
        body: &[u8],
    ) -> Result<RawChunk, UaError> {
        let mode = security.mode;
        let policy = security.policy;
        let (sender_certificate, receiver_thumbprint) = if mode.signs() {
            let local = security.local_credentials().ok_or_else(missing_credentials)?;
            let remote = security.remote_certificate().ok_or_else(missing_credentials)?;
            (Some(local.certificate().encode()?), Some(remote.thumbprint()?))
        } else {
            (None, None)
        };
        let signature_size = if mode.signs() {
            policy.asymmetric_signature_size()
        } else {
            0
        };
        let overhead = if mode.encrypts() {
            policy.asymmetric_encryption_overhead()
        } else {
            0
        };

        let prefix = HEADER_SIZE
            + 4
            + byte_string_len(Some(policy.uri().as_bytes()))
            + byte_string_len(sender_certificate.as_deref())
            + byte_string_len(receiver_thumbprint.as_deref());
        let total = prefix + SEQUENCE_HEADER_SIZE + body.len() + signature_size + overhead;
        if total > limits.send_chunk_size as usize {
            return Err(too_large(format!(
                "open channel message of {} bytes exceeds chunk size {}",
                total, limits.send_chunk_size
            )));
        }

        let mut buf = Vec::with_capacity(total);
        let header = MessageHeader {
            message_type: MessageType::OpenChannel,
            chunk_type: ChunkType::Final,
            message_size: total as u32,
        };
        buf.put_slice(&header.encode());
        buf.put_u32_le(security.channel_id);
        write_string(&mut buf, Some(policy.uri()));
        write_byte_string(&mut buf, sender_certificate.as_deref());
        write_byte_string(&mut buf, receiver_thumbprint.as_deref());
        SequenceHeader {
            sequence_number: self.sequence.next(),
            request_id,
        }
        .write(&mut buf);
        buf.put_slice(body);

        if mode.signs() {
            let local = security.local_credentials().ok_or_else(missing_credentials)?;
            let signature = asymmetric::sign(local, &buf);
            buf.put_slice(&signature);
        }
        if mode.encrypts() {
            let remote = security.remote_certificate().ok_or_else(missing_credentials)?;
            let sealed = asymmetric::seal(remote, &buf[prefix..])?;
            buf.truncate(prefix);
            buf.put_slice(&sealed);
        }
        debug_assert_eq!(buf.len(), total);
        Ok(RawChunk::new(
            MessageType::OpenChannel,
            ChunkType::Final,
            Bytes::from(buf).slice(HEADER_SIZE..),
        ))
    }
}

fn missing_credentials() -> UaError {
    UaError::security(
        StatusCode::BAD_CERTIFICATE_INVALID,
        "secured open channel needs local credentials and the peer certificate",
    )
}

fn current_token(security: &ChannelSecurity) -> Result<&TokenKeys, UaError> {
    security.current_token().ok_or_else(|| {
        UaError::security(
            StatusCode::BAD_SECURE_CHANNEL_TOKEN_UNKNOWN,
            "no security token installed",
        )
    })
}

fn sending_keys(mode: MessageSecurityMode, token: &TokenKeys) -> Result<Option<&DerivedKeys>, UaError> {
    if !mode.signs() {
        return Ok(None);
    }
    token
        .keys
        .as_ref()
        .map(|keys| Some(&keys.sending))
        .ok_or_else(|| {
            UaError::security(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                format!("token {} carries no keys", token.token_id),
            )
        })
}
