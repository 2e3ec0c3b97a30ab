use bytes::BufMut;
use tracing::{debug, warn};

use super::{ChannelSecurity, SequenceHeader, SequenceTracker, TokenKeys};
use super::{SEQUENCE_HEADER_SIZE, SYMMETRIC_PREFIX_SIZE};
use crate::binary::{read_byte_string, read_string, read_u32};
use crate::crypto::{asymmetric, symmetric, Certificate, DerivedKeys, SecurityPolicy};
use crate::error::UaError;
use crate::status::StatusCode;
use crate::transport::{ChunkType, ErrorMessage, MessageType, NegotiatedLimits, RawChunk};

/// A complete, verified message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    pub message_type: MessageType,
    pub channel_id: u32,
    /// Zero for OPN, which is secured asymmetrically.
    pub token_id: u32,
    pub request_id: u32,
    pub chunk_count: usize,
    pub body: Vec<u8>,
    /// Certificate the peer attached to a signed OPN.
    pub sender_certificate: Option<Certificate>,
}

/// Outcome of feeding one chunk that finished something.
#[derive(Debug, Clone, PartialEq)]
pub enum Assembled {
    Complete(AssembledMessage),
    /// The message for `request_id` will not complete; only that transaction fails.
    Aborted {
        request_id: u32,
        status: StatusCode,
        reason: String,
    },
}

#[derive(Debug)]
struct InProgress {
    message_type: MessageType,
    channel_id: u32,
    token_id: u32,
    request_id: u32,
    chunk_count: usize,
    body: Vec<u8>,
    sender_certificate: Option<Certificate>,
    discarding: bool,
}

/// One decoded and verified chunk.
struct OpenedChunk {
    channel_id: u32,
    token_id: u32,
    sequence: SequenceHeader,
    payload: Vec<u8>,
    sender_certificate: Option<Certificate>,
}

/// Rebuilds messages from incoming secure chunks.
///
/// Only one message is in progress at a time; the peer finishes (or aborts) a message before
/// starting the next. Errors returned from [`push`](Self::push) mean the channel can no
/// longer be trusted.
#[derive(Debug)]
pub struct ChunkAssembler {
    limits: NegotiatedLimits,
    tracker: SequenceTracker,
    in_progress: Option<InProgress>,
}

impl ChunkAssembler {
    pub fn new(limits: NegotiatedLimits) -> Self {
        Self {
            limits,
            tracker: SequenceTracker::default(),
            in_progress: None,
        }
    }

    pub fn last_sequence_number(&self) -> Option<u32> {
        self.tracker.last()
    }

    pub fn push(
        &mut self,
        security: &ChannelSecurity,
        chunk: RawChunk,
    ) -> Result<Option<Assembled>, UaError> {
        let opened = match chunk.message_type {
            MessageType::OpenChannel => open_asymmetric(security, &chunk)?,
            MessageType::Message | MessageType::CloseChannel => open_symmetric(security, &chunk)?,
            other => {
                return Err(UaError::protocol(
                    StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                    format!("{:?} chunk on a secure channel", other),
                ))
            }
        };
        self.tracker.accept(opened.sequence.sequence_number)?;
        let request_id = opened.sequence.request_id;

        if let Some(current) = &self.in_progress {
            if current.request_id != request_id || current.message_type != chunk.message_type {
                return Err(UaError::protocol(
                    StatusCode::BAD_DECODING_ERROR,
                    format!(
                        "chunk for request {} interleaved with unfinished request {}",
                        request_id, current.request_id
                    ),
                ));
            }
            if current.channel_id != opened.channel_id {
                return Err(UaError::security(
                    StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
                    "channel id changed within a message",
                ));
            }
        }

        if chunk.chunk_type == ChunkType::Abort {
            self.in_progress = None;
            let error = ErrorMessage::decode_body(&opened.payload)?;
            warn!(request_id, status = %error.status, reason = %error.reason, "peer aborted message");
            return Ok(Some(Assembled::Aborted {
                request_id,
                status: error.status,
                reason: error.reason,
            }));
        }

        let entry = self.in_progress.get_or_insert_with(|| InProgress {
            message_type: chunk.message_type,
            channel_id: opened.channel_id,
            token_id: opened.token_id,
            request_id,
            chunk_count: 0,
            body: Vec::new(),
            sender_certificate: opened.sender_certificate,
            discarding: false,
        });
        entry.chunk_count += 1;

        let mut aborted = None;
        if !entry.discarding {
            entry.body.extend_from_slice(&opened.payload);
            let max_chunks = self.limits.receive_max_chunk_count as usize;
            let max_size = self.limits.receive_max_message_size as usize;
            if (max_chunks != 0 && entry.chunk_count > max_chunks)
                || (max_size != 0 && entry.body.len() > max_size)
            {
                entry.discarding = true;
                entry.body = Vec::new();
                aborted = Some(Assembled::Aborted {
                    request_id,
                    status: StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                    reason: format!(
                        "incoming message exceeds {} bytes / {} chunks",
                        max_size, max_chunks
                    ),
                });
            }
        }

        if chunk.chunk_type == ChunkType::Intermediate {
            return Ok(aborted);
        }
        let Some(done) = self.in_progress.take() else {
            return Ok(aborted);
        };
        if done.discarding {
            return Ok(aborted);
        }
        debug!(
            channel_id = done.channel_id,
            request_id,
            chunks = done.chunk_count,
            bytes = done.body.len(),
            "message assembled"
        );
        Ok(Some(Assembled::Complete(AssembledMessage {
            message_type: done.message_type,
            channel_id: done.channel_id,
            token_id: done.token_id,
            request_id: done.request_id,
            chunk_count: done.chunk_count,
            body: done.body,
            sender_certificate: done.sender_certificate,
        })))
    }
}

fn check_channel(security: &ChannelSecurity, channel_id: u32) -> Result<(), UaError> {
    if security.channel_id != 0 && channel_id != security.channel_id {
        return Err(UaError::security(
            StatusCode::BAD_SECURE_CHANNEL_ID_INVALID,
            format!(
                "chunk for channel {} arrived on channel {}",
                channel_id, security.channel_id
            ),
        ));
    }
    Ok(())
}

fn security_error(status: StatusCode, message: impl Into<String>) -> UaError {
    UaError::security(status, message)
}

fn full_chunk(chunk: &RawChunk) -> Vec<u8> {
    let mut full = Vec::with_capacity(chunk.len());
    full.put_slice(&chunk.header().encode());
    full.put_slice(&chunk.body);
    full
}

fn receiving_keys<'a>(
    security: &ChannelSecurity,
    token: &'a TokenKeys,
) -> Result<Option<&'a DerivedKeys>, UaError> {
    if !security.mode.signs() {
        return Ok(None);
    }
    match &token.keys {
        Some(keys) => Ok(Some(&keys.receiving)),
        None => Err(security_error(
            StatusCode::BAD_SECURITY_CHECKS_FAILED,
            format!("token {} carries no keys", token.token_id),
        )),
    }
}

fn open_symmetric(security: &ChannelSecurity, chunk: &RawChunk) -> Result<OpenedChunk, UaError> {
    let mut full = full_chunk(chunk);
    if full.len() < SYMMETRIC_PREFIX_SIZE + SEQUENCE_HEADER_SIZE {
        return Err(UaError::protocol(
            StatusCode::BAD_DECODING_ERROR,
            "symmetric chunk truncated",
        ));
    }
    let channel_id = u32::from_le_bytes([full[8], full[9], full[10], full[11]]);
    let token_id = u32::from_le_bytes([full[12], full[13], full[14], full[15]]);
    check_channel(security, channel_id)?;
    let token = security.receiving_token(token_id)?;
    let keys = receiving_keys(security, token)?;
    let policy: SecurityPolicy = security.policy;

    if let (true, Some(keys)) = (security.mode.encrypts(), keys) {
        if (full.len() - SYMMETRIC_PREFIX_SIZE) % policy.block_size() != 0 {
            return Err(security_error(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                "encrypted region is not block aligned",
            ));
        }
        symmetric::decrypt(keys, &mut full[SYMMETRIC_PREFIX_SIZE..])?;
    }

    let mut end = full.len();
    if let Some(keys) = keys {
        let signature_size = policy.symmetric_signature_size();
        if end < SYMMETRIC_PREFIX_SIZE + SEQUENCE_HEADER_SIZE + signature_size {
            return Err(security_error(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                "chunk shorter than its signature",
            ));
        }
        let split = end - signature_size;
        symmetric::verify(keys, &full[..split], &full[split..])?;
        end = split;
    }
    if security.mode.encrypts() {
        let count = full[end - 1] as usize;
        let padding_start = end
            .checked_sub(count + 1)
            .filter(|start| *start >= SYMMETRIC_PREFIX_SIZE + SEQUENCE_HEADER_SIZE)
            .ok_or_else(|| {
                security_error(StatusCode::BAD_SECURITY_CHECKS_FAILED, "padding overruns chunk")
            })?;
        if full[padding_start..end].iter().any(|b| *b as usize != count) {
            return Err(security_error(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                "malformed padding",
            ));
        }
        end = padding_start;
    }

    let mut region = &full[SYMMETRIC_PREFIX_SIZE..end];
    let sequence = SequenceHeader::read(&mut region)?;
    Ok(OpenedChunk {
        channel_id,
        token_id,
        sequence,
        payload: region.to_vec(),
        sender_certificate: None,
    })
}

fn open_asymmetric(security: &ChannelSecurity, chunk: &RawChunk) -> Result<OpenedChunk, UaError> {
    let mut cursor: &[u8] = &chunk.body;
    let channel_id = read_u32(&mut cursor)?;
    check_channel(security, channel_id)?;
    let policy_uri = read_string(&mut cursor)?.unwrap_or_default();
    let policy = SecurityPolicy::from_uri(&policy_uri)?;
    if policy != security.policy {
        return Err(security_error(
            StatusCode::BAD_SECURITY_POLICY_REJECTED,
            format!("peer answered with policy {}", policy_uri),
        ));
    }
    let sender_certificate = read_byte_string(&mut cursor)?;
    let receiver_thumbprint = read_byte_string(&mut cursor)?;
    let prefix = crate::transport::HEADER_SIZE + chunk.body.len() - cursor.len();

    let mut full = full_chunk(chunk);
    if security.mode.encrypts() {
        let local = security.local_credentials().ok_or_else(|| {
            security_error(StatusCode::BAD_CERTIFICATE_INVALID, "no local credentials")
        })?;
        let opened = asymmetric::open(local, &full[prefix..])?;
        full.truncate(prefix);
        full.extend_from_slice(&opened);
    }

    let mut end = full.len();
    let mut certificate = None;
    if security.mode.signs() {
        let bytes = sender_certificate.ok_or_else(|| {
            security_error(StatusCode::BAD_CERTIFICATE_INVALID, "signed OPN without certificate")
        })?;
        let sender = Certificate::decode(&bytes)?;
        if let Some(expected) = security.remote_certificate() {
            if &sender != expected {
                return Err(security_error(
                    StatusCode::BAD_CERTIFICATE_INVALID,
                    format!("unexpected peer certificate {}", sender.application_uri),
                ));
            }
        }
        if let Some(local) = security.local_credentials() {
            if receiver_thumbprint.as_deref() != Some(local.certificate().thumbprint()?.as_slice())
            {
                return Err(security_error(
                    StatusCode::BAD_CERTIFICATE_INVALID,
                    "OPN addressed to another certificate",
                ));
            }
        }
        let signature_size = policy.asymmetric_signature_size();
        if end < prefix + SEQUENCE_HEADER_SIZE + signature_size {
            return Err(security_error(
                StatusCode::BAD_SECURITY_CHECKS_FAILED,
                "OPN shorter than its signature",
            ));
        }
        let split = end - signature_size;
        asymmetric::verify(&sender, &full[..split], &full[split..])?;
        end = split;
        certificate = Some(sender);
    }

    let mut region = &full[prefix..end];
    let sequence = SequenceHeader::read(&mut region)?;
    Ok(OpenedChunk {
        channel_id,
        token_id: 0,
        sequence,
        payload: region.to_vec(),
        sender_certificate: certificate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::{Chunker, SequenceCounter};
    use crate::crypto::{derive_channel_keys, ApplicationCredentials, MessageSecurityMode};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;

    const CHUNK: u32 = 8192;

    fn plain_pair(channel_id: u32) -> (ChannelSecurity, ChannelSecurity) {
        let mut client = ChannelSecurity::none();
        client.channel_id = channel_id;
        client.install_token(TokenKeys {
            token_id: 1,
            keys: None,
            expires_at: Instant::now() + Duration::from_secs(60),
        });
        (client.clone(), client)
    }

    fn secured_pair(mode: MessageSecurityMode) -> (ChannelSecurity, ChannelSecurity) {
        let policy = SecurityPolicy::Aes256Sha256Ed25519;
        let client_creds = Arc::new(ApplicationCredentials::generate("urn:client"));
        let server_creds = Arc::new(ApplicationCredentials::generate("urn:server"));
        let mut client = ChannelSecurity::new(
            policy,
            mode,
            Some(client_creds.clone()),
            Some(server_creds.certificate().clone()),
        )
        .unwrap();
        let mut server = ChannelSecurity::new(
            policy,
            mode,
            Some(server_creds),
            Some(client_creds.certificate().clone()),
        )
        .unwrap();
        let expires_at = Instant::now() + Duration::from_secs(60);
        let (cn, sn) = ([3u8; 32], [4u8; 32]);
        client.channel_id = 5;
        server.channel_id = 5;
        client.install_token(TokenKeys {
            token_id: 9,
            keys: Some(derive_channel_keys(policy, &cn, &sn)),
            expires_at,
        });
        server.install_token(TokenKeys {
            token_id: 9,
            keys: Some(derive_channel_keys(policy, &sn, &cn)),
            expires_at,
        });
        (client, server)
    }

    fn feed_all(
        assembler: &mut ChunkAssembler,
        security: &ChannelSecurity,
        chunks: Vec<RawChunk>,
    ) -> Option<Assembled> {
        let mut last = None;
        for chunk in chunks {
            last = assembler.push(security, chunk).unwrap();
        }
        last
    }

    #[tokio::test]
    async fn continuation_chunks_reassemble() {
        let (client, server) = plain_pair(7);
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let body: Vec<u8> = (0..30_000u32).map(|i| (i % 251) as u8).collect();
        let chunks = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 11, &body)
            .unwrap();
        assert_eq!(chunks.len(), 4);
        assert!(chunks[..3]
            .iter()
            .all(|c| c.chunk_type == ChunkType::Intermediate));
        assert_eq!(chunks[3].chunk_type, ChunkType::Final);

        let mut assembler = ChunkAssembler::new(limits);
        match feed_all(&mut assembler, &server, chunks) {
            Some(Assembled::Complete(message)) => {
                assert_eq!(message.request_id, 11);
                assert_eq!(message.channel_id, 7);
                assert_eq!(message.chunk_count, 4);
                assert_eq!(message.body, body);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn encrypted_chunks_verify_and_decrypt() {
        let (client, server) = secured_pair(MessageSecurityMode::SignAndEncrypt);
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let body = vec![0xA5u8; 20_000];
        let chunks = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 3, &body)
            .unwrap();
        assert!(chunks.iter().all(|c| c.len() <= CHUNK as usize));
        assert!(chunks.iter().all(|c| (c.len() - SYMMETRIC_PREFIX_SIZE) % 16 == 0));

        let mut assembler = ChunkAssembler::new(limits);
        match feed_all(&mut assembler, &server, chunks) {
            Some(Assembled::Complete(message)) => assert_eq!(message.body, body),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn tampered_signature_is_security_error() {
        let (client, server) = secured_pair(MessageSecurityMode::Sign);
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let chunk = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 3, b"hello")
            .unwrap()
            .remove(0);
        let mut body = chunk.body.to_vec();
        body[20] ^= 0x01;
        let tampered = RawChunk::new(chunk.message_type, chunk.chunk_type, body);
        let err = ChunkAssembler::new(limits)
            .push(&server, tampered)
            .unwrap_err();
        assert!(matches!(err, UaError::Security { .. }));
    }

    #[tokio::test]
    async fn channel_id_mismatch_rejected() {
        let (client, mut server) = plain_pair(7);
        server.channel_id = 8;
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let chunk = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 1, b"x")
            .unwrap()
            .remove(0);
        let err = ChunkAssembler::new(limits).push(&server, chunk).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_SECURE_CHANNEL_ID_INVALID);
    }

    #[tokio::test]
    async fn abort_fails_only_that_message() {
        let (client, server) = plain_pair(7);
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let mut assembler = ChunkAssembler::new(limits);
        let first = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 4, &vec![1u8; 9000])
            .unwrap()
            .remove(0);
        assert_eq!(assembler.push(&server, first).unwrap(), None);
        // The sender gives up after its first chunk.
        let mut chunker = Chunker::with_sequence(SequenceCounter::starting_at(2));
        let abort = chunker
            .abort(
                &client,
                MessageType::Message,
                4,
                &ErrorMessage {
                    status: StatusCode::BAD_REQUEST_INTERRUPTED,
                    reason: "cancelled".into(),
                },
            )
            .unwrap();
        assert_eq!(
            assembler.push(&server, abort).unwrap(),
            Some(Assembled::Aborted {
                request_id: 4,
                status: StatusCode::BAD_REQUEST_INTERRUPTED,
                reason: "cancelled".into(),
            })
        );
        let next = chunker
            .encode(&client, &limits, MessageType::Message, 5, b"ok")
            .unwrap();
        assert!(matches!(
            feed_all(&mut assembler, &server, next),
            Some(Assembled::Complete(_))
        ));
    }

    #[tokio::test]
    async fn sequence_gap_rejected() {
        let (client, server) = plain_pair(7);
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let mut chunker = Chunker::new();
        let mut assembler = ChunkAssembler::new(limits);
        let first = chunker
            .encode(&client, &limits, MessageType::Message, 1, b"a")
            .unwrap();
        feed_all(&mut assembler, &server, first);
        let _skipped = chunker
            .encode(&client, &limits, MessageType::Message, 2, b"b")
            .unwrap();
        let third = chunker
            .encode(&client, &limits, MessageType::Message, 3, b"c")
            .unwrap()
            .remove(0);
        let err = assembler.push(&server, third).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_SEQUENCE_NUMBER_INVALID);
    }

    #[tokio::test]
    async fn oversized_incoming_message_aborts() {
        let (client, server) = plain_pair(7);
        let mut receive = NegotiatedLimits::symmetric(CHUNK);
        receive.receive_max_chunk_count = 2;
        let send = NegotiatedLimits::symmetric(CHUNK);
        let chunks = Chunker::new()
            .encode(&client, &send, MessageType::Message, 6, &vec![0u8; 30_000])
            .unwrap();
        let mut assembler = ChunkAssembler::new(receive);
        let outcomes: Vec<_> = chunks
            .into_iter()
            .map(|c| assembler.push(&server, c).unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.is_some()).count(), 1);
        assert!(matches!(
            outcomes[2],
            Some(Assembled::Aborted {
                status: StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn outgoing_limits_enforced_before_writing() {
        let (client, _) = plain_pair(7);
        let mut limits = NegotiatedLimits::symmetric(CHUNK);
        limits.send_max_message_size = 1000;
        let err = Chunker::new()
            .encode(&client, &limits, MessageType::Message, 1, &vec![0u8; 1001])
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }

    #[tokio::test]
    async fn open_channel_signed_and_sealed() {
        let (mut client, mut server) = secured_pair(MessageSecurityMode::SignAndEncrypt);
        client.reset_tokens();
        server.reset_tokens();
        let limits = NegotiatedLimits::symmetric(CHUNK);
        let chunks = Chunker::new()
            .encode(&client, &limits, MessageType::OpenChannel, 1, b"open request")
            .unwrap();
        assert_eq!(chunks.len(), 1);
        match feed_all(&mut ChunkAssembler::new(limits), &server, chunks) {
            Some(Assembled::Complete(message)) => {
                assert_eq!(message.body, b"open request");
                assert_eq!(
                    message.sender_certificate.as_ref(),
                    client.local_credentials().map(|c| c.certificate())
                );
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
