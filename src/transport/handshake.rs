use super::{ChunkType, MessageType, RawChunk};
use crate::binary::{read_string, read_u32, write_string, write_u32};
use crate::config::{TransportConfig, MIN_BUFFER_SIZE};
use crate::error::UaError;
use crate::status::StatusCode;

/// Client greeting proposing buffer sizes and naming the target endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hello {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
    pub endpoint_url: String,
}

impl Hello {
    pub fn from_config(config: &TransportConfig, endpoint_url: &str) -> Self {
        Self {
            protocol_version: config.protocol_version,
            receive_buffer_size: config.receive_buffer_size,
            send_buffer_size: config.send_buffer_size,
            max_message_size: config.max_message_size,
            max_chunk_count: config.max_chunk_count,
            endpoint_url: endpoint_url.to_string(),
        }
    }

    pub fn to_chunk(&self) -> RawChunk {
        let mut body = Vec::with_capacity(24 + self.endpoint_url.len());
        write_u32(&mut body, self.protocol_version);
        write_u32(&mut body, self.receive_buffer_size);
        write_u32(&mut body, self.send_buffer_size);
        write_u32(&mut body, self.max_message_size);
        write_u32(&mut body, self.max_chunk_count);
        write_string(&mut body, Some(&self.endpoint_url));
        RawChunk::new(MessageType::Hello, ChunkType::Final, body)
    }

    pub fn from_chunk(chunk: &RawChunk) -> Result<Self, UaError> {
        expect_final(chunk, MessageType::Hello)?;
        let mut body = &chunk.body[..];
        Ok(Self {
            protocol_version: read_u32(&mut body)?,
            receive_buffer_size: read_u32(&mut body)?,
            send_buffer_size: read_u32(&mut body)?,
            max_message_size: read_u32(&mut body)?,
            max_chunk_count: read_u32(&mut body)?,
            endpoint_url: read_string(&mut body)?.unwrap_or_default(),
        })
    }
}

/// Server reply carrying the revised transport limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledge {
    pub protocol_version: u32,
    pub receive_buffer_size: u32,
    pub send_buffer_size: u32,
    pub max_message_size: u32,
    pub max_chunk_count: u32,
}

/// Exact body length of an ACK message.
const ACK_BODY_LEN: usize = 20;

impl Acknowledge {
    pub fn to_chunk(&self) -> RawChunk {
        let mut body = Vec::with_capacity(ACK_BODY_LEN);
        write_u32(&mut body, self.protocol_version);
        write_u32(&mut body, self.receive_buffer_size);
        write_u32(&mut body, self.send_buffer_size);
        write_u32(&mut body, self.max_message_size);
        write_u32(&mut body, self.max_chunk_count);
        RawChunk::new(MessageType::Acknowledge, ChunkType::Final, body)
    }

    pub fn from_chunk(chunk: &RawChunk) -> Result<Self, UaError> {
        expect_final(chunk, MessageType::Acknowledge).map_err(as_transport)?;
        if chunk.body.len() != ACK_BODY_LEN {
            return Err(UaError::transport(
                StatusCode::BAD_DECODING_ERROR,
                format!("ACK body of {} bytes, expected {}", chunk.body.len(), ACK_BODY_LEN),
            ));
        }
        let mut body = &chunk.body[..];
        Ok(Self {
            protocol_version: read_u32(&mut body)?,
            receive_buffer_size: read_u32(&mut body)?,
            send_buffer_size: read_u32(&mut body)?,
            max_message_size: read_u32(&mut body)?,
            max_chunk_count: read_u32(&mut body)?,
        })
    }
}

/// Error report; the peer closes the socket after sending it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorMessage {
    pub status: StatusCode,
    pub reason: String,
}

impl ErrorMessage {
    pub fn to_chunk(&self) -> RawChunk {
        RawChunk::new(MessageType::Error, ChunkType::Final, self.encode_body())
    }

    pub fn from_chunk(chunk: &RawChunk) -> Result<Self, UaError> {
        Self::decode_body(&chunk.body)
    }

    /// ERR bodies and abort-chunk payloads share this layout.
    pub fn decode_body(mut body: &[u8]) -> Result<Self, UaError> {
        let status = StatusCode(read_u32(&mut body)?);
        let reason = read_string(&mut body)?.unwrap_or_default();
        Ok(Self { status, reason })
    }

    pub fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.reason.len());
        write_u32(&mut body, self.status.0);
        write_string(&mut body, Some(&self.reason));
        body
    }
}

fn expect_final(chunk: &RawChunk, expected: MessageType) -> Result<(), UaError> {
    if chunk.message_type != expected {
        return Err(UaError::protocol(
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            format!("expected {:?}, got {:?}", expected, chunk.message_type),
        ));
    }
    if chunk.chunk_type != ChunkType::Final {
        return Err(UaError::protocol(
            StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
            format!("{:?} must be a single final chunk", expected),
        ));
    }
    Ok(())
}

fn as_transport(err: UaError) -> UaError {
    UaError::transport(err.status(), err.to_string())
}

/// Limits in force for the rest of the connection's life.
///
/// `send_*` values bound what this side may write (the peer's receive limits); `receive_*`
/// values bound what the peer may write to us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatedLimits {
    pub protocol_version: u32,
    pub send_chunk_size: u32,
    pub send_max_message_size: u32,
    pub send_max_chunk_count: u32,
    pub receive_chunk_size: u32,
    pub receive_max_message_size: u32,
    pub receive_max_chunk_count: u32,
}

impl NegotiatedLimits {
    /// Combines the proposal with the server's revision, rejecting revisions a conforming
    /// server cannot make.
    pub fn negotiate(hello: &Hello, ack: &Acknowledge) -> Result<Self, UaError> {
        if ack.protocol_version > hello.protocol_version {
            return Err(UaError::transport(
                StatusCode::BAD_PROTOCOL_VERSION_UNSUPPORTED,
                format!(
                    "server protocol version {} newer than ours {}",
                    ack.protocol_version, hello.protocol_version
                ),
            ));
        }
        if ack.receive_buffer_size < MIN_BUFFER_SIZE || ack.send_buffer_size < MIN_BUFFER_SIZE {
            return Err(UaError::transport(
                StatusCode::BAD_TCP_NOT_ENOUGH_RESOURCES,
                format!(
                    "server buffers {}/{} below minimum",
                    ack.receive_buffer_size, ack.send_buffer_size
                ),
            ));
        }
        Ok(Self {
            protocol_version: ack.protocol_version,
            send_chunk_size: ack.receive_buffer_size.min(hello.send_buffer_size),
            send_max_message_size: ack.max_message_size,
            send_max_chunk_count: ack.max_chunk_count,
            receive_chunk_size: ack.send_buffer_size.min(hello.receive_buffer_size),
            receive_max_message_size: hello.max_message_size,
            receive_max_chunk_count: hello.max_chunk_count,
        })
    }

    /// Limits used before a handshake has happened (tests and server-side helpers).
    pub fn symmetric(chunk_size: u32) -> Self {
        Self {
            protocol_version: 0,
            send_chunk_size: chunk_size,
            send_max_message_size: 0,
            send_max_chunk_count: 0,
            receive_chunk_size: chunk_size,
            receive_max_message_size: 0,
            receive_max_chunk_count: 0,
        }
    }

    /// The mirror image, as seen from the other end of the connection.
    pub fn reversed(&self) -> Self {
        Self {
            protocol_version: self.protocol_version,
            send_chunk_size: self.receive_chunk_size,
            send_max_message_size: self.receive_max_message_size,
            send_max_chunk_count: self.receive_max_chunk_count,
            receive_chunk_size: self.send_chunk_size,
            receive_max_message_size: self.send_max_message_size,
            receive_max_chunk_count: self.send_max_chunk_count,
        }
    }
}
