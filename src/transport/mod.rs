//! Connection-level framing: the 8-byte chunk header, the HEL/ACK/ERR handshake and the
//! byte-stream connection that carries chunks.
use bytes::{BufMut, Bytes};

use crate::error::UaError;
use crate::status::StatusCode;

pub mod codec;
pub mod connection;
pub mod handshake;

pub use codec::ChunkCodec;
pub use connection::{ConnectionStats, TransportConnection};
pub use handshake::{Acknowledge, ErrorMessage, Hello, NegotiatedLimits};

/// Size of the `type | indicator | length` prefix on every chunk.
pub const HEADER_SIZE: usize = 8;

pub const DEFAULT_PORT: u16 = 4840;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Hello,
    Acknowledge,
    Error,
    OpenChannel,
    Message,
    CloseChannel,
}

impl MessageType {
    pub fn tag(&self) -> &'static [u8; 3] {
        match self {
            MessageType::Hello => b"HEL",
            MessageType::Acknowledge => b"ACK",
            MessageType::Error => b"ERR",
            MessageType::OpenChannel => b"OPN",
            MessageType::Message => b"MSG",
            MessageType::CloseChannel => b"CLO",
        }
    }

    pub fn from_tag(tag: &[u8]) -> Result<Self, UaError> {
        match tag {
            b"HEL" => Ok(MessageType::Hello),
            b"ACK" => Ok(MessageType::Acknowledge),
            b"ERR" => Ok(MessageType::Error),
            b"OPN" => Ok(MessageType::OpenChannel),
            b"MSG" => Ok(MessageType::Message),
            b"CLO" => Ok(MessageType::CloseChannel),
            other => Err(UaError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("unknown message type {:?}", String::from_utf8_lossy(other)),
            )),
        }
    }

    /// Types that travel inside a secure channel (carry a channel id after the header).
    pub fn is_secure(&self) -> bool {
        matches!(
            self,
            MessageType::OpenChannel | MessageType::Message | MessageType::CloseChannel
        )
    }
}

/// Chunk indicator: final, continuation or abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkType {
    Final,
    Intermediate,
    Abort,
}

impl ChunkType {
    pub fn byte(&self) -> u8 {
        match self {
            ChunkType::Final => b'F',
            ChunkType::Intermediate => b'C',
            ChunkType::Abort => b'A',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, UaError> {
        match byte {
            b'F' => Ok(ChunkType::Final),
            b'C' => Ok(ChunkType::Intermediate),
            b'A' => Ok(ChunkType::Abort),
            other => Err(UaError::protocol(
                StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID,
                format!("invalid chunk indicator 0x{:02x}", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    /// Total chunk length including the header.
    pub message_size: u32,
}

impl MessageHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..3].copy_from_slice(self.message_type.tag());
        out[3] = self.chunk_type.byte();
        out[4..].copy_from_slice(&self.message_size.to_le_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, UaError> {
        if bytes.len() < HEADER_SIZE {
            return Err(UaError::protocol(
                StatusCode::BAD_DECODING_ERROR,
                "chunk header truncated",
            ));
        }
        let message_type = MessageType::from_tag(&bytes[..3])?;
        let chunk_type = ChunkType::from_byte(bytes[3])?;
        let message_size = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if (message_size as usize) < HEADER_SIZE {
            return Err(UaError::protocol(
                StatusCode::BAD_DECODING_ERROR,
                format!("chunk length {} shorter than header", message_size),
            ));
        }
        Ok(Self {
            message_type,
            chunk_type,
            message_size,
        })
    }
}

/// One length-delimited chunk as it travels on the wire. `body` excludes the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawChunk {
    pub message_type: MessageType,
    pub chunk_type: ChunkType,
    pub body: Bytes,
}

impl RawChunk {
    pub fn new(message_type: MessageType, chunk_type: ChunkType, body: impl Into<Bytes>) -> Self {
        Self {
            message_type,
            chunk_type,
            body: body.into(),
        }
    }

    pub fn header(&self) -> MessageHeader {
        MessageHeader {
            message_type: self.message_type,
            chunk_type: self.chunk_type,
            message_size: (HEADER_SIZE + self.body.len()) as u32,
        }
    }

    pub fn len(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Parses a complete chunk, insisting that the declared length matches the bytes given.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UaError> {
        let header = MessageHeader::decode(bytes)?;
        if header.message_size as usize != bytes.len() {
            return Err(UaError::protocol(
                StatusCode::BAD_DECODING_ERROR,
                format!(
                    "declared length {} does not match {} bytes",
                    header.message_size,
                    bytes.len()
                ),
            ));
        }
        Ok(Self {
            message_type: header.message_type,
            chunk_type: header.chunk_type,
            body: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.put_slice(&self.header().encode());
        out.put_slice(&self.body);
        out
    }
}

/// Host and port extracted from an `opc.tcp://host:port/path` endpoint URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointAddress {
    pub host: String,
    pub port: u16,
    pub url: String,
}

impl EndpointAddress {
    pub fn parse(url: &str) -> Result<Self, UaError> {
        let invalid = |why: &str| {
            UaError::transport(
                StatusCode::BAD_TCP_ENDPOINT_URL_INVALID,
                format!("{}: {}", why, url),
            )
        };
        let rest = url
            .strip_prefix("opc.tcp://")
            .ok_or_else(|| invalid("unsupported scheme"))?;
        let authority = rest.split('/').next().unwrap_or_default();
        if authority.is_empty() {
            return Err(invalid("missing host"));
        }
        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let end = bracketed.find(']').ok_or_else(|| invalid("bad ipv6 host"))?;
            let host = &bracketed[..end];
            let port = match bracketed[end + 1..].strip_prefix(':') {
                Some(p) => p.parse::<u16>().map_err(|_| invalid("bad port"))?,
                None => DEFAULT_PORT,
            };
            (host.to_string(), port)
        } else {
            match authority.rsplit_once(':') {
                Some((host, port)) => (
                    host.to_string(),
                    port.parse::<u16>().map_err(|_| invalid("bad port"))?,
                ),
                None => (authority.to_string(), DEFAULT_PORT),
            }
        };
        Ok(Self {
            host,
            port,
            url: url.to_string(),
        })
    }

    pub fn socket_target(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let chunk = RawChunk::new(MessageType::Message, ChunkType::Intermediate, vec![7u8; 12]);
        let bytes = chunk.to_bytes();
        assert_eq!(&bytes[..4], b"MSGC");
        assert_eq!(u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]), 20);
        assert_eq!(RawChunk::from_bytes(&bytes).unwrap(), chunk);
    }

    #[test]
    fn length_mismatch_rejected() {
        let mut bytes = RawChunk::new(MessageType::Message, ChunkType::Final, vec![1, 2, 3]).to_bytes();
        bytes.push(0);
        assert!(RawChunk::from_bytes(&bytes).is_err());
    }

    #[test]
    fn unknown_type_rejected() {
        let err = MessageHeader::decode(b"XYZF\x08\x00\x00\x00").unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_TCP_MESSAGE_TYPE_INVALID);
    }

    #[test]
    fn endpoint_parsing() {
        let addr = EndpointAddress::parse("opc.tcp://plc.local:4841/server").unwrap();
        assert_eq!(addr.host, "plc.local");
        assert_eq!(addr.port, 4841);
        let addr = EndpointAddress::parse("opc.tcp://10.0.0.5").unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        let addr = EndpointAddress::parse("opc.tcp://[::1]:4850/").unwrap();
        assert_eq!(addr.host, "::1");
        assert_eq!(addr.port, 4850);
        assert!(EndpointAddress::parse("http://plc.local").is_err());
    }
}
