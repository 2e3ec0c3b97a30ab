use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{MessageHeader, RawChunk, HEADER_SIZE};
use crate::error::UaError;
use crate::status::StatusCode;

/// Splits a byte stream into [`RawChunk`]s using the 8-byte header.
///
/// `max_chunk_size` is the receive buffer size advertised to the peer; a larger chunk is a
/// transport violation and ends the connection.
#[derive(Debug, Clone)]
pub struct ChunkCodec {
    max_chunk_size: usize,
}

impl ChunkCodec {
    pub fn new(max_chunk_size: u32) -> Self {
        Self {
            max_chunk_size: max_chunk_size as usize,
        }
    }

    pub fn set_max_chunk_size(&mut self, max_chunk_size: u32) {
        self.max_chunk_size = max_chunk_size as usize;
    }
}

impl Decoder for ChunkCodec {
    type Item = RawChunk;
    type Error = UaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_SIZE {
            return Ok(None);
        }
        let header = MessageHeader::decode(&src[..HEADER_SIZE])?;
        let size = header.message_size as usize;
        if self.max_chunk_size > 0 && size > self.max_chunk_size {
            return Err(UaError::transport(
                StatusCode::BAD_TCP_MESSAGE_TOO_LARGE,
                format!("chunk of {} bytes exceeds limit {}", size, self.max_chunk_size),
            ));
        }
        if src.len() < size {
            src.reserve(size - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(size);
        frame.advance(HEADER_SIZE);
        Ok(Some(RawChunk {
            message_type: header.message_type,
            chunk_type: header.chunk_type,
            body: frame.freeze(),
        }))
    }
}

impl Encoder<RawChunk> for ChunkCodec {
    type Error = UaError;

    fn encode(&mut self, item: RawChunk, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item.header().encode());
        dst.put_slice(&item.body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChunkType, MessageType};

    #[test]
    fn decodes_partial_input_incrementally() {
        let mut codec = ChunkCodec::new(1024);
        let chunk = RawChunk::new(MessageType::Message, ChunkType::Final, vec![9u8; 40]);
        let bytes = chunk.to_bytes();
        let mut buf = BytesMut::from(&bytes[..5]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[5..30]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&bytes[30..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(chunk));
        assert!(buf.is_empty());
    }

    #[test]
    fn oversize_chunk_is_fatal() {
        let mut codec = ChunkCodec::new(16);
        let chunk = RawChunk::new(MessageType::Message, ChunkType::Final, vec![0u8; 20]);
        let mut buf = BytesMut::from(&chunk.to_bytes()[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_TCP_MESSAGE_TOO_LARGE);
    }

    #[test]
    fn encodes_back_to_back_chunks() {
        let mut codec = ChunkCodec::new(0);
        let mut buf = BytesMut::new();
        let a = RawChunk::new(MessageType::OpenChannel, ChunkType::Final, vec![1, 2]);
        let b = RawChunk::new(MessageType::CloseChannel, ChunkType::Final, vec![3]);
        codec.encode(a.clone(), &mut buf).unwrap();
        codec.encode(b.clone(), &mut buf).unwrap();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(a));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(b));
    }
}
