//! Little-endian primitives used by the connection and chunk headers.
//!
//! Strings and byte strings are prefixed with an `Int32` length where `-1` encodes null.
use bytes::{Buf, BufMut};

use crate::error::UaError;
use crate::status::StatusCode;

fn short(what: &str) -> UaError {
    UaError::protocol(
        StatusCode::BAD_DECODING_ERROR,
        format!("buffer too short for {}", what),
    )
}

pub fn read_u32<B: Buf>(buf: &mut B) -> Result<u32, UaError> {
    if buf.remaining() < 4 {
        return Err(short("UInt32"));
    }
    Ok(buf.get_u32_le())
}

pub fn write_u32<B: BufMut>(buf: &mut B, value: u32) {
    buf.put_u32_le(value);
}

pub fn read_byte_string<B: Buf>(buf: &mut B) -> Result<Option<Vec<u8>>, UaError> {
    if buf.remaining() < 4 {
        return Err(short("ByteString length"));
    }
    let len = buf.get_i32_le();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(short("ByteString body"));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(Some(out))
}

pub fn write_byte_string<B: BufMut>(buf: &mut B, value: Option<&[u8]>) {
    match value {
        Some(bytes) => {
            buf.put_i32_le(bytes.len() as i32);
            buf.put_slice(bytes);
        }
        None => buf.put_i32_le(-1),
    }
}

pub fn byte_string_len(value: Option<&[u8]>) -> usize {
    4 + value.map(|v| v.len()).unwrap_or(0)
}

pub fn read_string<B: Buf>(buf: &mut B) -> Result<Option<String>, UaError> {
    match read_byte_string(buf)? {
        Some(bytes) => String::from_utf8(bytes).map(Some).map_err(|e| {
            UaError::protocol(StatusCode::BAD_DECODING_ERROR, format!("utf-8: {}", e))
        }),
        None => Ok(None),
    }
}

pub fn write_string<B: BufMut>(buf: &mut B, value: Option<&str>) {
    write_byte_string(buf, value.map(str::as_bytes));
}
