//! Codecs for Hark events.
//!
//! Text frames carry the JSON envelope. Binary frames carry the same envelope
//! encoded as MessagePack behind a 4-byte big-endian length prefix, so several
//! events can be packed into one buffer.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Maximum frame size (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Not enough data to decode frame.
    #[error("Incomplete frame: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire encoding of a connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// JSON in text frames.
    #[default]
    Json,
    /// Length-prefixed MessagePack in binary frames.
    MessagePack,
}

/// An encoded event ready to be written to a socket.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Bytes),
}

impl WireFrame {
    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            WireFrame::Text(text) => text.len(),
            WireFrame::Binary(data) => data.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode a value using the given encoding.
///
/// # Errors
///
/// Returns an error if serialization fails or the frame is too large.
pub fn encode_as<T: Serialize>(value: &T, encoding: Encoding) -> Result<WireFrame, ProtocolError> {
    match encoding {
        Encoding::Json => encode_json(value).map(WireFrame::Text),
        Encoding::MessagePack => encode(value).map(WireFrame::Binary),
    }
}

/// Encode a value as a JSON string.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_json<T: Serialize>(value: &T) -> Result<String, ProtocolError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a value from a JSON string.
///
/// # Errors
///
/// Returns an error if the text is not a valid envelope.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

/// Encode a value to a length-prefixed MessagePack frame.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(value, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a value into an existing buffer.
///
/// # Errors
///
/// Returns an error if the frame is too large or encoding fails.
pub fn encode_into<T: Serialize>(value: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = rmp_serde::to_vec_named(value)?;

    if payload.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::FrameTooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        });
    }

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a single length-prefixed frame.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    let length = frame_length(data, MAX_FRAME_SIZE)?.ok_or(ProtocolError::Incomplete(
        LENGTH_PREFIX_SIZE.saturating_sub(data.len()),
    ))?;

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    Ok(rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?)
}

/// Try to decode a frame from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(value))` if a complete frame was decoded and `Ok(None)` if
/// more data is needed. A frame that is complete but undecodable is consumed
/// before the error is returned so the buffer stays aligned.
///
/// # Errors
///
/// Returns an error if the frame is too large or invalid.
pub fn decode_from<T: DeserializeOwned>(buf: &mut BytesMut) -> Result<Option<T>, ProtocolError> {
    decode_from_with_limit(buf, MAX_FRAME_SIZE)
}

/// Like [`decode_from`], rejecting frames that declare more than `max` bytes.
///
/// The length prefix is checked before the payload arrives, so an oversized
/// frame fails as soon as its header is buffered. The buffer is left as is
/// on that error; callers should discard it.
///
/// # Errors
///
/// Returns [`ProtocolError::FrameTooLarge`] if the declared length exceeds
/// `max`, or a decoding error if the frame is invalid.
pub fn decode_from_with_limit<T: DeserializeOwned>(
    buf: &mut BytesMut,
    max: usize,
) -> Result<Option<T>, ProtocolError> {
    let Some(length) = frame_length(buf, max.min(MAX_FRAME_SIZE))? else {
        return Ok(None);
    };

    if buf.len() < LENGTH_PREFIX_SIZE + length {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    Ok(Some(rmp_serde::from_slice(&payload)?))
}

fn frame_length(data: &[u8], max: usize) -> Result<Option<usize>, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
    if length > max {
        return Err(ProtocolError::FrameTooLarge { size: length, max });
    }

    Ok(Some(length))
}
