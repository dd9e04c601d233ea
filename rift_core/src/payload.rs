//! Payload framing: batching packets into one transport round-trip.
//!
//! A multi-packet payload wraps each packet as
//! `\u{FFFD}<decimal byte length>\u{FFFD}<packet text>` with no separators
//! between entries. A buffer that does not begin with the delimiter is a
//! single unframed packet, and an empty buffer is an empty sequence; the
//! polling and socket paths produce both routinely.

use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::packet::{self, DecodeError, Packet};

/// The framing delimiter, UTF-8 encoded (`U+FFFD`, three bytes).
const DELIMITER: &[u8] = "\u{FFFD}".as_bytes();

/// A malformed payload frame.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FramingError {
    /// A length segment contains something other than ASCII digits.
    #[error("invalid frame length `{0}`")]
    BadLength(String),

    /// A length segment is not terminated by the delimiter.
    #[error("unterminated frame length")]
    UnterminatedLength,

    /// A declared length does not fit in the remaining buffer.
    #[error("frame length {declared} overruns remaining {remaining} bytes")]
    LengthOverrun {
        /// The declared frame length.
        declared: usize,
        /// Bytes left in the buffer.
        remaining: usize,
    },
}

/// A payload that failed to decode, either at the framing layer or inside
/// one of its packets.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    /// The framing itself is malformed.
    #[error(transparent)]
    Framing(#[from] FramingError),

    /// A framed packet is malformed.
    #[error(transparent)]
    Packet(#[from] DecodeError),
}

/// Frame a batch of already-encoded packets into one payload.
///
/// A single packet goes out unframed; an empty batch encodes to an empty
/// buffer.
#[must_use]
pub fn encode_payload<B: AsRef<[u8]>>(frames: &[B]) -> Bytes {
    match frames {
        [] => Bytes::new(),
        [single] => Bytes::copy_from_slice(single.as_ref()),
        many => {
            let mut out = BytesMut::new();
            for frame in many {
                let frame = frame.as_ref();
                out.extend_from_slice(DELIMITER);
                out.extend_from_slice(frame.len().to_string().as_bytes());
                out.extend_from_slice(DELIMITER);
                out.extend_from_slice(frame);
            }
            out.freeze()
        }
    }
}

/// Split a payload into its raw packet frames without decoding them.
///
/// The connection uses this so one malformed packet can be dropped while
/// its siblings are still delivered.
pub fn decode_frames(data: &[u8]) -> Result<Vec<&[u8]>, FramingError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if !data.starts_with(DELIMITER) {
        return Ok(vec![data]);
    }

    let mut frames = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        rest = match rest.strip_prefix(DELIMITER) {
            Some(r) => r,
            None => return Err(FramingError::UnterminatedLength),
        };
        let end = rest
            .windows(DELIMITER.len())
            .position(|w| w == DELIMITER)
            .ok_or(FramingError::UnterminatedLength)?;
        let digits = &rest[..end];
        let length: usize = std::str::from_utf8(digits)
            .ok()
            .filter(|s| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                FramingError::BadLength(String::from_utf8_lossy(digits).into_owned())
            })?;

        rest = &rest[end + DELIMITER.len()..];
        if length > rest.len() {
            return Err(FramingError::LengthOverrun {
                declared: length,
                remaining: rest.len(),
            });
        }
        frames.push(&rest[..length]);
        rest = &rest[length..];
    }
    Ok(frames)
}

/// Decode a payload into its packets, in order.
pub fn decode_payload(data: &[u8]) -> Result<Vec<Packet>, PayloadError> {
    decode_frames(data)?
        .into_iter()
        .map(|frame| packet::decode_packet(frame).map_err(PayloadError::from))
        .collect()
}
