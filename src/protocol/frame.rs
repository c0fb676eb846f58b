//! Content-Length frame codec.
//!
//! A frame on the wire is `Content-Length: <N>\r\n\r\n` followed by exactly
//! `<N>` payload bytes. Header names are case-insensitive and values may
//! carry leading whitespace; unknown headers are ignored. On input the
//! header region also accepts LF-only line endings; on output only CRLF is
//! emitted.
//!
//! [`FrameBuffer`] accumulates partial reads in a single rolling
//! `bytes::BytesMut` and yields complete payloads as they become available.
//!
//! # Example
//!
//! ```
//! use stdiowire::protocol::{encode_frame, Extracted, FrameBuffer};
//!
//! let mut buffer = FrameBuffer::new();
//! buffer.extend(&encode_frame(b"hello"));
//!
//! match buffer.extract() {
//!     Extracted::Frame(payload) => assert_eq!(&payload[..], b"hello"),
//!     other => panic!("unexpected: {:?}", other),
//! }
//! ```

use std::io::BufRead;

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::error::{Result, TransportError};

/// Largest accepted payload size (1 MiB). Frames declaring more are
/// rejected and their header region is skipped.
pub const MAX_CONTENT_LENGTH: usize = 1024 * 1024;

/// Header/body separator.
const HEADER_SEP: &[u8] = b"\r\n\r\n";

/// Frame-level parse failures.
///
/// These are recoverable: the extractor discards the offending header
/// region and the stream continues with the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// No parseable `Content-Length` header in the header region.
    #[error("missing Content-Length header")]
    MissingLength,

    /// Declared body length exceeds [`MAX_CONTENT_LENGTH`].
    #[error("declared body length {0} exceeds maximum")]
    BodyTooLarge(u64),
}

/// Outcome of one [`FrameBuffer::extract`] call.
#[derive(Debug)]
pub enum Extracted {
    /// Not enough buffered bytes for a complete frame; buffer untouched.
    NeedMore,
    /// One complete payload, removed from the buffer.
    Frame(Bytes),
    /// A header region without a usable length; the region (through the
    /// separator) has been discarded so framing can continue.
    Malformed(FrameError),
}

/// Encode a payload as a single frame.
///
/// Emits `Content-Length: <len>\r\n\r\n<payload>` and nothing else.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let header = format!("Content-Length: {}\r\n\r\n", payload.len());
    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Rolling buffer that reassembles frames from arbitrary read chunks.
///
/// Repeated [`extract`](Self::extract) calls on an ever-growing buffer
/// produce the exact payload sequence that was encoded, in order, as long
/// as the byte stream is a concatenation of valid frames.
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    /// Create an empty frame buffer.
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
        }
    }

    /// Append raw bytes from a read.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop all buffered bytes.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Try to pull the next frame out of the buffer.
    ///
    /// Returns [`Extracted::NeedMore`] without consuming anything when the
    /// header separator has not arrived or the body is still incomplete.
    pub fn extract(&mut self) -> Extracted {
        let Some(header_end) = find_separator(&self.buf) else {
            return Extracted::NeedMore;
        };
        let header_and_sep = header_end + HEADER_SEP.len();

        match parse_content_length(&self.buf[..header_end]) {
            Ok(content_length) => {
                let frame_total = header_and_sep + content_length;
                if self.buf.len() < frame_total {
                    return Extracted::NeedMore;
                }
                self.buf.advance(header_and_sep);
                let payload = self.buf.split_to(content_length).freeze();
                Extracted::Frame(payload)
            }
            Err(err) => {
                self.buf.advance(header_and_sep);
                Extracted::Malformed(err)
            }
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Offset of the first `\r\n\r\n` in `buf`, if any.
fn find_separator(buf: &[u8]) -> Option<usize> {
    if buf.len() < HEADER_SEP.len() {
        return None;
    }
    buf.windows(HEADER_SEP.len()).position(|w| w == HEADER_SEP)
}

/// Scan a header region for a usable `Content-Length` value.
///
/// Lines split on `\n` with a trailing `\r` trimmed. Duplicate headers:
/// last valid one wins. An unparseable value skips the line; a too-large
/// value rejects the whole region.
fn parse_content_length(region: &[u8]) -> std::result::Result<usize, FrameError> {
    let mut length: Option<usize> = None;

    for line in region.split(|&b| b == b'\n') {
        let line = match line.last() {
            Some(b'\r') => &line[..line.len() - 1],
            _ => line,
        };
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };
        if !line[..colon].eq_ignore_ascii_case(b"content-length") {
            continue;
        }
        match parse_length_value(&line[colon + 1..]) {
            Some(value) => {
                if value > MAX_CONTENT_LENGTH as u64 {
                    tracing::warn!(length = value, "Content-Length exceeds maximum");
                    return Err(FrameError::BodyTooLarge(value));
                }
                length = Some(value as usize);
            }
            None => {
                tracing::warn!(
                    value = %String::from_utf8_lossy(&line[colon + 1..]),
                    "invalid Content-Length header"
                );
            }
        }
    }

    length.ok_or(FrameError::MissingLength)
}

/// Parse the leading decimal digit run of a left-trimmed header value.
///
/// Trailing junk after the digits is ignored (strtoull semantics).
fn parse_length_value(raw: &[u8]) -> Option<u64> {
    let trimmed = match raw.iter().position(|b| !b.is_ascii_whitespace()) {
        Some(start) => &raw[start..],
        None => return None,
    };
    let digits_len = trimmed
        .iter()
        .take_while(|b| b.is_ascii_digit())
        .count();
    if digits_len == 0 {
        return None;
    }
    // The digit run is ASCII by construction.
    std::str::from_utf8(&trimmed[..digits_len])
        .ok()?
        .parse::<u64>()
        .ok()
}

/// Read one frame from a buffered reader, blocking until it is complete.
///
/// Getline-style convenience for callers that own a blocking stream.
/// Returns `Ok(None)` on end of stream before a complete header region.
pub fn read_frame<R: BufRead>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut line = String::new();
    let mut length: Option<usize> = None;

    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            continue;
        };
        if !name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        if let Some(value) = parse_length_value(value.as_bytes()) {
            if value > MAX_CONTENT_LENGTH as u64 {
                return Err(TransportError::Framing(FrameError::BodyTooLarge(value)));
            }
            length = Some(value as usize);
        }
    }

    let Some(length) = length else {
        return Err(TransportError::Framing(FrameError::MissingLength));
    };
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body)?;
    Ok(Some(body))
}
