//! Netstring framing.
//!
//! Every chunk on the wire is encoded as `<decimal length>:<raw bytes>,`.
//! The length is authoritative, so frames are binary-safe: the payload may
//! contain `:` or `,` freely.
//!
//! ```text
//! "hi"  -> 2:hi,
//! ""    -> 0:,
//! ```

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, BufRead, Read, Write};
use std::ops::ControlFlow;
use thiserror::Error;

/// Longest accepted length prefix (enough for any `u64`).
const MAX_LENGTH_DIGITS: usize = 20;

/// Netstring decoding errors.
#[derive(Debug, Error)]
pub enum NetstringError {
    #[error("netstring read failed: {0}")]
    Io(#[from] io::Error),
    #[error("invalid netstring length: {0:?}")]
    InvalidLength(String),
    #[error("netstring length not terminated by ':'")]
    MissingColon,
    #[error("netstring truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("netstring not terminated by ','")]
    MissingComma,
}

/// Encode one frame.
pub fn encode(data: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(data.len() + MAX_LENGTH_DIGITS + 2);
    encode_into(&mut buf, data);
    buf.freeze()
}

/// Append one frame to `buf`.
pub fn encode_into(buf: &mut BytesMut, data: &[u8]) {
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(data);
    buf.put_u8(b',');
}

/// Write one frame to `writer`.
pub fn write<W: Write>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    write!(writer, "{}:", data.len())?;
    writer.write_all(data)?;
    writer.write_all(b",")
}

/// Decode frames from `source` one at a time.
///
/// `on_frame` receives the raw payload of each frame and returns
/// `ControlFlow::Break(())` to stop early. Decoding also stops, without
/// error, when the source is exhausted at a frame boundary.
pub fn decode_sequence<R, F>(source: &mut R, mut on_frame: F) -> Result<(), NetstringError>
where
    R: BufRead,
    F: FnMut(Bytes) -> ControlFlow<()>,
{
    while let Some(frame) = read_frame(source)? {
        if on_frame(frame).is_break() {
            break;
        }
    }
    Ok(())
}

/// Decode every frame in `input`.
pub fn decode(input: &[u8]) -> Result<Vec<Bytes>, NetstringError> {
    let mut frames = Vec::new();
    let mut source = input;
    decode_sequence(&mut source, |frame| {
        frames.push(frame);
        ControlFlow::Continue(())
    })?;
    Ok(frames)
}

/// Read a single frame. Returns `None` on a clean end of input.
fn read_frame<R: BufRead>(source: &mut R) -> Result<Option<Bytes>, NetstringError> {
    let mut prefix = Vec::with_capacity(MAX_LENGTH_DIGITS + 1);
    (&mut *source)
        .take(MAX_LENGTH_DIGITS as u64 + 1)
        .read_until(b':', &mut prefix)?;

    if prefix.is_empty() {
        return Ok(None);
    }
    if prefix.last() != Some(&b':') {
        if prefix.iter().all(u8::is_ascii_digit) && prefix.len() <= MAX_LENGTH_DIGITS {
            return Err(NetstringError::MissingColon);
        }
        return Err(invalid_length(&prefix));
    }
    prefix.pop();
    if prefix.is_empty() || !prefix.iter().all(u8::is_ascii_digit) {
        return Err(invalid_length(&prefix));
    }

    let len: usize = std::str::from_utf8(&prefix)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| invalid_length(&prefix))?;

    // Read through `take` so a bogus length can't force a huge allocation.
    let mut payload = Vec::new();
    (&mut *source).take(len as u64).read_to_end(&mut payload)?;
    if payload.len() != len {
        return Err(NetstringError::Truncated {
            expected: len,
            got: payload.len(),
        });
    }

    let mut comma = [0u8; 1];
    match source.read(&mut comma)? {
        1 if comma[0] == b',' => Ok(Some(Bytes::from(payload))),
        _ => Err(NetstringError::MissingComma),
    }
}

fn invalid_length(prefix: &[u8]) -> NetstringError {
    NetstringError::InvalidLength(String::from_utf8_lossy(prefix).into_owned())
}
