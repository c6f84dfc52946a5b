//! Length-prefixed framing for the RPC and property sockets.
//!
//! Wire format: `[u32 big-endian length][payload]`. A multi-part message is
//! simply consecutive frames.
//!
//! [`FrameReader`] keeps partially received frames across read timeouts, so
//! a socket can be polled with a short timeout without corrupting the stream.

use crate::error::{AppResult, ScopeError};
use bytes::{Buf, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{ErrorKind, Read, Write};

/// Largest frame accepted from a peer.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const HEADER_LEN: usize = 4;
const READ_CHUNK: usize = 8 * 1024;

/// Result of polling a [`FrameReader`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A complete frame payload.
    Frame(Bytes),
    /// The read timed out before a whole frame arrived.
    Idle,
    /// The peer closed the connection cleanly between frames.
    Closed,
}

/// Incremental frame decoder over a blocking reader.
pub struct FrameReader<R> {
    inner: R,
    buffer: BytesMut,
}

impl<R: Read> FrameReader<R> {
    /// Wraps a reader with an empty buffer.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buffer: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// The underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Read until one frame is complete, the read times out, or the peer closes.
    pub fn next_frame(&mut self) -> AppResult<FrameEvent> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.split_frame()? {
                return Ok(FrameEvent::Frame(frame));
            }
            match self.inner.read(&mut chunk) {
                Ok(0) if self.buffer.is_empty() => return Ok(FrameEvent::Closed),
                Ok(0) => {
                    return Err(ScopeError::Frame(format!(
                        "connection closed with {} byte(s) of an incomplete frame",
                        self.buffer.len()
                    )))
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(FrameEvent::Idle)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Like [`next_frame`](Self::next_frame) but retries through timeouts.
    /// Returns `None` when the peer closes.
    pub fn read_frame(&mut self) -> AppResult<Option<Bytes>> {
        loop {
            match self.next_frame()? {
                FrameEvent::Frame(frame) => return Ok(Some(frame)),
                FrameEvent::Idle => continue,
                FrameEvent::Closed => return Ok(None),
            }
        }
    }

    fn split_frame(&mut self) -> AppResult<Option<Bytes>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(ScopeError::Frame(format!(
                "frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
            )));
        }
        if self.buffer.len() < HEADER_LEN + len {
            return Ok(None);
        }
        self.buffer.advance(HEADER_LEN);
        Ok(Some(self.buffer.split_to(len).freeze()))
    }
}

/// Encode one frame into `out`.
pub fn encode_frame(out: &mut Vec<u8>, payload: &[u8]) -> AppResult<()> {
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len as usize <= MAX_FRAME_LEN)
        .ok_or_else(|| ScopeError::Frame(format!("payload of {} bytes is too large", payload.len())))?;
    out.reserve(HEADER_LEN + payload.len());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Write consecutive frames with a single `write_all`.
pub fn write_frames<W: Write>(writer: &mut W, parts: &[&[u8]]) -> AppResult<()> {
    let mut out = Vec::new();
    for part in parts {
        encode_frame(&mut out, part)?;
    }
    writer.write_all(&out)?;
    writer.flush()?;
    Ok(())
}

/// Writes one length-prefixed frame and flushes.
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> AppResult<()> {
    write_frames(writer, &[payload])
}

/// Serializes `value` to JSON and writes it as one frame.
pub fn write_json<W: Write, T: Serialize>(writer: &mut W, value: &T) -> AppResult<()> {
    let payload = serde_json::to_vec(value)?;
    write_frame(writer, &payload)
}

/// Parses a frame payload as JSON.
pub fn decode_json<T: DeserializeOwned>(frame: &[u8]) -> AppResult<T> {
    Ok(serde_json::from_slice(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_frames_split_correctly() {
        let mut wire = Vec::new();
        write_frames(&mut wire, &[b"topic", b"", b"{\"a\":1}"]).unwrap();
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert_eq!(reader.read_frame().unwrap().as_deref(), Some(&b"topic"[..]));
        assert_eq!(reader.read_frame().unwrap().as_deref(), Some(&b""[..]));
        assert_eq!(reader.read_frame().unwrap().as_deref(), Some(&b"{\"a\":1}"[..]));
        assert_eq!(reader.read_frame().unwrap(), None);
    }

    #[test]
    fn test_truncated_frame_is_an_error() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"hello").unwrap();
        wire.truncate(6);
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(reader.next_frame(), Err(ScopeError::Frame(_))));
    }

    #[test]
    fn test_oversized_header_rejected() {
        let wire = u32::MAX.to_be_bytes().to_vec();
        let mut reader = FrameReader::new(Cursor::new(wire));
        assert!(matches!(reader.next_frame(), Err(ScopeError::Frame(_))));
    }
}
