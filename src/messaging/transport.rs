//! Byte transports carrying terminator-delimited device messages.
//!
//! A [`Transport`] is split into a receiving half, owned by the manager's
//! receive thread, and a sending half, shared by every device on the port.
//! Messages handed across both halves never include the terminator.
//!
//! Reads are expected to time out periodically (`Ok(None)`) so that the
//! receive loop can notice a stop request. Partial messages survive a timeout.
//! A message that grows past [`MAX_MESSAGE_LEN`] without a terminator is an
//! error; the manager treats it like any other transport failure.

use crate::error::{AppResult, ScopeError};
use bytes::{Bytes, BytesMut};
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::debug;

const READ_CHUNK: usize = 512;

/// Longest message accepted before its terminator, by default.
pub const MAX_MESSAGE_LEN: usize = 64 * 1024;

/// Receiving half of a transport.
pub trait MessageSource: Send {
    /// Next complete message, `Ok(None)` on read timeout, or an error once the
    /// underlying channel is unusable.
    fn receive(&mut self) -> AppResult<Option<Bytes>>;
}

/// Sending half of a transport.
pub trait MessageSink: Send {
    /// Write one message, appending the terminator.
    fn send(&mut self, message: &[u8]) -> AppResult<()>;
}

/// Splits a byte stream on a terminator.
pub struct DelimitedReader<R> {
    inner: R,
    terminator: Vec<u8>,
    buffer: BytesMut,
    /// Prefix of `buffer` already known not to contain a terminator.
    scanned: usize,
    max_len: usize,
}

impl<R: Read> DelimitedReader<R> {
    /// Split `inner` on `terminator`, which must not be empty.
    pub fn new(inner: R, terminator: &[u8]) -> Self {
        Self {
            inner,
            terminator: terminator.to_vec(),
            buffer: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
            max_len: MAX_MESSAGE_LEN,
        }
    }

    /// Override [`MAX_MESSAGE_LEN`].
    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    fn split_message(&mut self) -> AppResult<Option<Bytes>> {
        let needle = self.terminator.len();
        if needle == 0 {
            return Ok(None);
        }
        // A terminator may straddle the old end of the buffer.
        let start = self.scanned.saturating_sub(needle - 1);
        let found = self.buffer[start..]
            .windows(needle)
            .position(|window| window == self.terminator.as_slice());
        let Some(offset) = found else {
            self.scanned = self.buffer.len();
            return Ok(None);
        };
        let position = start + offset;
        let mut message = self.buffer.split_to(position + needle);
        self.scanned = 0;
        if position > self.max_len {
            return Err(too_long(self.max_len, position));
        }
        message.truncate(position);
        Ok(Some(message.freeze()))
    }

    fn check_overflow(&mut self) -> AppResult<()> {
        if self.buffer.len() < self.max_len + self.terminator.len() {
            return Ok(());
        }
        let dropped = self.buffer.len();
        self.buffer.clear();
        self.scanned = 0;
        Err(too_long(self.max_len, dropped))
    }
}

fn too_long(max_len: usize, len: usize) -> ScopeError {
    ScopeError::Frame(format!(
        "message of {len} bytes exceeds the {max_len} byte limit"
    ))
}

impl<R: Read + Send> MessageSource for DelimitedReader<R> {
    fn receive(&mut self) -> AppResult<Option<Bytes>> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(message) = self.split_message()? {
                return Ok(Some(message));
            }
            self.check_overflow()?;
            match self.inner.read(&mut chunk) {
                Ok(0) => {
                    return Err(ScopeError::TransportClosed(
                        "end of stream".to_string(),
                    ))
                }
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    return Ok(None)
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Appends a terminator to every outgoing message.
pub struct DelimitedWriter<W> {
    inner: W,
    terminator: Vec<u8>,
}

impl<W: Write> DelimitedWriter<W> {
    /// Append `terminator` to everything written to `inner`.
    pub fn new(inner: W, terminator: &[u8]) -> Self {
        Self {
            inner,
            terminator: terminator.to_vec(),
        }
    }
}

impl<W: Write + Send> MessageSink for DelimitedWriter<W> {
    fn send(&mut self, message: &[u8]) -> AppResult<()> {
        let mut frame = Vec::with_capacity(message.len() + self.terminator.len());
        frame.extend_from_slice(message);
        frame.extend_from_slice(&self.terminator);
        self.inner.write_all(&frame)?;
        self.inner.flush()?;
        Ok(())
    }
}

/// An opened byte channel to one physical port.
pub struct Transport {
    description: String,
    source: Box<dyn MessageSource>,
    sink: Box<dyn MessageSink>,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

impl Transport {
    /// Assemble a transport from already split halves.
    pub fn new(
        description: impl Into<String>,
        source: Box<dyn MessageSource>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        Self {
            description: description.into(),
            source,
            sink,
        }
    }

    /// Build a delimited transport over a reader/writer pair.
    pub fn from_stream<R, W>(
        description: impl Into<String>,
        reader: R,
        writer: W,
        terminator: &[u8],
    ) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self::new(
            description,
            Box::new(DelimitedReader::new(reader, terminator)),
            Box::new(DelimitedWriter::new(writer, terminator)),
        )
    }

    /// Connect to a TCP endpoint, e.g. a serial-to-ethernet bridge.
    pub fn tcp<A: ToSocketAddrs + std::fmt::Display>(
        addr: A,
        terminator: &[u8],
        read_timeout: Duration,
    ) -> AppResult<Self> {
        let description = format!("tcp://{addr}");
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(read_timeout))?;
        let reader = stream.try_clone()?;
        debug!("opened {}", description);
        Ok(Self::from_stream(description, reader, stream, terminator))
    }

    /// Open a serial port.
    #[cfg(feature = "instrument_serial")]
    pub fn serial(
        path: &str,
        baud_rate: u32,
        terminator: &[u8],
        read_timeout: Duration,
    ) -> AppResult<Self> {
        let port = serialport::new(path, baud_rate)
            .timeout(read_timeout)
            .open()?;
        let reader = port.try_clone()?;
        debug!("opened serial port {} at {} baud", path, baud_rate);
        Ok(Self::from_stream(
            format!("serial://{path}"),
            reader,
            port,
            terminator,
        ))
    }

    /// e.g. `tcp://127.0.0.1:4001`.
    pub fn description(&self) -> &str {
        &self.description
    }

    pub(crate) fn into_parts(self) -> (String, Box<dyn MessageSource>, Box<dyn MessageSink>) {
        (self.description, self.source, self.sink)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_splits_on_terminator() {
        let mut reader = DelimitedReader::new(Cursor::new(b"first\rsecond\r".to_vec()), b"\r");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"first");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"second");
        assert!(matches!(
            reader.receive(),
            Err(ScopeError::TransportClosed(_))
        ));
    }

    #[test]
    fn test_multi_byte_terminator() {
        let mut reader =
            DelimitedReader::new(Cursor::new(b"a\r\nb\rc\r\n".to_vec()), b"\r\n");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"a");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"b\rc");
    }

    /// Yields a timeout between every chunk.
    struct Trickle {
        chunks: Vec<&'static [u8]>,
        timed_out: bool,
    }

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.timed_out {
                self.timed_out = true;
                return Err(std::io::Error::new(ErrorKind::TimedOut, "timeout"));
            }
            self.timed_out = false;
            if self.chunks.is_empty() {
                return Ok(0);
            }
            let chunk = self.chunks.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_partial_message_survives_timeout() {
        let mut reader = DelimitedReader::new(
            Trickle {
                chunks: vec![b"par", b"tial\r"],
                timed_out: false,
            },
            b"\r",
        );
        assert!(reader.receive().unwrap().is_none());
        assert!(reader.receive().unwrap().is_none());
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"partial");
    }

    #[test]
    fn test_terminator_split_across_reads() {
        let mut reader = DelimitedReader::new(
            Trickle {
                chunks: vec![b"ab\r", b"\ncd\r\n"],
                timed_out: true,
            },
            b"\r\n",
        );
        assert!(reader.receive().unwrap().is_none());
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"ab");
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"cd");
    }

    #[test]
    fn test_runaway_message_is_an_error() {
        let mut wire = vec![b'x'; 100];
        wire.extend_from_slice(b"\rok\r");
        let mut reader = DelimitedReader::new(Cursor::new(wire), b"\r").with_max_len(16);
        assert!(matches!(reader.receive(), Err(ScopeError::Frame(_))));
        // The oversized message is dropped whole; the stream stays in sync.
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"ok");
    }

    #[test]
    fn test_unterminated_growth_is_bounded() {
        let mut reader =
            DelimitedReader::new(Cursor::new(vec![b'x'; 2048]), b"\r").with_max_len(256);
        assert!(matches!(reader.receive(), Err(ScopeError::Frame(_))));
    }

    #[test]
    fn test_message_at_limit_is_accepted() {
        let mut reader =
            DelimitedReader::new(Cursor::new(b"0123456789abcdef\r".to_vec()), b"\r")
                .with_max_len(16);
        assert_eq!(&reader.receive().unwrap().unwrap()[..], b"0123456789abcdef");
    }

    #[test]
    fn test_writer_appends_terminator() {
        let mut writer = DelimitedWriter::new(Vec::new(), b"\r");
        writer.send(b"71023").unwrap();
        writer.send(b"71024").unwrap();
        assert_eq!(writer.inner, b"71023\r71024\r");
    }
}
