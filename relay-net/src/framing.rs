//! Length-prefixed framing for TCP messages.
//!
//! Wire format: `[u32 length (big-endian)][JSON payload]`
//!
//! A TCP read may return half a frame or several frames at once, so the
//! server side never assumes one read is one message: [`FrameDecoder`] keeps
//! the unconsumed bytes of each connection between reads.

use std::fmt;
use std::io::{self, Read, Write};
use std::sync::Arc;

use serde::{de::DeserializeOwned, Serialize};

use crate::protocol::Message;

/// Size of the length prefix in bytes.
pub const LEN_PREFIX: usize = 4;

/// Largest payload accepted unless configured otherwise (64 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// An encoded frame, shareable between every recipient of a broadcast.
pub type Frame = Arc<[u8]>;

/// Error produced while encoding or decoding frames.
#[derive(Debug)]
pub enum FrameError {
    Io(io::Error),
    Json(serde_json::Error),
    /// The length prefix announced more than the configured maximum.
    TooLarge { len: usize, max: usize },
    /// The stream ended in the middle of a frame.
    Truncated { buffered: usize },
}

impl From<io::Error> for FrameError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for FrameError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO error: {}", e),
            Self::Json(e) => write!(f, "invalid payload: {}", e),
            Self::TooLarge { len, max } => {
                write!(f, "frame too large: {} bytes (max {})", len, max)
            }
            Self::Truncated { buffered } => {
                write!(f, "stream ended inside a frame ({} bytes buffered)", buffered)
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for io::Error {
    fn from(e: FrameError) -> Self {
        match e {
            FrameError::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Serialize a message into a complete frame, prefix included.
pub fn encode(msg: &Message) -> Result<Frame, FrameError> {
    Ok(encode_payload(msg)?.into())
}

fn encode_payload<T: Serialize>(msg: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(msg)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::TooLarge {
        len: payload.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Write a length-prefixed JSON message to a stream.
pub fn write_message<W: Write, T: Serialize>(writer: &mut W, msg: &T) -> io::Result<()> {
    let frame = encode_payload(msg)?;
    writer.write_all(&frame)?;
    writer.flush()?;

    Ok(())
}

/// Read a length-prefixed JSON message from a blocking stream, refusing
/// payloads longer than `max_len`.
pub fn read_message<R: Read, T: DeserializeOwned>(reader: &mut R, max_len: usize) -> io::Result<T> {
    let mut len_buf = [0u8; LEN_PREFIX];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len }.into());
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;

    serde_json::from_slice(&payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Incremental decoder holding the partial frame of one connection.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_frame_len,
        }
    }

    /// Number of bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append bytes from the transport without decoding anything.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Append `bytes` and lazily yield every message now complete.
    ///
    /// The iterator is empty when no full frame is buffered yet. It stops
    /// after the first error; the decoder is unusable once that happens.
    pub fn decode_stream(&mut self, bytes: &[u8]) -> Frames<'_> {
        self.feed(bytes);
        Frames {
            decoder: self,
            failed: false,
        }
    }

    /// Take one complete message out of the buffer, if there is one.
    pub fn next_message(&mut self) -> Result<Option<Message>, FrameError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }

        let mut len_buf = [0u8; LEN_PREFIX];
        len_buf.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_buf) as usize;

        // Checked before the body arrives so a bogus prefix cannot make us buffer it
        if len > self.max_frame_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_frame_len,
            });
        }

        let end = LEN_PREFIX + len;
        if self.buf.len() < end {
            return Ok(None);
        }

        let message = serde_json::from_slice(&self.buf[LEN_PREFIX..end]);
        self.buf.drain(..end);
        Ok(Some(message?))
    }

    /// Call once the transport reached end of stream.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(FrameError::Truncated {
                buffered: self.buf.len(),
            })
        }
    }
}

/// Messages decoded from the bytes fed so far.
pub struct Frames<'a> {
    decoder: &'a mut FrameDecoder,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<Message, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.decoder.next_message() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
