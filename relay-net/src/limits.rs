//! Tunables shared by the server and its connections.

use std::time::Duration;

use crate::framing::DEFAULT_MAX_FRAME_LEN;

/// Per-connection resource limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Largest frame payload accepted from a client.
    pub max_frame_len: usize,
    /// Longest nickname accepted, in characters.
    pub max_nickname_len: usize,
    /// Frames that may wait in a connection's outbound queue.
    pub outbound_queue: usize,
    /// Bytes that may wait in a connection's outbound queue. A single frame
    /// larger than this is still accepted when nothing else is queued.
    pub max_queued_bytes: usize,
    /// How long `send` waits for room in a full outbound queue.
    pub send_timeout: Duration,
    /// Socket write timeout for the connection's writer thread.
    pub write_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            max_nickname_len: 32,
            outbound_queue: 256,
            max_queued_bytes: 2 * DEFAULT_MAX_FRAME_LEN,
            send_timeout: Duration::from_millis(500),
            write_timeout: Duration::from_secs(10),
        }
    }
}
