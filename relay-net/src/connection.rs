//! Per-connection handle: identity, nickname, state and outbound path.
//!
//! Outbound frames go through a bounded queue drained by a dedicated writer
//! thread, so a sender never blocks on a slow peer's socket for longer than
//! the configured send timeout.

use std::fmt;
use std::io::{BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use log::{debug, warn};

use crate::framing::{self, Frame, FrameError};
use crate::limits::Limits;
use crate::protocol::Message;

/// Unique identifier of an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Protocol state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, no nickname yet.
    Connected,
    /// Nickname bound and present in the registry.
    Authenticated,
    /// Terminal.
    Closed,
}

/// Why a frame could not be queued for a peer.
#[derive(Debug)]
pub enum SendError {
    /// The connection is closed or its writer has exited.
    Closed,
    /// The outbound queue stayed full for the whole send timeout.
    Timeout,
    /// Queuing the frame would exceed the connection's byte budget.
    Overloaded { queued: usize, frame: usize },
    Encode(FrameError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "connection closed"),
            Self::Timeout => write!(f, "outbound queue full"),
            Self::Overloaded { queued, frame } => {
                write!(f, "{} bytes already queued, refusing {} more", queued, frame)
            }
            Self::Encode(e) => write!(f, "encode failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

impl From<FrameError> for SendError {
    fn from(e: FrameError) -> Self {
        Self::Encode(e)
    }
}

/// Why a nickname could not be bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// A connection logs in at most once.
    AlreadyBound,
    Closed,
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyBound => write!(f, "nickname already bound"),
            Self::Closed => write!(f, "connection closed"),
        }
    }
}

impl std::error::Error for BindError {}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A live client connection.
pub struct Connection {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    nickname: OnceLock<String>,
    state: Mutex<ConnectionState>,
    /// Taken on close; the writer drains what is queued, then exits.
    outbound: Mutex<Option<Sender<Frame>>>,
    /// Kept only to shut the socket down; reads happen on a clone.
    transport: Option<TcpStream>,
    send_timeout: Duration,
    /// Bytes sitting in the outbound queue; the writer subtracts what it takes.
    queued_bytes: Arc<AtomicUsize>,
    max_queued_bytes: usize,
    retired: AtomicBool,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("nickname", &self.nickname.get())
            .field("state", &self.state())
            .finish()
    }
}

impl Connection {
    /// Wrap an accepted stream and start its writer thread.
    pub fn open(id: ConnectionId, stream: TcpStream, limits: &Limits) -> std::io::Result<Arc<Self>> {
        let peer = stream.peer_addr().ok();
        stream.set_write_timeout(Some(limits.write_timeout))?;
        let write_stream = stream.try_clone()?;

        let (tx, rx) = crossbeam_channel::bounded(limits.outbound_queue);
        let queued_bytes = Arc::new(AtomicUsize::new(0));
        let writer_queued = Arc::clone(&queued_bytes);
        thread::Builder::new()
            .name(format!("relay-writer-{}", id.0))
            .spawn(move || writer_loop(id, write_stream, rx, writer_queued))?;

        Ok(Arc::new(Self::with_parts(id, peer, tx, Some(stream), limits, queued_bytes)))
    }

    /// A connection with no socket behind it; queued frames land in the
    /// returned receiver and stay counted against the byte budget.
    #[cfg(test)]
    pub(crate) fn detached(id: ConnectionId, limits: &Limits) -> (Arc<Self>, Receiver<Frame>) {
        let (tx, rx) = crossbeam_channel::bounded(limits.outbound_queue);
        let conn = Self::with_parts(id, None, tx, None, limits, Arc::new(AtomicUsize::new(0)));
        (Arc::new(conn), rx)
    }

    fn with_parts(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        tx: Sender<Frame>,
        transport: Option<TcpStream>,
        limits: &Limits,
        queued_bytes: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            id,
            peer,
            nickname: OnceLock::new(),
            state: Mutex::new(ConnectionState::Connected),
            outbound: Mutex::new(Some(tx)),
            transport,
            send_timeout: limits.send_timeout,
            queued_bytes,
            max_queued_bytes: limits.max_queued_bytes,
            retired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.get().map(String::as_str)
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Bind the nickname and move to `Authenticated`.
    pub fn bind_nickname(&self, nickname: String) -> Result<(), BindError> {
        let mut state = lock(&self.state);
        match *state {
            ConnectionState::Closed => Err(BindError::Closed),
            ConnectionState::Authenticated => Err(BindError::AlreadyBound),
            ConnectionState::Connected => {
                self.nickname
                    .set(nickname)
                    .map_err(|_| BindError::AlreadyBound)?;
                *state = ConnectionState::Authenticated;
                Ok(())
            }
        }
    }

    /// Encode and queue a message.
    pub fn send(&self, msg: &Message) -> Result<(), SendError> {
        self.send_frame(framing::encode(msg)?)
    }

    /// Queue an already-encoded frame, waiting at most the send timeout.
    ///
    /// Fails with `Overloaded` when the frame would push the queued bytes
    /// past the budget, unless the queue is empty.
    pub fn send_frame(&self, frame: Frame) -> Result<(), SendError> {
        let tx = match lock(&self.outbound).as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(SendError::Closed),
        };

        let len = frame.len();
        let queued = self.queued_bytes.fetch_add(len, Ordering::AcqRel);
        if queued > 0 && queued + len > self.max_queued_bytes {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            return Err(SendError::Overloaded { queued, frame: len });
        }

        tx.send_timeout(frame, self.send_timeout).map_err(|e| {
            self.queued_bytes.fetch_sub(len, Ordering::AcqRel);
            match e {
                SendTimeoutError::Timeout(_) => SendError::Timeout,
                SendTimeoutError::Disconnected(_) => SendError::Closed,
            }
        })
    }

    /// Bytes queued for this connection and not yet taken by its writer.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Acquire)
    }

    /// Mark closed, let the writer flush what is queued and stop reading.
    ///
    /// Returns `false` if the connection was already closed.
    pub fn close(&self) -> bool {
        {
            let mut state = lock(&self.state);
            if *state == ConnectionState::Closed {
                return false;
            }
            *state = ConnectionState::Closed;
        }

        lock(&self.outbound).take();
        if let Some(stream) = &self.transport {
            let _ = stream.shutdown(Shutdown::Read);
        }
        debug!("Connection {} closed", self.id);
        true
    }

    /// Claim the one-time teardown of this connection.
    pub(crate) fn retire(&self) -> bool {
        !self.retired.swap(true, Ordering::AcqRel)
    }
}

/// Drains the outbound queue onto the socket until the queue is dropped or
/// a write fails.
fn writer_loop(id: ConnectionId, stream: TcpStream, rx: Receiver<Frame>, queued_bytes: Arc<AtomicUsize>) {
    let mut writer = BufWriter::new(&stream);

    while let Ok(frame) = rx.recv() {
        let mut result = writer.write_all(&frame);
        queued_bytes.fetch_sub(frame.len(), Ordering::AcqRel);
        if result.is_ok() && rx.is_empty() {
            result = writer.flush();
        }
        if let Err(e) = result {
            warn!("Connection {} write error: {}", id, e);
            break;
        }
    }

    let _ = writer.flush();
    drop(writer);
    // Also wakes the reader if the loop ended on a write error
    let _ = stream.shutdown(Shutdown::Both);
    debug!("Connection {} writer thread exiting", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;

    fn detached(queue: usize) -> (Arc<Connection>, Receiver<Frame>) {
        let limits = Limits {
            outbound_queue: queue,
            send_timeout: Duration::from_millis(20),
            ..Limits::default()
        };
        Connection::detached(ConnectionId(1), &limits)
    }

    fn frame_of(len: usize) -> Frame {
        vec![0u8; len].into()
    }

    #[test]
    fn starts_connected_without_nickname() {
        let (conn, _rx) = detached(4);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.nickname(), None);
    }

    #[test]
    fn binds_nickname_once() {
        let (conn, _rx) = detached(4);
        conn.bind_nickname("alice".into()).unwrap();
        assert_eq!(conn.nickname(), Some("alice"));
        assert_eq!(conn.state(), ConnectionState::Authenticated);
        assert_eq!(conn.bind_nickname("bob".into()), Err(BindError::AlreadyBound));
        assert_eq!(conn.nickname(), Some("alice"));
    }

    #[test]
    fn cannot_bind_after_close() {
        let (conn, _rx) = detached(4);
        conn.close();
        assert_eq!(conn.bind_nickname("alice".into()), Err(BindError::Closed));
    }

    #[test]
    fn send_queues_encoded_frame() {
        let (conn, rx) = detached(4);
        let msg = Message::Chat(ChatMessage::text("alice", "bob", "hi"));
        conn.send(&msg).unwrap();
        let frame = rx.try_recv().unwrap();
        assert_eq!(frame, framing::encode(&msg).unwrap());
    }

    #[test]
    fn close_is_idempotent() {
        let (conn, _rx) = detached(4);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
    }

    #[test]
    fn send_after_close_fails() {
        let (conn, _rx) = detached(4);
        conn.close();
        let err = conn
            .send(&Message::Roster { users: vec![] })
            .unwrap_err();
        assert!(matches!(err, SendError::Closed));
    }

    #[test]
    fn full_queue_times_out() {
        let (conn, _rx) = detached(1);
        let msg = Message::Roster { users: vec![] };
        conn.send(&msg).unwrap();
        assert!(matches!(conn.send(&msg), Err(SendError::Timeout)));
    }

    #[test]
    fn queued_bytes_are_capped() {
        let limits = Limits {
            outbound_queue: 256,
            max_queued_bytes: 1000,
            ..Limits::default()
        };
        let (conn, rx) = Connection::detached(ConnectionId(1), &limits);

        conn.send_frame(frame_of(600)).unwrap();
        assert_eq!(conn.queued_bytes(), 600);
        assert!(matches!(
            conn.send_frame(frame_of(600)),
            Err(SendError::Overloaded {
                queued: 600,
                frame: 600
            })
        ));
        // A refused frame is not counted
        assert_eq!(conn.queued_bytes(), 600);
        conn.send_frame(frame_of(400)).unwrap();
        assert_eq!(conn.queued_bytes(), 1000);
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn oversized_frame_passes_when_queue_is_empty() {
        let limits = Limits {
            max_queued_bytes: 100,
            ..Limits::default()
        };
        let (conn, _rx) = Connection::detached(ConnectionId(1), &limits);
        conn.send_frame(frame_of(5000)).unwrap();
        assert!(matches!(
            conn.send_frame(frame_of(1)),
            Err(SendError::Overloaded { .. })
        ));
    }

    #[test]
    fn timed_out_frame_is_not_counted() {
        let (conn, _rx) = detached(1);
        conn.send_frame(frame_of(10)).unwrap();
        assert!(matches!(conn.send_frame(frame_of(10)), Err(SendError::Timeout)));
        assert_eq!(conn.queued_bytes(), 10);
    }

    #[test]
    fn retire_claims_once() {
        let (conn, _rx) = detached(1);
        assert!(conn.retire());
        assert!(!conn.retire());
    }
}
