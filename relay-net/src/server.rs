//! Relay server: accepts connections and drives each through its session.
//!
//! One listener thread accepts sockets; every accepted socket gets a reader
//! thread that decodes frames and runs the login/chat state machine, plus the
//! writer thread owned by its [`Connection`]. Whatever ends a session (peer
//! hangup, bad frame, protocol violation, server shutdown) goes through
//! [`Shared::disconnect`], which runs once per connection.

use std::collections::HashMap;
use std::io::{self, Read};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::connection::{lock, Connection, ConnectionId, ConnectionState};
use crate::events::RelayObserver;
use crate::framing::{self, FrameDecoder};
use crate::limits::Limits;
use crate::protocol::{Message, ProtocolViolation, BROADCAST_TARGET};
use crate::registry::{Registry, RegistryError};
use crate::router::{self, Router};

/// How long the listener sleeps when no connection is pending.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Read buffer size per connection.
const READ_CHUNK: usize = 8 * 1024;

/// Why a session ended.
#[derive(Debug)]
enum Disconnect {
    PeerClosed,
    Transport(io::Error),
    Violation(ProtocolViolation),
    Shutdown,
}

/// State shared by the listener and every connection thread.
struct Shared {
    registry: Arc<Registry>,
    router: Router,
    observer: Arc<dyn RelayObserver>,
    limits: Limits,
    /// Every open connection, authenticated or not.
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    /// Serializes roster broadcasts so members see them in order.
    roster_lock: Mutex<()>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

/// A bound, not yet running server.
pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Bind the server to an address.
    pub fn bind(addr: &str, limits: Limits, observer: Arc<dyn RelayObserver>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;

        let registry = Arc::new(Registry::new());
        let router = Router::new(Arc::clone(&registry), Arc::clone(&observer));

        info!("Relay listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                registry,
                router,
                observer,
                limits,
                connections: Mutex::new(HashMap::new()),
                roster_lock: Mutex::new(()),
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
            }),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Start accepting connections on a background thread.
    pub fn spawn(self) -> io::Result<RunningServer> {
        let addr = self.listener.local_addr()?;
        let shared = Arc::clone(&self.shared);
        let listener = self.listener;
        let listener_shared = Arc::clone(&shared);

        let handle = thread::Builder::new()
            .name("relay-listener".into())
            .spawn(move || accept_loop(listener, listener_shared))?;

        Ok(RunningServer {
            addr,
            shared,
            listener_thread: Some(handle),
        })
    }
}

/// Handle to a server accepting connections in the background.
///
/// Dropping it shuts the server down.
pub struct RunningServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    listener_thread: Option<JoinHandle<()>>,
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Nicknames currently online, sorted.
    pub fn members(&self) -> Vec<String> {
        self.shared.registry.snapshot_members()
    }

    /// Open connections, including those not logged in yet.
    pub fn connection_count(&self) -> usize {
        lock(&self.shared.connections).len()
    }

    pub fn is_running(&self) -> bool {
        self.listener_thread.is_some()
    }

    /// Stop accepting, close every connection and wait for the listener.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.listener_thread.take() else {
            return;
        };

        self.shared.shutting_down.store(true, Ordering::SeqCst);
        if handle.join().is_err() {
            error!("Listener thread panicked");
        }

        let live: Vec<Arc<Connection>> = lock(&self.shared.connections).values().cloned().collect();
        let count = live.len();
        for conn in live {
            self.shared.disconnect(&conn, Disconnect::Shutdown);
        }

        info!("Relay on {} shut down, closed {} connections", self.addr, count);
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutting_down.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, addr)) => {
                if let Err(e) = accept_connection(&shared, stream, addr) {
                    error!("Failed to set up connection from {}: {}", addr, e);
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => {
                // Usually fd exhaustion; back off instead of spinning
                error!("Accept error: {}", e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    info!("Listener thread exiting");
}

fn accept_connection(shared: &Arc<Shared>, stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let read_stream = stream.try_clone()?;

    let id = ConnectionId(shared.next_id.fetch_add(1, Ordering::Relaxed));
    let conn = Connection::open(id, stream, &shared.limits)?;
    lock(&shared.connections).insert(id, Arc::clone(&conn));

    let session_shared = Arc::clone(shared);
    let session_conn = Arc::clone(&conn);
    let spawned = thread::Builder::new()
        .name(format!("relay-conn-{}", id.0))
        .spawn(move || serve_connection(session_shared, session_conn, read_stream));
    if let Err(e) = spawned {
        shared.disconnect(&conn, Disconnect::Transport(io::Error::new(e.kind(), e.to_string())));
        return Err(e);
    }

    info!("Connection {} accepted from {}, awaiting login", id, addr);
    Ok(())
}

/// Reader side of one connection: decode, dispatch, tear down.
fn serve_connection(shared: Arc<Shared>, conn: Arc<Connection>, mut stream: TcpStream) {
    let mut decoder = FrameDecoder::with_max_frame_len(shared.limits.max_frame_len);
    let mut buf = vec![0u8; READ_CHUNK];

    let cause = 'session: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => {
                break match decoder.finish() {
                    Ok(()) => Disconnect::PeerClosed,
                    Err(e) if conn.is_closed() => {
                        debug!("Connection {} closed with partial frame: {}", conn.id(), e);
                        Disconnect::PeerClosed
                    }
                    Err(e) => Disconnect::Violation(e.into()),
                };
            }
            Ok(n) => n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break Disconnect::Transport(e),
        };

        for decoded in decoder.decode_stream(&buf[..n]) {
            if conn.is_closed() {
                break 'session Disconnect::PeerClosed;
            }
            let handled = decoded
                .map_err(ProtocolViolation::from)
                .and_then(|message| shared.handle_message(&conn, message));
            if let Err(violation) = handled {
                break 'session Disconnect::Violation(violation);
            }
        }
    };

    shared.disconnect(&conn, cause);
    debug!("Connection {} reader thread exiting", conn.id());
}

impl Shared {
    /// Apply one message to the connection's state machine.
    fn handle_message(&self, conn: &Arc<Connection>, message: Message) -> Result<(), ProtocolViolation> {
        match (conn.state(), message) {
            (ConnectionState::Connected, Message::Login { nickname }) => {
                self.login(conn, nickname);
                Ok(())
            }
            (ConnectionState::Connected, other) => Err(ProtocolViolation::NotLoggedIn { kind: other.kind() }),
            (ConnectionState::Authenticated, Message::Chat(chat)) => {
                self.router.route(conn, chat)?;
                Ok(())
            }
            (ConnectionState::Authenticated, Message::Login { .. }) => Err(ProtocolViolation::Relogin),
            (ConnectionState::Authenticated, other) => Err(ProtocolViolation::ServerOnly { kind: other.kind() }),
            // Already on its way out
            (ConnectionState::Closed, _) => Ok(()),
        }
    }

    /// Try to authenticate `conn`. A refused nickname leaves the connection
    /// logged out and free to retry.
    fn login(&self, conn: &Arc<Connection>, nickname: String) {
        if let Err(reason) = validate_nickname(&nickname, self.limits.max_nickname_len) {
            info!("Connection {} login refused: {}", conn.id(), reason);
            self.reject(conn, reason);
            return;
        }

        match self.registry.insert(&nickname, Arc::clone(conn)) {
            Ok(()) => {}
            Err(RegistryError::Conflict(taken)) => {
                info!("Connection {} login refused: '{}' already in use", conn.id(), taken);
                self.reject(conn, format!("nickname '{}' is already in use", taken));
                return;
            }
            Err(RegistryError::Bind(e)) => {
                debug!("Connection {} could not bind '{}': {}", conn.id(), nickname, e);
                return;
            }
        }

        // Closed from another thread while registering; teardown may already have run
        if conn.is_closed() {
            self.registry.remove_connection(conn);
            return;
        }

        info!("Connection {} from {} logged in as '{}'", conn.id(), peer_label(conn), nickname);
        self.observer.on_member_joined(&nickname);
        self.broadcast_roster();
    }

    fn reject(&self, conn: &Connection, reason: String) {
        if let Err(e) = conn.send(&Message::Error { message: reason }) {
            warn!("Failed to send login rejection to {}: {}", conn.id(), e);
        }
    }

    /// Send the current member list to every member.
    fn broadcast_roster(&self) {
        let _order = lock(&self.roster_lock);
        let members = self.registry.snapshot();
        let users = members.iter().map(|(nickname, _)| nickname.clone()).collect();

        let frame = match framing::encode(&Message::Roster { users }) {
            Ok(frame) => frame,
            Err(e) => {
                error!("Failed to encode roster: {}", e);
                return;
            }
        };
        for (_, conn) in &members {
            router::deliver(conn, &frame);
        }
    }

    /// Close `conn` and drop it from every table. Runs at most once per
    /// connection no matter how many paths ask for it.
    fn disconnect(&self, conn: &Connection, cause: Disconnect) {
        if !conn.retire() {
            return;
        }

        match &cause {
            Disconnect::PeerClosed => debug!("Connection {} closed by peer", conn.id()),
            Disconnect::Transport(e) => warn!("Connection {} transport error: {}", conn.id(), e),
            Disconnect::Violation(violation) => {
                let reason = violation.to_string();
                warn!("Connection {} protocol violation: {}", conn.id(), reason);
                self.observer.on_protocol_error(conn.id(), &reason);
                // Best effort: queued before close so the writer flushes it
                let _ = conn.send(&Message::Error { message: reason });
            }
            Disconnect::Shutdown => debug!("Connection {} closed for shutdown", conn.id()),
        }

        conn.close();
        lock(&self.connections).remove(&conn.id());

        if let Some(nickname) = self.registry.remove_connection(conn) {
            info!("'{}' left ({} from {})", nickname, conn.id(), peer_label(conn));
            self.observer.on_member_left(&nickname);
            if !self.shutting_down.load(Ordering::SeqCst) {
                self.broadcast_roster();
            }
        }
    }
}

fn peer_label(conn: &Connection) -> String {
    conn.peer()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "unknown peer".into())
}

/// Check a requested nickname, returning the refusal reason.
fn validate_nickname(nickname: &str, max_len: usize) -> Result<(), String> {
    if nickname.trim().is_empty() {
        return Err("nickname must not be empty".into());
    }
    if nickname == BROADCAST_TARGET {
        return Err(format!("nickname '{}' is reserved", nickname));
    }
    if nickname.chars().count() > max_len {
        return Err(format!("nickname is longer than {} characters", max_len));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_ordinary_nicknames() {
        assert!(validate_nickname("alice", 32).is_ok());
        assert!(validate_nickname("小明", 2).is_ok());
    }

    #[test]
    fn rejects_blank_nicknames() {
        assert!(validate_nickname("", 32).is_err());
        assert!(validate_nickname("   ", 32).is_err());
    }

    #[test]
    fn rejects_broadcast_sentinel() {
        assert!(validate_nickname(BROADCAST_TARGET, 32).is_err());
    }

    #[test]
    fn rejects_long_nicknames() {
        assert!(validate_nickname("abcd", 3).is_err());
        assert!(validate_nickname("abc", 3).is_ok());
    }
}
