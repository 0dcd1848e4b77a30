#![allow(dead_code)]
//! Test harness utilities for relay-net integration tests.

use std::io::{self, BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use relay_net::framing::{read_message, write_message, DEFAULT_MAX_FRAME_LEN};
use relay_net::{ChannelObserver, Limits, Message, RelayEvent, RelayServer, RunningServer};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port with default limits.
pub fn start_server() -> (RunningServer, Receiver<RelayEvent>) {
    start_server_with(Limits::default())
}

pub fn start_server_with(limits: Limits) -> (RunningServer, Receiver<RelayEvent>) {
    let (observer, events) = ChannelObserver::new();
    let server = RelayServer::bind("127.0.0.1:0", limits, Arc::new(observer))
        .unwrap()
        .spawn()
        .unwrap();
    (server, events)
}

/// Wait for the first event matching `pred`, skipping others.
pub fn wait_for_event<F>(events: &Receiver<RelayEvent>, mut pred: F) -> RelayEvent
where
    F: FnMut(&RelayEvent) -> bool,
{
    let deadline = Instant::now() + TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match events.recv_timeout(remaining) {
            Ok(event) if pred(&event) => return event,
            Ok(_) => {}
            Err(_) => panic!("Timed out waiting for event"),
        }
    }
}

/// Poll `cond` until it holds, or panic.
pub fn wait_until<F: FnMut() -> bool>(mut cond: F, what: &str) {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if cond() {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out waiting for {}", what);
}

/// A raw TCP client for protocol-level tests.
pub struct RawClient {
    pub reader: BufReader<TcpStream>,
    pub writer: BufWriter<TcpStream>,
}

impl RawClient {
    pub fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_read_timeout(Some(TIMEOUT))?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
        })
    }

    /// Connect and log in.
    pub fn logged_in(addr: SocketAddr, nickname: &str) -> Self {
        let mut client = Self::connect(addr).unwrap();
        client.login(nickname);
        client
    }

    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        write_message(&mut self.writer, msg)
    }

    /// Write bytes as-is, bypassing the codec.
    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write_all(bytes)?;
        self.writer.flush()
    }

    pub fn recv(&mut self) -> io::Result<Message> {
        read_message(&mut self.reader, DEFAULT_MAX_FRAME_LEN)
    }

    /// Send a login and expect a roster that includes us.
    pub fn login(&mut self, nickname: &str) -> Vec<String> {
        self.send(&Message::Login {
            nickname: nickname.to_string(),
        })
        .unwrap();
        match self.recv().unwrap() {
            Message::Roster { users } => {
                assert!(users.iter().any(|u| u == nickname), "{} not in {:?}", nickname, users);
                users
            }
            other => panic!("Expected Roster after login, got {:?}", other),
        }
    }

    /// Read rosters until one equals `expected`.
    pub fn wait_for_roster(&mut self, expected: &[&str]) {
        loop {
            match self.recv().unwrap() {
                Message::Roster { users } if users == expected => return,
                Message::Roster { .. } => {}
                other => panic!("Expected Roster {:?}, got {:?}", expected, other),
            }
        }
    }

    /// Next message that is not a roster update.
    pub fn recv_skipping_rosters(&mut self) -> Message {
        loop {
            match self.recv().unwrap() {
                Message::Roster { .. } => {}
                other => return other,
            }
        }
    }

    /// Read until the server closes the connection; returns what arrived first.
    pub fn expect_closed(&mut self) -> Vec<Message> {
        let mut received = Vec::new();
        loop {
            match self.recv() {
                Ok(msg) => received.push(msg),
                Err(e) if matches!(
                    e.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                ) =>
                {
                    return received
                }
                Err(e) => panic!("Expected the server to close the connection, got {}", e),
            }
        }
    }

    /// Assert nothing arrives for `window`.
    pub fn expect_silence(&mut self, window: Duration) {
        self.reader.get_ref().set_read_timeout(Some(window)).unwrap();
        let result = self.recv();
        self.reader.get_ref().set_read_timeout(Some(TIMEOUT)).unwrap();
        match result {
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Ok(msg) => panic!("Expected silence, got {:?}", msg),
            Err(e) => panic!("Expected silence, got error {}", e),
        }
    }
}
