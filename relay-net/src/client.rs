//! Relay client: the programmatic counterpart of a chat window.
//!
//! Sends framed messages on the caller's thread; a background thread reads
//! frames from the server and queues them for [`RelayClient::recv_timeout`].

use std::io::{self, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use log::{error, info, warn};

use crate::framing::{read_message, write_message, DEFAULT_MAX_FRAME_LEN};
use crate::protocol::{ChatMessage, Message, BROADCAST_TARGET};

pub struct RelayClient {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    inbound: Receiver<Message>,
    nickname: Option<String>,
}

impl RelayClient {
    /// Connect to a relay server. No login is sent yet.
    pub fn connect(addr: &str) -> io::Result<Self> {
        Self::connect_with_max_frame_len(addr, DEFAULT_MAX_FRAME_LEN)
    }

    /// Connect, accepting frames up to `max_frame_len` bytes from the server.
    /// Should match the server's own limit when that one is raised.
    pub fn connect_with_max_frame_len(addr: &str, max_frame_len: usize) -> io::Result<Self> {
        info!("Connecting to relay at {}", addr);

        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        let writer = BufWriter::new(stream.try_clone()?);

        let (tx, inbound) = crossbeam_channel::unbounded();
        thread::Builder::new()
            .name("relay-client-reader".into())
            .spawn(move || server_reader_thread(read_stream, tx, max_frame_len))?;

        Ok(Self {
            stream,
            writer,
            inbound,
            nickname: None,
        })
    }

    /// Log in and wait until the server lists us in a roster.
    ///
    /// Returns that roster. A refused nickname comes back as
    /// `ConnectionRefused` and the client may try another one.
    pub fn login(&mut self, nickname: &str, timeout: Duration) -> io::Result<Vec<String>> {
        self.send(&Message::Login {
            nickname: nickname.to_string(),
        })?;

        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.inbound.recv_timeout(remaining) {
                Ok(Message::Roster { users }) if users.iter().any(|u| u == nickname) => {
                    self.nickname = Some(nickname.to_string());
                    return Ok(users);
                }
                Ok(Message::Error { message }) => {
                    return Err(io::Error::new(io::ErrorKind::ConnectionRefused, message));
                }
                Ok(other) => {
                    warn!("Ignoring {} while waiting for login", other.kind());
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no reply to login"));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        "server closed the connection",
                    ));
                }
            }
        }
    }

    pub fn nickname(&self) -> Option<&str> {
        self.nickname.as_deref()
    }

    /// Send a raw protocol message.
    pub fn send(&mut self, msg: &Message) -> io::Result<()> {
        write_message(&mut self.writer, msg)
    }

    /// Send text to one member.
    pub fn send_text(&mut self, target: &str, content: &str) -> io::Result<()> {
        let sender = self.require_nickname()?;
        self.send(&Message::Chat(ChatMessage::text(sender, target, content)))
    }

    /// Send text to every other member.
    pub fn broadcast_text(&mut self, content: &str) -> io::Result<()> {
        self.send_text(BROADCAST_TARGET, content)
    }

    /// Send a file to one member, or to everyone with [`BROADCAST_TARGET`].
    pub fn send_file(&mut self, target: &str, file_name: &str, bytes: Vec<u8>) -> io::Result<()> {
        let sender = self.require_nickname()?;
        self.send(&Message::Chat(ChatMessage::file(sender, target, file_name, bytes)))
    }

    /// Next message from the server, waiting up to `timeout`.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Message> {
        self.inbound.recv_timeout(timeout).ok()
    }

    pub fn try_recv(&self) -> Option<Message> {
        self.inbound.try_recv().ok()
    }

    /// Close both directions of the connection.
    pub fn disconnect(self) -> io::Result<()> {
        self.stream.shutdown(Shutdown::Both)
    }

    fn require_nickname(&self) -> io::Result<String> {
        self.nickname
            .clone()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "not logged in"))
    }
}

/// Background thread that reads messages from the server.
fn server_reader_thread(stream: TcpStream, tx: Sender<Message>, max_frame_len: usize) {
    let mut reader = BufReader::new(stream);

    loop {
        match read_message::<_, Message>(&mut reader, max_frame_len) {
            Ok(msg) => {
                if tx.send(msg).is_err() {
                    // Client dropped
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    error!("Relay read error: {}", e);
                }
                break;
            }
        }
    }

    info!("Relay reader thread exiting");
}
