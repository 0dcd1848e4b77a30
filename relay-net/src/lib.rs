//! Network core of the relay chat server.
//!
//! Clients log in with a nickname over TCP, then exchange text or files with
//! one member or with everyone. This crate holds the frame codec, the
//! connection registry, the router and the server that ties them together,
//! plus a small client.

pub mod client;
pub mod connection;
pub mod events;
pub mod framing;
pub mod limits;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;

pub use client::RelayClient;
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use events::{ChannelObserver, LogObserver, RelayEvent, RelayObserver};
pub use framing::{FrameDecoder, FrameError};
pub use limits::Limits;
pub use protocol::{ChatBody, ChatMessage, Message, ProtocolViolation, BROADCAST_TARGET};
pub use registry::{Registry, RegistryError};
pub use router::{Delivery, Router};
pub use server::{RelayServer, RunningServer};
