//! Observable relay events for whatever surrounds the core (CLI, status UI).

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};

use crate::connection::ConnectionId;

/// Callbacks fired by the server. Called from connection threads, so
/// implementations must be cheap and must not block.
pub trait RelayObserver: Send + Sync {
    fn on_member_joined(&self, _nickname: &str) {}
    fn on_member_left(&self, _nickname: &str) {}
    fn on_message_routed(&self, _sender: &str, _target: &str, _delivered: bool) {}
    fn on_protocol_error(&self, _connection: ConnectionId, _reason: &str) {}
}

/// Writes every event to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RelayObserver for LogObserver {
    fn on_member_joined(&self, nickname: &str) {
        info!(target: "relay::events", "member joined: {}", nickname);
    }

    fn on_member_left(&self, nickname: &str) {
        info!(target: "relay::events", "member left: {}", nickname);
    }

    fn on_message_routed(&self, sender: &str, target: &str, delivered: bool) {
        if delivered {
            info!(target: "relay::events", "message routed: {} -> {}", sender, target);
        } else {
            debug!(target: "relay::events", "message dropped: {} -> {}", sender, target);
        }
    }

    fn on_protocol_error(&self, connection: ConnectionId, reason: &str) {
        warn!(target: "relay::events", "protocol error on {}: {}", connection, reason);
    }
}

/// An event as a value, for observers that forward instead of react.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    MemberJoined(String),
    MemberLeft(String),
    MessageRouted {
        sender: String,
        target: String,
        delivered: bool,
    },
    ProtocolError {
        connection: ConnectionId,
        reason: String,
    },
}

/// Forwards events into a channel.
pub struct ChannelObserver {
    tx: Sender<RelayEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, Receiver<RelayEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self { tx }, rx)
    }

    fn emit(&self, event: RelayEvent) {
        // Nobody listening is fine
        let _ = self.tx.send(event);
    }
}

impl RelayObserver for ChannelObserver {
    fn on_member_joined(&self, nickname: &str) {
        self.emit(RelayEvent::MemberJoined(nickname.to_string()));
    }

    fn on_member_left(&self, nickname: &str) {
        self.emit(RelayEvent::MemberLeft(nickname.to_string()));
    }

    fn on_message_routed(&self, sender: &str, target: &str, delivered: bool) {
        self.emit(RelayEvent::MessageRouted {
            sender: sender.to_string(),
            target: target.to_string(),
            delivered,
        });
    }

    fn on_protocol_error(&self, connection: ConnectionId, reason: &str) {
        self.emit(RelayEvent::ProtocolError {
            connection,
            reason: reason.to_string(),
        });
    }
}
