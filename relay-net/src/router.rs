//! Chat routing: decides who receives a message and queues it for them.

use std::sync::Arc;

use log::{debug, warn};

use crate::connection::{Connection, SendError};
use crate::events::RelayObserver;
use crate::framing::{self, Frame};
use crate::protocol::{ChatMessage, Message, ProtocolViolation};
use crate::registry::Registry;

/// Result of routing one chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Delivery {
    /// Connections the message was addressed to.
    pub recipients: usize,
    /// Of those, how many accepted the frame.
    pub delivered: usize,
}

pub struct Router {
    registry: Arc<Registry>,
    observer: Arc<dyn RelayObserver>,
}

impl Router {
    pub fn new(registry: Arc<Registry>, observer: Arc<dyn RelayObserver>) -> Self {
        Self { registry, observer }
    }

    /// Route a chat from `origin`.
    ///
    /// A sender that does not match the origin's nickname is a violation and
    /// nothing is delivered. An unknown target is dropped silently:
    /// delivery is best effort, to whoever is online right now.
    pub fn route(&self, origin: &Connection, chat: ChatMessage) -> Result<Delivery, ProtocolViolation> {
        if origin.nickname() != Some(chat.sender.as_str()) {
            return Err(ProtocolViolation::SenderMismatch {
                claimed: chat.sender,
                bound: origin.nickname().map(str::to_owned),
            });
        }

        let sender = chat.sender.clone();
        let target = chat.target.clone();

        let recipients: Vec<Arc<Connection>> = if chat.is_broadcast() {
            self.registry
                .snapshot()
                .into_iter()
                .map(|(_, conn)| conn)
                .filter(|conn| conn.id() != origin.id())
                .collect()
        } else {
            self.registry.lookup(&target).into_iter().collect()
        };

        let mut delivery = Delivery {
            recipients: recipients.len(),
            delivered: 0,
        };

        if recipients.is_empty() {
            debug!("No recipient for {} -> {}, dropped", sender, target);
        } else {
            match framing::encode(&Message::Chat(chat)) {
                Ok(frame) => {
                    delivery.delivered = recipients
                        .iter()
                        .filter(|conn| deliver(conn, &frame))
                        .count();
                }
                Err(e) => warn!("Failed to encode chat from {}: {}", sender, e),
            }
        }

        self.observer
            .on_message_routed(&sender, &target, delivery.delivered > 0);
        Ok(delivery)
    }
}

/// Queue `frame` for `conn`, logging failures.
///
/// A recipient whose queue stays full for the whole send timeout, or holds
/// more bytes than its budget, is treated as gone and closed; its own
/// connection thread then cleans it up.
pub(crate) fn deliver(conn: &Connection, frame: &Frame) -> bool {
    match conn.send_frame(Arc::clone(frame)) {
        Ok(()) => true,
        Err(e @ (SendError::Timeout | SendError::Overloaded { .. })) => {
            warn!("Connection {} is not draining its queue ({}), closing", conn.id(), e);
            conn.close();
            false
        }
        Err(e) => {
            warn!("Failed to send to {}: {}", conn.id(), e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionId;
    use crate::events::{ChannelObserver, RelayEvent};
    use crate::limits::Limits;
    use crate::protocol::BROADCAST_TARGET;
    use crossbeam_channel::Receiver;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<Registry>,
        router: Router,
        events: Receiver<RelayEvent>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(Registry::new());
        let (observer, events) = ChannelObserver::new();
        let router = Router::new(Arc::clone(&registry), Arc::new(observer));
        Fixture {
            registry,
            router,
            events,
        }
    }

    fn member(fx: &Fixture, id: u64, nickname: &str) -> (Arc<Connection>, Receiver<Frame>) {
        let limits = Limits {
            outbound_queue: 8,
            send_timeout: Duration::from_millis(20),
            ..Limits::default()
        };
        member_with(fx, id, nickname, &limits)
    }

    fn member_with(
        fx: &Fixture,
        id: u64,
        nickname: &str,
        limits: &Limits,
    ) -> (Arc<Connection>, Receiver<Frame>) {
        let (conn, rx) = Connection::detached(ConnectionId(id), limits);
        fx.registry.insert(nickname, Arc::clone(&conn)).unwrap();
        (conn, rx)
    }

    fn decode(frame: &Frame) -> Message {
        let mut decoder = framing::FrameDecoder::new();
        decoder.feed(frame);
        decoder.next_message().unwrap().unwrap()
    }

    #[test]
    fn unicast_reaches_only_target() {
        let fx = fixture();
        let (alice, alice_rx) = member(&fx, 1, "alice");
        let (_bob, bob_rx) = member(&fx, 2, "bob");
        let (_carol, carol_rx) = member(&fx, 3, "carol");

        let chat = ChatMessage::text("alice", "bob", "hi");
        let delivery = fx.router.route(&alice, chat.clone()).unwrap();
        assert_eq!(delivery, Delivery { recipients: 1, delivered: 1 });

        assert_eq!(decode(&bob_rx.try_recv().unwrap()), Message::Chat(chat));
        assert!(alice_rx.try_recv().is_err());
        assert!(carol_rx.try_recv().is_err());
        assert_eq!(
            fx.events.try_recv().unwrap(),
            RelayEvent::MessageRouted {
                sender: "alice".into(),
                target: "bob".into(),
                delivered: true
            }
        );
    }

    #[test]
    fn broadcast_skips_sender() {
        let fx = fixture();
        let (alice, alice_rx) = member(&fx, 1, "alice");
        let (_bob, bob_rx) = member(&fx, 2, "bob");
        let (_carol, carol_rx) = member(&fx, 3, "carol");

        let chat = ChatMessage::text("alice", BROADCAST_TARGET, "all");
        let delivery = fx.router.route(&alice, chat.clone()).unwrap();
        assert_eq!(delivery.delivered, 2);

        assert_eq!(decode(&bob_rx.try_recv().unwrap()), Message::Chat(chat.clone()));
        assert_eq!(decode(&carol_rx.try_recv().unwrap()), Message::Chat(chat));
        assert!(alice_rx.try_recv().is_err());
    }

    #[test]
    fn unknown_target_is_dropped() {
        let fx = fixture();
        let (alice, _alice_rx) = member(&fx, 1, "alice");

        let delivery = fx
            .router
            .route(&alice, ChatMessage::text("alice", "carol", "x"))
            .unwrap();
        assert_eq!(delivery, Delivery::default());
        assert_eq!(
            fx.events.try_recv().unwrap(),
            RelayEvent::MessageRouted {
                sender: "alice".into(),
                target: "carol".into(),
                delivered: false
            }
        );
    }

    #[test]
    fn spoofed_sender_is_rejected() {
        let fx = fixture();
        let (alice, _alice_rx) = member(&fx, 1, "alice");
        let (_bob, bob_rx) = member(&fx, 2, "bob");

        let err = fx
            .router
            .route(&alice, ChatMessage::text("bob", "bob", "fake"))
            .unwrap_err();
        assert!(matches!(err, ProtocolViolation::SenderMismatch { .. }));
        assert!(bob_rx.try_recv().is_err());
        assert!(fx.events.try_recv().is_err());
    }

    #[test]
    fn failed_recipient_does_not_stop_fanout() {
        let fx = fixture();
        let (alice, _alice_rx) = member(&fx, 1, "alice");
        let (bob, _bob_rx) = member(&fx, 2, "bob");
        let (_carol, carol_rx) = member(&fx, 3, "carol");
        bob.close();

        let delivery = fx
            .router
            .route(&alice, ChatMessage::text("alice", BROADCAST_TARGET, "still here?"))
            .unwrap();
        assert_eq!(delivery, Delivery { recipients: 2, delivered: 1 });
        assert!(carol_rx.try_recv().is_ok());
    }

    #[test]
    fn stalled_recipient_is_closed() {
        let fx = fixture();
        let (alice, _alice_rx) = member(&fx, 1, "alice");
        let limits = Limits {
            outbound_queue: 1,
            send_timeout: Duration::from_millis(10),
            ..Limits::default()
        };
        let (bob, _bob_rx) = member_with(&fx, 2, "bob", &limits);

        let first = fx.router.route(&alice, ChatMessage::text("alice", "bob", "1")).unwrap();
        assert_eq!(first.delivered, 1);
        let second = fx.router.route(&alice, ChatMessage::text("alice", "bob", "2")).unwrap();
        assert_eq!(second.delivered, 0);
        assert!(bob.is_closed());
    }

    #[test]
    fn recipient_over_byte_budget_is_closed() {
        let fx = fixture();
        let (alice, _alice_rx) = member(&fx, 1, "alice");
        let limits = Limits {
            max_queued_bytes: 32 * 1024,
            ..Limits::default()
        };
        let (bob, bob_rx) = member_with(&fx, 2, "bob", &limits);
        let (_carol, carol_rx) = member(&fx, 3, "carol");

        let big = vec![7u8; 20 * 1024];
        let file = ChatMessage::file("alice", BROADCAST_TARGET, "a.bin", big.clone());
        assert_eq!(fx.router.route(&alice, file).unwrap().delivered, 2);
        let file = ChatMessage::file("alice", BROADCAST_TARGET, "b.bin", big);
        let second = fx.router.route(&alice, file).unwrap();

        assert_eq!(second, Delivery { recipients: 2, delivered: 1 });
        assert!(bob.is_closed());
        assert_eq!(bob_rx.len(), 1);
        assert_eq!(carol_rx.len(), 2);
    }
}
