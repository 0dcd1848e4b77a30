//! Wire protocol types for the relay.
//!
//! Every frame carries exactly one [`Message`], encoded as a JSON object
//! tagged by its `type` field.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use crate::framing::FrameError;

/// Reserved chat target meaning "every member except the sender".
///
/// Never accepted as a nickname, so it cannot collide with a real member.
pub const BROADCAST_TARGET: &str = "__broadcast__";

/// A single application message, in either direction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    /// Client asks to bind a nickname to its connection.
    Login { nickname: String },
    /// Text or file payload, one-to-one or broadcast.
    Chat(ChatMessage),
    /// Server-only: the current member list, sorted by nickname.
    #[serde(rename = "userlist")]
    Roster { users: Vec<String> },
    /// Server-only: a recoverable rejection (e.g. nickname taken) or the
    /// reason a connection is about to be closed.
    Error { message: String },
}

impl Message {
    /// Short name of the variant, as it appears in the `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Login { .. } => "login",
            Message::Chat(_) => "chat",
            Message::Roster { .. } => "userlist",
            Message::Error { .. } => "error",
        }
    }
}

/// Payload of a chat message: exactly one of text or file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatBody {
    Text(String),
    File { name: String, bytes: Vec<u8> },
}

/// A chat message as routed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireChat", into = "WireChat")]
pub struct ChatMessage {
    pub sender: String,
    pub target: String,
    pub body: ChatBody,
}

impl ChatMessage {
    pub fn text(sender: impl Into<String>, target: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            body: ChatBody::Text(content.into()),
        }
    }

    pub fn file(
        sender: impl Into<String>,
        target: impl Into<String>,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            sender: sender.into(),
            target: target.into(),
            body: ChatBody::File {
                name: name.into(),
                bytes,
            },
        }
    }

    /// Whether this message goes to every member but the sender.
    pub fn is_broadcast(&self) -> bool {
        self.target == BROADCAST_TARGET
    }
}

/// The JSON shape of a chat message; file bytes travel as base64.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireChat {
    sender: String,
    target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file_content: Option<String>,
}

/// A chat object that does not carry exactly one body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidChat {
    MissingBody,
    AmbiguousBody,
    IncompleteFile,
    InvalidBase64,
}

impl fmt::Display for InvalidChat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingBody => write!(f, "chat carries neither content nor a file"),
            Self::AmbiguousBody => write!(f, "chat carries both content and a file"),
            Self::IncompleteFile => write!(f, "fileName and fileContent must be sent together"),
            Self::InvalidBase64 => write!(f, "fileContent is not valid base64"),
        }
    }
}

impl std::error::Error for InvalidChat {}

impl TryFrom<WireChat> for ChatMessage {
    type Error = InvalidChat;

    fn try_from(wire: WireChat) -> Result<Self, InvalidChat> {
        let body = match (wire.content, wire.file_name, wire.file_content) {
            (Some(content), None, None) => ChatBody::Text(content),
            (None, Some(name), Some(encoded)) => {
                let bytes = STANDARD
                    .decode(encoded.as_bytes())
                    .map_err(|_| InvalidChat::InvalidBase64)?;
                ChatBody::File { name, bytes }
            }
            (None, None, None) => return Err(InvalidChat::MissingBody),
            (Some(_), _, _) => return Err(InvalidChat::AmbiguousBody),
            (None, _, _) => return Err(InvalidChat::IncompleteFile),
        };
        Ok(Self {
            sender: wire.sender,
            target: wire.target,
            body,
        })
    }
}

impl From<ChatMessage> for WireChat {
    fn from(chat: ChatMessage) -> Self {
        let (content, file_name, file_content) = match chat.body {
            ChatBody::Text(text) => (Some(text), None, None),
            ChatBody::File { name, bytes } => (None, Some(name), Some(STANDARD.encode(bytes))),
        };
        Self {
            sender: chat.sender,
            target: chat.target,
            content,
            file_name,
            file_content,
        }
    }
}

/// Behavior that costs a connection its session.
#[derive(Debug)]
pub enum ProtocolViolation {
    /// Anything other than a login before the connection authenticated.
    NotLoggedIn { kind: &'static str },
    /// A second login on an authenticated connection.
    Relogin,
    /// A chat whose `sender` is not the nickname bound to the connection.
    SenderMismatch { claimed: String, bound: Option<String> },
    /// A message only the server may send.
    ServerOnly { kind: &'static str },
    /// The byte stream could not be decoded into messages.
    Malformed(FrameError),
}

impl fmt::Display for ProtocolViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotLoggedIn { kind } => write!(f, "'{}' received before login", kind),
            Self::Relogin => write!(f, "connection is already logged in"),
            Self::SenderMismatch { claimed, bound } => match bound {
                Some(bound) => write!(f, "sender '{}' does not match nickname '{}'", claimed, bound),
                None => write!(f, "sender '{}' on a connection without a nickname", claimed),
            },
            Self::ServerOnly { kind } => write!(f, "'{}' may only be sent by the server", kind),
            Self::Malformed(e) => write!(f, "malformed frame: {}", e),
        }
    }
}

impl std::error::Error for ProtocolViolation {}

impl From<FrameError> for ProtocolViolation {
    fn from(e: FrameError) -> Self {
        Self::Malformed(e)
    }
}
