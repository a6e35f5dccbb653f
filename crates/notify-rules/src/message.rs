//! Incoming chat message types and target classification.

use serde::{Deserialize, Serialize};

/// Prefixes that mark a channel target (as opposed to a private query).
const CHANNEL_PREFIXES: &[char] = &['#', '&', '+', '!'];

/// A chat message forwarded from a live connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    /// Sender nick.
    pub from: String,
    /// Message body.
    pub text: String,
    /// Target channel name, or the sender's nick for private messages.
    pub channel: String,
    /// Network the message arrived on.
    pub network: String,
    pub kind: MessageKind,
    /// Receipt time, unix millis. Filled in by the forwarding layer.
    pub received_at: i64,
}

/// Kind of chat event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Privmsg,
    Action,
    Notice,
    /// Server/system event (joins, modes, MOTD lines...). Never notifies.
    System,
    /// Unparsed protocol line. Never notifies.
    Raw,
}

/// Where a message was addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageTarget {
    Channel,
    Private,
}

impl IncomingMessage {
    /// Classify the target: channel if the name carries a channel prefix,
    /// private otherwise.
    pub fn target(&self) -> MessageTarget {
        if self.channel.starts_with(CHANNEL_PREFIXES) {
            MessageTarget::Channel
        } else {
            MessageTarget::Private
        }
    }
}

impl MessageKind {
    /// Whether this kind can ever produce a user-visible notification.
    pub fn is_notifiable(&self) -> bool {
        !matches!(self, MessageKind::System | MessageKind::Raw)
    }
}
