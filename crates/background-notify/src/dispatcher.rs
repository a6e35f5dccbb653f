//! Collaborator trait for the platform notification surface.
//!
//! This crate decides *whether* and *what* to dispatch; rendering, sounds,
//! and permission prompts belong to the implementer behind this trait.

use serde::Serialize;

use crate::NotifyError;

/// Platform notification channel descriptor (Android notification channels
/// and their equivalents). Idempotent to ensure.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelDescriptor {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl ChannelDescriptor {
    /// The channel every chat-message notification is posted on.
    pub fn chat_messages() -> Self {
        Self {
            id: "chat-messages".into(),
            name: "Chat messages".into(),
            description: "Messages received while the app is in the background".into(),
        }
    }
}

/// Structured metadata attached to each dispatched notification.
#[derive(Debug, Clone, Serialize)]
pub struct NotificationMetadata {
    /// Platform channel id from [`NotificationDispatcher::ensure_channel`],
    /// when one was established.
    pub platform_channel: Option<String>,
    pub network: String,
    pub channel: String,
    /// Number of messages this notification represents (1 for an immediate
    /// dispatch, the burst size for an aggregate).
    pub message_count: usize,
}

/// External notification dispatch collaborator.
pub trait NotificationDispatcher: Send + Sync {
    /// Create or update the platform channel, returning its id.
    fn ensure_channel(&self, descriptor: &ChannelDescriptor) -> Result<String, NotifyError>;

    /// Display a notification, returning an id usable with [`cancel`](Self::cancel).
    fn display(
        &self,
        title: &str,
        body: &str,
        metadata: &NotificationMetadata,
    ) -> Result<String, NotifyError>;

    /// Remove a previously displayed notification.
    fn cancel(&self, notification_id: &str) -> Result<(), NotifyError>;

    /// Update the app badge count.
    fn set_badge(&self, count: usize) -> Result<(), NotifyError>;
}
