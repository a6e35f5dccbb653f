//! Notification decision rules for the chat client.
//!
//! Pure logic only: preference-layer resolution, mention detection,
//! and the per-message notify/ignore decision. No I/O, no async.

pub mod decision;
pub mod mention;
pub mod message;
pub mod prefs;

pub use decision::should_notify;
pub use mention::MentionDetector;
pub use message::{IncomingMessage, MessageKind, MessageTarget};
pub use prefs::{NotificationPolicy, PreferenceLayer, resolve};
