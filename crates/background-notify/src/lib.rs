//! Background connection & notification coordination.
//!
//! Everything that runs while the app is not foregrounded: keeping exactly
//! one live message subscription per active chat connection, deciding which
//! incoming messages become notifications, and rate-limiting delivery so a
//! busy channel does not flood the user.
//!
//! The chat protocol engine, the platform notification surface, and the
//! settings store are collaborators behind traits ([`ConnectionRegistry`],
//! [`NotificationDispatcher`], [`PreferenceStore`]); this crate owns only
//! the coordination logic.

pub mod coordinator;
pub mod dispatcher;
pub mod lifecycle;
pub mod listener;
pub mod registry;
pub mod store;
pub mod throttle;

pub use coordinator::{BackgroundCoordinator, ChannelPreferenceView};
pub use dispatcher::{ChannelDescriptor, NotificationDispatcher, NotificationMetadata};
pub use lifecycle::{AppLifecycleMonitor, LifecycleState, classify};
pub use listener::{ConnectionListenerCoordinator, RECONCILE_INTERVAL, RoutedMessage};
pub use registry::{ChatConnection, ConnectionRegistry, MessageHandler, SubscriptionToken};
pub use store::{MemoryPreferenceStore, PreferenceManager, PreferenceStore, StoredPreferences};
pub use throttle::{NotificationThrottler, THROTTLE_WINDOW, ThrottleKey};

/// Unified error type for the background-notify crate.
///
/// Nothing here is fatal: callers catch, log, and degrade (skip the cycle,
/// fall back to defaults, drop the notification). Delivery is best-effort.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("preference store error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("notification dispatch failed: {0}")]
    Dispatch(String),

    #[error("connection registry unavailable: {0}")]
    Registry(String),
}
