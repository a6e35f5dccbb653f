//! Collaborator traits for the chat connection layer.

use std::fmt;
use std::sync::Arc;

use notify_rules::IncomingMessage;

use crate::NotifyError;

/// Callback invoked for every message a connection receives.
///
/// Handlers run on the connection's event path and must not block; the
/// coordinator's handler forwards into a bounded channel and returns.
pub type MessageHandler = Arc<dyn Fn(IncomingMessage) + Send + Sync>;

/// Explicit handle for tearing down one message subscription.
///
/// Returned by [`ChatConnection::subscribe`] and held by the listener
/// coordinator; the subscription stays live until [`cancel`](Self::cancel)
/// is called. Dropping the token without cancelling leaks the subscription
/// on purpose, so teardown is always an explicit, observable step.
pub struct SubscriptionToken {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl SubscriptionToken {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Tear down the subscription. No further handler invocations happen
    /// once this returns.
    pub fn cancel(mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

impl fmt::Debug for SubscriptionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionToken")
            .field("live", &self.unsubscribe.is_some())
            .finish()
    }
}

/// One live chat connection, owned by the protocol engine.
pub trait ChatConnection: Send + Sync {
    /// Stable identifier for this connection.
    fn id(&self) -> String;

    /// Display name of the network this connection is attached to.
    fn network_name(&self) -> String;

    /// The nick the user currently holds on this connection.
    fn current_nick(&self) -> String;

    fn is_connected(&self) -> bool;

    /// Register a message handler; the returned token is the only way to
    /// remove it again.
    fn subscribe(&self, handler: MessageHandler) -> SubscriptionToken;
}

/// Enumerates the currently active connections.
pub trait ConnectionRegistry: Send + Sync {
    /// The current connection set. Errors are expected (the engine may be
    /// mid-restart); callers degrade to [`default_connection`](Self::default_connection).
    fn connections(&self) -> Result<Vec<Arc<dyn ChatConnection>>, NotifyError>;

    /// Singleton fallback used when enumeration fails or reports zero
    /// connections, supporting single-network mode.
    fn default_connection(&self) -> Option<Arc<dyn ChatConnection>>;
}
