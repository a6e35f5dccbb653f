//! Per-(network, channel) notification rate limiting and batching.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use notify_rules::IncomingMessage;
use tokio::time::Instant;

use crate::dispatcher::{NotificationDispatcher, NotificationMetadata};

/// Minimum time between two dispatched notifications for the same key.
pub const THROTTLE_WINDOW: Duration = Duration::from_millis(5000);

/// Rate-limit key: one throttle window per channel per network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ThrottleKey {
    pub network: String,
    pub channel: String,
}

impl ThrottleKey {
    pub fn for_message(message: &IncomingMessage) -> Self {
        Self {
            network: message.network.clone(),
            channel: message.channel.to_lowercase(),
        }
    }
}

impl fmt::Display for ThrottleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.network, self.channel)
    }
}

#[derive(Debug, Clone)]
struct QueuedNotification {
    body: String,
}

struct ThrottleEntry {
    last_notified_at: Instant,
    queued: Vec<QueuedNotification>,
    /// Messages represented by the current window, including the one that
    /// was dispatched immediately when the window opened.
    window_count: usize,
    /// Id of the most recent notification shown for this key, for
    /// dismissal on return to foreground.
    last_notification_id: Option<String>,
}

/// Rate limiter and batching queue in front of the dispatcher.
///
/// The first notify-worthy message per key dispatches immediately and opens
/// a throttle window; messages inside the window queue up and are drained
/// into one aggregate notification by [`flush_all`](Self::flush_all).
pub struct NotificationThrottler {
    dispatcher: Arc<dyn NotificationDispatcher>,
    window: Duration,
    entries: Mutex<HashMap<ThrottleKey, ThrottleEntry>>,
    /// Platform channel id from `ensure_channel`, attached to metadata.
    platform_channel: RwLock<Option<String>>,
    /// Notifications delivered since the last clear, mirrored to the badge.
    delivered: AtomicUsize,
}

impl NotificationThrottler {
    pub fn new(dispatcher: Arc<dyn NotificationDispatcher>, window: Duration) -> Self {
        Self {
            dispatcher,
            window,
            entries: Mutex::new(HashMap::new()),
            platform_channel: RwLock::new(None),
            delivered: AtomicUsize::new(0),
        }
    }

    pub fn set_platform_channel(&self, channel_id: String) {
        *self
            .platform_channel
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(channel_id);
    }

    /// Handle one notify-worthy message: dispatch immediately when the key
    /// has no open window, queue otherwise.
    ///
    /// The window is refreshed after an attempted dispatch whether or not
    /// the dispatcher call succeeded (see DESIGN.md); there is no retry.
    pub fn handle(&self, key: ThrottleKey, title: &str, body: &str) {
        let now = Instant::now();

        {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get_mut(&key) {
                if now.duration_since(entry.last_notified_at) < self.window {
                    entry.queued.push(QueuedNotification { body: body.to_string() });
                    entry.window_count += 1;
                    tracing::debug!(key = %key, queued = entry.queued.len(), "notification throttled");
                    return;
                }
            }
        }

        let notification_id = self.dispatch(&key, title, body, 1);

        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            ThrottleEntry {
                last_notified_at: now,
                queued: Vec::new(),
                window_count: 1,
                last_notification_id: notification_id,
            },
        );
    }

    /// Drain the queue for one key into a single aggregate notification.
    pub fn flush_key(&self, key: &ThrottleKey) {
        let batch = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.get_mut(key).and_then(|entry| take_batch(entry))
        };
        if let Some((count, last_body)) = batch {
            self.dispatch_aggregate(key, count, &last_body);
        }
    }

    /// Drain every nonempty queue. A dispatch failure on one key is logged
    /// and does not block the others.
    pub fn flush_all(&self) {
        let batches: Vec<(ThrottleKey, usize, String)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    take_batch(entry).map(|(count, body)| (key.clone(), count, body))
                })
                .collect()
        };

        for (key, count, last_body) in batches {
            self.dispatch_aggregate(&key, count, &last_body);
        }
    }

    /// Drop all pending state without dispatching and dismiss everything
    /// still showing. Used on the transition back to foreground, where the
    /// user is about to see the messages live in-app.
    pub fn clear_all(&self) {
        let drained: Vec<(ThrottleKey, ThrottleEntry)> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().collect()
        };

        for (key, entry) in &drained {
            if !entry.queued.is_empty() {
                tracing::debug!(key = %key, discarded = entry.queued.len(), "pending batch discarded");
            }
            if let Some(id) = &entry.last_notification_id {
                if let Err(e) = self.dispatcher.cancel(id) {
                    tracing::debug!(key = %key, "failed to dismiss notification: {e}");
                }
            }
        }

        self.delivered.store(0, Ordering::SeqCst);
        if let Err(e) = self.dispatcher.set_badge(0) {
            tracing::debug!("failed to reset badge: {e}");
        }
    }

    /// Queued message count for a key. Zero when no window is open.
    pub fn pending(&self, key: &ThrottleKey) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|entry| entry.queued.len())
            .unwrap_or(0)
    }

    fn dispatch_aggregate(&self, key: &ThrottleKey, count: usize, last_body: &str) {
        let title = format!("{} ({})", key.channel, key.network);
        let body = format!("{count} new messages. {last_body}");
        let notification_id = self.dispatch(key, &title, &body, count);

        // The window was already refreshed when the batch was taken;
        // only the id for later dismissal changes here.
        if notification_id.is_some() {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get_mut(key) {
                entry.last_notification_id = notification_id;
            }
        }
    }

    fn dispatch(&self, key: &ThrottleKey, title: &str, body: &str, count: usize) -> Option<String> {
        let metadata = NotificationMetadata {
            platform_channel: self
                .platform_channel
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            network: key.network.clone(),
            channel: key.channel.clone(),
            message_count: count,
        };

        match self.dispatcher.display(title, body, &metadata) {
            Ok(id) => {
                let delivered = self.delivered.fetch_add(1, Ordering::SeqCst) + 1;
                if let Err(e) = self.dispatcher.set_badge(delivered) {
                    tracing::debug!("failed to update badge: {e}");
                }
                tracing::debug!(key = %key, count, "notification dispatched");
                Some(id)
            }
            Err(e) => {
                tracing::warn!(key = %key, "notification dispatch failed: {e}");
                None
            }
        }
    }
}

/// Take the pending batch out of an entry, refreshing its window. `None`
/// when nothing is queued.
fn take_batch(entry: &mut ThrottleEntry) -> Option<(usize, String)> {
    let last = entry.queued.last()?.body.clone();
    let count = entry.window_count;
    entry.queued.clear();
    entry.window_count = 0;
    entry.last_notified_at = Instant::now();
    Some((count, last))
}
