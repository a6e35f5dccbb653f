//! App lifecycle classification and transition handling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::listener::ConnectionListenerCoordinator;
use crate::throttle::NotificationThrottler;

/// Coarse app visibility state. Everything this subsystem does hinges on
/// which side of this line the app is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Foreground,
    Background,
}

/// Map a raw OS app-state string onto [`LifecycleState`].
///
/// `"inactive"` and `"background"` are backgrounded; `"active"` and any
/// unknown value count as foregrounded, so a platform quirk can never
/// leave notifications firing over a visible app.
pub fn classify(raw: &str) -> LifecycleState {
    match raw.trim().to_ascii_lowercase().as_str() {
        "inactive" | "background" => LifecycleState::Background,
        _ => LifecycleState::Foreground,
    }
}

/// Classifies raw OS lifecycle signals and drives the listener and
/// throttler on state edges.
///
/// Transitions fire only when the classified state actually changes, so
/// chattering OS signals ("inactive" followed by "background") cannot
/// double-start the listener.
pub struct AppLifecycleMonitor {
    state: Mutex<LifecycleState>,
    /// Shared with the forwarding handlers, which re-check it per message.
    background: Arc<AtomicBool>,
    /// Whether background connections are enabled at all.
    connection_enabled: Arc<AtomicBool>,
    listener: ConnectionListenerCoordinator,
    throttler: Arc<NotificationThrottler>,
}

impl AppLifecycleMonitor {
    /// `initial_raw` is the OS's current app state, read once at
    /// construction.
    pub fn new(
        initial_raw: &str,
        background: Arc<AtomicBool>,
        connection_enabled: Arc<AtomicBool>,
        listener: ConnectionListenerCoordinator,
        throttler: Arc<NotificationThrottler>,
    ) -> Self {
        let initial = classify(initial_raw);
        background.store(initial == LifecycleState::Background, Ordering::SeqCst);
        Self {
            state: Mutex::new(initial),
            background,
            connection_enabled,
            listener,
            throttler,
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Feed one raw OS lifecycle signal through classification and, on an
    /// edge, start or stop the background machinery.
    pub fn handle_signal(&self, raw: &str) {
        let next = classify(raw);
        let prev = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == next {
                tracing::trace!(raw, "lifecycle signal without state change");
                return;
            }
            let prev = *state;
            *state = next;
            prev
        };

        tracing::info!(?prev, ?next, "app lifecycle transition");
        match next {
            LifecycleState::Background => {
                // Flag first: a message arriving between start() and the
                // first subscription must already see Background.
                self.background.store(true, Ordering::SeqCst);
                if self.connection_enabled.load(Ordering::SeqCst) {
                    self.listener.start();
                } else {
                    tracing::debug!("background connection disabled, listener not started");
                }
            }
            LifecycleState::Foreground => {
                // Flag first so in-flight message callbacks stop forwarding
                // before subscriptions are torn down.
                self.background.store(false, Ordering::SeqCst);
                self.listener.stop();
                // Discard, not flush: the user is about to see these
                // messages live in-app.
                self.throttler.clear_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_known_states() {
        assert_eq!(classify("active"), LifecycleState::Foreground);
        assert_eq!(classify("inactive"), LifecycleState::Background);
        assert_eq!(classify("background"), LifecycleState::Background);
    }

    #[test]
    fn test_classify_is_lenient_about_case_and_whitespace() {
        assert_eq!(classify(" Background "), LifecycleState::Background);
        assert_eq!(classify("INACTIVE"), LifecycleState::Background);
    }

    #[test]
    fn test_classify_unknown_defaults_to_foreground() {
        assert_eq!(classify("extension"), LifecycleState::Foreground);
        assert_eq!(classify(""), LifecycleState::Foreground);
    }
}
