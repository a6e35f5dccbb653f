//! Composition root wiring lifecycle, listener, rules, and throttler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use notify_rules::{
    IncomingMessage, MentionDetector, MessageKind, MessageTarget, NotificationPolicy,
    PreferenceLayer, resolve, should_notify,
};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::dispatcher::{ChannelDescriptor, NotificationDispatcher};
use crate::lifecycle::{AppLifecycleMonitor, LifecycleState};
use crate::listener::{ConnectionListenerCoordinator, RoutedMessage};
use crate::registry::ConnectionRegistry;
use crate::store::{PreferenceManager, PreferenceStore, StoredPreferences};
use crate::throttle::{NotificationThrottler, THROTTLE_WINDOW, ThrottleKey};

/// Forwarded messages waiting for a notify/ignore decision.
const INBOX_CAPACITY: usize = 256;

/// A channel override together with its effective resolved policy.
#[derive(Debug, Clone)]
pub struct ChannelPreferenceView {
    pub channel: String,
    pub effective: NotificationPolicy,
}

struct CoordinatorInner {
    dispatcher: Arc<dyn NotificationDispatcher>,
    prefs: PreferenceManager,
    throttler: Arc<NotificationThrottler>,
    listener: ConnectionListenerCoordinator,
    monitor: AppLifecycleMonitor,
    detector: MentionDetector,
    background: Arc<AtomicBool>,
    connection_enabled: Arc<AtomicBool>,
    shutdown: CancellationToken,
    /// Taken by the worker when `initialize` spawns it.
    inbox_rx: Mutex<Option<mpsc::Receiver<RoutedMessage>>>,
}

/// The subsystem's single entry point for the app shell and settings UI.
///
/// Constructed once with its collaborators injected; clones share state.
#[derive(Clone)]
pub struct BackgroundCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl BackgroundCoordinator {
    /// Wire the subsystem. `initial_raw_state` is the OS's current
    /// app-state value, read once here.
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        dispatcher: Arc<dyn NotificationDispatcher>,
        store: Arc<dyn PreferenceStore>,
        initial_raw_state: &str,
    ) -> Self {
        let prefs = PreferenceManager::load(store);
        let background = Arc::new(AtomicBool::new(false));
        let connection_enabled =
            Arc::new(AtomicBool::new(prefs.background_connection_enabled()));
        let throttler = Arc::new(NotificationThrottler::new(
            Arc::clone(&dispatcher),
            THROTTLE_WINDOW,
        ));

        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);
        let listener =
            ConnectionListenerCoordinator::new(registry, inbox_tx, Arc::clone(&background));
        let monitor = AppLifecycleMonitor::new(
            initial_raw_state,
            Arc::clone(&background),
            Arc::clone(&connection_enabled),
            listener.clone(),
            Arc::clone(&throttler),
        );

        Self {
            inner: Arc::new(CoordinatorInner {
                dispatcher,
                prefs,
                throttler,
                listener,
                monitor,
                detector: MentionDetector::new(),
                background,
                connection_enabled,
                shutdown: CancellationToken::new(),
                inbox_rx: Mutex::new(Some(inbox_rx)),
            }),
        }
    }

    /// Spawn the decision worker and, when constructed already backgrounded
    /// with background connection enabled, start listening right away.
    pub fn initialize(&self) {
        match self
            .inner
            .dispatcher
            .ensure_channel(&ChannelDescriptor::chat_messages())
        {
            Ok(channel_id) => self.inner.throttler.set_platform_channel(channel_id),
            Err(e) => tracing::warn!("failed to ensure notification channel: {e}"),
        }

        if let Some(inbox_rx) = self
            .inner
            .inbox_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            tokio::spawn(worker_loop(self.clone(), inbox_rx));
        }

        if self.inner.monitor.state() == LifecycleState::Background
            && self.inner.connection_enabled.load(Ordering::SeqCst)
        {
            self.inner.listener.start();
        }
        tracing::info!("background coordinator initialized");
    }

    /// Tear everything down: listener, worker, pending throttle state.
    pub fn cleanup(&self) {
        self.inner.listener.stop();
        self.inner.shutdown.cancel();
        self.inner.throttler.clear_all();
        tracing::info!("background coordinator cleaned up");
    }

    /// App-shell entry point for raw OS lifecycle signals.
    pub fn handle_lifecycle_signal(&self, raw: &str) {
        self.inner.monitor.handle_signal(raw);
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.inner.monitor.state()
    }

    pub fn is_background_connection_enabled(&self) -> bool {
        self.inner.connection_enabled.load(Ordering::SeqCst)
    }

    /// Toggle background connections. Takes effect immediately when the app
    /// is currently backgrounded.
    pub fn set_background_connection_enabled(&self, enabled: bool) -> Result<(), anyhow::Error> {
        self.inner.prefs.set_background_connection_enabled(enabled)?;
        self.inner.connection_enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.inner.listener.stop();
        } else if self.inner.background.load(Ordering::SeqCst) {
            self.inner.listener.start();
        }
        tracing::info!(enabled, "background connection toggled");
        Ok(())
    }

    pub fn get_preferences(&self) -> StoredPreferences {
        self.inner.prefs.snapshot()
    }

    pub fn update_preferences(&self, partial: &PreferenceLayer) -> Result<(), anyhow::Error> {
        self.inner.prefs.update_global(partial)
    }

    pub fn update_network_preferences(
        &self,
        network: &str,
        partial: &PreferenceLayer,
    ) -> Result<(), anyhow::Error> {
        self.inner.prefs.update_network(network, partial)
    }

    pub fn update_channel_preferences(
        &self,
        channel: &str,
        partial: &PreferenceLayer,
    ) -> Result<(), anyhow::Error> {
        self.inner.prefs.update_channel(channel, partial)
    }

    pub fn remove_channel_preferences(&self, channel: &str) -> Result<(), anyhow::Error> {
        self.inner.prefs.remove_channel(channel)
    }

    /// Every channel override with its effective policy (global + channel;
    /// channel names are not network-scoped, so no network layer applies).
    pub fn list_channel_preferences(&self) -> Vec<ChannelPreferenceView> {
        let snapshot = self.inner.prefs.snapshot();
        self.inner
            .prefs
            .channel_layers()
            .into_iter()
            .map(|(channel, layer)| ChannelPreferenceView {
                channel,
                effective: resolve(&snapshot.global, None, Some(&layer)),
            })
            .collect()
    }

    /// Decide and, when notify-worthy, throttle one forwarded message.
    fn process(&self, routed: RoutedMessage) {
        // The forwarding handler gated on Background, but the state can
        // flip while the message sits in the inbox; re-check here so a
        // foregrounded app never gets a notification.
        if !self.inner.background.load(Ordering::SeqCst) {
            tracing::trace!(
                channel = %routed.message.channel,
                "discarding message that raced the foreground transition"
            );
            return;
        }
        let message = routed.message;
        let snapshot = self.inner.prefs.snapshot();
        let (global, network, channel) = snapshot.layers_for(&message.network, &message.channel);
        let policy = resolve(global, network, channel);

        if !should_notify(&message, &policy, &routed.nick, &self.inner.detector) {
            tracing::trace!(
                channel = %message.channel,
                network = %message.network,
                "message not notify-worthy"
            );
            return;
        }

        let (title, body) = render(&message);
        self.inner
            .throttler
            .handle(ThrottleKey::for_message(&message), &title, &body);
    }
}

/// Consume forwarded messages and drain queued batches on a fixed cadence.
async fn worker_loop(
    coordinator: BackgroundCoordinator,
    mut inbox_rx: mpsc::Receiver<RoutedMessage>,
) {
    let mut flush = tokio::time::interval(THROTTLE_WINDOW);
    flush.set_missed_tick_behavior(MissedTickBehavior::Delay);
    flush.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = coordinator.inner.shutdown.cancelled() => break,
            routed = inbox_rx.recv() => match routed {
                Some(routed) => coordinator.process(routed),
                None => break,
            },
            _ = flush.tick() => coordinator.inner.throttler.flush_all(),
        }
    }
    tracing::info!("notification worker stopped");
}

fn render(message: &IncomingMessage) -> (String, String) {
    match message.target() {
        MessageTarget::Channel => {
            let title = format!("{} ({})", message.channel, message.network);
            let body = match message.kind {
                MessageKind::Action => format!("* {} {}", message.from, message.text),
                _ => format!("{}: {}", message.from, message.text),
            };
            (title, body)
        }
        MessageTarget::Private => {
            let title = format!("{} ({})", message.from, message.network);
            let body = match message.kind {
                MessageKind::Action => format!("* {} {}", message.from, message.text),
                _ => message.text.clone(),
            };
            (title, body)
        }
    }
}
