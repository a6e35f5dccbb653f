//! Keeps exactly one live message subscription per active connection.
//!
//! Reconciliation is poll-based: a cancellable tick compares the registry's
//! current connection set against the owned subscription map and closes the
//! difference in both directions. A push-based added/removed signal would
//! remove the tick latency, but the poll is deliberately retained.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use notify_rules::IncomingMessage;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::registry::{ChatConnection, ConnectionRegistry, MessageHandler, SubscriptionToken};

/// How often the subscription map is reconciled against the registry.
pub const RECONCILE_INTERVAL: Duration = Duration::from_secs(2);

/// A message forwarded off a connection's event path, tagged with the
/// subscription context it arrived under.
#[derive(Debug, Clone)]
pub struct RoutedMessage {
    pub connection_id: String,
    /// The user's nick on that connection, captured at subscribe time.
    pub nick: String,
    pub message: IncomingMessage,
}

struct ActiveSubscription {
    token: SubscriptionToken,
    network: String,
}

struct ListenerInner {
    registry: Arc<dyn ConnectionRegistry>,
    inbox: mpsc::Sender<RoutedMessage>,
    background: Arc<AtomicBool>,
    subscriptions: Mutex<HashMap<String, ActiveSubscription>>,
    tick: Mutex<Option<CancellationToken>>,
    /// Bumped by [`stop`](ConnectionListenerCoordinator::stop) so a
    /// reconcile pass already past the registry call cannot repopulate
    /// the map it just drained.
    generation: AtomicU64,
    interval: Duration,
}

/// Maintains the connection-id → subscription map while backgrounded.
#[derive(Clone)]
pub struct ConnectionListenerCoordinator {
    inner: Arc<ListenerInner>,
}

impl ConnectionListenerCoordinator {
    pub fn new(
        registry: Arc<dyn ConnectionRegistry>,
        inbox: mpsc::Sender<RoutedMessage>,
        background: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                registry,
                inbox,
                background,
                subscriptions: Mutex::new(HashMap::new()),
                tick: Mutex::new(None),
                generation: AtomicU64::new(0),
                interval: RECONCILE_INTERVAL,
            }),
        }
    }

    #[cfg(test)]
    fn with_interval(
        registry: Arc<dyn ConnectionRegistry>,
        inbox: mpsc::Sender<RoutedMessage>,
        background: Arc<AtomicBool>,
        interval: Duration,
    ) -> Self {
        let mut this = Self::new(registry, inbox, background);
        Arc::get_mut(&mut this.inner).unwrap().interval = interval;
        this
    }

    /// Reconcile immediately, then keep reconciling on a fixed interval
    /// until [`stop`](Self::stop). Calling `start` while already running is
    /// a no-op.
    pub fn start(&self) {
        let token = CancellationToken::new();
        {
            let mut tick = self.inner.tick.lock().unwrap_or_else(|e| e.into_inner());
            if tick.is_some() {
                tracing::debug!("listener already running");
                return;
            }
            *tick = Some(token.clone());
        }
        tracing::info!("connection listener started");
        self.reconcile();

        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = sleep(this.inner.interval) => this.reconcile(),
                }
            }
            tracing::debug!("reconcile loop stopped");
        });
    }

    /// Cancel the tick and tear down every subscription. Synchronous: no
    /// message callback fires after this returns.
    pub fn stop(&self) {
        // Invalidate any reconcile pass still in flight before draining,
        // so it cannot insert into the map afterwards.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(token) = self
            .inner
            .tick
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }

        let drained: Vec<(String, ActiveSubscription)> = {
            let mut subscriptions = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            subscriptions.drain().collect()
        };
        for (connection_id, subscription) in drained {
            subscription.token.cancel();
            tracing::debug!(connection = %connection_id, "subscription removed on stop");
        }
        tracing::info!("connection listener stopped");
    }

    /// One reconcile pass: subscribe connections with no subscription yet,
    /// unsubscribe ids no longer present. Idempotent; failures degrade to
    /// the fallback connection and never cancel the tick.
    pub fn reconcile(&self) {
        let generation = self.inner.generation.load(Ordering::SeqCst);
        let connections = match self.inner.registry.connections() {
            Ok(connections) => connections,
            Err(e) => {
                tracing::warn!("connection enumeration failed: {e}");
                Vec::new()
            }
        };
        let connections = if connections.is_empty() {
            // Single-network mode: one default connection stands in.
            self.inner.registry.default_connection().into_iter().collect()
        } else {
            connections
        };
        let connections: Vec<Arc<dyn ChatConnection>> = connections
            .into_iter()
            .filter(|connection| connection.is_connected())
            .collect();

        let live_ids: HashSet<String> = connections.iter().map(|c| c.id()).collect();

        let stale: Vec<(String, ActiveSubscription)> = {
            let mut subscriptions = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            let stale_ids: Vec<String> = subscriptions
                .keys()
                .filter(|id| !live_ids.contains(*id))
                .cloned()
                .collect();
            stale_ids
                .into_iter()
                .filter_map(|id| subscriptions.remove(&id).map(|sub| (id, sub)))
                .collect()
        };
        for (connection_id, subscription) in stale {
            subscription.token.cancel();
            tracing::info!(
                connection = %connection_id,
                network = %subscription.network,
                "subscription torn down, connection gone"
            );
        }

        for connection in connections {
            let connection_id = connection.id();
            let mut subscriptions = self
                .inner
                .subscriptions
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            // A stop since this pass began already drained the map; bail
            // out before subscribing, checked under the insert lock.
            if self.inner.generation.load(Ordering::SeqCst) != generation {
                tracing::debug!("reconcile pass superseded by stop");
                return;
            }
            // The gate against duplicates: create strictly when absent,
            // checked and inserted under the same lock.
            if subscriptions.contains_key(&connection_id) {
                continue;
            }
            let network = connection.network_name();
            let token = connection.subscribe(self.forwarding_handler(&connection));
            subscriptions.insert(
                connection_id.clone(),
                ActiveSubscription {
                    token,
                    network: network.clone(),
                },
            );
            tracing::info!(connection = %connection_id, network = %network, "subscription created");
        }
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn forwarding_handler(&self, connection: &Arc<dyn ChatConnection>) -> MessageHandler {
        let background = Arc::clone(&self.inner.background);
        let inbox = self.inner.inbox.clone();
        let connection_id = connection.id();
        let nick = connection.current_nick();

        Arc::new(move |mut message: IncomingMessage| {
            // The state may have flipped between this message being queued
            // by the engine and the handler running.
            if !background.load(Ordering::SeqCst) {
                return;
            }
            message.received_at = chrono::Utc::now().timestamp_millis();
            let routed = RoutedMessage {
                connection_id: connection_id.clone(),
                nick: nick.clone(),
                message,
            };
            if let Err(e) = inbox.try_send(routed) {
                tracing::warn!("dropping chat event, inbox full or closed: {e}");
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use notify_rules::MessageKind;

    use super::*;
    use crate::NotifyError;

    struct FakeConnection {
        id: String,
        network: String,
        connected: AtomicBool,
        handlers: Arc<Mutex<HashMap<u64, MessageHandler>>>,
        next_handler: AtomicUsize,
        subscribe_calls: AtomicUsize,
    }

    impl FakeConnection {
        fn new(id: &str, network: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                network: network.into(),
                connected: AtomicBool::new(true),
                handlers: Arc::new(Mutex::new(HashMap::new())),
                next_handler: AtomicUsize::new(0),
                subscribe_calls: AtomicUsize::new(0),
            })
        }

        fn handler_count(&self) -> usize {
            self.handlers.lock().unwrap().len()
        }

        fn emit(&self, message: IncomingMessage) {
            let handlers: Vec<MessageHandler> =
                self.handlers.lock().unwrap().values().cloned().collect();
            for handler in handlers {
                handler(message.clone());
            }
        }
    }

    impl ChatConnection for FakeConnection {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn network_name(&self) -> String {
            self.network.clone()
        }

        fn current_nick(&self) -> String {
            "bob".into()
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn subscribe(&self, handler: MessageHandler) -> SubscriptionToken {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            let slot = self.next_handler.fetch_add(1, Ordering::SeqCst) as u64;
            self.handlers.lock().unwrap().insert(slot, handler);
            let handlers = Arc::clone(&self.handlers);
            SubscriptionToken::new(move || {
                handlers.lock().unwrap().remove(&slot);
            })
        }
    }

    #[derive(Default)]
    struct FakeRegistry {
        connections: Mutex<Vec<Arc<FakeConnection>>>,
        fallback: Mutex<Option<Arc<FakeConnection>>>,
        fail: AtomicBool,
        /// When set, the next enumeration stops this listener mid-pass,
        /// mimicking a stop that lands while reconcile is at the registry.
        stop_on_enumerate: Mutex<Option<ConnectionListenerCoordinator>>,
    }

    impl ConnectionRegistry for FakeRegistry {
        fn connections(&self) -> Result<Vec<Arc<dyn ChatConnection>>, NotifyError> {
            if let Some(listener) = self.stop_on_enumerate.lock().unwrap().take() {
                listener.stop();
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(NotifyError::Registry("engine restarting".into()));
            }
            Ok(self
                .connections
                .lock()
                .unwrap()
                .iter()
                .map(|c| Arc::clone(c) as Arc<dyn ChatConnection>)
                .collect())
        }

        fn default_connection(&self) -> Option<Arc<dyn ChatConnection>> {
            self.fallback
                .lock()
                .unwrap()
                .as_ref()
                .map(|c| Arc::clone(c) as Arc<dyn ChatConnection>)
        }
    }

    fn message() -> IncomingMessage {
        IncomingMessage {
            from: "alice".into(),
            text: "hi bob".into(),
            channel: "#test".into(),
            network: "Libera".into(),
            kind: MessageKind::Privmsg,
            received_at: 0,
        }
    }

    fn coordinator(
        registry: Arc<FakeRegistry>,
        background: bool,
    ) -> (ConnectionListenerCoordinator, mpsc::Receiver<RoutedMessage>) {
        let (tx, rx) = mpsc::channel(16);
        let flag = Arc::new(AtomicBool::new(background));
        (
            ConnectionListenerCoordinator::new(registry, tx, flag),
            rx,
        )
    }

    #[tokio::test]
    async fn test_reconcile_creates_one_subscription_per_connection() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        let b = FakeConnection::new("conn-b", "OFTC");
        registry
            .connections
            .lock()
            .unwrap()
            .extend([Arc::clone(&a), Arc::clone(&b)]);

        let (listener, _rx) = coordinator(registry, true);
        listener.reconcile();

        assert_eq!(listener.subscription_count(), 2);
        assert_eq!(a.handler_count(), 1);
        assert_eq!(b.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_repeated_reconcile_never_duplicates() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (listener, _rx) = coordinator(registry, true);
        for _ in 0..5 {
            listener.reconcile();
        }

        assert_eq!(listener.subscription_count(), 1);
        assert_eq!(a.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_removed_connection_is_torn_down() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        let b = FakeConnection::new("conn-b", "OFTC");
        registry
            .connections
            .lock()
            .unwrap()
            .extend([Arc::clone(&a), Arc::clone(&b)]);

        let (listener, _rx) = coordinator(registry.clone(), true);
        listener.reconcile();
        assert_eq!(listener.subscription_count(), 2);

        registry.connections.lock().unwrap().retain(|c| c.id == "conn-a");
        listener.reconcile();

        assert_eq!(listener.subscription_count(), 1);
        assert_eq!(b.handler_count(), 0, "unsubscribe token was cancelled");
        assert_eq!(a.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_disconnected_connections_are_skipped() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        a.connected.store(false, Ordering::SeqCst);
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (listener, _rx) = coordinator(registry, true);
        listener.reconcile();

        assert_eq!(listener.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_registry_failure_degrades_to_default_connection() {
        let registry = Arc::new(FakeRegistry::default());
        let fallback = FakeConnection::new("default", "Libera");
        *registry.fallback.lock().unwrap() = Some(Arc::clone(&fallback));
        registry.fail.store(true, Ordering::SeqCst);

        let (listener, _rx) = coordinator(registry, true);
        listener.reconcile();

        assert_eq!(listener.subscription_count(), 1);
        assert_eq!(fallback.handler_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_registry_without_fallback_is_quiet() {
        let registry = Arc::new(FakeRegistry::default());
        let (listener, _rx) = coordinator(registry, true);
        listener.reconcile();
        assert_eq!(listener.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_tears_down_everything_synchronously() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (listener, mut rx) = coordinator(registry, true);
        listener.reconcile();
        assert_eq!(a.handler_count(), 1);

        listener.stop();

        assert_eq!(listener.subscription_count(), 0);
        assert_eq!(a.handler_count(), 0);
        // Nothing can arrive after stop; emit goes nowhere.
        a.emit(message());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_during_reconcile_leaves_map_empty() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (listener, _rx) = coordinator(registry.clone(), true);
        // stop() lands after reconcile has fetched the connection set but
        // before it subscribes; the pass must not repopulate the map.
        *registry.stop_on_enumerate.lock().unwrap() = Some(listener.clone());
        listener.reconcile();

        assert_eq!(listener.subscription_count(), 0);
        assert_eq!(a.handler_count(), 0);

        // A later explicit pass subscribes again as usual.
        listener.reconcile();
        assert_eq!(listener.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_handler_drops_messages_once_foregrounded() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (tx, mut rx) = mpsc::channel(16);
        let background = Arc::new(AtomicBool::new(true));
        let listener =
            ConnectionListenerCoordinator::new(registry, tx, Arc::clone(&background));
        listener.reconcile();

        a.emit(message());
        let routed = rx.try_recv().expect("forwarded while backgrounded");
        assert_eq!(routed.connection_id, "conn-a");
        assert_eq!(routed.nick, "bob");
        assert!(routed.message.received_at > 0);

        // Narrow-window case: state flips while the subscription still
        // exists. The handler itself must gate.
        background.store(false, Ordering::SeqCst);
        a.emit(message());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_started_loop_picks_up_new_connections() {
        let registry = Arc::new(FakeRegistry::default());
        let a = FakeConnection::new("conn-a", "Libera");
        registry.connections.lock().unwrap().push(Arc::clone(&a));

        let (tx, _rx) = mpsc::channel(16);
        let listener = ConnectionListenerCoordinator::with_interval(
            registry.clone(),
            tx,
            Arc::new(AtomicBool::new(true)),
            Duration::from_millis(100),
        );
        listener.start();
        assert_eq!(listener.subscription_count(), 1, "immediate reconcile");

        let b = FakeConnection::new("conn-b", "OFTC");
        registry.connections.lock().unwrap().push(Arc::clone(&b));
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(listener.subscription_count(), 2);
        assert_eq!(b.subscribe_calls.load(Ordering::SeqCst), 1);

        listener.start(); // no-op while running
        assert_eq!(a.subscribe_calls.load(Ordering::SeqCst), 1);

        listener.stop();
        assert_eq!(listener.subscription_count(), 0);
    }
}
