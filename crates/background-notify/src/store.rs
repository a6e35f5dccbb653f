//! Preference persistence over an opaque key-value blob store.
//!
//! The store itself belongs to the host app (on mobile, whatever async
//! storage the shell provides); this module owns the keys, the JSON layer
//! encoding, and the in-memory snapshot the hot path reads from.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use notify_rules::PreferenceLayer;
use serde::{Deserialize, Serialize};

/// Key for the global preference layer blob.
pub const KEY_GLOBAL: &str = "NOTIFY_GLOBAL";
/// Key prefix for per-network layer blobs; the network name follows.
pub const KEY_NETWORK_PREFIX: &str = "NOTIFY_NETWORK:";
/// Key prefix for per-channel layer blobs; the lowercased channel follows.
pub const KEY_CHANNEL_PREFIX: &str = "NOTIFY_CHANNEL:";
/// Key for the background-connection toggle ("true"/"false").
pub const KEY_BACKGROUND_ENABLED: &str = "BACKGROUND_CONNECTION_ENABLED";

/// Opaque string key-value store owned by the host app.
pub trait PreferenceStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error>;
    fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error>;
    fn remove(&self, key: &str) -> Result<(), anyhow::Error>;
    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error>;
}

/// In-memory [`PreferenceStore`], used in tests and as a fallback when the
/// host provides no persistence.
#[derive(Debug, Default)]
pub struct MemoryPreferenceStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryPreferenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreferenceStore for MemoryPreferenceStore {
    fn get(&self, key: &str) -> Result<Option<String>, anyhow::Error> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), anyhow::Error> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), anyhow::Error> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>, anyhow::Error> {
        Ok(self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

/// All three preference scopes. Channel keys are lowercased.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoredPreferences {
    pub global: PreferenceLayer,
    pub per_network: HashMap<String, PreferenceLayer>,
    pub per_channel: HashMap<String, PreferenceLayer>,
}

impl StoredPreferences {
    /// The three layers relevant to a message on `network` in `channel`.
    pub fn layers_for(
        &self,
        network: &str,
        channel: &str,
    ) -> (
        &PreferenceLayer,
        Option<&PreferenceLayer>,
        Option<&PreferenceLayer>,
    ) {
        (
            &self.global,
            self.per_network.get(network),
            self.per_channel.get(&channel.to_lowercase()),
        )
    }
}

/// High-level preference operations over a [`PreferenceStore`].
///
/// Keeps a cached snapshot for the message hot path; updates write through
/// to the store and refresh the cache. A malformed persisted layer degrades
/// to the default layer with a warning rather than failing the load.
pub struct PreferenceManager {
    store: Arc<dyn PreferenceStore>,
    cached: RwLock<StoredPreferences>,
}

impl PreferenceManager {
    /// Load all persisted layers. Store errors leave the affected scope at
    /// its default; they never fail construction.
    pub fn load(store: Arc<dyn PreferenceStore>) -> Self {
        let mut prefs = StoredPreferences::default();

        prefs.global = read_layer(store.as_ref(), KEY_GLOBAL);
        for key in list_keys(store.as_ref(), KEY_NETWORK_PREFIX) {
            let network = key[KEY_NETWORK_PREFIX.len()..].to_string();
            prefs
                .per_network
                .insert(network, read_layer(store.as_ref(), &key));
        }
        for key in list_keys(store.as_ref(), KEY_CHANNEL_PREFIX) {
            let channel = key[KEY_CHANNEL_PREFIX.len()..].to_lowercase();
            prefs
                .per_channel
                .insert(channel, read_layer(store.as_ref(), &key));
        }

        Self {
            store,
            cached: RwLock::new(prefs),
        }
    }

    /// Current snapshot of all scopes.
    pub fn snapshot(&self) -> StoredPreferences {
        self.cached.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Merge `partial` into the global layer and persist.
    pub fn update_global(&self, partial: &PreferenceLayer) -> Result<(), anyhow::Error> {
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        let mut layer = cached.global.clone();
        layer.merge_from(partial);
        self.store.set(KEY_GLOBAL, &serde_json::to_string(&layer)?)?;
        cached.global = layer;
        Ok(())
    }

    /// Merge `partial` into the layer for `network` and persist.
    pub fn update_network(
        &self,
        network: &str,
        partial: &PreferenceLayer,
    ) -> Result<(), anyhow::Error> {
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        let mut layer = cached.per_network.get(network).cloned().unwrap_or_default();
        layer.merge_from(partial);
        let key = format!("{KEY_NETWORK_PREFIX}{network}");
        self.store.set(&key, &serde_json::to_string(&layer)?)?;
        cached.per_network.insert(network.to_string(), layer);
        Ok(())
    }

    /// Merge `partial` into the layer for `channel` and persist.
    pub fn update_channel(
        &self,
        channel: &str,
        partial: &PreferenceLayer,
    ) -> Result<(), anyhow::Error> {
        let channel = channel.to_lowercase();
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        let mut layer = cached.per_channel.get(&channel).cloned().unwrap_or_default();
        layer.merge_from(partial);
        let key = format!("{KEY_CHANNEL_PREFIX}{channel}");
        self.store.set(&key, &serde_json::to_string(&layer)?)?;
        cached.per_channel.insert(channel, layer);
        Ok(())
    }

    /// Drop the channel override entirely; the channel falls back to the
    /// network/global resolution.
    pub fn remove_channel(&self, channel: &str) -> Result<(), anyhow::Error> {
        let channel = channel.to_lowercase();
        let mut cached = self.cached.write().unwrap_or_else(|e| e.into_inner());
        self.store.remove(&format!("{KEY_CHANNEL_PREFIX}{channel}"))?;
        cached.per_channel.remove(&channel);
        Ok(())
    }

    /// All channel overrides, sorted by channel name.
    pub fn channel_layers(&self) -> Vec<(String, PreferenceLayer)> {
        let cached = self.cached.read().unwrap_or_else(|e| e.into_inner());
        let mut layers: Vec<_> = cached
            .per_channel
            .iter()
            .map(|(channel, layer)| (channel.clone(), layer.clone()))
            .collect();
        layers.sort_by(|a, b| a.0.cmp(&b.0));
        layers
    }

    /// Whether keeping connections alive in the background is enabled.
    /// Defaults to true when unset or unreadable.
    pub fn background_connection_enabled(&self) -> bool {
        match self.store.get(KEY_BACKGROUND_ENABLED) {
            Ok(Some(value)) => value == "true",
            Ok(None) => true,
            Err(e) => {
                tracing::warn!("failed to read background-connection flag: {e}");
                true
            }
        }
    }

    pub fn set_background_connection_enabled(&self, enabled: bool) -> Result<(), anyhow::Error> {
        self.store
            .set(KEY_BACKGROUND_ENABLED, if enabled { "true" } else { "false" })
    }
}

fn read_layer(store: &dyn PreferenceStore, key: &str) -> PreferenceLayer {
    match store.get(key) {
        Ok(Some(blob)) => match serde_json::from_str(&blob) {
            Ok(layer) => layer,
            Err(e) => {
                tracing::warn!(key, "malformed preference layer, using defaults: {e}");
                PreferenceLayer::default()
            }
        },
        Ok(None) => PreferenceLayer::default(),
        Err(e) => {
            tracing::warn!(key, "preference read failed, using defaults: {e}");
            PreferenceLayer::default()
        }
    }
}

fn list_keys(store: &dyn PreferenceStore, prefix: &str) -> Vec<String> {
    match store.keys_with_prefix(prefix) {
        Ok(keys) => keys,
        Err(e) => {
            tracing::warn!(prefix, "preference key listing failed: {e}");
            Vec::new()
        }
    }
}
