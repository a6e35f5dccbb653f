//! Notification preference layers and their resolution.
//!
//! Three scopes exist: one global layer, one per network, one per channel.
//! Each field of a layer is independently overridable; unset fields inherit
//! from the next-wider scope, and anything still unset falls back to the
//! built-in defaults.

use serde::{Deserialize, Serialize};

/// One scope of notification preferences. Every field optional; `None`
/// means "inherit".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferenceLayer {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_on_mentions: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_on_private_messages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_on_all_messages: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub do_not_disturb: Option<bool>,
}

impl PreferenceLayer {
    /// Overlay another partial layer: fields set in `other` win, the rest
    /// keep their current value.
    pub fn merge_from(&mut self, other: &PreferenceLayer) {
        if other.enabled.is_some() {
            self.enabled = other.enabled;
        }
        if other.notify_on_mentions.is_some() {
            self.notify_on_mentions = other.notify_on_mentions;
        }
        if other.notify_on_private_messages.is_some() {
            self.notify_on_private_messages = other.notify_on_private_messages;
        }
        if other.notify_on_all_messages.is_some() {
            self.notify_on_all_messages = other.notify_on_all_messages;
        }
        if other.do_not_disturb.is_some() {
            self.do_not_disturb = other.do_not_disturb;
        }
    }

    /// Whether no field is set at all.
    pub fn is_empty(&self) -> bool {
        *self == PreferenceLayer::default()
    }
}

/// Fully resolved notification policy for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationPolicy {
    pub enabled: bool,
    pub notify_on_mentions: bool,
    pub notify_on_private_messages: bool,
    pub notify_on_all_messages: bool,
    pub do_not_disturb: bool,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            notify_on_mentions: true,
            notify_on_private_messages: true,
            notify_on_all_messages: false,
            do_not_disturb: false,
        }
    }
}

impl NotificationPolicy {
    fn apply(&mut self, layer: &PreferenceLayer) {
        if let Some(v) = layer.enabled {
            self.enabled = v;
        }
        if let Some(v) = layer.notify_on_mentions {
            self.notify_on_mentions = v;
        }
        if let Some(v) = layer.notify_on_private_messages {
            self.notify_on_private_messages = v;
        }
        if let Some(v) = layer.notify_on_all_messages {
            self.notify_on_all_messages = v;
        }
        if let Some(v) = layer.do_not_disturb {
            self.do_not_disturb = v;
        }
    }
}

/// Resolve the effective policy for a message: defaults, then the global
/// layer, then the network layer, then the channel layer. Later layers
/// override only the fields they explicitly set.
pub fn resolve(
    global: &PreferenceLayer,
    network: Option<&PreferenceLayer>,
    channel: Option<&PreferenceLayer>,
) -> NotificationPolicy {
    let mut policy = NotificationPolicy::default();
    policy.apply(global);
    if let Some(layer) = network {
        policy.apply(layer);
    }
    if let Some(layer) = channel {
        policy.apply(layer);
    }
    policy
}
