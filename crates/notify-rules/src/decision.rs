//! The per-message notify/ignore decision.

use crate::mention::MentionDetector;
use crate::message::{IncomingMessage, MessageTarget};
use crate::prefs::NotificationPolicy;

/// Decide whether `message` should produce a notification under the
/// resolved `policy` for the user currently known as `nick`.
///
/// Deterministic for identical inputs.
pub fn should_notify(
    message: &IncomingMessage,
    policy: &NotificationPolicy,
    nick: &str,
    detector: &MentionDetector,
) -> bool {
    if !policy.enabled || policy.do_not_disturb {
        return false;
    }
    if !message.kind.is_notifiable() || message.channel.is_empty() {
        return false;
    }

    match message.target() {
        MessageTarget::Private => policy.notify_on_private_messages,
        MessageTarget::Channel => {
            if policy.notify_on_all_messages {
                return true;
            }
            if policy.notify_on_mentions {
                return detector.matches(&message.text, nick);
            }
            false
        }
    }
}
