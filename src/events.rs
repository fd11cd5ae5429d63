//! Outbound lifecycle and data events.
//!
//! The connection manager never talks to the host directly. It emits
//! [`Event`] values through an injected [`Notifier`]; the host decides how
//! they are delivered. [`ChannelNotifier`] is the default adapter and pushes
//! events onto a `tokio::sync::mpsc` channel for a consumer loop to drain.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::constants::{EVENT_KIND, UNKNOWN_CHANNEL};

/// Event delivered to the host.
///
/// `data` is a human-readable status string for lifecycle events, or the
/// raw message payload for data events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Event {
    /// Always [`EVENT_KIND`].
    pub kind: String,
    /// Channel the event belongs to, or [`UNKNOWN_CHANNEL`].
    pub channel: String,
    /// Status text or message payload.
    pub data: String,
}

impl Event {
    /// Build an event for `channel`.
    #[must_use]
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            kind: EVENT_KIND.to_string(),
            channel: channel.into(),
            data: data.into(),
        }
    }

    /// Build an event not tied to any subscription channel.
    #[must_use]
    pub fn unknown(data: impl Into<String>) -> Self {
        Self::new(UNKNOWN_CHANNEL, data)
    }

    /// `"{channel} subscribed"`.
    #[must_use]
    pub fn subscribed(channel: &str) -> Self {
        Self::new(channel, format!("{channel} subscribed"))
    }

    /// `"{channel} unsubscribed"`.
    #[must_use]
    pub fn unsubscribed(channel: &str) -> Self {
        Self::new(channel, format!("{channel} unsubscribed"))
    }
}

/// Sink for outbound events.
///
/// Implementations must not block: the manager calls `notify` from inside
/// its serialized sections.
pub trait Notifier: Send + Sync {
    /// Deliver one event to the host.
    fn notify(&self, event: Event);
}

/// [`Notifier`] that forwards events onto an unbounded mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: mpsc::UnboundedSender<Event>,
}

impl ChannelNotifier {
    /// Wrap an existing sender.
    #[must_use]
    pub fn new(tx: mpsc::UnboundedSender<Event>) -> Self {
        Self { tx }
    }

    /// Create a notifier together with the receiver the host drains.
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, event: Event) {
        log::debug!("[Notifier] {} <- {}", event.channel, event.data);
        if self.tx.send(event).is_err() {
            log::debug!("[Notifier] Host receiver dropped, event discarded");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_event_text() {
        let e = Event::subscribed("c1");
        assert_eq!(e.kind, "REDIS");
        assert_eq!(e.channel, "c1");
        assert_eq!(e.data, "c1 subscribed");

        assert_eq!(Event::unsubscribed("c1").data, "c1 unsubscribed");
    }

    #[test]
    fn test_unknown_channel_event() {
        let e = Event::unknown("fail to connect");
        assert_eq!(e.channel, "UNKNOWN");
    }

    #[test]
    fn test_event_serializes_with_kind() {
        let json = serde_json::to_value(Event::new("c2", "hello")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "REDIS", "channel": "c2", "data": "hello"})
        );
    }

    #[test]
    fn test_channel_notifier_forwards_and_survives_drop() {
        let (notifier, mut rx) = ChannelNotifier::channel();
        notifier.notify(Event::new("c1", "payload"));
        assert_eq!(rx.try_recv().unwrap().data, "payload");

        drop(rx);
        // Must not panic once the host has gone away.
        notifier.notify(Event::unknown("late"));
    }
}
