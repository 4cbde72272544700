use crate::error::Result;
use crate::events::protocol::{RealtimeEvent, parse_event};

/// Receives every routed event, in arrival order.
///
/// Called on the router's task; implementations must not block.
pub trait EventSubscriber: Send {
    fn on_event(&mut self, event: &RealtimeEvent);

    /// Name for logging/debugging.
    fn name(&self) -> &'static str {
        "subscriber"
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub routed: u64,
    pub ignored: u64,
    pub malformed: u64,
}

/// Fans parsed events out to per-session subscribers.
#[derive(Default)]
pub struct EventRouter {
    subscribers: Vec<Box<dyn EventSubscriber>>,
    stats: RouterStats,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, subscriber: Box<dyn EventSubscriber>) {
        tracing::debug!(subscriber = subscriber.name(), "Event subscriber registered");
        self.subscribers.push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Parse one raw message and deliver it to every subscriber.
    ///
    /// Unknown event types yield `Ok(None)`. Malformed messages are returned as
    /// `Protocol` errors and reach no subscriber.
    pub fn route(&mut self, raw: &str) -> Result<Option<RealtimeEvent>> {
        let event = match parse_event(raw) {
            Ok(Some(event)) => event,
            Ok(None) => {
                self.stats.ignored += 1;
                tracing::trace!(raw = %truncate(raw), "Ignoring unknown event type");
                return Ok(None);
            }
            Err(e) => {
                self.stats.malformed += 1;
                return Err(e);
            }
        };
        self.deliver(&event);
        Ok(Some(event))
    }

    /// Deliver an already-parsed event.
    pub fn deliver(&mut self, event: &RealtimeEvent) {
        self.stats.routed += 1;
        tracing::trace!(kind = event.kind(), "Routing event");
        for subscriber in &mut self.subscribers {
            subscriber.on_event(event);
        }
    }

    /// Drop every subscriber. Called when the owning session ends.
    pub fn clear(&mut self) {
        self.subscribers.clear();
        self.stats = RouterStats::default();
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }
}

fn truncate(raw: &str) -> &str {
    match raw.char_indices().nth(120) {
        Some((idx, _)) => &raw[..idx],
        None => raw,
    }
}
