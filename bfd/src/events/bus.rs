//! Event bus for scheduler lifecycle notifications
//!
//! A tokio broadcast channel delivers events to any number of observers.
//! Emit is fire-and-forget: the loops never wait on subscribers, and a
//! subscriber that lags simply misses events.

use tokio::sync::broadcast;
use tracing::debug;

use super::types::SchedulerEvent;

/// Default channel capacity (events)
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Broadcast fan-out for [`SchedulerEvent`]s
pub struct EventBus {
    tx: broadcast::Sender<SchedulerEvent>,
}

impl EventBus {
    /// Create a new event bus with the given capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Create a new event bus with default capacity
    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Emit an event to all subscribers
    ///
    /// Send errors (no subscribers) are ignored.
    pub fn emit(&self, event: SchedulerEvent) {
        debug!(
            event_type = event.event_type(),
            execution = %event.execution_id(),
            "EventBus::emit"
        );
        let _ = self.tx.send(event);
    }

    /// Subscribe to events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.tx.subscribe()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}
