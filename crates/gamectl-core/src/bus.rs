//! In-process publish/subscribe event bus.
//!
//! Producers call [`EventBus::emit`]; every handler registered for the
//! event's kind receives its own copy on a long-lived delivery task,
//! isolated from the emitter and from the other handlers. `emit` never
//! waits for a handler, and a handler panic is caught and logged rather
//! than propagated. Each subscription has a single delivery queue, so one
//! producer's events reach a given handler in emission order.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tracing::warn;

use crate::events::{Event, EventKind};

/// A subscriber on the event bus.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Process one event. Runs on the subscription's delivery task.
    async fn handle(&self, event: Event);
}

/// Adapter turning a plain closure into an [`EventHandler`].
///
/// Handy for tests and for subscribers that only need synchronous work
/// (forwarding into a channel, counting, ...).
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(Event) + Send + Sync,
{
    async fn handle(&self, event: Event) {
        (self.0)(event);
    }
}

/// In-process pub/sub bus keyed by [`EventKind`].
///
/// Construct one per control plane and share it via `Arc`; there is no
/// global instance, so tests get an isolated bus for free.
///
/// Every subscription owns one unbounded queue drained by one spawned
/// task. `emit` only pushes onto the matching queues, which keeps the
/// emitter decoupled from slow handlers while per-handler delivery stays
/// first-in first-out.
pub struct EventBus {
    queues: RwLock<HashMap<EventKind, Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for one event kind.
    ///
    /// Multiple handlers per kind are allowed; each gets its own copy of
    /// every matching event. Must be called from within a tokio runtime,
    /// since the subscription's delivery task is spawned here.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let sender = spawn_delivery(handler);
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        queues.entry(kind).or_default().push(sender);
    }

    /// Register one handler for every event kind.
    ///
    /// All kinds share a single delivery queue, so a producer emitting a
    /// mixed sequence of kinds reaches this handler in emission order.
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) {
        let sender = spawn_delivery(handler);
        let mut queues = self.queues.write().unwrap_or_else(|e| e.into_inner());
        for kind in EventKind::ALL {
            queues.entry(*kind).or_default().push(sender.clone());
        }
    }

    /// Deliver an event to all handlers registered for its kind.
    ///
    /// Dispatch is fire-and-forget: the emitter only pays for the registry
    /// read lock and an unbounded push per subscription. A subscription
    /// whose delivery task is gone is silently skipped.
    pub fn emit(&self, event: &Event) {
        let matching: Vec<mpsc::UnboundedSender<Event>> = {
            let queues = self.queues.read().unwrap_or_else(|e| e.into_inner());
            queues.get(&event.kind()).cloned().unwrap_or_default()
        };

        for sender in matching {
            let _ = sender.send(event.clone());
        }
    }

    /// Number of handlers registered for a kind.
    #[must_use]
    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.queues
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Spawn the delivery task for one subscription and hand back its queue.
///
/// The task drains events in arrival order and runs each through the
/// handler behind a panic boundary, so one bad event does not take the
/// subscription down. It exits once every sender clone is dropped.
fn spawn_delivery(handler: Arc<dyn EventHandler>) -> mpsc::UnboundedSender<Event> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let name = event.event_name();
            if AssertUnwindSafe(handler.handle(event))
                .catch_unwind()
                .await
                .is_err()
            {
                warn!(event = name, "Event handler panicked; subscriber isolated");
            }
        }
    });
    tx
}
