//! # Event Bus
//!
//! Synchronous pub/sub with per-subscription predicate filters.
//!
//! `emit` delivers to matching subscribers in subscription order on the
//! caller's thread. A subscriber that errors or panics is logged, its event
//! goes to the dead-letter queue, and the remaining subscribers still
//! receive it. Every delivered event is also kept in a bounded history and
//! forwarded to a broadcast channel for async observers.
//!
//! While paused, published events are buffered and replayed in publish
//! order by `resume`.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use super::event::{Event, EventKind};

/// Callback invoked for each delivered event
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;

/// Predicate deciding whether a subscriber sees an event
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Handle returned by `subscribe`
pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    /// `None` subscribes to every kind
    kind: Option<EventKind>,
    handler: EventHandler,
    filter: Option<EventFilter>,
}

impl Subscription {
    fn matches(&self, event: &Event) -> bool {
        let kind_ok = self.kind.as_ref().map_or(true, |k| *k == event.kind);
        kind_ok && self.filter.as_ref().map_or(true, |f| f(event))
    }
}

/// An event one subscriber failed to handle
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub event: Event,
    pub subscription: SubscriptionId,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EventBusStats {
    pub subscriptions: usize,
    pub history: usize,
    pub dead_letters: usize,
    pub buffered: usize,
    pub paused: bool,
}

/// In-process event bus
pub struct EventBus {
    subscriptions: RwLock<Vec<Subscription>>,
    history: Mutex<VecDeque<Event>>,
    /// Bounds history, dead letters and the pause buffer alike
    max_history: usize,
    dead_letters: Mutex<VecDeque<DeadLetter>>,
    paused: AtomicBool,
    buffered: Mutex<VecDeque<Event>>,
    next_id: AtomicU64,
    stream_tx: broadcast::Sender<Event>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, item: T, max: usize) {
    queue.push_back(item);
    while queue.len() > max {
        queue.pop_front();
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl EventBus {
    /// Create a bus keeping at most `max_history` past events
    pub fn new(max_history: usize) -> Self {
        let (stream_tx, _) = broadcast::channel(256);
        Self {
            subscriptions: RwLock::new(Vec::new()),
            history: Mutex::new(VecDeque::new()),
            max_history,
            dead_letters: Mutex::new(VecDeque::new()),
            paused: AtomicBool::new(false),
            buffered: Mutex::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            stream_tx,
        }
    }

    /// Subscribe to one event kind
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler), None)
    }

    /// Subscribe to one event kind, delivering only events accepted by `filter`
    pub fn subscribe_filtered<F, P>(&self, kind: EventKind, handler: F, filter: P) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler), Some(Arc::new(filter)))
    }

    /// Subscribe to every event kind
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler), None)
    }

    fn add(
        &self,
        kind: Option<EventKind>,
        handler: EventHandler,
        filter: Option<EventFilter>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        subs.push(Subscription {
            id,
            kind,
            handler,
            filter,
        });
        id
    }

    /// Remove a subscription. Returns false if the id was unknown.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self
            .subscriptions
            .write()
            .unwrap_or_else(|e| e.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != id);
        subs.len() != before
    }

    /// Build and publish an event. Returns the number of subscribers that
    /// handled it without error.
    pub fn emit(&self, kind: EventKind, source: &str, data: serde_json::Value) -> usize {
        self.publish(Event::new(kind, source).with_data(data))
    }

    /// Publish a prebuilt event. Returns 0 while the bus is paused.
    pub fn publish(&self, event: Event) -> usize {
        if self.paused.load(Ordering::SeqCst) {
            let mut buffered = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
            // Re-checked under the buffer lock so `resume` cannot miss it
            if self.paused.load(Ordering::SeqCst) {
                if buffered.len() >= self.max_history.max(1) {
                    tracing::warn!(event = %event.kind.name(), "Pause buffer full, dropping oldest event");
                }
                push_bounded(&mut *buffered, event, self.max_history.max(1));
                return 0;
            }
        }
        self.deliver(event)
    }

    fn deliver(&self, event: Event) -> usize {
        self.record(&event);

        // Handlers run outside the lock so they may subscribe or emit.
        let handlers: Vec<(SubscriptionId, EventHandler)> = {
            let subs = self
                .subscriptions
                .read()
                .unwrap_or_else(|e| e.into_inner());
            subs.iter()
                .filter(|s| s.matches(&event))
                .map(|s| (s.id, Arc::clone(&s.handler)))
                .collect()
        };

        let mut delivered = 0;
        for (id, handler) in handlers {
            let error = match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {
                    delivered += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{:#}", e),
                Err(payload) => {
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    format!("subscriber panicked: {}", message)
                }
            };
            tracing::warn!(subscription = id, event = %event.kind.name(), error = %error, "Event subscriber failed");
            self.dead_letter(DeadLetter {
                event: event.clone(),
                subscription: id,
                error,
                failed_at: Utc::now(),
            });
        }

        // No receivers is fine.
        let _ = self.stream_tx.send(event);
        delivered
    }

    fn record(&self, event: &Event) {
        if self.max_history == 0 {
            return;
        }
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut *history, event.clone(), self.max_history);
    }

    fn dead_letter(&self, letter: DeadLetter) {
        if self.max_history == 0 {
            return;
        }
        let mut letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        push_bounded(&mut *letters, letter, self.max_history);
    }

    /// Buffer published events instead of delivering them
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        tracing::debug!("Event bus paused");
    }

    /// Deliver everything buffered while paused, oldest first. Returns the
    /// number of events replayed.
    pub fn resume(&self) -> usize {
        let pending: Vec<Event> = {
            let mut buffered = self.buffered.lock().unwrap_or_else(|e| e.into_inner());
            self.paused.store(false, Ordering::SeqCst);
            buffered.drain(..).collect()
        };
        let replayed = pending.len();
        for event in pending {
            self.deliver(event);
        }
        tracing::debug!(replayed, "Event bus resumed");
        replayed
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Most recent failed deliveries, newest last
    pub fn dead_letters(&self, limit: usize) -> Vec<DeadLetter> {
        let letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        let skip = letters.len().saturating_sub(limit);
        letters.iter().skip(skip).cloned().collect()
    }

    /// Empty the dead-letter queue, returning how many entries it held
    pub fn clear_dead_letters(&self) -> usize {
        let mut letters = self.dead_letters.lock().unwrap_or_else(|e| e.into_inner());
        let count = letters.len();
        letters.clear();
        count
    }

    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            subscriptions: self.subscriber_count(),
            history: self.history.lock().map(|h| h.len()).unwrap_or_default(),
            dead_letters: self.dead_letters.lock().map(|d| d.len()).unwrap_or_default(),
            buffered: self.buffered.lock().map(|b| b.len()).unwrap_or_default(),
            paused: self.is_paused(),
        }
    }

    /// Receive every future event asynchronously
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.stream_tx.subscribe()
    }

    /// Past events, oldest first
    pub fn history(&self) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().cloned().collect()
    }

    /// Past events of one kind, oldest first
    pub fn history_of(&self, kind: &EventKind) -> Vec<Event> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().filter(|e| e.kind == *kind).cloned().collect()
    }

    pub fn clear_history(&self) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.clear();
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.subscriptions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_delivery_in_subscription_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let seen = Arc::clone(&seen);
            bus.subscribe(EventKind::NodeStarted, move |_| {
                seen.lock().unwrap().push(tag);
                Ok(())
            });
        }

        let delivered = bus.emit(EventKind::NodeStarted, "a", json!({}));
        assert_eq!(delivered, 3);
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::default();
        let count = Arc::new(AtomicU64::new(0));

        bus.subscribe(EventKind::NodeFailed, |_| anyhow::bail!("subscriber broke"));
        bus.subscribe(EventKind::NodeFailed, |_| panic!("subscriber panicked"));
        let c = Arc::clone(&count);
        bus.subscribe(EventKind::NodeFailed, move |_| {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let delivered = bus.emit(EventKind::NodeFailed, "b", json!({ "error": "x" }));
        assert_eq!(delivered, 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let letters = bus.dead_letters(10);
        assert_eq!(letters.len(), 2);
        assert_eq!(letters[0].error, "subscriber broke");
        assert_eq!(letters[1].error, "subscriber panicked: subscriber panicked");
        assert_eq!(letters[1].event.source, "b");
        assert_eq!(bus.clear_dead_letters(), 2);
        assert!(bus.dead_letters(10).is_empty());
    }

    #[test]
    fn test_pause_buffers_and_resume_replays_in_order() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        bus.subscribe_all(move |e| {
            s.lock().unwrap().push(e.source.clone());
            Ok(())
        });

        bus.pause();
        assert_eq!(bus.emit(EventKind::NodeStarted, "first", json!({})), 0);
        assert_eq!(bus.emit(EventKind::NodeCompleted, "second", json!({})), 0);
        assert!(seen.lock().unwrap().is_empty());
        assert!(bus.history().is_empty());
        let stats = bus.stats();
        assert!(stats.paused);
        assert_eq!(stats.buffered, 2);

        assert_eq!(bus.resume(), 2);
        assert!(!bus.is_paused());
        assert_eq!(*seen.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(bus.history().len(), 2);

        assert_eq!(bus.emit(EventKind::RunCompleted, "third", json!({})), 1);
        assert_eq!(bus.stats().buffered, 0);
    }

    #[test]
    fn test_filter_and_kind_matching() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicU64::new(0));

        let h = Arc::clone(&hits);
        bus.subscribe_filtered(
            EventKind::ToolInvoked,
            move |_| {
                h.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
            |e| e.source == "validator",
        );

        bus.emit(EventKind::ToolInvoked, "builder", json!({}));
        bus.emit(EventKind::ToolInvoked, "validator", json!({}));
        bus.emit(EventKind::ToolFailed, "validator", json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe_and_wildcard() {
        let bus = EventBus::default();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        let id = bus.subscribe_all(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.emit(EventKind::RunStarted, "graph", json!({}));
        bus.emit(EventKind::Custom("note".into()), "user", json!({}));
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.emit(EventKind::RunCompleted, "graph", json!({}));

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_history_is_bounded() {
        let bus = EventBus::new(2);
        bus.emit(EventKind::NodeStarted, "a", json!({}));
        bus.emit(EventKind::NodeCompleted, "a", json!({}));
        bus.emit(EventKind::NodeStarted, "b", json!({}));

        let history = bus.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, EventKind::NodeCompleted);
        assert_eq!(bus.history_of(&EventKind::NodeStarted).len(), 1);
    }

    #[tokio::test]
    async fn test_stream_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.stream();
        bus.emit(EventKind::PhaseEntered, "pipeline", json!({ "phase": "analyzing" }));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::PhaseEntered);
        assert_eq!(event.data_str("phase"), Some("analyzing"));
    }
}
