//! Asynchronous publish/subscribe hub
//!
//! Queued events are delivered by a single dispatch task in priority order
//! (FIFO within a priority). Each delivery fans out to every subscriber of
//! the event's kind concurrently and completes before the next event is
//! taken from the queue.

use futures::future::{join_all, BoxFuture, FutureExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{Event, EventKind, EventPriority};

/// Upper bound on how long `stop` waits for the queue to drain
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<()>>;

/// Type-erased subscriber callback
pub type EventHandler = Arc<dyn Fn(Arc<Event>) -> HandlerFuture + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]; pass it to `unsubscribe`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId {
    kind: EventKind,
    id: u64,
}

impl SubscriptionId {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

/// History entry kept for introspection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventRecord {
    pub timestamp: f64,
    pub kind: EventKind,
    pub source: String,
    pub event_id: String,
}

/// Point-in-time bus statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct BusStats {
    pub is_running: bool,
    pub queue_size: usize,
    pub history_size: usize,
    pub events_published: u64,
    pub events_processed: u64,
    pub handler_failures: u64,
    pub events_by_kind: BTreeMap<EventKind, u64>,
    pub subscribers_by_kind: BTreeMap<EventKind, usize>,
}

struct Subscriber {
    id: u64,
    handler: EventHandler,
}

struct QueuedEvent {
    priority: EventPriority,
    sequence: u64,
    event: Arc<Event>,
}

impl PartialEq for QueuedEvent {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}

impl Eq for QueuedEvent {}

impl PartialOrd for QueuedEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedEvent {
    // BinaryHeap pops the greatest element: lowest priority value, then oldest sequence
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

#[derive(Default)]
struct AtomicBusMetrics {
    published: AtomicU64,
    processed: AtomicU64,
    handler_failures: AtomicU64,
    per_kind: [AtomicU64; 6],
}

struct BusInner {
    subscribers: RwLock<HashMap<EventKind, Vec<Subscriber>>>,
    queue: Mutex<BinaryHeap<QueuedEvent>>,
    wakeup: Notify,
    history: Mutex<VecDeque<EventRecord>>,
    max_history: usize,
    metrics: AtomicBusMetrics,
    running: AtomicBool,
    next_subscription: AtomicU64,
    next_sequence: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn record(&self, event: &Event) {
        let kind = event.kind();
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        self.metrics.per_kind[kind as usize].fetch_add(1, Ordering::Relaxed);

        let mut history = self.history.lock();
        if self.max_history == 0 {
            return;
        }
        while history.len() >= self.max_history {
            history.pop_front();
        }
        history.push_back(EventRecord {
            timestamp: event.timestamp,
            kind,
            source: event.source.clone(),
            event_id: event.event_id(),
        });
    }

    async fn deliver(&self, event: Arc<Event>) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = self
            .subscribers
            .read()
            .get(&kind)
            .map(|subs| subs.iter().map(|s| s.handler.clone()).collect())
            .unwrap_or_default();

        if !handlers.is_empty() {
            let deliveries = handlers.into_iter().map(|handler| {
                let event = event.clone();
                AssertUnwindSafe(async move { handler(event).await }).catch_unwind()
            });

            for outcome in join_all(deliveries).await {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                        error!(kind = %kind, source = %event.source, "event handler failed: {e:#}");
                    }
                    Err(_) => {
                        self.metrics.handler_failures.fetch_add(1, Ordering::Relaxed);
                        error!(kind = %kind, source = %event.source, "event handler panicked");
                    }
                }
            }
        }

        self.metrics.processed.fetch_add(1, Ordering::Relaxed);
    }
}

async fn dispatch_loop(inner: Arc<BusInner>) {
    debug!("event dispatch loop started");
    loop {
        let next = inner.queue.lock().pop();
        match next {
            Some(queued) => inner.deliver(queued.event).await,
            None => {
                if !inner.running.load(Ordering::Acquire) {
                    break;
                }
                inner.wakeup.notified().await;
            }
        }
    }
    debug!("event dispatch loop drained");
}

/// Publish/subscribe hub shared by every component
///
/// Cloning is cheap and yields another handle to the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a stopped bus keeping at most `max_history` records
    pub fn new(max_history: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(HashMap::new()),
                queue: Mutex::new(BinaryHeap::new()),
                wakeup: Notify::new(),
                history: Mutex::new(VecDeque::with_capacity(max_history.min(1024))),
                max_history,
                metrics: AtomicBusMetrics::default(),
                running: AtomicBool::new(false),
                next_subscription: AtomicU64::new(1),
                next_sequence: AtomicU64::new(0),
                dispatcher: Mutex::new(None),
            }),
        }
    }

    /// Spawn the dispatch task. Must be called inside a tokio runtime.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            return;
        }
        let handle = tokio::spawn(dispatch_loop(self.inner.clone()));
        *self.inner.dispatcher.lock() = Some(handle);
        info!("event bus started");
    }

    /// Drain the queue, stop the dispatch task and drop every subscription
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.inner.wakeup.notify_one();

        let handle = self.inner.dispatcher.lock().take();
        if let Some(handle) = handle {
            let abort = handle.abort_handle();
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("event dispatch task failed: {e}"),
                Err(_) => {
                    abort.abort();
                    let dropped = {
                        let mut queue = self.inner.queue.lock();
                        let n = queue.len();
                        queue.clear();
                        n
                    };
                    warn!(dropped, "event bus drain timed out, remaining events discarded");
                }
            }
        }

        self.inner.subscribers.write().clear();
        info!("event bus stopped");
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Register a handler for one event kind
    ///
    /// Handlers must not block; long work belongs on another task.
    pub fn subscribe<F, Fut>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler: EventHandler = Arc::new(move |event| handler(event).boxed());
        self.subscribe_handler(kind, handler)
    }

    /// Register an already type-erased handler
    pub fn subscribe_handler(&self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        let id = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed);
        self.inner
            .subscribers
            .write()
            .entry(kind)
            .or_default()
            .push(Subscriber { id, handler });
        debug!(kind = %kind, id, "subscribed");
        SubscriptionId { kind, id }
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        let mut subscribers = self.inner.subscribers.write();
        let Some(subs) = subscribers.get_mut(&subscription.kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != subscription.id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            subscribers.remove(&subscription.kind);
        }
        if removed {
            debug!(kind = %subscription.kind, id = subscription.id, "unsubscribed");
        }
        removed
    }

    /// Queue an event for asynchronous delivery
    ///
    /// The event is always recorded in history and stats, but only queued
    /// while the bus is running; otherwise nothing would ever drain it.
    pub fn publish(&self, event: Event, priority: EventPriority) {
        self.inner.record(&event);
        if !self.is_running() {
            debug!(kind = %event.kind(), source = %event.source, "bus not running, event not queued");
            return;
        }
        let sequence = self.inner.next_sequence.fetch_add(1, Ordering::Relaxed);
        self.inner.queue.lock().push(QueuedEvent {
            priority,
            sequence,
            event: Arc::new(event),
        });
        self.inner.wakeup.notify_one();
    }

    /// Deliver an event on the caller's task, bypassing the queue
    pub async fn publish_sync(&self, event: Event) {
        self.inner.record(&event);
        self.inner.deliver(Arc::new(event)).await;
    }

    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.inner
            .subscribers
            .read()
            .get(&kind)
            .map_or(0, |subs| subs.len())
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Most recent `limit` history records, oldest first
    pub fn recent_events(&self, limit: usize) -> Vec<EventRecord> {
        let history = self.inner.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }

    pub fn clear_history(&self) {
        self.inner.history.lock().clear();
    }

    pub fn stats(&self) -> BusStats {
        let metrics = &self.inner.metrics;
        let events_by_kind = EventKind::ALL
            .iter()
            .map(|&kind| {
                (
                    kind,
                    metrics.per_kind[kind as usize].load(Ordering::Relaxed),
                )
            })
            .collect();
        let subscribers_by_kind = self
            .inner
            .subscribers
            .read()
            .iter()
            .map(|(&kind, subs)| (kind, subs.len()))
            .collect();

        BusStats {
            is_running: self.is_running(),
            queue_size: self.queue_len(),
            history_size: self.inner.history.lock().len(),
            events_published: metrics.published.load(Ordering::Relaxed),
            events_processed: metrics.processed.load(Ordering::Relaxed),
            handler_failures: metrics.handler_failures.load(Ordering::Relaxed),
            events_by_kind,
            subscribers_by_kind,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("running", &self.is_running())
            .field("queue_size", &self.queue_len())
            .finish()
    }
}
