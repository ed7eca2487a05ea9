//! Event bus implementation.
//!
//! Handlers are invoked on the publishing task, one at a time: exact-type
//! handlers in registration order, then wildcard handlers in registration
//! order. Channel receivers are fed after all handlers have settled.

use crate::error::{panic_message, HandlerError};
use crate::types::{SubscriptionHandle, SubscriptionId};
use crossbeam_channel::{bounded, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::taxonomy::KnownEvent;
use super::types::{BusStats, Event, EventBusConfig, EventFilter, EventInput, EventReceiver};

/// What an event handler returns. Errors are logged and isolated.
pub type HandlerResult = std::result::Result<(), HandlerError>;

type SyncHandler = Arc<dyn Fn(&Event) -> HandlerResult + Send + Sync>;
type AsyncHandler = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

enum Handler {
    Sync(SyncHandler),
    Async(AsyncHandler),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Topic {
    Exact(String),
    Wildcard,
}

/// A registered handler.
struct HandlerEntry {
    id: SubscriptionId,
    topic: Topic,
    handler: Handler,
    /// Cleared on unsubscribe so an in-progress round skips it.
    active: AtomicBool,
}

impl HandlerEntry {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn invoke(&self, event: &Arc<Event>) -> HandlerResult {
        match &self.handler {
            Handler::Sync(handler) => {
                match std::panic::catch_unwind(AssertUnwindSafe(|| handler(event.as_ref()))) {
                    Ok(result) => result,
                    Err(panic) => Err(panic_message(panic).into()),
                }
            }
            Handler::Async(handler) => {
                let event = Arc::clone(event);
                match AssertUnwindSafe(async move { handler(event).await })
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(panic) => Err(panic_message(panic).into()),
                }
            }
        }
    }
}

/// A polling subscriber fed through a bounded channel.
struct ChannelSubscriber {
    filter: EventFilter,
    sender: Sender<Event>,
}

impl ChannelSubscriber {
    /// Returns false if the buffer is full or the receiver is gone.
    fn try_send(&self, event: &Event) -> bool {
        self.sender.try_send(event.clone()).is_ok()
    }
}

#[derive(Default)]
struct StatsState {
    total_published: u64,
    published_by_type: HashMap<String, u64>,
    delivered_by_type: HashMap<String, u64>,
    handler_failures: u64,
    recent: VecDeque<String>,
}

struct BusInner {
    config: EventBusConfig,
    handlers: RwLock<Vec<Arc<HandlerEntry>>>,
    channels: RwLock<HashMap<SubscriptionId, ChannelSubscriber>>,
    stats: Mutex<StatsState>,
    next_id: AtomicU64,
}

impl BusInner {
    /// Handlers for one delivery round, in delivery order.
    fn targets(&self, event_type: &str) -> Vec<Arc<HandlerEntry>> {
        let handlers = self.handlers.read();
        let exact = handlers
            .iter()
            .filter(|h| matches!(&h.topic, Topic::Exact(t) if t == event_type));
        let wildcard = handlers.iter().filter(|h| h.topic == Topic::Wildcard);
        exact.chain(wildcard).cloned().collect()
    }

    fn remove(&self, id: SubscriptionId) -> bool {
        {
            let mut handlers = self.handlers.write();
            if let Some(pos) = handlers.iter().position(|h| h.id == id) {
                let entry = handlers.remove(pos);
                entry.active.store(false, Ordering::SeqCst);
                tracing::debug!(subscription = %id, "Handler removed");
                return true;
            }
        }

        if self.channels.write().remove(&id).is_some() {
            tracing::debug!(subscription = %id, "Channel receiver removed");
            return true;
        }

        false
    }

    /// Feed channel receivers. Drops receivers that fail to accept.
    fn broadcast_to_channels(&self, event: &Event) -> u64 {
        let mut to_remove = Vec::new();
        let mut delivered = 0;

        {
            let channels = self.channels.read();
            for (id, sub) in channels.iter() {
                if sub.filter.matches(event) {
                    if sub.try_send(event) {
                        delivered += 1;
                    } else {
                        to_remove.push(*id);
                    }
                }
            }
        }

        if !to_remove.is_empty() {
            let mut channels = self.channels.write();
            for id in to_remove {
                channels.remove(&id);
                tracing::warn!(subscription = %id, "Dropping channel receiver (full or disconnected)");
            }
        }

        delivered
    }

    fn record(&self, event_type: &str, delivered: u64, failures: u64) {
        let mut stats = self.stats.lock();
        stats.total_published += 1;
        *stats
            .published_by_type
            .entry(event_type.to_string())
            .or_default() += 1;
        *stats
            .delivered_by_type
            .entry(event_type.to_string())
            .or_default() += delivered;
        stats.handler_failures += failures;

        stats.recent.push_back(event_type.to_string());
        while stats.recent.len() > self.config.stats_window {
            stats.recent.pop_front();
        }
    }
}

/// In-process publish/subscribe bus.
///
/// Cloning is cheap and every clone shares the same registry, so one bus can
/// be constructed at start-up and handed to every fragment.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an event bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(EventBusConfig::default())
    }

    /// Create an event bus with custom configuration.
    pub fn with_config(config: EventBusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                handlers: RwLock::new(Vec::new()),
                channels: RwLock::new(HashMap::new()),
                stats: Mutex::new(StatsState::default()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Publish an event and wait for every matching handler to settle.
    ///
    /// Returns the event as delivered, with id and timestamp filled in.
    pub async fn publish(&self, input: EventInput) -> Event {
        let event = Arc::new(input.into_event());
        let targets = self.inner.targets(&event.event_type);

        let mut delivered = 0u64;
        let mut failures = 0u64;

        for entry in &targets {
            // Removed after the round started.
            if !entry.is_active() {
                continue;
            }
            delivered += 1;
            if let Err(err) = entry.invoke(&event).await {
                failures += 1;
                tracing::warn!(
                    subscription = %entry.id,
                    event_type = %event.event_type,
                    event_id = %event.id,
                    error = %err,
                    "Event handler failed"
                );
            }
        }

        let received = self.inner.broadcast_to_channels(&event);
        self.inner.record(&event.event_type, delivered, failures);

        if delivered == 0 && received == 0 {
            tracing::trace!(event_type = %event.event_type, "No subscribers for event");
        }

        Event::clone(&event)
    }

    /// Publish one of the well-known events.
    pub async fn publish_known(&self, source: &str, event: KnownEvent) -> Event {
        self.publish(event.into_input(source)).await
    }

    /// Subscribe a synchronous handler to one event type.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Topic::Exact(event_type.into()), Handler::Sync(Arc::new(handler)))
    }

    /// Subscribe an asynchronous handler to one event type.
    pub fn subscribe_async<F, Fut>(
        &self,
        event_type: impl Into<String>,
        handler: F,
    ) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| handler(event).boxed());
        self.register(Topic::Exact(event_type.into()), Handler::Async(handler))
    }

    /// Subscribe a synchronous handler to every event type.
    pub fn subscribe_wildcard<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(&Event) -> HandlerResult + Send + Sync + 'static,
    {
        self.register(Topic::Wildcard, Handler::Sync(Arc::new(handler)))
    }

    /// Subscribe an asynchronous handler to every event type.
    pub fn subscribe_wildcard_async<F, Fut>(&self, handler: F) -> SubscriptionHandle
    where
        F: Fn(Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: AsyncHandler = Arc::new(move |event| handler(event).boxed());
        self.register(Topic::Wildcard, Handler::Async(handler))
    }

    /// Subscribe a polling receiver.
    ///
    /// The receiver is dropped from the bus if its buffer fills up.
    pub fn subscribe_channel(&self, filter: EventFilter) -> EventReceiver {
        let id = self.next_id();
        let (sender, receiver) = bounded(self.inner.config.channel_buffer_size);
        self.inner
            .channels
            .write()
            .insert(id, ChannelSubscriber { filter, sender });
        tracing::debug!(subscription = %id, "Channel receiver added");
        EventReceiver { id, receiver }
    }

    /// Remove a handler or channel receiver. Unknown ids are a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.remove(id)
    }

    /// Number of handlers and channel receivers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.handlers.read().len() + self.inner.channels.read().len()
    }

    /// Snapshot of delivery statistics.
    pub fn stats(&self) -> BusStats {
        let mut subscribers_by_type: HashMap<String, usize> = HashMap::new();
        let mut wildcard_subscribers = 0;
        let handler_count = {
            let handlers = self.inner.handlers.read();
            for entry in handlers.iter() {
                match &entry.topic {
                    Topic::Exact(t) => *subscribers_by_type.entry(t.clone()).or_default() += 1,
                    Topic::Wildcard => wildcard_subscribers += 1,
                }
            }
            handlers.len()
        };
        let channel_subscribers = self.inner.channels.read().len();

        let stats = self.inner.stats.lock();
        let mut recent_by_type: HashMap<String, usize> = HashMap::new();
        for event_type in &stats.recent {
            *recent_by_type.entry(event_type.clone()).or_default() += 1;
        }

        BusStats {
            total_published: stats.total_published,
            published_by_type: stats.published_by_type.clone(),
            delivered_by_type: stats.delivered_by_type.clone(),
            handler_failures: stats.handler_failures,
            subscribers_by_type,
            wildcard_subscribers,
            channel_subscribers,
            total_subscribers: handler_count + channel_subscribers,
            recent_by_type,
        }
    }

    /// Get the current configuration.
    pub fn config(&self) -> &EventBusConfig {
        &self.inner.config
    }

    fn next_id(&self) -> SubscriptionId {
        SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn register(&self, topic: Topic, handler: Handler) -> SubscriptionHandle {
        let id = self.next_id();
        tracing::debug!(subscription = %id, topic = ?topic, "Handler added");
        self.inner.handlers.write().push(Arc::new(HandlerEntry {
            id,
            topic,
            handler,
            active: AtomicBool::new(true),
        }));

        let inner = Arc::downgrade(&self.inner);
        SubscriptionHandle::new(id, move |id| {
            inner.upgrade().map(|inner| inner.remove(id)).unwrap_or(false)
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("config", &self.inner.config)
            .finish()
    }
}
