//! Event and subscription types for the bus.

use crate::types::{SubscriptionId, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Configuration for the event bus.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Number of recently processed events kept for statistics.
    /// Default: 1000
    pub stats_window: usize,

    /// Buffered events per channel receiver before it is dropped.
    /// Default: 1000
    pub channel_buffer_size: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            stats_window: 1000,
            channel_buffer_size: 1000,
        }
    }
}

/// A published event. Immutable once published.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub source: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: Timestamp,
}

/// Input for publishing an event (before id/timestamp are filled in).
#[derive(Clone, Debug)]
pub struct EventInput {
    pub id: Option<String>,
    pub event_type: String,
    pub source: String,
    pub data: serde_json::Value,
    pub timestamp: Option<Timestamp>,
}

impl EventInput {
    /// Create an event input with a JSON payload.
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            source: source.into(),
            data,
            timestamp: None,
        }
    }

    /// Use a caller-chosen id instead of a generated one.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Use a caller-chosen timestamp instead of the publish time.
    pub fn with_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Fill in the missing id and timestamp.
    pub(crate) fn into_event(self) -> Event {
        Event {
            id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            event_type: self.event_type,
            source: self.source,
            data: self.data,
            timestamp: self.timestamp.unwrap_or_else(Timestamp::now),
        }
    }
}

impl From<Event> for EventInput {
    fn from(event: Event) -> Self {
        Self {
            id: Some(event.id),
            event_type: event.event_type,
            source: event.source,
            data: event.data,
            timestamp: Some(event.timestamp),
        }
    }
}

/// Which events a channel receiver wants.
#[derive(Clone, Debug, Default)]
pub enum EventFilter {
    /// Every event.
    #[default]
    All,
    /// Events whose type is one of these.
    Types(Vec<String>),
}

impl EventFilter {
    /// Filter for a single event type.
    pub fn event_type(event_type: impl Into<String>) -> Self {
        EventFilter::Types(vec![event_type.into()])
    }

    /// Check if an event matches this filter.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Types(types) => types.iter().any(|t| t == &event.event_type),
        }
    }
}

/// Delivery statistics. Observability only.
#[derive(Clone, Debug, Default, Serialize)]
pub struct BusStats {
    /// Events published, total.
    pub total_published: u64,
    /// Events published per type.
    pub published_by_type: HashMap<String, u64>,
    /// Handler invocations per event type.
    pub delivered_by_type: HashMap<String, u64>,
    /// Handlers that returned an error or panicked.
    pub handler_failures: u64,
    /// Exact-type handlers per event type.
    pub subscribers_by_type: HashMap<String, usize>,
    /// Wildcard handlers.
    pub wildcard_subscribers: usize,
    /// Channel receivers.
    pub channel_subscribers: usize,
    /// All handlers and receivers.
    pub total_subscribers: usize,
    /// Event types within the rolling window of recent events.
    pub recent_by_type: HashMap<String, usize>,
}

/// Receiving side of a channel subscription.
pub struct EventReceiver {
    pub id: SubscriptionId,
    /// Channel to receive events.
    pub receiver: crossbeam_channel::Receiver<Event>,
}

impl EventReceiver {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> Result<Event, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(&self) -> Result<Event, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> Result<Event, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
