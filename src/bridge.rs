//! Forwarding between the connection pool and the event bus.
//!
//! Fragments that only care about events can listen to remote channels
//! without holding a pool reference: a [`ChannelBridge`] republishes every
//! inbound channel message as a bus event, and [`forward_notifications`]
//! turns pool notifications into `connection-status` events.

use crate::error::{Result, SwitchboardError};
use crate::events::{taxonomy, EventBus, EventInput, KnownEvent};
use crate::pool::{ChannelMessage, ConnectionPool, PoolNotification};
use crate::types::SubscriptionHandle;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Source recorded on events republished from the pool itself.
pub const POOL_SOURCE: &str = "pool";

/// Event source for messages forwarded from `channel`.
pub fn channel_source(channel: &str) -> String {
    format!("channel:{channel}")
}

/// Republishes one channel's inbound messages on the bus.
///
/// Messages are queued by the channel subscriber and published by a single
/// task, so bus handlers see them in arrival order.
#[derive(Debug)]
pub struct ChannelBridge {
    channel: String,
    subscription: SubscriptionHandle,
    task: JoinHandle<()>,
}

impl ChannelBridge {
    /// Subscribe to `channel` (opening it at `url` if needed) and forward.
    pub fn forward(pool: &ConnectionPool, bus: &EventBus, channel: &str, url: &str) -> Result<Self> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SwitchboardError::NoRuntime("forward channel messages"))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ChannelMessage>();
        let subscription = pool.subscribe(
            channel,
            move |message| {
                // Receiver gone means the bridge is stopping
                let _ = tx.send(message.clone());
            },
            Some(url),
        )?;

        let bus = bus.clone();
        let source = channel_source(channel);
        let task = runtime.spawn(async move {
            while let Some(message) = rx.recv().await {
                bus.publish(message_event(&source, message)).await;
            }
            tracing::debug!(source = %source, "Channel bridge finished");
        });

        tracing::debug!(channel = %channel, "Channel bridge started");
        Ok(Self {
            channel: channel.to_string(),
            subscription,
            task,
        })
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Stop forwarding. Messages already queued are still published.
    ///
    /// If this bridge was the channel's last subscriber, the channel closes.
    pub fn stop(self) -> bool {
        // The forwarding task ends once the subscriber (and its sender) is dropped
        let removed = self.subscription.unsubscribe();
        tracing::debug!(channel = %self.channel, removed, "Channel bridge stopped");
        removed
    }

    /// Stop forwarding and drop anything still queued.
    pub fn abort(self) -> bool {
        self.task.abort();
        self.subscription.unsubscribe()
    }
}

fn message_event(source: &str, message: ChannelMessage) -> EventInput {
    let ChannelMessage {
        message_type,
        data,
        timestamp,
        ..
    } = message;
    let input = EventInput::new(message_type, source, data.unwrap_or(Value::Null));
    match timestamp {
        Some(timestamp) => input.with_timestamp(timestamp),
        None => input,
    }
}

/// Publish every pool notification as a `connection-status` event.
///
/// Runs until the pool is dropped or the task is aborted. Notifications
/// missed because the bus fell behind are logged and skipped.
pub fn forward_notifications(pool: &ConnectionPool, bus: &EventBus) -> Result<JoinHandle<()>> {
    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|_| SwitchboardError::NoRuntime("forward pool notifications"))?;
    let mut notifications = pool.notifications();
    let bus = bus.clone();

    Ok(runtime.spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(notification) => {
                    bus.publish_known(POOL_SOURCE, status_event(&notification)).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Pool notifications skipped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!(event_type = taxonomy::CONNECTION_STATUS, "Notification forwarding finished");
    }))
}

/// The `connection-status` event for a pool notification.
pub fn status_event(notification: &PoolNotification) -> KnownEvent {
    let detail = match notification {
        PoolNotification::Connected { url, .. } => Some(url.clone()),
        PoolNotification::Disconnected { reason, .. } => Some(reason.to_string()),
        PoolNotification::Error { message, .. } => Some(message.clone()),
        PoolNotification::Reconnecting {
            attempt, delay_ms, ..
        } => Some(format!("attempt {attempt} in {delay_ms}ms")),
        PoolNotification::ReconnectFailed { attempts, .. } => {
            Some(format!("gave up after {attempts} attempts"))
        }
        PoolNotification::HeartbeatMissed { missed, .. } => Some(format!("{missed} missed")),
    };
    KnownEvent::ConnectionStatus {
        channel: notification.channel().to_string(),
        status: notification.status().to_string(),
        detail,
    }
}
