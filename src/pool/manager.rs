//! The connection pool.
//!
//! Each channel key is driven by exactly one task at a time. The task runs
//! the connect attempt, the open session (heartbeat and inbound fan-out) and
//! the reconnect backoff, so inbound messages reach subscribers in arrival
//! order. Every task carries the generation it was started for; once the
//! channel is closed or restarted its writes to the shared table are
//! ignored.

use crate::error::{panic_message, Result, SwitchboardError};
use crate::types::{SubscriptionHandle, SubscriptionId, Timestamp};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::backoff::reconnect_delay;
use super::transport::{Connector, TransportFrame, TransportLink, WebSocketConnector};
use super::types::{
    ChannelMessage, ConnectionState, ConnectionStatus, DisconnectReason, HealthReport,
    HeartbeatPolicy, PoolConfig, PoolNotification, PING,
};

type MessageCallback = Arc<dyn Fn(&ChannelMessage) + Send + Sync>;

struct ChannelSubscriber {
    id: SubscriptionId,
    callback: MessageCallback,
    active: AtomicBool,
}

/// Why an open attempt failed. Cloned to every waiting caller.
#[derive(Clone, Debug)]
enum OpenFailure {
    Timeout(u64),
    Transport(String),
}

impl OpenFailure {
    fn into_error(self, channel: &str) -> SwitchboardError {
        match self {
            OpenFailure::Timeout(timeout_ms) => SwitchboardError::ConnectTimeout {
                channel: channel.to_string(),
                timeout_ms,
            },
            OpenFailure::Transport(message) => SwitchboardError::Transport {
                channel: channel.to_string(),
                message,
            },
        }
    }
}

impl std::fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenFailure::Timeout(ms) => write!(f, "connect timed out after {ms}ms"),
            OpenFailure::Transport(message) => f.write_str(message),
        }
    }
}

type OpenWaiter = oneshot::Sender<std::result::Result<(), OpenFailure>>;

struct ChannelEntry {
    url: String,
    state: ConnectionState,
    outbound: Option<mpsc::Sender<String>>,
    subscribers: Vec<Arc<ChannelSubscriber>>,
    reconnect_attempts: u32,
    last_heartbeat: Option<Timestamp>,
    missed_heartbeats: u32,
    cancel: CancellationToken,
    generation: u64,
    /// Callers of `get_connection` waiting for the next attempt's outcome.
    waiters: Vec<OpenWaiter>,
}

impl ChannelEntry {
    fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            state: ConnectionState::Closed,
            outbound: None,
            subscribers: Vec::new(),
            reconnect_attempts: 0,
            last_heartbeat: None,
            missed_heartbeats: 0,
            cancel: CancellationToken::new(),
            generation: 0,
            waiters: Vec::new(),
        }
    }

    fn status(&self, channel: &str) -> ConnectionStatus {
        ConnectionStatus {
            channel: channel.to_string(),
            url: self.url.clone(),
            state: self.state,
            reconnect_attempts: self.reconnect_attempts,
            subscribers: self.subscribers.len(),
            last_heartbeat: self.last_heartbeat,
            missed_heartbeats: self.missed_heartbeats,
        }
    }

    fn resolve_waiters(&mut self, outcome: std::result::Result<(), OpenFailure>) {
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(outcome.clone());
        }
    }
}

/// How an open session ended.
enum SessionEnd {
    Cancelled,
    Dropped(DisconnectReason),
}

struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    channels: Mutex<HashMap<String, ChannelEntry>>,
    notifications: broadcast::Sender<PoolNotification>,
    next_subscription: AtomicU64,
    next_generation: AtomicU64,
}

impl PoolInner {
    fn emit(&self, notification: PoolNotification) {
        // No receivers is fine
        let _ = self.notifications.send(notification);
    }

    /// (Re)start the driver for a channel with a zeroed attempt counter.
    fn start(self: &Arc<Self>, key: &str, entry: &mut ChannelEntry, runtime: &tokio::runtime::Handle) {
        entry.cancel.cancel();
        entry.cancel = CancellationToken::new();
        entry.generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        entry.state = ConnectionState::Connecting;
        entry.reconnect_attempts = 0;
        entry.missed_heartbeats = 0;
        entry.outbound = None;

        tracing::debug!(channel = %key, url = %entry.url, generation = entry.generation, "Starting channel");
        runtime.spawn(Arc::clone(self).drive(
            key.to_string(),
            entry.generation,
            entry.cancel.clone(),
        ));
    }

    async fn drive(self: Arc<Self>, key: String, generation: u64, cancel: CancellationToken) {
        loop {
            let Some(url) = self.with_entry(&key, generation, |entry| entry.url.clone()) else {
                return;
            };

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return,
                attempt = time::timeout(self.config.connect_timeout(), self.connector.connect(&url)) => attempt,
            };

            match attempt {
                Ok(Ok(link)) => {
                    let TransportLink { outbound, inbound } = link;
                    if !self.mark_open(&key, generation, &url, outbound.clone()) {
                        return;
                    }
                    match self.session(&key, generation, inbound, outbound, &cancel).await {
                        SessionEnd::Cancelled => return,
                        SessionEnd::Dropped(reason) => self.mark_dropped(&key, generation, reason),
                    }
                }
                Ok(Err(e)) => {
                    let message = match e {
                        SwitchboardError::Transport { message, .. } => message,
                        other => other.to_string(),
                    };
                    self.mark_attempt_failed(&key, generation, OpenFailure::Transport(message));
                }
                Err(_) => {
                    let timeout_ms = self.config.connect_timeout_ms;
                    self.mark_attempt_failed(&key, generation, OpenFailure::Timeout(timeout_ms));
                }
            }

            let Some(delay) = self.schedule_reconnect(&key, generation) else {
                return;
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = time::sleep(delay) => {}
            }
        }
    }

    /// Heartbeat and inbound fan-out for an open transport.
    async fn session(
        &self,
        key: &str,
        generation: u64,
        mut inbound: mpsc::Receiver<TransportFrame>,
        outbound: mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let period = self.config.heartbeat_interval();
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        let mut awaiting_pong = false;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return SessionEnd::Cancelled,

                _ = heartbeat.tick() => {
                    if awaiting_pong {
                        let missed = self
                            .with_entry(key, generation, |entry| {
                                entry.missed_heartbeats += 1;
                                entry.missed_heartbeats
                            })
                            .unwrap_or(0);
                        tracing::debug!(channel = %key, missed, "Heartbeat unanswered");
                        self.emit(PoolNotification::HeartbeatMissed {
                            channel: key.to_string(),
                            missed,
                        });
                        if let HeartbeatPolicy::CloseAfter(limit) = self.config.heartbeat_policy {
                            if missed >= limit.max(1) {
                                return SessionEnd::Dropped(DisconnectReason::HeartbeatTimeout);
                            }
                        }
                    }
                    match ChannelMessage::new(PING).stamped_json() {
                        Ok(ping) => {
                            if outbound.try_send(ping).is_err() {
                                tracing::debug!(channel = %key, "Heartbeat probe not sent");
                            }
                        }
                        Err(e) => tracing::warn!(channel = %key, error = %e, "Failed to encode heartbeat"),
                    }
                    awaiting_pong = true;
                }

                frame = inbound.recv() => match frame {
                    Some(TransportFrame::Text(text)) => match serde_json::from_str::<ChannelMessage>(&text) {
                        Ok(message) if message.is_pong() => {
                            awaiting_pong = false;
                            self.with_entry(key, generation, |entry| {
                                entry.last_heartbeat = Some(Timestamp::now());
                                entry.missed_heartbeats = 0;
                            });
                        }
                        Ok(message) => self.fan_out(key, generation, &message),
                        Err(e) => {
                            tracing::warn!(channel = %key, error = %e, "Dropping malformed inbound frame");
                        }
                    },
                    Some(TransportFrame::Error(message)) => {
                        self.emit(PoolNotification::Error {
                            channel: key.to_string(),
                            message: message.clone(),
                        });
                        return SessionEnd::Dropped(DisconnectReason::TransportError(message));
                    }
                    Some(TransportFrame::Closed(reason)) => {
                        return SessionEnd::Dropped(DisconnectReason::Remote(reason));
                    }
                    None => return SessionEnd::Dropped(DisconnectReason::Remote(None)),
                },
            }
        }
    }

    /// Run `f` on the entry if it still belongs to this generation.
    fn with_entry<T>(
        &self,
        key: &str,
        generation: u64,
        f: impl FnOnce(&mut ChannelEntry) -> T,
    ) -> Option<T> {
        let mut channels = self.channels.lock();
        match channels.get_mut(key) {
            Some(entry) if entry.generation == generation => Some(f(entry)),
            _ => None,
        }
    }

    fn mark_open(&self, key: &str, generation: u64, url: &str, outbound: mpsc::Sender<String>) -> bool {
        let opened = self.with_entry(key, generation, |entry| {
            entry.state = ConnectionState::Open;
            entry.outbound = Some(outbound);
            entry.reconnect_attempts = 0;
            entry.missed_heartbeats = 0;
            entry.resolve_waiters(Ok(()));
        });
        if opened.is_none() {
            return false;
        }
        tracing::info!(channel = %key, url = %url, "Channel open");
        self.emit(PoolNotification::Connected {
            channel: key.to_string(),
            url: url.to_string(),
        });
        true
    }

    fn mark_dropped(&self, key: &str, generation: u64, reason: DisconnectReason) {
        let dropped = self.with_entry(key, generation, |entry| {
            entry.outbound = None;
            entry.state = ConnectionState::Reconnecting;
        });
        if dropped.is_some() {
            tracing::warn!(channel = %key, reason = %reason, "Channel closed unexpectedly");
            self.emit(PoolNotification::Disconnected {
                channel: key.to_string(),
                reason,
            });
        }
    }

    fn mark_attempt_failed(&self, key: &str, generation: u64, failure: OpenFailure) {
        let failed = self.with_entry(key, generation, |entry| {
            entry.resolve_waiters(Err(failure.clone()));
        });
        if failed.is_some() {
            tracing::warn!(channel = %key, error = %failure, "Connect attempt failed");
            self.emit(PoolNotification::Error {
                channel: key.to_string(),
                message: failure.to_string(),
            });
        }
    }

    /// Count an attempt. `None` means stop: exhausted, closed or restarted.
    fn schedule_reconnect(&self, key: &str, generation: u64) -> Option<Duration> {
        let max_attempts = self.config.max_reconnect_attempts;
        let attempt = self.with_entry(key, generation, |entry| {
            entry.reconnect_attempts += 1;
            if entry.reconnect_attempts > max_attempts {
                entry.state = ConnectionState::Failed;
                entry.outbound = None;
                None
            } else {
                entry.state = ConnectionState::Reconnecting;
                Some(entry.reconnect_attempts)
            }
        })?;

        match attempt {
            Some(attempt) => {
                let delay = reconnect_delay(self.config.reconnect_base_delay(), attempt);
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                tracing::warn!(channel = %key, attempt, delay_ms, "Reconnecting");
                self.emit(PoolNotification::Reconnecting {
                    channel: key.to_string(),
                    attempt,
                    delay_ms,
                });
                Some(delay)
            }
            None => {
                tracing::error!(channel = %key, attempts = max_attempts, "Reconnect attempts exhausted");
                self.emit(PoolNotification::ReconnectFailed {
                    channel: key.to_string(),
                    attempts: max_attempts,
                });
                None
            }
        }
    }

    fn fan_out(&self, key: &str, generation: u64, message: &ChannelMessage) {
        let Some(subscribers) = self.with_entry(key, generation, |entry| entry.subscribers.clone()) else {
            return;
        };
        for subscriber in subscribers {
            // Removed earlier in this round
            if !subscriber.active.load(Ordering::SeqCst) {
                continue;
            }
            let callback = Arc::clone(&subscriber.callback);
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(message))) {
                tracing::warn!(
                    channel = %key,
                    subscription = %subscriber.id,
                    message_type = %message.message_type,
                    error = %panic_message(panic),
                    "Channel subscriber failed"
                );
            }
        }
    }

    fn close(&self, key: &str, reason: DisconnectReason) -> bool {
        let Some(entry) = self.channels.lock().remove(key) else {
            return false;
        };
        entry.cancel.cancel();
        for subscriber in &entry.subscribers {
            subscriber.active.store(false, Ordering::SeqCst);
        }
        tracing::info!(channel = %key, reason = %reason, "Channel closed");
        self.emit(PoolNotification::Disconnected {
            channel: key.to_string(),
            reason,
        });
        true
    }

    fn remove_subscriber(&self, key: &str, id: SubscriptionId) -> bool {
        let now_idle = {
            let mut channels = self.channels.lock();
            let Some(entry) = channels.get_mut(key) else {
                return false;
            };
            let Some(pos) = entry.subscribers.iter().position(|s| s.id == id) else {
                return false;
            };
            let subscriber = entry.subscribers.remove(pos);
            subscriber.active.store(false, Ordering::SeqCst);
            entry.subscribers.is_empty()
        };
        tracing::debug!(channel = %key, subscription = %id, "Channel subscriber removed");
        if now_idle {
            self.close(key, DisconnectReason::Idle);
        }
        true
    }

    fn send(&self, key: &str, message: &ChannelMessage) -> bool {
        let outbound = {
            let channels = self.channels.lock();
            match channels.get(key) {
                Some(entry) if entry.state == ConnectionState::Open => entry.outbound.clone(),
                _ => None,
            }
        };
        let Some(outbound) = outbound else {
            tracing::debug!(channel = %key, "Send on a channel that is not open");
            return false;
        };
        match message.stamped_json() {
            Ok(text) => outbound.try_send(text).is_ok(),
            Err(e) => {
                tracing::warn!(channel = %key, error = %e, "Failed to encode outbound message");
                false
            }
        }
    }

    fn is_open(&self, key: &str) -> bool {
        self.channels
            .lock()
            .get(key)
            .map(|entry| entry.state == ConnectionState::Open)
            .unwrap_or(false)
    }
}

/// Handle to a pooled channel.
///
/// Holds the channel key, not the transport; the pool keeps exclusive
/// ownership of the socket.
#[derive(Clone)]
pub struct ConnectionHandle {
    key: String,
    pool: Weak<PoolInner>,
}

impl ConnectionHandle {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_open(&self) -> bool {
        self.pool
            .upgrade()
            .map(|pool| pool.is_open(&self.key))
            .unwrap_or(false)
    }

    /// Same as [`ConnectionPool::send`] on this channel.
    pub fn send(&self, message: &ChannelMessage) -> bool {
        self.pool
            .upgrade()
            .map(|pool| pool.send(&self.key, message))
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.key)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Multiplexed live channels keyed by name.
///
/// At most one transport exists per channel key. Channels reconnect with
/// exponential backoff after unexpected closes and are reclaimed when their
/// last subscriber leaves. Cloning is cheap and clones share the pool.
///
/// Channel tasks keep the pool alive; call [`ConnectionPool::close_all`]
/// on shutdown.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Pool over WebSocket transports.
    pub fn new(config: PoolConfig) -> Self {
        let connector = WebSocketConnector::with_buffer(config.outbound_buffer);
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: PoolConfig, connector: impl Connector) -> Self {
        Self::with_shared_connector(config, Arc::new(connector))
    }

    pub fn with_shared_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let (notifications, _) = broadcast::channel(config.notification_buffer.max(1));
        Self {
            inner: Arc::new(PoolInner {
                config,
                connector,
                channels: Mutex::new(HashMap::new()),
                notifications,
                next_subscription: AtomicU64::new(1),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Get an open channel, opening it if needed.
    ///
    /// Concurrent callers for the same channel share one open attempt. A
    /// failed or timed-out attempt is returned as an error while the channel
    /// carries on into its reconnect schedule. A `Failed` or closed channel
    /// is restarted.
    pub async fn get_connection(&self, key: &str, url: &str) -> Result<ConnectionHandle> {
        let runtime = runtime_handle()?;
        let waiter = {
            let mut channels = self.inner.channels.lock();
            let entry = channels
                .entry(key.to_string())
                .or_insert_with(|| ChannelEntry::new(url));
            match entry.state {
                ConnectionState::Open => return Ok(self.handle(key)),
                ConnectionState::Connecting | ConnectionState::Reconnecting => {}
                ConnectionState::Closed | ConnectionState::Failed => {
                    entry.url = url.to_string();
                    self.inner.start(key, entry, &runtime);
                }
            }
            let (tx, rx) = oneshot::channel();
            entry.waiters.push(tx);
            rx
        };

        match waiter.await {
            Ok(Ok(())) => Ok(self.handle(key)),
            Ok(Err(failure)) => Err(failure.into_error(key)),
            Err(_) => Err(SwitchboardError::Transport {
                channel: key.to_string(),
                message: "channel closed before it opened".to_string(),
            }),
        }
    }

    /// Subscribe to inbound messages on a channel.
    ///
    /// With a `url`, a missing channel is created (and a failed one
    /// restarted). Without one, an unknown channel is an error. Removing the
    /// last subscriber closes the channel.
    pub fn subscribe<F>(&self, key: &str, callback: F, url: Option<&str>) -> Result<SubscriptionHandle>
    where
        F: Fn(&ChannelMessage) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_subscription.fetch_add(1, Ordering::SeqCst));
        {
            let mut channels = self.inner.channels.lock();
            if !channels.contains_key(key) {
                let Some(url) = url else {
                    return Err(SwitchboardError::ChannelNotFound(key.to_string()));
                };
                let runtime = runtime_handle()?;
                let mut entry = ChannelEntry::new(url);
                self.inner.start(key, &mut entry, &runtime);
                channels.insert(key.to_string(), entry);
            } else if let Some(url) = url {
                if let Some(entry) = channels.get_mut(key) {
                    if matches!(entry.state, ConnectionState::Failed | ConnectionState::Closed) {
                        let runtime = runtime_handle()?;
                        entry.url = url.to_string();
                        self.inner.start(key, entry, &runtime);
                    }
                }
            }

            if let Some(entry) = channels.get_mut(key) {
                entry.subscribers.push(Arc::new(ChannelSubscriber {
                    id,
                    callback: Arc::new(callback),
                    active: AtomicBool::new(true),
                }));
            }
        }
        tracing::debug!(channel = %key, subscription = %id, "Channel subscriber added");

        let pool = Arc::downgrade(&self.inner);
        let key = key.to_string();
        Ok(SubscriptionHandle::new(id, move |id| {
            pool.upgrade()
                .map(|pool| pool.remove_subscriber(&key, id))
                .unwrap_or(false)
        }))
    }

    /// Remove a channel subscriber.
    pub fn unsubscribe(&self, key: &str, id: SubscriptionId) -> bool {
        self.inner.remove_subscriber(key, id)
    }

    /// Stamp and write a message. `false` if the channel is not open or its
    /// outbound buffer is full.
    pub fn send(&self, key: &str, message: &ChannelMessage) -> bool {
        self.inner.send(key, message)
    }

    /// Send to every open channel. Returns how many accepted the message.
    pub fn broadcast(&self, message: &ChannelMessage) -> usize {
        let keys: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        keys.iter()
            .filter(|key| self.inner.send(key, message))
            .count()
    }

    /// Close a channel. No reconnect follows. Its subscribers are dropped.
    pub fn close_connection(&self, key: &str) -> bool {
        self.inner.close(key, DisconnectReason::Explicit)
    }

    /// Close every channel.
    pub fn close_all(&self) -> usize {
        let keys: Vec<String> = self.inner.channels.lock().keys().cloned().collect();
        keys.iter()
            .filter(|key| self.inner.close(key, DisconnectReason::Explicit))
            .count()
    }

    pub fn connection_status(&self, key: &str) -> Option<ConnectionStatus> {
        self.inner.channels.lock().get(key).map(|entry| entry.status(key))
    }

    pub fn health_check(&self) -> HealthReport {
        let channels = self.inner.channels.lock();
        let statuses: std::collections::BTreeMap<String, ConnectionStatus> = channels
            .iter()
            .map(|(key, entry)| (key.clone(), entry.status(key)))
            .collect();
        HealthReport {
            total: statuses.len(),
            open: statuses
                .values()
                .filter(|s| s.state == ConnectionState::Open)
                .count(),
            channels: statuses,
        }
    }

    /// Receiver for pool notifications emitted from now on.
    pub fn notifications(&self) -> broadcast::Receiver<PoolNotification> {
        self.inner.notifications.subscribe()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn handle(&self, key: &str) -> ConnectionHandle {
        ConnectionHandle {
            key: key.to_string(),
            pool: Arc::downgrade(&self.inner),
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("channels", &self.inner.channels.lock().len())
            .field("config", &self.inner.config)
            .finish()
    }
}

fn runtime_handle() -> Result<tokio::runtime::Handle> {
    tokio::runtime::Handle::try_current()
        .map_err(|_| SwitchboardError::NoRuntime("drive pooled channels"))
}
