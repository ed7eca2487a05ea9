//! Channel messages, notifications and pool configuration.

use crate::types::Timestamp;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Heartbeat probe type.
pub const PING: &str = "ping";

/// Heartbeat reply type. Never fanned out to subscribers.
pub const PONG: &str = "pong";

/// What to do when heartbeat probes go unanswered.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "misses", rename_all = "snake_case")]
pub enum HeartbeatPolicy {
    /// Report misses; only the transport's own close ends the channel.
    #[default]
    Observe,
    /// Treat this many consecutive misses as an unexpected close.
    CloseAfter(u32),
}

/// Pool configuration. Durations are in milliseconds.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Bound on a single connect attempt.
    /// Default: 10000
    pub connect_timeout_ms: u64,

    /// Interval between heartbeat probes on an open channel.
    /// Default: 30000
    pub heartbeat_interval_ms: u64,

    /// First reconnect delay; doubles with every further attempt.
    /// Default: 1000
    pub reconnect_base_delay_ms: u64,

    /// Reconnect attempts before the channel is given up.
    /// Default: 5
    pub max_reconnect_attempts: u32,

    pub heartbeat_policy: HeartbeatPolicy,

    /// Outbound frames buffered per channel before `send` reports failure.
    /// Default: 256
    pub outbound_buffer: usize,

    /// Notifications buffered per `notifications()` receiver.
    /// Default: 256
    pub notification_buffer: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            reconnect_base_delay_ms: 1_000,
            max_reconnect_attempts: 5,
            heartbeat_policy: HeartbeatPolicy::Observe,
            outbound_buffer: 256,
            notification_buffer: 256,
        }
    }
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        // A zero period would make the interval timer panic
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }
}

/// Lifecycle state of a pooled channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// First connect attempt in flight.
    Connecting,
    Open,
    /// Waiting for, or running, a reconnect attempt.
    Reconnecting,
    Closed,
    /// Reconnect attempts exhausted. Restarted by an explicit request.
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Open => "open",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Closed => "closed",
            ConnectionState::Failed => "failed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A frame on a channel: `{type, channel?, data?, timestamp}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelMessage {
    #[serde(rename = "type")]
    pub message_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    /// Stamped by the pool on send. Inbound, both ISO-8601 strings and
    /// epoch milliseconds are accepted; anything else reads as absent.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "lenient_timestamp"
    )]
    pub timestamp: Option<Timestamp>,
}

impl ChannelMessage {
    pub fn new(message_type: impl Into<String>) -> Self {
        Self {
            message_type: message_type.into(),
            channel: None,
            data: None,
            timestamp: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    pub fn is_pong(&self) -> bool {
        self.message_type == PONG
    }

    /// Serialize with a fresh send timestamp.
    pub(crate) fn stamped_json(&self) -> serde_json::Result<String> {
        let mut stamped = self.clone();
        stamped.timestamp = Some(Timestamp::now());
        serde_json::to_string(&stamped)
    }
}

fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<Timestamp>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .ok()
            .map(|dt| Timestamp(dt.with_timezone(&Utc))),
        Some(Value::Number(n)) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .map(Timestamp),
        _ => None,
    })
}

/// Why a channel stopped being open.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DisconnectReason {
    /// `close_connection` or `close_all`.
    Explicit,
    /// The last subscriber left.
    Idle,
    /// The remote side closed, with its reason if it gave one.
    Remote(Option<String>),
    /// The transport reported an error.
    TransportError(String),
    /// Too many unanswered heartbeats under `HeartbeatPolicy::CloseAfter`.
    HeartbeatTimeout,
}

impl DisconnectReason {
    /// Whether the pool will try to reconnect.
    pub fn is_unexpected(&self) -> bool {
        !matches!(self, DisconnectReason::Explicit | DisconnectReason::Idle)
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Explicit => write!(f, "closed"),
            DisconnectReason::Idle => write!(f, "no subscribers left"),
            DisconnectReason::Remote(Some(reason)) => write!(f, "remote closed: {reason}"),
            DisconnectReason::Remote(None) => write!(f, "remote closed"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {e}"),
            DisconnectReason::HeartbeatTimeout => write!(f, "heartbeat timed out"),
        }
    }
}

/// Pool-level notification, keyed by channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PoolNotification {
    Connected {
        channel: String,
        url: String,
    },
    Disconnected {
        channel: String,
        reason: DisconnectReason,
    },
    Error {
        channel: String,
        message: String,
    },
    Reconnecting {
        channel: String,
        attempt: u32,
        delay_ms: u64,
    },
    /// Terminal: emitted once when attempts are exhausted.
    ReconnectFailed {
        channel: String,
        attempts: u32,
    },
    HeartbeatMissed {
        channel: String,
        missed: u32,
    },
}

impl PoolNotification {
    pub fn channel(&self) -> &str {
        match self {
            PoolNotification::Connected { channel, .. }
            | PoolNotification::Disconnected { channel, .. }
            | PoolNotification::Error { channel, .. }
            | PoolNotification::Reconnecting { channel, .. }
            | PoolNotification::ReconnectFailed { channel, .. }
            | PoolNotification::HeartbeatMissed { channel, .. } => channel,
        }
    }

    /// Short status word, suitable for a UI banner.
    pub fn status(&self) -> &'static str {
        match self {
            PoolNotification::Connected { .. } => "connected",
            PoolNotification::Disconnected { .. } => "disconnected",
            PoolNotification::Error { .. } => "error",
            PoolNotification::Reconnecting { .. } => "reconnecting",
            PoolNotification::ReconnectFailed { .. } => "reconnect-failed",
            PoolNotification::HeartbeatMissed { .. } => "heartbeat-missed",
        }
    }
}

/// Read-only view of one channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConnectionStatus {
    pub channel: String,
    pub url: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub subscribers: usize,
    pub last_heartbeat: Option<Timestamp>,
    pub missed_heartbeats: u32,
}

/// Read-only view of the whole pool.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HealthReport {
    pub total: usize,
    pub open: usize,
    pub channels: BTreeMap<String, ConnectionStatus>,
}
