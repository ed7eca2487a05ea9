//! Connection pool for live channels.
//!
//! Channels are named by key and multiplexed: however many fragments
//! subscribe to `"orders"`, one transport carries it. The pool runs a
//! heartbeat on every open channel, reconnects with exponential backoff
//! after unexpected closes and reports everything that happens through
//! [`ConnectionPool::notifications`].
//!
//! # Example
//!
//! ```ignore
//! let pool = ConnectionPool::new(PoolConfig::default());
//! let handle = pool.subscribe(
//!     "orders",
//!     |msg| println!("{}: {:?}", msg.message_type, msg.data),
//!     Some("wss://example.com/orders"),
//! )?;
//!
//! pool.send("orders", &ChannelMessage::new("subscribe"));
//! handle.unsubscribe(); // last subscriber: the channel closes
//! ```

mod backoff;
mod manager;
mod transport;
mod types;

pub use backoff::reconnect_delay;
pub use manager::{ConnectionHandle, ConnectionPool};
pub use transport::{Connector, TransportFrame, TransportLink, WebSocketConnector};
pub use types::{
    ChannelMessage, ConnectionState, ConnectionStatus, DisconnectReason, HealthReport,
    HeartbeatPolicy, PoolConfig, PoolNotification, PING, PONG,
};
