//! # Switchboard
//!
//! Communication core for independently loaded UI fragments sharing one
//! host page.
//!
//! ## Core Concepts
//!
//! - **Events**: Publish/subscribe bus with exact-type and wildcard handlers
//! - **State**: One document of named slices, changed only through actions,
//!   with middleware, undo/redo history and snapshots
//! - **Channels**: Pooled live connections with heartbeat, backoff
//!   reconnection and fan-out to every subscriber
//!
//! ## Example
//!
//! ```ignore
//! use switchboard::{Switchboard, SwitchboardConfig, KnownAction, taxonomy};
//!
//! let hub = Switchboard::new(SwitchboardConfig::default());
//!
//! // React to theme changes from any fragment
//! let handle = hub.bus().subscribe(taxonomy::THEME_CHANGE, |event| {
//!     println!("theme: {}", event.data["theme"]);
//!     Ok(())
//! });
//!
//! // Shared state with history
//! hub.store().dispatch(KnownAction::SetTheme("dark".into())).await?;
//! hub.store().undo().await?;
//!
//! // Live channel republished on the bus
//! let bridge = hub.bridge("orders", "wss://example.com/orders")?;
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod events;
pub mod hub;
pub mod lifecycle;
pub mod pool;
pub mod state;
pub mod storage;
pub mod types;

// Re-exports
pub use bridge::{forward_notifications, ChannelBridge};
pub use config::SwitchboardConfig;
pub use error::{HandlerError, MiddlewareError, Result, SwitchboardError};
pub use events::{
    taxonomy, BusStats, Event, EventBus, EventBusConfig, EventFilter, EventInput, EventReceiver,
    HandlerResult, KnownEvent,
};
pub use hub::Switchboard;
pub use lifecycle::LifecycleHooks;
pub use pool::{
    ChannelMessage, ConnectionHandle, ConnectionPool, ConnectionState, ConnectionStatus,
    Connector, DisconnectReason, HealthReport, HeartbeatPolicy, PoolConfig, PoolNotification,
    TransportFrame, TransportLink, WebSocketConnector,
};
pub use state::{
    action_types, HistoryEntry, KnownAction, LoggingMiddleware, Middleware, MiddlewareInfo,
    PersistenceMiddleware, Reducer, SliceReducer, Snapshot, StateAction, StateDocument,
    StateStore, StoreConfig, ValidationMiddleware,
};
pub use storage::{FileStorage, KeyValueStorage, MemoryStorage};
pub use types::*;
