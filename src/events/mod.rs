//! In-process publish/subscribe event bus.
//!
//! Fragments exchange events without knowing about each other:
//! - Exact-type and wildcard handlers, sync or async
//! - Handlers run one at a time in registration order; failures are isolated
//! - Polling receivers over bounded channels, with slow-consumer dropping
//! - Per-type delivery statistics
//!
//! # Example
//!
//! ```ignore
//! let bus = EventBus::new();
//!
//! let handle = bus.subscribe(taxonomy::THEME_CHANGE, |event| {
//!     println!("theme is now {}", event.data["theme"]);
//!     Ok(())
//! });
//!
//! bus.publish(EventInput::new(taxonomy::THEME_CHANGE, "settings", json!({"theme": "dark"})))
//!     .await;
//!
//! // Fragment teardown
//! handle.unsubscribe();
//! ```

mod bus;
pub mod taxonomy;
mod types;

pub use bus::{EventBus, HandlerResult};
pub use taxonomy::KnownEvent;
pub use types::{BusStats, Event, EventBusConfig, EventFilter, EventInput, EventReceiver};
