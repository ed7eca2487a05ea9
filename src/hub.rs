//! One bus, one store and one pool, constructed together.

use crate::bridge::{self, ChannelBridge};
use crate::config::SwitchboardConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::lifecycle::LifecycleHooks;
use crate::pool::{ConnectionPool, Connector, WebSocketConnector};
use crate::state::{StateDocument, StateStore};
use tokio::task::JoinHandle;

/// The communication core a host hands to every fragment.
///
/// Construct one at start-up and clone it (or its parts) into fragments;
/// all clones share the same bus, store and pool.
#[derive(Clone, Debug)]
pub struct Switchboard {
    bus: EventBus,
    store: StateStore,
    pool: ConnectionPool,
}

impl Switchboard {
    /// Switchboard over WebSocket channels and the standard slices.
    pub fn new(config: SwitchboardConfig) -> Self {
        let connector = WebSocketConnector::with_buffer(config.pool.outbound_buffer);
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: SwitchboardConfig, connector: impl Connector) -> Self {
        Self::with_state(config, StateDocument::standard(), connector)
    }

    /// Switchboard with a caller-built initial document.
    pub fn with_state(
        config: SwitchboardConfig,
        initial: StateDocument,
        connector: impl Connector,
    ) -> Self {
        let SwitchboardConfig { bus, store, pool } = config;
        Self {
            bus: EventBus::with_config(bus),
            store: StateStore::with_config(initial, store),
            pool: ConnectionPool::with_connector(pool, connector),
        }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    /// Lifecycle hooks publishing on this bus and recording in this store.
    pub fn lifecycle(&self) -> LifecycleHooks {
        LifecycleHooks::new(self.bus.clone()).with_store(self.store.clone())
    }

    /// Republish a channel's messages on the bus.
    pub fn bridge(&self, channel: &str, url: &str) -> Result<ChannelBridge> {
        ChannelBridge::forward(&self.pool, &self.bus, channel, url)
    }

    /// Republish pool notifications as `connection-status` events.
    pub fn forward_notifications(&self) -> Result<JoinHandle<()>> {
        bridge::forward_notifications(&self.pool, &self.bus)
    }

    /// Close every channel. Returns how many were open or opening.
    pub fn shutdown(&self) -> usize {
        let closed = self.pool.close_all();
        tracing::info!(channels = closed, "Switchboard shut down");
        closed
    }
}
