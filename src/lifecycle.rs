//! Hooks for the host that loads and mounts fragments.
//!
//! The host calls these at the matching points of a fragment's life. Each
//! hook publishes the conventional event so other fragments can react, and,
//! when a store is attached, records the fragment's status in the `apps`
//! slice. Store failures are logged; the event is published regardless.

use crate::events::{Event, EventBus, KnownEvent};
use crate::state::{KnownAction, StateAction, StateStore};
use serde_json::Value;

/// Status values recorded under `apps/registered/<name>/status`.
pub mod app_status {
    pub const LOADING: &str = "loading";
    pub const MOUNTED: &str = "mounted";
    pub const UNMOUNTED: &str = "unmounted";
    pub const ERROR: &str = "error";
    pub const READY: &str = "ready";
}

/// Default event source for lifecycle events.
pub const HOST_SOURCE: &str = "host";

#[derive(Clone, Debug)]
pub struct LifecycleHooks {
    bus: EventBus,
    store: Option<StateStore>,
    source: String,
}

impl LifecycleHooks {
    /// Hooks that only publish events.
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            store: None,
            source: HOST_SOURCE.to_string(),
        }
    }

    /// Also record fragment status in `store`.
    ///
    /// Status goes through [`StateStore::record`], so it never adds history
    /// entries and a user's undo does not revert it.
    pub fn with_store(mut self, store: StateStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    /// Before a fragment's code is loaded. Registers it as `loading`.
    ///
    /// No event is published; nothing is mounted yet.
    pub async fn before_load(&self, app: &str, meta: Value) {
        tracing::debug!(app = %app, "Loading fragment");
        self.record(KnownAction::RegisterApp {
            name: app.to_string(),
            meta,
        })
        .await;
        self.record_status(app, app_status::LOADING).await;
    }

    pub async fn after_mount(&self, app: &str) -> Event {
        self.record_status(app, app_status::MOUNTED).await;
        self.publish(KnownEvent::AppMount {
            app: app.to_string(),
        })
        .await
    }

    pub async fn after_unmount(&self, app: &str) -> Event {
        self.record_status(app, app_status::UNMOUNTED).await;
        self.publish(KnownEvent::AppUnmount {
            app: app.to_string(),
        })
        .await
    }

    /// A fragment failed to load, mount or run.
    pub async fn on_error(&self, app: &str, error: impl std::fmt::Display) -> Event {
        let error = error.to_string();
        tracing::warn!(app = %app, error = %error, "Fragment error");
        self.record_status(app, app_status::ERROR).await;
        self.publish(KnownEvent::AppError {
            app: app.to_string(),
            error,
        })
        .await
    }

    /// The fragment finished its own initialisation.
    pub async fn ready(&self, app: &str) -> Event {
        self.record_status(app, app_status::READY).await;
        self.publish(KnownEvent::AppReady {
            app: app.to_string(),
        })
        .await
    }

    async fn publish(&self, event: KnownEvent) -> Event {
        self.bus.publish_known(&self.source, event).await
    }

    async fn record_status(&self, app: &str, status: &str) {
        self.record(KnownAction::UpdateAppStatus {
            name: app.to_string(),
            status: status.to_string(),
        })
        .await;
    }

    async fn record(&self, action: impl Into<StateAction>) {
        let Some(store) = &self.store else {
            return;
        };
        let action = action.into();
        if let Err(e) = store.record(action.clone()).await {
            tracing::warn!(action = %action.action_type, error = %e, "Failed to record fragment status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::taxonomy;
    use crate::state::StateDocument;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hooks_publish_and_record() {
        let bus = EventBus::new();
        let store = StateStore::new(StateDocument::standard());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe_wildcard(move |event| {
            seen_clone.lock().push(event.event_type.clone());
            Ok(())
        });

        let hooks = LifecycleHooks::new(bus).with_store(store.clone());
        hooks.before_load("orders", json!({"version": "1.2.0"})).await;
        assert_eq!(
            store.get_state().get("apps/registered/orders/status"),
            Some(&json!("loading"))
        );

        let event = hooks.after_mount("orders").await;
        assert_eq!(event.source, HOST_SOURCE);
        assert_eq!(event.data["app"], "orders");
        hooks.ready("orders").await;
        hooks.on_error("orders", "chunk load failed").await;
        hooks.after_unmount("orders").await;

        assert_eq!(
            *seen.lock(),
            vec![
                taxonomy::APP_MOUNT,
                taxonomy::APP_READY,
                taxonomy::APP_ERROR,
                taxonomy::APP_UNMOUNT,
            ]
        );
        let state = store.get_state();
        assert_eq!(state.get("apps/registered/orders/status"), Some(&json!("unmounted")));
        assert_eq!(state.get("apps/registered/orders/meta/version"), Some(&json!("1.2.0")));
    }

    #[tokio::test]
    async fn test_status_stays_out_of_undo_history() {
        let store = StateStore::new(StateDocument::standard());
        let hooks = LifecycleHooks::new(EventBus::new()).with_store(store.clone());

        store.dispatch(KnownAction::SetTheme("dark".into())).await.unwrap();
        hooks.before_load("orders", Value::Null).await;
        hooks.after_mount("orders").await;
        assert_eq!(store.history().len(), 2);

        // Undo reverts the user's theme, not the mount
        assert!(store.undo().await.unwrap());
        let state = store.get_state();
        assert_eq!(state.get("theme/current"), Some(&json!("light")));
        assert_eq!(state.get("apps/registered/orders/status"), Some(&json!("mounted")));

        assert!(store.redo().await.unwrap());
        assert_eq!(
            store.get_state().get("apps/registered/orders/status"),
            Some(&json!("mounted"))
        );
        assert!(!store.can_redo());
    }

    #[tokio::test]
    async fn test_hooks_without_store() {
        let hooks = LifecycleHooks::new(EventBus::new()).with_source("shell");
        hooks.before_load("orders", Value::Null).await;
        let event = hooks.on_error("orders", "boom").await;
        assert_eq!(event.source, "shell");
        assert_eq!(event.data["error"], "boom");
    }
}
