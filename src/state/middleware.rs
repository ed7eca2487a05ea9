//! Middleware: hooks around every dispatch.
//!
//! `before` runs in registration order and may transform or reject the
//! action. `after` runs once the new state is committed; its failures are
//! logged and never roll the commit back.

use crate::error::MiddlewareError;
use crate::storage::KeyValueStorage;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

use super::action::StateAction;
use super::document::{json_kind, StateDocument};

/// A dispatch hook.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used by `toggle_middleware` and in errors.
    fn name(&self) -> &str;

    /// Inspect, transform or reject an action before it is reduced.
    async fn before(
        &self,
        action: StateAction,
        _state: &StateDocument,
    ) -> Result<StateAction, MiddlewareError> {
        Ok(action)
    }

    /// Observe a committed state.
    async fn after(&self, _state: &StateDocument, _action: &StateAction) -> Result<(), MiddlewareError> {
        Ok(())
    }
}

/// Logs every action and commit.
#[derive(Clone, Debug, Default)]
pub struct LoggingMiddleware;

impl LoggingMiddleware {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Middleware for LoggingMiddleware {
    fn name(&self) -> &str {
        "logging"
    }

    async fn before(
        &self,
        action: StateAction,
        _state: &StateDocument,
    ) -> Result<StateAction, MiddlewareError> {
        tracing::debug!(
            action = %action.action_type,
            payload = %action.payload,
            "Dispatching action"
        );
        Ok(action)
    }

    async fn after(&self, state: &StateDocument, action: &StateAction) -> Result<(), MiddlewareError> {
        tracing::debug!(
            action = %action.action_type,
            slices = state.len(),
            "State committed"
        );
        Ok(())
    }
}

type Rule = Arc<dyn Fn(&StateAction, &StateDocument) -> Result<(), String> + Send + Sync>;

/// Rejects malformed actions before they reach the reducer.
///
/// Always requires a non-empty type and an object payload. Optionally
/// restricts action types to an allow-list, bounds the serialized payload
/// size, and runs named custom rules.
#[derive(Clone, Default)]
pub struct ValidationMiddleware {
    allowed_types: Option<HashSet<String>>,
    max_payload_bytes: Option<usize>,
    rules: Vec<(String, Rule)>,
}

impl ValidationMiddleware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only let these action types through.
    pub fn allow_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Reject payloads whose JSON encoding exceeds this many bytes.
    pub fn max_payload_bytes(mut self, max: usize) -> Self {
        self.max_payload_bytes = Some(max);
        self
    }

    /// Add a custom rule. An `Err` message becomes the rejection reason.
    pub fn rule<F>(mut self, name: impl Into<String>, rule: F) -> Self
    where
        F: Fn(&StateAction, &StateDocument) -> Result<(), String> + Send + Sync + 'static,
    {
        self.rules.push((name.into(), Arc::new(rule)));
        self
    }

    fn check(&self, action: &StateAction, state: &StateDocument) -> Result<(), String> {
        if action.action_type.trim().is_empty() {
            return Err("action type must not be empty".to_string());
        }
        if !matches!(action.payload, Value::Object(_)) {
            return Err(format!(
                "payload must be an object, got {}",
                json_kind(&action.payload)
            ));
        }
        if let Some(allowed) = &self.allowed_types {
            if !allowed.contains(&action.action_type) {
                return Err(format!("action type '{}' is not allowed", action.action_type));
            }
        }
        if let Some(max) = self.max_payload_bytes {
            let size = serde_json::to_vec(&action.payload)
                .map(|bytes| bytes.len())
                .unwrap_or(usize::MAX);
            if size > max {
                return Err(format!("payload is {size} bytes, limit is {max}"));
            }
        }
        for (name, rule) in &self.rules {
            rule(action, state).map_err(|reason| format!("{name}: {reason}"))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    fn name(&self) -> &str {
        "validation"
    }

    async fn before(
        &self,
        action: StateAction,
        state: &StateDocument,
    ) -> Result<StateAction, MiddlewareError> {
        self.check(&action, state).map_err(MiddlewareError::Rejected)?;
        Ok(action)
    }
}

impl std::fmt::Debug for ValidationMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationMiddleware")
            .field("allowed_types", &self.allowed_types)
            .field("max_payload_bytes", &self.max_payload_bytes)
            .field("rules", &self.rules.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .finish()
    }
}

/// Key the document is persisted under unless configured otherwise.
pub const DEFAULT_PERSISTENCE_KEY: &str = "switchboard:state";

/// Writes the document to a key-value store after every commit.
///
/// Clone it before handing it to the store to keep a handle for
/// [`PersistenceMiddleware::load`].
#[derive(Clone)]
pub struct PersistenceMiddleware {
    storage: Arc<dyn KeyValueStorage>,
    key: String,
    slices: Option<Vec<String>>,
}

impl PersistenceMiddleware {
    pub fn new(storage: Arc<dyn KeyValueStorage>) -> Self {
        Self {
            storage,
            key: DEFAULT_PERSISTENCE_KEY.to_string(),
            slices: None,
        }
    }

    /// Persist under a different key.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }

    /// Persist only these slices.
    pub fn only_slices<I, S>(mut self, slices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.slices = Some(slices.into_iter().map(Into::into).collect());
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the persisted document.
    ///
    /// Missing, unreadable and malformed values all yield `None`.
    pub fn load(&self) -> Option<StateDocument> {
        let text = match self.storage.get(&self.key) {
            Ok(Some(text)) => text,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Failed to read persisted state");
                return None;
            }
        };
        match serde_json::from_str::<StateDocument>(&text) {
            Ok(doc) => Some(doc),
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Ignoring malformed persisted state");
                None
            }
        }
    }

    fn persisted(&self, state: &StateDocument) -> StateDocument {
        match &self.slices {
            Some(slices) => state.filtered(slices.iter().map(String::as_str)),
            None => state.clone(),
        }
    }
}

#[async_trait]
impl Middleware for PersistenceMiddleware {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn after(&self, state: &StateDocument, _action: &StateAction) -> Result<(), MiddlewareError> {
        let text = serde_json::to_string(&self.persisted(state))
            .map_err(|e| MiddlewareError::Failed(e.to_string()))?;
        self.storage
            .set(&self.key, &text)
            .map_err(|e| MiddlewareError::Failed(e.to_string()))
    }
}

impl std::fmt::Debug for PersistenceMiddleware {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMiddleware")
            .field("key", &self.key)
            .field("slices", &self.slices)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use serde_json::json;

    #[tokio::test]
    async fn test_validation_rejections() {
        let doc = StateDocument::standard();
        let validation = ValidationMiddleware::new()
            .allow_types(["SET_THEME"])
            .max_payload_bytes(64)
            .rule("known-theme", |action, _| match action.payload["current"].as_str() {
                Some("light") | Some("dark") => Ok(()),
                _ => Err("unknown theme".to_string()),
            });

        let ok = StateAction::new("SET_THEME", json!({"current": "dark"}));
        assert!(validation.before(ok, &doc).await.is_ok());

        for bad in [
            StateAction::new("", json!({})),
            StateAction::new("SET_THEME", json!("dark")),
            StateAction::new("SET_LOCALE", json!({"current": "de"})),
            StateAction::new("SET_THEME", json!({"current": "x".repeat(100)})),
            StateAction::new("SET_THEME", json!({"current": "neon"})),
        ] {
            assert!(matches!(
                validation.before(bad, &doc).await,
                Err(MiddlewareError::Rejected(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_persistence_writes_selected_slices() {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = PersistenceMiddleware::new(storage.clone()).only_slices(["theme"]);
        let doc = StateDocument::standard();

        persistence
            .after(&doc, &StateAction::new("SET_THEME", json!({})))
            .await
            .unwrap();

        let loaded = persistence.load().unwrap();
        assert_eq!(loaded.slice_names().collect::<Vec<_>>(), vec!["theme"]);
        assert_eq!(loaded.get("theme/current"), Some(&json!("light")));
    }

    #[test]
    fn test_load_tolerates_missing_and_malformed() {
        let storage = Arc::new(MemoryStorage::new());
        let persistence = PersistenceMiddleware::new(storage.clone()).with_key("state");
        assert!(persistence.load().is_none());

        storage.set("state", "{not json").unwrap();
        assert!(persistence.load().is_none());

        storage.set("state", "[1,2,3]").unwrap();
        assert!(persistence.load().is_none());
    }
}
