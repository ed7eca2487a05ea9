//! Reducers turn an action into per-slice merge patches.

use crate::error::{Result, SwitchboardError};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

use super::action::{action_types, StateAction};
use super::document::{json_kind, StateDocument, APPS_SLICE, LOCALE_SLICE, THEME_SLICE, USER_SLICE};

/// Computes the slice patches an action produces.
///
/// The returned map is keyed by slice name; each value is applied to its
/// slice as a merge patch. Slices not named in the map are left untouched.
pub trait Reducer: Send + Sync {
    fn reduce(&self, state: &StateDocument, action: &StateAction) -> Result<Map<String, Value>>;
}

impl<F> Reducer for F
where
    F: Fn(&StateDocument, &StateAction) -> Result<Map<String, Value>> + Send + Sync,
{
    fn reduce(&self, state: &StateDocument, action: &StateAction) -> Result<Map<String, Value>> {
        self(state, action)
    }
}

/// How a routed action type becomes a patch.
#[derive(Clone, Debug, PartialEq)]
pub enum Route {
    /// Merge the payload into the slice.
    Merge(String),
    /// Merge a fixed patch into the slice, ignoring the payload.
    Fixed { slice: String, patch: Value },
    /// Merge the payload (minus `name`) into `<registry>.<name>` of the slice.
    Entry { slice: String, registry: String },
    /// Remove `<registry>.<name>` from the slice.
    RemoveEntry { slice: String, registry: String },
}

/// Routes action types to slices.
///
/// `MERGE_STATE` is always understood: its object payload addresses several
/// slices by key. Any other unrouted action type is rejected.
#[derive(Clone, Debug, Default)]
pub struct SliceReducer {
    routes: HashMap<String, Route>,
}

impl SliceReducer {
    /// Reducer that only understands `MERGE_STATE`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes for the standard `user`, `theme`, `locale` and `apps` slices.
    pub fn standard() -> Self {
        use action_types::*;
        let registry = || Route::Entry {
            slice: APPS_SLICE.to_string(),
            registry: "registered".to_string(),
        };
        Self::new()
            .route(SET_USER, Route::Merge(USER_SLICE.to_string()))
            .route(
                CLEAR_USER,
                Route::Fixed {
                    slice: USER_SLICE.to_string(),
                    patch: json!({ "current": null, "authenticated": false }),
                },
            )
            .route(SET_THEME, Route::Merge(THEME_SLICE.to_string()))
            .route(SET_LOCALE, Route::Merge(LOCALE_SLICE.to_string()))
            .route(REGISTER_APP, registry())
            .route(UPDATE_APP, registry())
            .route(
                UNREGISTER_APP,
                Route::RemoveEntry {
                    slice: APPS_SLICE.to_string(),
                    registry: "registered".to_string(),
                },
            )
    }

    /// Add or replace the route for an action type.
    pub fn route(mut self, action_type: impl Into<String>, route: Route) -> Self {
        self.routes.insert(action_type.into(), route);
        self
    }

    /// Shorthand for a plain merge route.
    pub fn merge_into(self, action_type: impl Into<String>, slice: impl Into<String>) -> Self {
        self.route(action_type, Route::Merge(slice.into()))
    }

    fn apply_route(route: &Route, action: &StateAction) -> Result<Map<String, Value>> {
        let mut patches = Map::new();
        match route {
            Route::Merge(slice) => {
                patches.insert(slice.clone(), action.payload.clone());
            }
            Route::Fixed { slice, patch } => {
                patches.insert(slice.clone(), patch.clone());
            }
            Route::Entry { slice, registry } => {
                let (name, mut fields) = entry_payload(action)?;
                fields.remove("name");
                patches.insert(slice.clone(), nested(registry, name, Value::Object(fields)));
            }
            Route::RemoveEntry { slice, registry } => {
                let (name, _) = entry_payload(action)?;
                patches.insert(slice.clone(), nested(registry, name, Value::Null));
            }
        }
        Ok(patches)
    }
}

/// `{ registry: { name: value } }`
fn nested(registry: &str, name: String, value: Value) -> Value {
    let mut entry = Map::new();
    entry.insert(name, value);
    let mut outer = Map::new();
    outer.insert(registry.to_string(), Value::Object(entry));
    Value::Object(outer)
}

/// Split an entry payload into its `name` and remaining fields.
fn entry_payload(action: &StateAction) -> Result<(String, Map<String, Value>)> {
    let fields = match &action.payload {
        Value::Object(map) => map.clone(),
        other => {
            return Err(SwitchboardError::InvalidAction(format!(
                "{} expects an object payload, got {}",
                action.action_type,
                json_kind(other)
            )))
        }
    };
    match fields.get("name").and_then(Value::as_str) {
        Some(name) if !name.is_empty() => Ok((name.to_string(), fields)),
        _ => Err(SwitchboardError::InvalidAction(format!(
            "{} requires a non-empty string 'name'",
            action.action_type
        ))),
    }
}

impl Reducer for SliceReducer {
    fn reduce(&self, _state: &StateDocument, action: &StateAction) -> Result<Map<String, Value>> {
        if action.action_type == action_types::MERGE_STATE {
            return match &action.payload {
                Value::Object(map) => Ok(map.clone()),
                other => Err(SwitchboardError::InvalidAction(format!(
                    "MERGE_STATE expects an object keyed by slice, got {}",
                    json_kind(other)
                ))),
            };
        }

        match self.routes.get(&action.action_type) {
            Some(route) => Self::apply_route(route, action),
            None => Err(SwitchboardError::InvalidAction(format!(
                "No route for action type '{}'",
                action.action_type
            ))),
        }
    }
}
