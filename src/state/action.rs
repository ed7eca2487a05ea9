//! Actions: the only way to ask the store for a change.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Action type constants.
pub mod action_types {
    pub const SET_USER: &str = "SET_USER";
    pub const CLEAR_USER: &str = "CLEAR_USER";
    pub const SET_THEME: &str = "SET_THEME";
    pub const SET_LOCALE: &str = "SET_LOCALE";
    pub const REGISTER_APP: &str = "REGISTER_APP";
    pub const UPDATE_APP: &str = "UPDATE_APP";
    pub const UNREGISTER_APP: &str = "UNREGISTER_APP";
    /// Object payload keyed by slice name; each value is merged into its slice.
    pub const MERGE_STATE: &str = "MERGE_STATE";

    // Recorded by the store itself; never routed through the reducer.
    pub const INIT: &str = "@@INIT";
    pub const SET_STATE: &str = "@@SET_STATE";
    pub const RESTORE_SNAPSHOT: &str = "@@RESTORE_SNAPSHOT";
    pub const UNDO: &str = "@@UNDO";
    pub const REDO: &str = "@@REDO";
}

/// A request to change state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateAction {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl StateAction {
    pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
        }
    }

    /// Actions the store records on its own behalf (`@@`-prefixed).
    pub fn is_internal(&self) -> bool {
        self.action_type.starts_with("@@")
    }
}

/// Typed constructors for the standard slices.
#[derive(Clone, Debug, PartialEq)]
pub enum KnownAction {
    SetUser(Value),
    ClearUser,
    SetTheme(String),
    SetLocale(String),
    RegisterApp { name: String, meta: Value },
    UpdateAppStatus { name: String, status: String },
    UnregisterApp { name: String },
}

impl From<KnownAction> for StateAction {
    fn from(action: KnownAction) -> Self {
        use action_types::*;
        match action {
            KnownAction::SetUser(user) => StateAction::new(
                SET_USER,
                json!({ "current": user, "authenticated": true }),
            ),
            KnownAction::ClearUser => StateAction::new(CLEAR_USER, json!({})),
            KnownAction::SetTheme(theme) => StateAction::new(SET_THEME, json!({ "current": theme })),
            KnownAction::SetLocale(locale) => {
                StateAction::new(SET_LOCALE, json!({ "current": locale }))
            }
            KnownAction::RegisterApp { name, meta } => StateAction::new(
                REGISTER_APP,
                json!({ "name": name, "status": "registered", "meta": meta }),
            ),
            KnownAction::UpdateAppStatus { name, status } => {
                StateAction::new(UPDATE_APP, json!({ "name": name, "status": status }))
            }
            KnownAction::UnregisterApp { name } => {
                StateAction::new(UNREGISTER_APP, json!({ "name": name }))
            }
        }
    }
}
