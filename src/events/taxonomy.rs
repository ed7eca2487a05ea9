//! Well-known event types.
//!
//! Any string is a valid event type; these are the conventions fragments
//! share. [`KnownEvent`] gives the well-known ones a typed shape at the edge
//! while the bus itself stays untyped.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{Event, EventInput};

pub const USER_CHANGE: &str = "user-change";
pub const THEME_CHANGE: &str = "theme-change";
pub const LOCALE_CHANGE: &str = "locale-change";
pub const DATA_UPDATE: &str = "data-update";
pub const APP_MOUNT: &str = "app-mount";
pub const APP_UNMOUNT: &str = "app-unmount";
pub const APP_ERROR: &str = "app-error";
pub const APP_READY: &str = "app-ready";
pub const CONNECTION_STATUS: &str = "connection-status";

/// Typed view of the conventional events.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum KnownEvent {
    #[serde(rename = "user-change")]
    UserChange { user: Option<Value> },

    #[serde(rename = "theme-change")]
    ThemeChange { theme: String },

    #[serde(rename = "locale-change")]
    LocaleChange { locale: String },

    #[serde(rename = "data-update")]
    DataUpdate { entity: String, data: Value },

    #[serde(rename = "app-mount")]
    AppMount { app: String },

    #[serde(rename = "app-unmount")]
    AppUnmount { app: String },

    #[serde(rename = "app-error")]
    AppError { app: String, error: String },

    #[serde(rename = "app-ready")]
    AppReady { app: String },

    #[serde(rename = "connection-status")]
    ConnectionStatus {
        channel: String,
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

impl KnownEvent {
    /// The event type string this variant publishes under.
    pub fn event_type(&self) -> &'static str {
        match self {
            KnownEvent::UserChange { .. } => USER_CHANGE,
            KnownEvent::ThemeChange { .. } => THEME_CHANGE,
            KnownEvent::LocaleChange { .. } => LOCALE_CHANGE,
            KnownEvent::DataUpdate { .. } => DATA_UPDATE,
            KnownEvent::AppMount { .. } => APP_MOUNT,
            KnownEvent::AppUnmount { .. } => APP_UNMOUNT,
            KnownEvent::AppError { .. } => APP_ERROR,
            KnownEvent::AppReady { .. } => APP_READY,
            KnownEvent::ConnectionStatus { .. } => CONNECTION_STATUS,
        }
    }

    /// Build a publishable input from this event.
    pub fn into_input(self, source: impl Into<String>) -> EventInput {
        let event_type = self.event_type();
        let data = match serde_json::to_value(&self) {
            Ok(Value::Object(mut map)) => map.remove("data").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        EventInput::new(event_type, source, data)
    }

    /// Parse a published event. `None` for unknown types or mismatched data.
    pub fn from_event(event: &Event) -> Option<Self> {
        let tagged = serde_json::json!({
            "type": event.event_type,
            "data": event.data,
        });
        serde_json::from_value(tagged).ok()
    }
}
