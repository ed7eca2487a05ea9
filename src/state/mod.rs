//! Central state store.
//!
//! A single document partitioned into named slices. Every change is an
//! action that passes through middleware and a reducer, and every commit
//! is kept in a linear undo/redo history. Untouched slices are shared
//! between consecutive documents, so listeners can compare slices with
//! `Arc::ptr_eq` to skip work.
//!
//! # Example
//!
//! ```ignore
//! let store = StateStore::new(StateDocument::standard());
//! store.use_middleware(ValidationMiddleware::new());
//!
//! let handle = store.subscribe(|state| {
//!     println!("theme: {:?}", state.get("theme/current"));
//! });
//!
//! store.dispatch(KnownAction::SetTheme("dark".into())).await?;
//! store.undo().await?;
//! ```

mod action;
mod document;
mod history;
mod middleware;
mod reducer;
mod snapshot;
mod store;

pub use action::{action_types, KnownAction, StateAction};
pub use document::{merge_patch, StateDocument, APPS_SLICE, LOCALE_SLICE, THEME_SLICE, USER_SLICE};
pub use history::HistoryEntry;
pub use middleware::{
    LoggingMiddleware, Middleware, PersistenceMiddleware, ValidationMiddleware,
    DEFAULT_PERSISTENCE_KEY,
};
pub use reducer::{Reducer, Route, SliceReducer};
pub use snapshot::Snapshot;
pub use store::{MiddlewareInfo, PendingDispatch, StateStore, StoreConfig};
