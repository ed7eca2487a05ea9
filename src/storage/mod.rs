//! Key-value persistence contract.
//!
//! The store persists snapshots of its document through this contract; the
//! host decides where they live. Two backends ship with the crate:
//! - [`MemoryStorage`] for tests and ephemeral sessions
//! - [`FileStorage`], a directory of checksummed records keyed by SHA-256

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::Result;

/// A string key-value store.
pub trait KeyValueStorage: Send + Sync {
    /// Read a value. `Ok(None)` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value, replacing any previous one.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Remove a value. Returns false if it was absent.
    fn remove(&self, key: &str) -> Result<bool>;
}
