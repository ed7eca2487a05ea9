//! File-backed storage.

use crate::error::{Result, SwitchboardError};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use super::KeyValueStorage;

/// Magic bytes for value files.
const VALUE_MAGIC: &[u8; 4] = b"SWKV";

/// Current value format version.
const VALUE_VERSION: u8 = 1;

/// Magic, version, key length, value length and checksum.
const FIXED_HEADER_LEN: u64 = 4 + 1 + 2 + 8 + 4;

/// Values stored one per file, named by the SHA-256 of the key.
///
/// Files are sharded by the first byte of the hash. Each file carries the
/// original key and a CRC32 of the value, and is replaced atomically on
/// write. A `LOCK` file held for the lifetime of the storage keeps a second
/// process from opening the same directory.
pub struct FileStorage {
    /// Base directory.
    path: PathBuf,

    /// Exclusive lock, released on drop.
    _lock_file: File,

    /// LRU cache of recently read or written values.
    cache: Mutex<LruCache<String, String>>,
}

impl FileStorage {
    /// Open (or create) storage in a directory.
    pub fn open(path: impl AsRef<Path>, cache_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path)?;

        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| SwitchboardError::Locked)?;

        let cache_size = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        tracing::debug!(path = %path.display(), "Opened file storage");

        Ok(Self {
            path,
            _lock_file: lock_file,
            cache: Mutex::new(LruCache::new(cache_size)),
        })
    }

    /// Base directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the file holding a key.
    fn value_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.path.join(&digest[..2]).join(digest)
    }

    fn read_file(&self, key: &str, file_path: &Path) -> Result<String> {
        let mut file = File::open(file_path)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != VALUE_MAGIC {
            return Err(SwitchboardError::InvalidFormat("Invalid value magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != VALUE_VERSION {
            return Err(SwitchboardError::InvalidFormat(format!(
                "Unsupported value version: {}",
                version[0]
            )));
        }

        let mut key_len_bytes = [0u8; 2];
        file.read_exact(&mut key_len_bytes)?;
        let key_len = u64::from(u16::from_le_bytes(key_len_bytes));
        let body_len = file_len
            .checked_sub(FIXED_HEADER_LEN + key_len)
            .ok_or_else(|| {
                SwitchboardError::InvalidFormat(format!(
                    "Value file for '{key}' is shorter than its header ({file_len} bytes)"
                ))
            })?;
        let mut stored_key = vec![0u8; key_len as usize];
        file.read_exact(&mut stored_key)?;
        if stored_key != key.as_bytes() {
            return Err(SwitchboardError::InvalidFormat(format!(
                "Value file for '{key}' belongs to another key"
            )));
        }

        let mut value_len_bytes = [0u8; 8];
        file.read_exact(&mut value_len_bytes)?;
        let value_len = u64::from_le_bytes(value_len_bytes);
        if value_len != body_len {
            return Err(SwitchboardError::InvalidFormat(format!(
                "Value length {value_len} does not match file size ({body_len} bytes left)"
            )));
        }
        let mut value = vec![0u8; body_len as usize];
        file.read_exact(&mut value)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&value);
        if stored_checksum != computed_checksum {
            return Err(SwitchboardError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        String::from_utf8(value)
            .map_err(|e| SwitchboardError::InvalidFormat(format!("Value is not UTF-8: {e}")))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(cached) = self.cache.lock().get(key).cloned() {
            return Ok(Some(cached));
        }

        let file_path = self.value_path(key);
        if !file_path.exists() {
            return Ok(None);
        }

        let value = self.read_file(key, &file_path)?;
        self.cache.lock().put(key.to_string(), value.clone());
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let file_path = self.value_path(key);
        if let Some(shard) = file_path.parent() {
            fs::create_dir_all(shard)?;
        }

        let key_bytes = key.as_bytes();
        let key_len = u16::try_from(key_bytes.len())
            .map_err(|_| SwitchboardError::InvalidFormat(format!("Key too long: {} bytes", key_bytes.len())))?;

        let tmp_path = file_path.with_extension("tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(VALUE_MAGIC)?;
            file.write_all(&[VALUE_VERSION])?;
            file.write_all(&key_len.to_le_bytes())?;
            file.write_all(key_bytes)?;
            file.write_all(&(value.len() as u64).to_le_bytes())?;
            file.write_all(value.as_bytes())?;
            file.write_all(&crc32fast::hash(value.as_bytes()).to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &file_path)?;

        self.cache.lock().put(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<bool> {
        self.cache.lock().pop(key);

        let file_path = self.value_path(key);
        if file_path.exists() {
            fs::remove_file(&file_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }
}

impl std::fmt::Debug for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStorage")
            .field("path", &self.path)
            .finish()
    }
}
