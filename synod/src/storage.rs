//! # Summary
//!
//! This module abstracts over stable storage. Paxos safety rests on
//! acceptor state surviving restarts, so `put` must be atomic and
//! durable before it returns: a promise or accept is only considered
//! made once its state change is on disk.
//!
//! Two implementations are provided: `MemoryStorage` for tests and toy
//! clusters, and `DiskStorage`, which keeps one file per key and
//! replaces it by renaming a freshly synced temporary into place.

use std::collections::HashMap as Map;
use std::fs;
use std::io::Write;
use std::path;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Error;

/// A durable per-key map with atomic whole-value replacement.
pub trait Storage: Send + Sync + 'static {
    /// Returns the stored bytes for `key`, or empty bytes if the key
    /// has never been written. Errors only on I/O failure.
    fn get(&self, key: u64) -> Result<Vec<u8>, Error>;

    /// Atomically replaces the value for `key`, returning only after
    /// the new value is durable.
    fn put(&self, key: u64, value: &[u8]) -> Result<(), Error>;
}

/// Not durable across restarts, only use for toy problems and tests.
#[derive(Clone, Default)]
pub struct MemoryStorage(Arc<Mutex<Map<u64, Vec<u8>>>>);

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: u64) -> Result<Vec<u8>, Error> {
        Ok(self.0.lock().get(&key).cloned().unwrap_or_default())
    }

    fn put(&self, key: u64, value: &[u8]) -> Result<(), Error> {
        self.0.lock().insert(key, value.to_vec());
        Ok(())
    }
}

/// One file per key under a dedicated directory.
#[derive(Clone)]
pub struct DiskStorage {
    dir: path::PathBuf,
}

impl DiskStorage {
    /// Creates the backing directory if necessary.
    pub fn new<P: AsRef<path::Path>>(dir: P) -> Result<Self, Error> {
        fs::create_dir_all(&dir)?;
        Ok(DiskStorage { dir: dir.as_ref().to_path_buf() })
    }

    fn path(&self, key: u64) -> path::PathBuf {
        self.dir.join(key.to_string())
    }
}

impl Storage for DiskStorage {
    fn get(&self, key: u64) -> Result<Vec<u8>, Error> {
        match fs::read(self.path(key)) {
        | Ok(bytes) => Ok(bytes),
        | Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        | Err(error) => Err(error.into()),
        }
    }

    fn put(&self, key: u64, value: &[u8]) -> Result<(), Error> {
        // Write-then-rename so a crash never leaves a torn value.
        let tmp = self.dir.join(format!(".{}.tmp", key));
        let mut file = fs::File::create(&tmp)?;
        file.write_all(value)?;
        file.sync_all()?;
        fs::rename(&tmp, self.path(key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> path::PathBuf {
        std::env::temp_dir().join(format!("synod-{}-{:x}", name, rand::random::<u64>()))
    }

    #[test]
    fn memory_missing_key_is_empty() {
        let storage = MemoryStorage::new();
        assert_eq!(storage.get(42).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn memory_put_replaces_whole_value() {
        let storage = MemoryStorage::new();
        storage.put(1, b"first").unwrap();
        storage.put(1, b"second").unwrap();
        assert_eq!(storage.get(1).unwrap(), b"second");
    }

    #[test]
    fn disk_round_trip() {
        let dir = scratch_dir("round-trip");
        let storage = DiskStorage::new(&dir).unwrap();
        assert_eq!(storage.get(7).unwrap(), Vec::<u8>::new());
        storage.put(7, b"value").unwrap();
        assert_eq!(storage.get(7).unwrap(), b"value");
        fs::remove_dir_all(dir).ok();
    }

    #[test]
    fn disk_survives_reopen() {
        let dir = scratch_dir("reopen");
        {
            let storage = DiskStorage::new(&dir).unwrap();
            storage.put(3, b"persisted").unwrap();
        }
        let storage = DiskStorage::new(&dir).unwrap();
        assert_eq!(storage.get(3).unwrap(), b"persisted");
        fs::remove_dir_all(dir).ok();
    }
}
