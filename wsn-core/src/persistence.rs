//! C8: Persistence Adaptor.
//!
//! An opaque key/value store for uptime and configuration. The core only
//! ever uses the `uptime` key plus the configuration keys documented in
//! [`crate::config`]; everything else is the caller's business. Reads
//! return `None` on a missing key (the caller applies its own default);
//! writes are best-effort and a failure is logged, not propagated — the
//! next periodic flush retries.

/// Key under which persisted uptime (an 8-byte little-endian `u64` of
/// seconds) is stored.
pub const UPTIME_KEY: &str = "uptime";

pub trait PersistenceStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<(), String>;
}

/// Persist `uptime_seconds`, logging (not propagating) any failure.
pub fn persist_uptime(store: &dyn PersistenceStore, uptime_seconds: u64) {
    if let Err(e) = store.put(UPTIME_KEY, &uptime_seconds.to_le_bytes()) {
        log::warn!("persistence: failed to write uptime: {e}");
    }
}

/// Load persisted uptime, defaulting to 0 on a missing or malformed key.
pub fn load_uptime(store: &dyn PersistenceStore) -> u64 {
    store
        .get(UPTIME_KEY)
        .and_then(|bytes| bytes.get(0..8).map(|s| u64::from_le_bytes(s.try_into().unwrap())))
        .unwrap_or(0)
}

/// In-memory store used by tests and by the host simulator. Not meant for
/// production flash use.
#[derive(Default)]
pub struct MemoryStore {
    inner: std::sync::Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), String> {
        self.inner
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }
}

/// Flat-file store: every key is written to its own file under a base
/// directory, one write per `put`. Meant for the Linux gateway binary,
/// where a real filesystem is available but there is no NVS partition.
pub struct FileStore {
    base_dir: std::path::PathBuf,
}

impl FileStore {
    /// Creates `base_dir` (and any missing parents) if it doesn't exist.
    pub fn new(base_dir: impl Into<std::path::PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    fn path_for(&self, key: &str) -> std::path::PathBuf {
        self.base_dir.join(key)
    }
}

impl PersistenceStore for FileStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path_for(key)).ok()
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<(), String> {
        std::fs::write(self.path_for(key), value).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_returns_default() {
        let store = MemoryStore::new();
        assert_eq!(load_uptime(&store), 0);
    }

    #[test]
    fn uptime_round_trips() {
        let store = MemoryStore::new();
        persist_uptime(&store, 12345);
        assert_eq!(load_uptime(&store), 12345);
    }

    fn temp_dir(label: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("wsn_filestore_test_{label}_{}", std::process::id()))
    }

    #[test]
    fn file_store_round_trips_across_instances() {
        let dir = temp_dir("round_trip");
        {
            let store = FileStore::new(&dir).unwrap();
            persist_uptime(&store, 54321);
        }
        let reopened = FileStore::new(&dir).unwrap();
        assert_eq!(load_uptime(&reopened), 54321);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_store_missing_key_returns_none() {
        let dir = temp_dir("missing_key");
        let store = FileStore::new(&dir).unwrap();
        assert!(store.get("w_battery").is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
