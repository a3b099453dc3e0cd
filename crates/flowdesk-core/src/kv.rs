//! Durable key-value storage
//!
//! The only state that must outlive a restart is the active task handle, so
//! the interface is deliberately tiny: string keys, string values. The file
//! implementation keeps the whole map in one JSON document and replaces it
//! atomically on every write.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

/// Injected durable store (`get/set/remove`)
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// JSON-file backed store, one file per installation
pub struct FileKeyValueStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl FileKeyValueStore {
    /// File name used inside a state directory
    pub const FILE_NAME: &'static str = "state.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Store at `<dir>/state.json`, creating the directory if needed
    pub fn in_dir(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(Self::new(dir.as_ref().join(Self::FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, String>, StoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => Ok(map),
                Err(e) => {
                    self.quarantine(&e);
                    Ok(BTreeMap::new())
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an unreadable state file aside; the store then starts empty
    fn quarantine(&self, error: &serde_json::Error) {
        let aside = self.path.with_extension("json.corrupt");
        warn!(
            path = %self.path.display(),
            moved_to = %aside.display(),
            error = %error,
            "state file is unreadable, starting with empty state"
        );
        if let Err(e) = fs::rename(&self.path, &aside) {
            warn!(path = %self.path.display(), error = %e, "failed to move unreadable state file aside");
        }
    }

    fn persist(&self, map: &BTreeMap<String, String>) -> Result<(), StoreError> {
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string_pretty(map)?.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path).inspect_err(|e| {
            warn!(path = %self.path.display(), error = %e, "failed to replace state file");
        })?;
        debug!(path = %self.path.display(), entries = map.len(), "state file written");
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let _guard = self.lock.lock();
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        map.insert(key.to_string(), value.to_string());
        self.persist(&map)
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.lock.lock();
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.persist(&map)?;
        }
        Ok(())
    }
}
