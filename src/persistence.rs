//! JSON file store for config entries and restore data.
//!
//! The daemon keeps everything that must survive a restart in one file:
//! the plant config entries (so `replace_sensor` changes stick) and the
//! restore data of thresholds, the light integral and the DLI.
//!
//! Config changes are written through at once. Restore data changes on
//! every light sample, so it is only kept in memory and written by
//! [`FileStore::flush`], which the daemon calls periodically and on
//! shutdown. File writes run on the blocking pool.

use crate::error::{PlantError, Result};
use crate::host::{ConfigRecord, ConfigStore, RestoreStore};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    #[serde(default)]
    pub entries: BTreeMap<String, ConfigRecord>,
    #[serde(default)]
    pub restore: BTreeMap<String, Value>,
}

/// Where an unreadable state file is moved, e.g. `state.json.corrupt`.
pub fn corrupt_path(path: &Path) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(".corrupt");
    PathBuf::from(name)
}

impl PersistedState {
    /// Load the state file. A file that does not parse is moved aside so the
    /// next write cannot overwrite it.
    pub fn load(path: &Path) -> Self {
        match fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<PersistedState>(&bytes) {
                Ok(state) => {
                    info!(
                        "Loaded {} plant entries and {} restore values from {:?}",
                        state.entries.len(),
                        state.restore.len(),
                        path
                    );
                    state
                }
                Err(e) => {
                    let backup = corrupt_path(path);
                    warn!(
                        "Failed to parse state file {:?}: {}, moving it to {:?}",
                        path, e, backup
                    );
                    if let Err(e) = fs::rename(path, &backup) {
                        error!("Failed to move {:?} aside: {}", path, e);
                    }
                    Self::default()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state file at {:?} (first run)", path);
                Self::default()
            }
            Err(e) => {
                error!("Failed to read state file {:?}: {}", path, e);
                Self::default()
            }
        }
    }
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, data)?;
    Ok(())
}

/// File-backed [`ConfigStore`] and [`RestoreStore`].
pub struct FileStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
    dirty: AtomicBool,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = PersistedState::load(&path);
        Self {
            path,
            state: Mutex::new(state),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn entry_ids(&self) -> Vec<String> {
        self.state.lock().entries.keys().cloned().collect()
    }

    /// Add an entry unless one with the same id is already stored. Returns
    /// whether it was added. Written on the next [`flush`](Self::flush).
    pub fn seed_entry(&self, entry_id: &str, record: ConfigRecord) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(entry_id) {
            return false;
        }
        state.entries.insert(entry_id.to_string(), record);
        self.dirty.store(true, Ordering::Release);
        true
    }

    /// Write pending changes, if any.
    pub async fn flush(&self) -> Result<()> {
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        if let Err(e) = self.write().await {
            self.dirty.store(true, Ordering::Release);
            return Err(e);
        }
        debug!("Flushed state to {:?}", self.path);
        Ok(())
    }

    async fn write(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&*self.state.lock())?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_file(&path, &data)).await?
    }

    /// Write everything now, including pending restore data.
    async fn write_through(&self) -> Result<()> {
        self.dirty.store(false, Ordering::Release);
        self.write().await
    }
}

#[async_trait]
impl ConfigStore for FileStore {
    async fn read_entry(&self, entry_id: &str) -> Result<ConfigRecord> {
        self.state
            .lock()
            .entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))
    }

    async fn merge_key(&self, entry_id: &str, key: &str, value: Value) -> Result<()> {
        {
            let mut state = self.state.lock();
            let entry = state
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))?;
            entry.insert(key.to_string(), value);
        }
        self.write_through().await
    }

    async fn remove_entry(&self, entry_id: &str) -> Result<()> {
        if self.state.lock().entries.remove(entry_id).is_none() {
            return Err(PlantError::PlantNotFound(entry_id.to_string()));
        }
        self.write_through().await
    }
}

#[async_trait]
impl RestoreStore for FileStore {
    async fn load(&self, key: &str) -> Option<Value> {
        self.state.lock().restore.get(key).cloned()
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        let mut state = self.state.lock();
        if state.restore.get(key) != Some(&value) {
            state.restore.insert(key.to_string(), value);
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        if self.state.lock().restore.remove(key).is_some() {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// Scratch directory removed on drop.
    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("plant-monitor-{}", uuid::Uuid::new_v4())))
        }

        fn path(&self) -> &Path {
            &self.0
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    fn record(value: Value) -> ConfigRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[tokio::test]
    async fn test_merge_key_keeps_other_keys() {
        let dir = ScratchDir::new();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path);
        assert!(store.seed_entry("e1", record(json!({"name": "Fern", "moisture_sensor": "sensor.a"}))));

        store
            .merge_key("e1", "temperature_sensor", json!("sensor.t"))
            .await
            .unwrap();
        store.merge_key("e1", "moisture_sensor", Value::Null).await.unwrap();

        let reopened = FileStore::open(&path);
        let entry = reopened.read_entry("e1").await.unwrap();
        assert_eq!(entry["name"], json!("Fern"));
        assert_eq!(entry["temperature_sensor"], json!("sensor.t"));
        assert_eq!(entry["moisture_sensor"], Value::Null);
        assert!(matches!(
            reopened.merge_key("e2", "name", json!("x")).await,
            Err(PlantError::PlantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_restore_round_trip_and_seed() {
        let dir = ScratchDir::new();
        let path = dir.path().join("nested").join("state.json");
        let store = FileStore::open(&path);
        store.save("e1.dli", json!({"last_period": "3.5"})).await.unwrap();
        assert!(store.seed_entry("e1", record(json!({"name": "Fern"}))));
        assert!(!store.seed_entry("e1", record(json!({"name": "Other"}))));
        store.flush().await.unwrap();

        let reopened = FileStore::open(&path);
        assert_eq!(
            reopened.load("e1.dli").await,
            Some(json!({"last_period": "3.5"}))
        );
        assert_eq!(reopened.read_entry("e1").await.unwrap()["name"], json!("Fern"));
        assert_eq!(reopened.entry_ids(), vec!["e1".to_string()]);
    }

    #[tokio::test]
    async fn test_restore_data_waits_for_flush() {
        let dir = ScratchDir::new();
        let path = dir.path().join("state.json");
        let store = FileStore::open(&path);
        store.seed_entry("e1", record(json!({"name": "Fern"})));
        store.flush().await.unwrap();

        store.save("e1.total_light_integral", json!({"total": "1"})).await.unwrap();
        assert_eq!(FileStore::open(&path).load("e1.total_light_integral").await, None);

        store.flush().await.unwrap();
        assert!(FileStore::open(&path).load("e1.total_light_integral").await.is_some());

        store.remove("e1.total_light_integral").await.unwrap();
        store.remove_entry("e1").await.unwrap();
        let reopened = FileStore::open(&path);
        assert_eq!(reopened.load("e1.total_light_integral").await, None);
        assert!(reopened.entry_ids().is_empty());
        assert!(matches!(
            store.remove_entry("e1").await,
            Err(PlantError::PlantNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let dir = ScratchDir::new();
        fs::create_dir_all(dir.path()).unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"{not json").unwrap();

        let store = FileStore::open(&path);
        assert!(store.entry_ids().is_empty());
        assert_eq!(fs::read(corrupt_path(&path)).unwrap(), b"{not json");

        store.seed_entry("e1", record(json!({"name": "Fern"})));
        store.flush().await.unwrap();
        assert_eq!(fs::read(corrupt_path(&path)).unwrap(), b"{not json");
        assert_eq!(FileStore::open(&path).entry_ids(), vec!["e1".to_string()]);
    }
}
