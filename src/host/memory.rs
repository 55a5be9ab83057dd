//! In-memory host.
//!
//! Implements every host trait on plain maps behind `parking_lot` locks and
//! fans changes out over a `tokio::sync::broadcast` bus. The daemon runs on
//! top of it, and tests use it as the fake bus.

use super::{
    ConfigRecord, ConfigStore, EntityRegistry, HostEvent, HostState, RegistryUpdate,
    RestoreStore, SpeciesLookup, StateStore,
};
use crate::error::{PlantError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::debug;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 256;

pub struct InMemoryHost {
    states: RwLock<HashMap<String, HostState>>,
    entries: Mutex<HashMap<String, ConfigRecord>>,
    restore: Mutex<HashMap<String, Value>>,
    disabled: RwLock<HashSet<String>>,
    /// unique id -> entity id
    registered: Mutex<HashMap<String, String>>,
    temperature_unit: RwLock<String>,
    events: broadcast::Sender<HostEvent>,
}

impl InMemoryHost {
    pub fn new(temperature_unit: impl Into<String>) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            states: RwLock::new(HashMap::new()),
            entries: Mutex::new(HashMap::new()),
            restore: Mutex::new(HashMap::new()),
            disabled: RwLock::new(HashSet::new()),
            registered: Mutex::new(HashMap::new()),
            temperature_unit: RwLock::new(temperature_unit.into()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: HostEvent) {
        // No receivers is fine: nothing is listening yet.
        if self.events.send(event).is_err() {
            debug!("Host event dropped, no subscribers");
        }
    }

    /// Write a state from outside the plant (sensor input, tests).
    pub fn write_state(&self, entity_id: &str, state: HostState) {
        let old_state = self.states.write().insert(entity_id.to_string(), state.clone());
        self.emit(HostEvent::StateChanged {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: Some(state),
        });
    }

    /// Set a single attribute, creating an `unknown` state if the entity
    /// does not exist yet.
    pub fn write_attribute(&self, entity_id: &str, key: &str, value: Value, at: DateTime<Utc>) {
        let mut state = self
            .states
            .read()
            .get(entity_id)
            .cloned()
            .unwrap_or_else(|| HostState::new(super::STATE_UNKNOWN, at));
        if state.attributes.get(key) == Some(&value) {
            return;
        }
        state.attributes.insert(key.to_string(), value);
        state.last_updated = at;
        self.write_state(entity_id, state);
    }

    /// Move an entity to a new id and announce the rename.
    pub fn rename_entity(&self, old: &str, new: &str) {
        {
            let mut states = self.states.write();
            if let Some(state) = states.remove(old) {
                states.insert(new.to_string(), state);
            }
        }
        {
            let mut disabled = self.disabled.write();
            if disabled.remove(old) {
                disabled.insert(new.to_string());
            }
        }
        for entity_id in self.registered.lock().values_mut() {
            if entity_id == old {
                *entity_id = new.to_string();
            }
        }
        self.emit(HostEvent::RegistryUpdated(RegistryUpdate::renamed(old, new)));
    }

    /// Remove an entity: its state goes away, then the registry entry.
    pub fn remove_entity(&self, entity_id: &str) {
        let old_state = self.states.write().remove(entity_id);
        self.disabled.write().remove(entity_id);
        self.registered.lock().retain(|_, id| id != entity_id);
        self.emit(HostEvent::StateChanged {
            entity_id: entity_id.to_string(),
            old_state,
            new_state: None,
        });
        self.emit(HostEvent::RegistryUpdated(RegistryUpdate::removed(entity_id)));
    }

    pub fn temperature_unit(&self) -> String {
        self.temperature_unit.read().clone()
    }

    pub fn set_temperature_unit(&self, unit: &str) {
        let old = std::mem::replace(&mut *self.temperature_unit.write(), unit.to_string());
        if old == unit {
            return;
        }
        self.emit(HostEvent::UnitSystemChanged {
            old: Some(old),
            new: Some(unit.to_string()),
        });
    }

    pub fn add_entry(&self, entry_id: &str, record: ConfigRecord) {
        self.entries.lock().insert(entry_id.to_string(), record);
    }

    pub fn entry(&self, entry_id: &str) -> Option<ConfigRecord> {
        self.entries.lock().get(entry_id).cloned()
    }

    pub fn is_disabled(&self, entity_id: &str) -> bool {
        self.disabled.read().contains(entity_id)
    }
}

impl Default for InMemoryHost {
    fn default() -> Self {
        Self::new(crate::plant::UNIT_CELSIUS)
    }
}

#[async_trait]
impl StateStore for InMemoryHost {
    fn get_state(&self, entity_id: &str) -> Option<HostState> {
        self.states.read().get(entity_id).cloned()
    }

    async fn set_state(&self, entity_id: &str, state: HostState) {
        self.write_state(entity_id, state);
    }
}

#[async_trait]
impl ConfigStore for InMemoryHost {
    async fn read_entry(&self, entry_id: &str) -> Result<ConfigRecord> {
        self.entries
            .lock()
            .get(entry_id)
            .cloned()
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))
    }

    async fn merge_key(&self, entry_id: &str, key: &str, value: Value) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(entry_id)
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))?;
        entry.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_entry(&self, entry_id: &str) -> Result<()> {
        self.entries
            .lock()
            .remove(entry_id)
            .map(|_| ())
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))
    }
}

#[async_trait]
impl RestoreStore for InMemoryHost {
    async fn load(&self, key: &str) -> Option<Value> {
        self.restore.lock().get(key).cloned()
    }

    async fn save(&self, key: &str, value: Value) -> Result<()> {
        self.restore.lock().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.restore.lock().remove(key);
        Ok(())
    }
}

impl EntityRegistry for InMemoryHost {
    fn get_or_create(&self, unique_id: &str, suggested: &str) -> String {
        let mut registered = self.registered.lock();
        if let Some(entity_id) = registered.get(unique_id) {
            return entity_id.clone();
        }
        let taken = |id: &str| {
            registered.values().any(|r| r == id) || self.states.read().contains_key(id)
        };
        let mut entity_id = suggested.to_string();
        let mut n = 2;
        while taken(&entity_id) {
            entity_id = format!("{}_{}", suggested, n);
            n += 1;
        }
        registered.insert(unique_id.to_string(), entity_id.clone());
        entity_id
    }

    fn set_disabled(&self, entity_id: &str, disabled: bool) {
        let mut set = self.disabled.write();
        if disabled {
            set.insert(entity_id.to_string());
        } else {
            set.remove(entity_id);
        }
    }

    fn delete_entity(&self, entity_id: &str) {
        self.remove_entity(entity_id);
    }
}

/// Species lookup over a fixed table of records keyed by species id.
#[derive(Default)]
pub struct StaticSpeciesLookup {
    species: HashMap<String, ConfigRecord>,
}

impl StaticSpeciesLookup {
    pub fn with_species(mut self, pid: &str, record: ConfigRecord) -> Self {
        self.species.insert(pid.to_string(), record);
        self
    }
}

#[async_trait]
impl SpeciesLookup for StaticSpeciesLookup {
    async fn search(&self, alias: &str) -> Result<HashMap<String, String>> {
        let needle = alias.to_lowercase();
        Ok(self
            .species
            .iter()
            .filter(|(pid, _)| pid.to_lowercase().contains(&needle))
            .map(|(pid, record)| {
                let display = record
                    .get("display_pid")
                    .and_then(Value::as_str)
                    .unwrap_or(pid)
                    .to_string();
                (pid.clone(), display)
            })
            .collect())
    }

    async fn get(&self, species_id: &str) -> Result<Option<ConfigRecord>> {
        Ok(self.species.get(species_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_write_state_emits_change() {
        let host = InMemoryHost::default();
        let mut rx = host.subscribe();

        host.write_state("sensor.soil", HostState::new("21", Utc::now()));

        match rx.recv().await.unwrap() {
            HostEvent::StateChanged {
                entity_id,
                old_state,
                new_state,
            } => {
                assert_eq!(entity_id, "sensor.soil");
                assert!(old_state.is_none());
                assert_eq!(new_state.unwrap().state, "21");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rename_moves_state() {
        let host = InMemoryHost::default();
        host.write_state("sensor.a", HostState::new("3", Utc::now()));
        let mut rx = host.subscribe();

        host.rename_entity("sensor.a", "sensor.b");

        assert!(host.get_state("sensor.a").is_none());
        assert_eq!(host.get_state("sensor.b").unwrap().state, "3");
        assert_eq!(
            rx.recv().await.unwrap(),
            HostEvent::RegistryUpdated(RegistryUpdate::renamed("sensor.a", "sensor.b"))
        );
    }

    #[tokio::test]
    async fn test_merge_key_preserves_other_keys() {
        let host = InMemoryHost::default();
        let mut record = ConfigRecord::new();
        record.insert("name".into(), json!("Fern"));
        record.insert("moisture_sensor".into(), json!("sensor.a"));
        host.add_entry("entry1", record);

        host.merge_key("entry1", "moisture_sensor", json!("sensor.b"))
            .await
            .unwrap();

        let entry = host.read_entry("entry1").await.unwrap();
        assert_eq!(entry["name"], json!("Fern"));
        assert_eq!(entry["moisture_sensor"], json!("sensor.b"));
        assert!(host.merge_key("missing", "x", json!(1)).await.is_err());
    }

    #[test]
    fn test_get_or_create_makes_ids_unique() {
        let host = InMemoryHost::default();
        assert_eq!(host.get_or_create("e1", "plant.fern"), "plant.fern");
        assert_eq!(host.get_or_create("e2", "plant.fern"), "plant.fern_2");
        assert_eq!(host.get_or_create("e1", "plant.other"), "plant.fern");

        host.write_state("plant.fern_3", HostState::new("ok", Utc::now()));
        assert_eq!(host.get_or_create("e3", "plant.fern"), "plant.fern_4");

        host.rename_entity("plant.fern_2", "plant.boston_fern");
        assert_eq!(host.get_or_create("e2", "plant.fern"), "plant.boston_fern");

        host.delete_entity("plant.fern");
        assert_eq!(host.get_or_create("e5", "plant.fern"), "plant.fern");
    }

    #[test]
    fn test_unit_change_is_announced_once() {
        let host = InMemoryHost::default();
        let mut rx = host.subscribe();

        host.set_temperature_unit("°C");
        host.set_temperature_unit("°F");

        assert_eq!(
            rx.try_recv().unwrap(),
            HostEvent::UnitSystemChanged {
                old: Some("°C".into()),
                new: Some("°F".into()),
            }
        );
        assert!(rx.try_recv().is_err());
    }
}
