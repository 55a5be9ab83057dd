//! Host platform interfaces.
//!
//! Everything the plant components need from the home-automation host is
//! reached through the traits in this module: reading and writing entity
//! states, persisting config entries and restore data, toggling entity
//! registry flags, and looking up species data. The host delivers changes
//! to the plant through [`HostEvent`]s on its event bus.

pub mod memory;

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;

pub use memory::InMemoryHost;

/// Sentinel state for a reading with no current value.
pub const STATE_UNKNOWN: &str = "unknown";
/// Sentinel state for a source that is currently unreachable.
pub const STATE_UNAVAILABLE: &str = "unavailable";

pub const ATTR_UNIT_OF_MEASUREMENT: &str = "unit_of_measurement";
pub const ATTR_EXTERNAL_SENSOR: &str = "external_sensor";

/// A config entry record as stored by the host.
pub type ConfigRecord = Map<String, Value>;

/// State of a single entity as held by the host state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostState {
    pub state: String,
    #[serde(default)]
    pub attributes: Map<String, Value>,
    pub last_updated: DateTime<Utc>,
}

impl HostState {
    pub fn new(state: impl Into<String>, last_updated: DateTime<Utc>) -> Self {
        Self {
            state: state.into(),
            attributes: Map::new(),
            last_updated,
        }
    }

    /// Attach a unit of measurement.
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.with_attribute(ATTR_UNIT_OF_MEASUREMENT, unit.into())
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn unit(&self) -> Option<&str> {
        self.attributes
            .get(ATTR_UNIT_OF_MEASUREMENT)
            .and_then(Value::as_str)
    }

    pub fn attribute_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryAction {
    Create,
    Update,
    Remove,
}

/// Entity registry notification.
///
/// `old_entity_id` is set only when an update renamed the entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryUpdate {
    pub action: RegistryAction,
    pub entity_id: String,
    pub old_entity_id: Option<String>,
}

impl RegistryUpdate {
    pub fn renamed(old: impl Into<String>, new: impl Into<String>) -> Self {
        Self {
            action: RegistryAction::Update,
            entity_id: new.into(),
            old_entity_id: Some(old.into()),
        }
    }

    pub fn removed(entity_id: impl Into<String>) -> Self {
        Self {
            action: RegistryAction::Remove,
            entity_id: entity_id.into(),
            old_entity_id: None,
        }
    }
}

/// Events delivered on the host event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    StateChanged {
        entity_id: String,
        old_state: Option<HostState>,
        new_state: Option<HostState>,
    },
    RegistryUpdated(RegistryUpdate),
    /// The host's temperature unit changed (e.g. `°C` to `°F`).
    UnitSystemChanged {
        old: Option<String>,
        new: Option<String>,
    },
}

/// Host state machine.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Resolve the current state of an entity, if it exists.
    fn get_state(&self, entity_id: &str) -> Option<HostState>;

    /// Publish a new state for an entity owned by this crate.
    async fn set_state(&self, entity_id: &str, state: HostState);
}

/// Persistent config entries.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn read_entry(&self, entry_id: &str) -> Result<ConfigRecord>;

    /// Read-merge-write of a single key; other keys of the entry are preserved.
    async fn merge_key(&self, entry_id: &str, key: &str, value: Value) -> Result<()>;

    async fn remove_entry(&self, entry_id: &str) -> Result<()>;
}

/// Last-known state of derived entities across restarts.
#[async_trait]
pub trait RestoreStore: Send + Sync {
    async fn load(&self, key: &str) -> Option<Value>;
    async fn save(&self, key: &str, value: Value) -> Result<()>;
    async fn remove(&self, key: &str) -> Result<()>;
}

pub trait EntityRegistry: Send + Sync {
    /// Entity id registered for `unique_id`. On first use `suggested` is
    /// registered, with a `_2`, `_3`, ... suffix if already taken.
    fn get_or_create(&self, unique_id: &str, suggested: &str) -> String;

    fn set_disabled(&self, entity_id: &str, disabled: bool);

    /// Drop an entity: its state, registration and flags.
    fn delete_entity(&self, entity_id: &str);
}

/// Species database (OpenPlantbook-style).
#[async_trait]
pub trait SpeciesLookup: Send + Sync {
    /// Search species by alias; returns `pid -> display name`.
    async fn search(&self, alias: &str) -> Result<HashMap<String, String>>;

    /// Fetch the full record of one species, `None` if unknown.
    async fn get(&self, species_id: &str) -> Result<Option<ConfigRecord>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_state_unit() {
        let now = Utc::now();
        let state = HostState::new("12.5", now).with_unit("lx");
        assert_eq!(state.unit(), Some("lx"));
        assert_eq!(state.attribute_str(ATTR_UNIT_OF_MEASUREMENT), Some("lx"));
        assert!(HostState::new(STATE_UNKNOWN, now).unit().is_none());
    }

    #[test]
    fn test_registry_update_constructors() {
        let update = RegistryUpdate::renamed("sensor.a", "sensor.b");
        assert_eq!(update.action, RegistryAction::Update);
        assert_eq!(update.old_entity_id.as_deref(), Some("sensor.a"));
        assert_eq!(RegistryUpdate::removed("sensor.a").action, RegistryAction::Remove);
    }
}
