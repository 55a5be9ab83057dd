//! Meter entities mirroring an external sensor.

use super::quantity::Quantity;
use super::reading::{Reading, ReadingValue};
use crate::host::{HostState, StateStore, ATTR_EXTERNAL_SENSOR, ATTR_UNIT_OF_MEASUREMENT};
use chrono::{DateTime, Utc};

/// Mirrors the reading of one upstream sensor entity.
///
/// The upstream id may be `None`, in which case the reading stays unknown.
/// Only the follower itself writes its reading, through [`pull`] or
/// [`on_upstream_changed`], which share one code path.
///
/// [`pull`]: ExternalSensorFollower::pull
/// [`on_upstream_changed`]: ExternalSensorFollower::on_upstream_changed
#[derive(Debug, Clone)]
pub struct ExternalSensorFollower {
    quantity: Quantity,
    entity_id: String,
    external_sensor: Option<String>,
    reading: Reading,
}

impl ExternalSensorFollower {
    pub fn new(quantity: Quantity, entity_id: impl Into<String>, external_sensor: Option<String>) -> Self {
        let reading = Reading::unknown(external_sensor.clone());
        Self {
            quantity,
            entity_id: entity_id.into(),
            external_sensor,
            reading,
        }
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn rename(&mut self, entity_id: &str) {
        self.entity_id = entity_id.to_string();
    }

    pub fn external_sensor(&self) -> Option<&str> {
        self.external_sensor.as_deref()
    }

    pub fn reading(&self) -> &Reading {
        &self.reading
    }

    /// Swap the tracked upstream id, returning the previous one. The
    /// reading is unknown until the next pull.
    pub fn replace_source(&mut self, external_sensor: Option<String>) -> Option<String> {
        self.reading = Reading::unknown(external_sensor.clone());
        std::mem::replace(&mut self.external_sensor, external_sensor)
    }

    /// Read the upstream state from the host. Returns whether the reading
    /// changed.
    pub fn pull(&mut self, states: &dyn StateStore) -> bool {
        let upstream = self
            .external_sensor
            .as_deref()
            .and_then(|id| states.get_state(id));
        self.on_upstream_changed(upstream.as_ref())
    }

    /// Apply an upstream state. A missing state reads as unknown. The unit
    /// is taken from the upstream when it has one.
    pub fn on_upstream_changed(&mut self, upstream: Option<&HostState>) -> bool {
        let Some(source) = self.external_sensor.as_deref() else {
            let changed = self.reading.value != ReadingValue::Unknown;
            self.reading = Reading::unknown(None);
            return changed;
        };
        let mut reading = Reading::from_host_state(source, upstream);
        if reading.unit.is_none() && upstream.is_some() {
            reading.unit = self.reading.unit.clone();
        }
        let changed = reading != self.reading;
        self.reading = reading;
        changed
    }

    pub fn to_host_state(&self, at: DateTime<Utc>, temperature_unit: &str) -> HostState {
        let spec = self.quantity.spec();
        let unit = self
            .reading
            .unit
            .clone()
            .unwrap_or_else(|| spec.unit.resolve(temperature_unit));
        let mut state = HostState::new(self.reading.state_string(), at)
            .with_attribute(ATTR_EXTERNAL_SENSOR, self.external_sensor.clone())
            .with_attribute(ATTR_UNIT_OF_MEASUREMENT, unit)
            .with_attribute("icon", spec.icon);
        if let Some(device_class) = spec.device_class {
            state = state.with_attribute("device_class", device_class);
        }
        state
    }
}
