//! Configurable thresholds.

use super::quantity::{
    Bound, DEFAULT_LUX_TO_PPFD, LUX_TO_PPFD_RANGE, LUX_TO_PPFD_STEP, Quantity, UNIT_CELSIUS,
    UNIT_FAHRENHEIT,
};
use crate::host::{HostState, ATTR_UNIT_OF_MEASUREMENT};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

/// Which bound a [`ThresholdStore`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ThresholdKind {
    Limit(Quantity, Bound),
    /// Lux to PPFD conversion factor.
    LuxToPpfd,
}

impl ThresholdKind {
    /// Every store a plant owns: min/max for each quantity plus the factor.
    pub fn all() -> impl Iterator<Item = ThresholdKind> {
        Quantity::iter()
            .flat_map(|q| Bound::iter().map(move |b| ThresholdKind::Limit(q, b)))
            .chain(std::iter::once(ThresholdKind::LuxToPpfd))
    }

    /// Key inside the `limits` config map, also the entity id suffix.
    pub fn config_key(&self) -> String {
        match self {
            ThresholdKind::Limit(q, b) => q.limit_key(*b),
            ThresholdKind::LuxToPpfd => "lux_to_ppfd".to_string(),
        }
    }

    pub fn quantity(&self) -> Option<Quantity> {
        match self {
            ThresholdKind::Limit(q, _) => Some(*q),
            ThresholdKind::LuxToPpfd => None,
        }
    }

    pub fn is_temperature(&self) -> bool {
        self.quantity().is_some_and(Quantity::is_temperature)
    }

    pub fn range(&self) -> (f64, f64) {
        match self {
            ThresholdKind::Limit(q, _) => q.spec().threshold_range,
            ThresholdKind::LuxToPpfd => LUX_TO_PPFD_RANGE,
        }
    }

    pub fn step(&self) -> f64 {
        match self {
            ThresholdKind::Limit(q, _) => q.spec().threshold_step,
            ThresholdKind::LuxToPpfd => LUX_TO_PPFD_STEP,
        }
    }

    /// Hard-coded default, temperatures shown in the host unit.
    pub fn default_value(&self, temperature_unit: &str) -> f64 {
        match self {
            ThresholdKind::Limit(q, bound) => {
                let spec = q.spec();
                let value = match bound {
                    Bound::Min => spec.default_min,
                    Bound::Max => spec.default_max,
                };
                if q.is_temperature() {
                    celsius_to_display(value, temperature_unit)
                } else {
                    value
                }
            }
            ThresholdKind::LuxToPpfd => DEFAULT_LUX_TO_PPFD,
        }
    }

    pub fn unit(&self, temperature_unit: &str) -> Option<String> {
        self.quantity()
            .map(|q| q.spec().unit.resolve(temperature_unit))
    }

    /// Seed value: config override, then species value, then default.
    pub fn seed(&self, config: Option<f64>, species: Option<f64>, temperature_unit: &str) -> f64 {
        config
            .or(species)
            .unwrap_or_else(|| self.default_value(temperature_unit))
    }
}

/// Convert between °C and °F. `None` for any other unit pair.
pub fn convert_temperature(value: f64, from: &str, to: &str) -> Option<f64> {
    match (from, to) {
        (a, b) if a == b => Some(value),
        (UNIT_CELSIUS, UNIT_FAHRENHEIT) => Some(value * 9.0 / 5.0 + 32.0),
        (UNIT_FAHRENHEIT, UNIT_CELSIUS) => Some((value - 32.0) * 5.0 / 9.0),
        _ => None,
    }
}

/// A °C value rounded to a whole number in the host's temperature unit.
pub fn celsius_to_display(celsius: f64, temperature_unit: &str) -> f64 {
    convert_temperature(celsius, UNIT_CELSIUS, temperature_unit)
        .unwrap_or(celsius)
        .round_ties_even()
}

/// Persisted value of a user-edited threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSnapshot {
    pub value: f64,
    #[serde(default)]
    pub unit: Option<String>,
}

/// One scalar bound owned by a plant.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdStore {
    kind: ThresholdKind,
    entity_id: String,
    value: f64,
    unit: Option<String>,
}

impl ThresholdStore {
    pub fn new(
        kind: ThresholdKind,
        entity_id: impl Into<String>,
        value: f64,
        unit: Option<String>,
    ) -> Self {
        Self {
            kind,
            entity_id: entity_id.into(),
            value,
            unit,
        }
    }

    pub fn kind(&self) -> ThresholdKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn rename(&mut self, entity_id: &str) {
        self.entity_id = entity_id.to_string();
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Overwrite the value. No range check: the host's input widget bounds it.
    pub fn set_value(&mut self, value: f64) {
        self.value = value;
    }

    /// Convert a temperature bound after the host switched units. Returns
    /// whether anything changed.
    pub fn on_unit_system_changed(&mut self, old: Option<&str>, new: Option<&str>) -> bool {
        if !self.kind.is_temperature() {
            return false;
        }
        let (Some(old), Some(new)) = (old, new) else {
            return false;
        };
        if old == new {
            return false;
        }
        let Some(converted) = convert_temperature(self.value, old, new) else {
            debug!("{}: cannot convert {} to {}", self.entity_id, old, new);
            return false;
        };
        let converted = converted.round_ties_even();
        debug!(
            "{}: changing from {} {} to {} {}",
            self.entity_id, self.value, old, converted, new
        );
        self.value = converted;
        self.unit = Some(new.to_string());
        true
    }

    pub fn snapshot(&self) -> ThresholdSnapshot {
        ThresholdSnapshot {
            value: self.value,
            unit: self.unit.clone(),
        }
    }

    /// Take over a saved value. A temperature saved under another unit is
    /// converted to the current one.
    pub fn restore(&mut self, snapshot: ThresholdSnapshot) {
        let current = self.unit.clone();
        self.value = snapshot.value;
        if snapshot.unit.is_some() && snapshot.unit != current {
            self.on_unit_system_changed(snapshot.unit.as_deref(), current.as_deref());
        }
        self.unit = current;
    }

    pub fn to_host_state(&self, at: DateTime<Utc>) -> HostState {
        let (min, max) = self.kind.range();
        let mut state = HostState::new(self.value.to_string(), at)
            .with_attribute("min", min)
            .with_attribute("max", max)
            .with_attribute("step", self.kind.step());
        if let Some(unit) = &self.unit {
            state = state.with_attribute(ATTR_UNIT_OF_MEASUREMENT, unit.as_str());
        }
        state
    }
}
