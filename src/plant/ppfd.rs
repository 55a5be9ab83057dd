//! Lux to photosynthetic photon flux density.

use super::quantity::UNIT_PPFD;
use super::reading::{Reading, ReadingValue, format_value};
use crate::host::{HostState, ATTR_UNIT_OF_MEASUREMENT};
use chrono::{DateTime, Utc};

const MICRO: f64 = 1_000_000.0;

/// Whether a unit already denotes a photon flux (e.g. `µmol/s⋅m²`).
pub fn is_photon_flux(unit: Option<&str>) -> bool {
    unit.is_some_and(|u| u.contains("mol"))
}

/// Convert an illuminance reading to PPFD in mol/s⋅m².
///
/// Lux readings are scaled by `factor` (µmol/s⋅m² per lux); readings
/// already in a photon-flux unit are only rescaled from µmol to mol.
///
/// # Example
///
/// ```
/// use plant_monitor::plant::{Reading, ReadingValue, ppfd};
///
/// let lux = Reading::known(10_000.0, Some("lx".into()), None);
/// let ReadingValue::Value(v) = ppfd(&lux, 0.0185) else { unreachable!() };
/// assert!((v - 0.000185).abs() < 1e-12);
/// ```
pub fn ppfd(reading: &Reading, factor: f64) -> ReadingValue {
    match reading.as_f64() {
        Some(v) if is_photon_flux(reading.unit.as_deref()) => ReadingValue::Value(v / MICRO),
        Some(v) => ReadingValue::Value(v * factor / MICRO),
        None => ReadingValue::Unknown,
    }
}

/// Derived PPFD entity fed by the illuminance meter.
#[derive(Debug, Clone)]
pub struct PpfdSensor {
    entity_id: String,
    source: Option<String>,
    value: ReadingValue,
}

impl PpfdSensor {
    pub fn new(entity_id: impl Into<String>, source: Option<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            source,
            value: ReadingValue::Unknown,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    pub fn rename(&mut self, entity_id: &str) {
        self.entity_id = entity_id.to_string();
    }

    pub fn source(&self) -> Option<&str> {
        self.source.as_deref()
    }

    /// Point at a new source. The value is kept until the next update.
    pub fn set_source(&mut self, source: Option<String>) {
        self.source = source;
    }

    pub fn value(&self) -> ReadingValue {
        self.value
    }

    /// Recompute from the source state. Returns whether the value changed.
    pub fn update(&mut self, source_state: Option<&HostState>, factor: f64) -> bool {
        let value = match &self.source {
            Some(source) => ppfd(&Reading::from_host_state(source, source_state), factor),
            None => ReadingValue::Unknown,
        };
        let changed = value != self.value;
        self.value = value;
        changed
    }

    pub fn to_host_state(&self, at: DateTime<Utc>) -> HostState {
        HostState::new(format_value(self.value), at)
            .with_attribute(ATTR_UNIT_OF_MEASUREMENT, UNIT_PPFD)
            .with_attribute("icon", "mdi:white-balance-sunny")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ppfd_from_lux() {
        let lux = Reading::known(10_000.0, Some("lx".into()), None);
        let ReadingValue::Value(v) = ppfd(&lux, 0.0185) else {
            panic!("expected a value");
        };
        assert!((v - 0.000185).abs() < 1e-12);
    }

    #[test]
    fn test_ppfd_from_photon_flux_ignores_factor() {
        let flux = Reading::known(500.0, Some("µmol/s⋅m²".into()), None);
        assert_eq!(ppfd(&flux, 0.0185), ReadingValue::Value(0.0005));
    }

    #[test]
    fn test_unknown_lux_gives_unknown_ppfd() {
        assert_eq!(ppfd(&Reading::unknown(None), 0.0185), ReadingValue::Unknown);
        let unavailable = Reading {
            value: ReadingValue::Unavailable,
            ..Reading::default()
        };
        assert_eq!(ppfd(&unavailable, 0.0185), ReadingValue::Unknown);
    }

    #[test]
    fn test_sensor_without_source_is_unknown() {
        let now = Utc::now();
        let mut sensor = PpfdSensor::new("sensor.fern_ppfd", Some("sensor.fern_illuminance".into()));
        let state = HostState::new("20000", now).with_unit("lx");

        assert!(sensor.update(Some(&state), 0.02));
        assert_eq!(sensor.value(), ReadingValue::Value(0.0004));
        assert!(!sensor.update(Some(&state), 0.02));

        sensor.set_source(None);
        sensor.update(Some(&state), 0.02);
        assert_eq!(sensor.value(), ReadingValue::Unknown);
        assert_eq!(sensor.to_host_state(now).state, "unknown");
    }
}
