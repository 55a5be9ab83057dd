//! Plant config entry record.

use super::quantity::Quantity;
use super::threshold::ThresholdKind;
use crate::error::{PlantError, Result};
use crate::host::ConfigRecord;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn enabled() -> bool {
    true
}

/// Which quantities may escalate the plant state to a problem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerOptions {
    #[serde(default = "enabled")]
    pub moisture_trigger: bool,
    #[serde(default = "enabled")]
    pub temperature_trigger: bool,
    #[serde(default = "enabled")]
    pub conductivity_trigger: bool,
    #[serde(default = "enabled")]
    pub illuminance_trigger: bool,
    #[serde(default = "enabled")]
    pub humidity_trigger: bool,
    #[serde(default = "enabled")]
    pub co2_trigger: bool,
    #[serde(default = "enabled")]
    pub soil_temperature_trigger: bool,
    #[serde(default = "enabled")]
    pub dli_trigger: bool,
}

impl Default for TriggerOptions {
    fn default() -> Self {
        Self {
            moisture_trigger: true,
            temperature_trigger: true,
            conductivity_trigger: true,
            illuminance_trigger: true,
            humidity_trigger: true,
            co2_trigger: true,
            soil_temperature_trigger: true,
            dli_trigger: true,
        }
    }
}

impl TriggerOptions {
    /// Effective trigger of a quantity. DLI also depends on the
    /// illuminance trigger.
    pub fn is_enabled(&self, quantity: Quantity) -> bool {
        match quantity {
            Quantity::Moisture => self.moisture_trigger,
            Quantity::Temperature => self.temperature_trigger,
            Quantity::Conductivity => self.conductivity_trigger,
            Quantity::Illuminance => self.illuminance_trigger,
            Quantity::Humidity => self.humidity_trigger,
            Quantity::Co2 => self.co2_trigger,
            Quantity::SoilTemperature => self.soil_temperature_trigger,
            Quantity::Dli => self.illuminance_trigger && self.dli_trigger,
        }
    }
}

/// One plant as stored in its config entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlantRecord {
    pub name: String,
    #[serde(default)]
    pub species: String,
    #[serde(default)]
    pub display_pid: Option<String>,
    #[serde(default)]
    pub entity_picture: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    /// Free-text notes shown on the plant's text entity.
    #[serde(default)]
    pub notes: Option<String>,
    /// `min_<quantity>` / `max_<quantity>` bounds. Values may be numbers or
    /// numeric strings.
    #[serde(default)]
    pub limits: BTreeMap<String, Value>,
    #[serde(default)]
    pub moisture_sensor: Option<String>,
    #[serde(default)]
    pub temperature_sensor: Option<String>,
    #[serde(default)]
    pub conductivity_sensor: Option<String>,
    #[serde(default)]
    pub illuminance_sensor: Option<String>,
    #[serde(default)]
    pub humidity_sensor: Option<String>,
    #[serde(default)]
    pub co2_sensor: Option<String>,
    #[serde(default)]
    pub soil_temperature_sensor: Option<String>,
    #[serde(default)]
    pub lux_to_ppfd: Option<f64>,
    #[serde(default)]
    pub options: TriggerOptions,
}

impl PlantRecord {
    pub fn from_config(entry_id: &str, record: ConfigRecord) -> Result<Self> {
        let plant: PlantRecord =
            serde_json::from_value(Value::Object(record)).map_err(|e| {
                PlantError::InvalidConfig {
                    entry_id: entry_id.to_string(),
                    reason: e.to_string(),
                }
            })?;
        if plant.name.trim().is_empty() {
            return Err(PlantError::InvalidConfig {
                entry_id: entry_id.to_string(),
                reason: "missing plant name".to_string(),
            });
        }
        Ok(plant)
    }

    /// External sensor configured for a quantity. Empty strings count as
    /// unset.
    pub fn sensor(&self, quantity: Quantity) -> Option<&str> {
        let sensor = match quantity {
            Quantity::Moisture => self.moisture_sensor.as_deref(),
            Quantity::Temperature => self.temperature_sensor.as_deref(),
            Quantity::Conductivity => self.conductivity_sensor.as_deref(),
            Quantity::Illuminance => self.illuminance_sensor.as_deref(),
            Quantity::Humidity => self.humidity_sensor.as_deref(),
            Quantity::Co2 => self.co2_sensor.as_deref(),
            Quantity::SoilTemperature => self.soil_temperature_sensor.as_deref(),
            Quantity::Dli => None,
        };
        sensor.filter(|s| !s.trim().is_empty())
    }

    /// Configured value of a threshold, if present and numeric.
    pub fn limit(&self, kind: ThresholdKind) -> Option<f64> {
        match kind {
            ThresholdKind::LuxToPpfd => self.lux_to_ppfd,
            kind => self.limits.get(&kind.config_key()).and_then(value_as_f64),
        }
    }

    /// Whether any threshold still needs a seed from somewhere else.
    pub fn has_missing_limits(&self) -> bool {
        ThresholdKind::all()
            .filter(|kind| *kind != ThresholdKind::LuxToPpfd)
            .any(|kind| self.limit(kind).is_none())
    }
}

fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
