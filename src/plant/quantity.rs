//! Measured quantities and their parameters.
//!
//! Each quantity is described by one [`QuantitySpec`] row: config keys,
//! display unit, icon, threshold defaults and the species-database fields
//! that seed its bounds.

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

pub const DEFAULT_LUX_TO_PPFD: f64 = 0.0185;
pub const LUX_TO_PPFD_RANGE: (f64, f64) = (0.001, 0.1);
pub const LUX_TO_PPFD_STEP: f64 = 0.0001;

/// µmol/s⋅m² per hour → mol/d⋅m²
pub const PPFD_DLI_FACTOR: f64 = 0.0036;

pub const UNIT_PPFD: &str = "mol/s⋅m²";
pub const UNIT_TOTAL_LIGHT_INTEGRAL: &str = "mol/m²";
pub const UNIT_DLI: &str = "mol/d⋅m²";
pub const UNIT_CELSIUS: &str = "°C";
pub const UNIT_FAHRENHEIT: &str = "°F";
pub const UNIT_PERCENT: &str = "%";
pub const UNIT_CONDUCTIVITY: &str = "µS/cm";
pub const UNIT_LUX: &str = "lx";
pub const UNIT_PPM: &str = "ppm";

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Quantity {
    Moisture,
    Temperature,
    Conductivity,
    Illuminance,
    Humidity,
    Co2,
    SoilTemperature,
    /// Daily light integral, derived from illuminance.
    Dli,
}

/// Lower or upper threshold of a quantity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    AsRefStr,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Bound {
    Min,
    Max,
}

/// Display unit of a quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Fixed(&'static str),
    /// Whatever temperature unit the host is configured for.
    HostTemperature,
}

impl UnitKind {
    pub fn resolve(&self, host_temperature_unit: &str) -> String {
        match self {
            UnitKind::Fixed(unit) => unit.to_string(),
            UnitKind::HostTemperature => host_temperature_unit.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct QuantitySpec {
    pub quantity: Quantity,
    /// Human readable name used in entity names.
    pub label: &'static str,
    pub unit: UnitKind,
    pub icon: &'static str,
    pub device_class: Option<&'static str>,
    pub threshold_range: (f64, f64),
    pub threshold_step: f64,
    /// Defaults, in °C for the temperature quantities.
    pub default_min: f64,
    pub default_max: f64,
    /// Species-database fields seeding (min, max).
    pub species_fields: Option<(&'static str, &'static str)>,
}

const SPECS: [QuantitySpec; 8] = [
    QuantitySpec {
        quantity: Quantity::Moisture,
        label: "soil moisture",
        unit: UnitKind::Fixed(UNIT_PERCENT),
        icon: "mdi:water",
        device_class: Some("moisture"),
        threshold_range: (0.0, 100.0),
        threshold_step: 1.0,
        default_min: 20.0,
        default_max: 60.0,
        species_fields: Some(("min_soil_moist", "max_soil_moist")),
    },
    QuantitySpec {
        quantity: Quantity::Temperature,
        label: "temperature",
        unit: UnitKind::HostTemperature,
        icon: "mdi:thermometer",
        device_class: Some("temperature"),
        threshold_range: (-50.0, 100.0),
        threshold_step: 1.0,
        default_min: 10.0,
        default_max: 40.0,
        species_fields: Some(("min_temp", "max_temp")),
    },
    QuantitySpec {
        quantity: Quantity::Conductivity,
        label: "conductivity",
        unit: UnitKind::Fixed(UNIT_CONDUCTIVITY),
        icon: "mdi:spa-outline",
        device_class: Some("conductivity"),
        threshold_range: (0.0, 3000.0),
        threshold_step: 50.0,
        default_min: 500.0,
        default_max: 3000.0,
        species_fields: Some(("min_soil_ec", "max_soil_ec")),
    },
    QuantitySpec {
        quantity: Quantity::Illuminance,
        label: "illuminance",
        unit: UnitKind::Fixed(UNIT_LUX),
        icon: "mdi:brightness-6",
        device_class: Some("illuminance"),
        threshold_range: (0.0, 200_000.0),
        threshold_step: 500.0,
        default_min: 0.0,
        default_max: 100_000.0,
        species_fields: Some(("min_light_lux", "max_light_lux")),
    },
    QuantitySpec {
        quantity: Quantity::Humidity,
        label: "air humidity",
        unit: UnitKind::Fixed(UNIT_PERCENT),
        icon: "mdi:water-percent",
        device_class: Some("humidity"),
        threshold_range: (0.0, 100.0),
        threshold_step: 1.0,
        default_min: 20.0,
        default_max: 60.0,
        species_fields: Some(("min_env_humid", "max_env_humid")),
    },
    QuantitySpec {
        quantity: Quantity::Co2,
        label: "CO2",
        unit: UnitKind::Fixed(UNIT_PPM),
        icon: "mdi:molecule-co2",
        device_class: Some("carbon_dioxide"),
        threshold_range: (0.0, 5000.0),
        threshold_step: 50.0,
        default_min: 400.0,
        default_max: 2000.0,
        species_fields: None,
    },
    QuantitySpec {
        quantity: Quantity::SoilTemperature,
        label: "soil temperature",
        unit: UnitKind::HostTemperature,
        icon: "mdi:thermometer",
        device_class: Some("temperature"),
        threshold_range: (-50.0, 100.0),
        threshold_step: 1.0,
        default_min: 10.0,
        default_max: 40.0,
        species_fields: None,
    },
    QuantitySpec {
        quantity: Quantity::Dli,
        label: "daily light integral",
        unit: UnitKind::Fixed(UNIT_DLI),
        icon: "mdi:counter",
        device_class: None,
        threshold_range: (0.0, 100.0),
        threshold_step: 1.0,
        default_min: 2.0,
        default_max: 30.0,
        species_fields: Some(("min_light_mmol", "max_light_mmol")),
    },
];

impl Quantity {
    /// Quantities backed by an external sensor.
    pub fn measured() -> impl Iterator<Item = Quantity> {
        Quantity::iter().filter(|q| *q != Quantity::Dli)
    }

    pub fn spec(self) -> &'static QuantitySpec {
        // SPECS is declared in enum order
        &SPECS[self as usize]
    }

    /// Config key holding the external sensor id, `None` for derived quantities.
    pub fn sensor_key(self) -> Option<String> {
        match self {
            Quantity::Dli => None,
            q => Some(format!("{}_sensor", q.as_ref())),
        }
    }

    pub fn trigger_key(self) -> String {
        format!("{}_trigger", self.as_ref())
    }

    pub fn limit_key(self, bound: Bound) -> String {
        format!("{}_{}", bound.as_ref(), self.as_ref())
    }

    pub fn is_temperature(self) -> bool {
        matches!(self, Quantity::Temperature | Quantity::SoilTemperature)
    }

    /// Suffix of the meter entity, e.g. `current_moisture`.
    pub fn meter_suffix(self) -> String {
        format!("current_{}", self.as_ref())
    }
}

/// Slug used for generated entity ids.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    for c in name.trim().chars().flat_map(char::to_lowercase) {
        if c.is_ascii_alphanumeric() {
            slug.push(c);
        } else if !slug.ends_with('_') && !slug.is_empty() {
            slug.push('_');
        }
    }
    while slug.ends_with('_') {
        slug.pop();
    }
    if slug.is_empty() {
        slug.push_str("plant");
    }
    slug
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_table_matches_enum_order() {
        for quantity in Quantity::iter() {
            assert_eq!(quantity.spec().quantity, quantity);
        }
    }

    #[test]
    fn test_config_keys() {
        assert_eq!(
            Quantity::SoilTemperature.sensor_key().as_deref(),
            Some("soil_temperature_sensor")
        );
        assert_eq!(Quantity::Dli.sensor_key(), None);
        assert_eq!(Quantity::Co2.trigger_key(), "co2_trigger");
        assert_eq!(Quantity::Moisture.limit_key(Bound::Max), "max_moisture");
        assert_eq!(Quantity::Dli.limit_key(Bound::Min), "min_dli");
        assert_eq!(Quantity::measured().count(), 7);
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Monstera Deliciosa"), "monstera_deliciosa");
        assert_eq!(slugify("  Fern #2 "), "fern_2");
        assert_eq!(slugify("***"), "plant");
    }
}
