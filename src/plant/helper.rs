//! Species-database helper.
//!
//! Turns a species record into threshold seeds. The lookup is optional and
//! bounded by a timeout; when it is absent, slow or failing, setup carries
//! on with the hard-coded defaults.

use super::dli::mmol_to_dli;
use super::quantity::{Bound, Quantity};
use super::threshold::{ThresholdKind, celsius_to_display};
use crate::host::{ConfigRecord, SpeciesLookup};
use log::{debug, warn};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use strum::IntoEnumIterator;

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What a species lookup contributes to a plant.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpeciesData {
    pub limits: BTreeMap<ThresholdKind, f64>,
    pub display_pid: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Clone)]
pub struct PlantHelper {
    lookup: Option<Arc<dyn SpeciesLookup>>,
    timeout: Duration,
}

impl PlantHelper {
    pub fn new(lookup: Option<Arc<dyn SpeciesLookup>>) -> Self {
        Self {
            lookup,
            timeout: REQUEST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Search species by alias. Empty on any failure.
    pub async fn search(&self, alias: &str) -> HashMap<String, String> {
        let Some(lookup) = &self.lookup else {
            return HashMap::new();
        };
        match tokio::time::timeout(self.timeout, lookup.search(alias)).await {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                warn!("Species search for {:?} failed: {}", alias, e);
                HashMap::new()
            }
            Err(_) => {
                warn!("Species search for {:?} timed out", alias);
                HashMap::new()
            }
        }
    }

    /// Fetch threshold seeds for a species. `None` when there is no lookup,
    /// the species is unknown, or the request fails.
    pub async fn species_data(&self, species: &str, temperature_unit: &str) -> Option<SpeciesData> {
        let lookup = self.lookup.as_ref()?;
        if species.trim().is_empty() {
            return None;
        }
        let record = match tokio::time::timeout(self.timeout, lookup.get(species)).await {
            Ok(Ok(Some(record))) => record,
            Ok(Ok(None)) => {
                debug!("Species {:?} not found, using defaults", species);
                return None;
            }
            Ok(Err(e)) => {
                warn!("Species lookup for {:?} failed: {}, using defaults", species, e);
                return None;
            }
            Err(_) => {
                warn!(
                    "Species lookup for {:?} timed out after {:?}, using defaults",
                    species, self.timeout
                );
                return None;
            }
        };
        Some(parse_species_record(&record, temperature_unit))
    }
}

/// Map a species record onto thresholds.
pub fn parse_species_record(record: &ConfigRecord, temperature_unit: &str) -> SpeciesData {
    let mut limits = BTreeMap::new();
    for quantity in Quantity::iter() {
        let Some((min_field, max_field)) = quantity.spec().species_fields else {
            continue;
        };
        for bound in Bound::iter() {
            let kind = ThresholdKind::Limit(quantity, bound);
            let field = match bound {
                Bound::Min => min_field,
                Bound::Max => max_field,
            };
            let Some(raw) = record.get(field) else {
                continue;
            };
            let value = match parse_int(raw) {
                Some(v) if quantity == Quantity::Dli => mmol_to_dli(v),
                Some(v) if quantity.is_temperature() => celsius_to_display(v, temperature_unit),
                Some(v) => v,
                None => {
                    let default = kind.default_value(temperature_unit);
                    warn!("Unable to convert {} of {} to a number, using {}", field, raw, default);
                    default
                }
            };
            limits.insert(kind, value);
        }
    }

    let text = |key: &str| {
        record
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    SpeciesData {
        limits,
        display_pid: text("display_pid"),
        image_url: text("image_url"),
    }
}

/// Integer-valued species field: integer strings parse directly, float
/// strings and numbers round.
fn parse_int(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(i as f64),
            None => n.as_f64().map(f64::round_ties_even),
        },
        Value::String(s) => {
            let s = s.trim();
            match s.parse::<i64>() {
                Ok(i) => Some(i as f64),
                Err(_) => s
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(f64::round_ties_even),
            }
        }
        _ => None,
    }
}
