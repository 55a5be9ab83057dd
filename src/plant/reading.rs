//! Readings and status values.

use crate::host::{HostState, STATE_UNAVAILABLE, STATE_UNKNOWN};
use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display};

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ReadingValue {
    Value(f64),
    #[default]
    Unknown,
    Unavailable,
}

/// A measured value together with its unit and the entity it came from.
///
/// Value and unit are replaced together; a sentinel value is never compared
/// numerically.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reading {
    pub value: ReadingValue,
    pub unit: Option<String>,
    pub source: Option<String>,
    /// Upstream timestamp of the value.
    pub updated_at: Option<DateTime<Utc>>,
}

impl Reading {
    pub fn unknown(source: Option<String>) -> Self {
        Self {
            value: ReadingValue::Unknown,
            unit: None,
            source,
            updated_at: None,
        }
    }

    pub fn known(value: f64, unit: Option<String>, source: Option<String>) -> Self {
        Self {
            value: ReadingValue::Value(value),
            unit,
            source,
            updated_at: None,
        }
    }

    /// Parse a host state. A missing state, a sentinel or a non-numeric
    /// state all yield a non-numeric reading.
    pub fn from_host_state(source: &str, state: Option<&HostState>) -> Self {
        let Some(state) = state else {
            return Self::unknown(Some(source.to_string()));
        };
        let unit = state.unit().map(str::to_string);
        let value = match state.state.as_str() {
            STATE_UNKNOWN => ReadingValue::Unknown,
            STATE_UNAVAILABLE => ReadingValue::Unavailable,
            raw => match raw.trim().parse::<f64>() {
                Ok(v) if v.is_finite() => ReadingValue::Value(v),
                _ => {
                    debug!("Non-numeric state {:?} from {}", raw, source);
                    ReadingValue::Unknown
                }
            },
        };
        Self {
            value,
            unit,
            source: Some(source.to_string()),
            updated_at: Some(state.last_updated),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self.value {
            ReadingValue::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_known(&self) -> bool {
        self.as_f64().is_some()
    }

    /// State string as published to the host.
    pub fn state_string(&self) -> String {
        format_value(self.value)
    }
}

pub fn format_value(value: ReadingValue) -> String {
    match value {
        ReadingValue::Value(v) => v.to_string(),
        ReadingValue::Unknown => STATE_UNKNOWN.to_string(),
        ReadingValue::Unavailable => STATE_UNAVAILABLE.to_string(),
    }
}

/// Classification of one quantity against its thresholds. An unknown
/// reading has no status at all (`Option<Status>::None`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, AsRefStr)]
pub enum Status {
    #[strum(serialize = "ok")]
    #[serde(rename = "ok")]
    Ok,
    #[strum(serialize = "Low")]
    #[serde(rename = "Low")]
    Low,
    #[strum(serialize = "High")]
    #[serde(rename = "High")]
    High,
}

/// Combined state of the plant entity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlantState {
    Ok,
    Problem,
    #[default]
    Unknown,
}
