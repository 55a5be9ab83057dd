//! Daily light integral: the light total accumulated since the last daily
//! boundary.

use super::quantity::{PPFD_DLI_FACTOR, UNIT_DLI};
use crate::host::{HostState, ATTR_UNIT_OF_MEASUREMENT, STATE_UNKNOWN};
use chrono::{DateTime, Duration, FixedOffset, NaiveTime, Offset, TimeZone, Utc};
use log::{info, warn};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// When the day rolls over: local midnight in a fixed UTC offset, shifted
/// by `reset_offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DaySchedule {
    utc_offset: FixedOffset,
    reset_offset: Duration,
}

impl DaySchedule {
    /// `reset_offset_minutes` is folded into a single day.
    pub fn new(utc_offset: FixedOffset, reset_offset_minutes: i64) -> Self {
        Self {
            utc_offset,
            reset_offset: Duration::minutes(reset_offset_minutes.rem_euclid(24 * 60)),
        }
    }

    /// Build from minutes east of UTC; out-of-range offsets fall back to UTC.
    pub fn from_minutes(utc_offset_minutes: i32, reset_offset_minutes: i64) -> Self {
        let utc_offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| {
            warn!(
                "Invalid UTC offset of {} minutes, using UTC",
                utc_offset_minutes
            );
            Utc.fix()
        });
        Self::new(utc_offset, reset_offset_minutes)
    }

    /// First boundary strictly after `t`.
    pub fn next_boundary_after(&self, t: DateTime<Utc>) -> DateTime<Utc> {
        let local = t.with_timezone(&self.utc_offset);
        let local_midnight = local.date_naive().and_time(NaiveTime::MIN);
        let offset = Duration::seconds(i64::from(self.utc_offset.local_minus_utc()));
        let mut boundary = Utc.from_utc_datetime(&(local_midnight - offset)) + self.reset_offset;
        while boundary <= t {
            boundary += Duration::days(1);
        }
        boundary
    }
}

impl Default for DaySchedule {
    fn default() -> Self {
        Self::from_minutes(0, 0)
    }
}

/// Persisted accumulator state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DliSnapshot {
    pub total_at_day_start: Decimal,
    pub last_period: Decimal,
    pub last_reset: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct DailyLightIntegral {
    entity_id: String,
    source: Option<String>,
    schedule: DaySchedule,
    total_at_day_start: Option<Decimal>,
    total: Option<Decimal>,
    delta: Decimal,
    last_period: Decimal,
    last_reset: DateTime<Utc>,
}

impl DailyLightIntegral {
    pub fn new(
        entity_id: impl Into<String>,
        source: Option<String>,
        schedule: DaySchedule,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            source,
            schedule,
            total_at_day_start: None,
            total: None,
            delta: Decimal::ZERO,
            last_period: Decimal::ZERO,
            last_reset: now,
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

    pub fn set_source(&mut self, source: Option<String>) {
        self.source = source;
    }

    pub fn delta(&self) -> Decimal {
        self.delta
    }

    pub fn last_period(&self) -> Decimal {
        self.last_period
    }

    pub fn last_reset(&self) -> DateTime<Utc> {
        self.last_reset
    }

    pub fn total_at_day_start(&self) -> Option<Decimal> {
        self.total_at_day_start
    }

    /// Whether a baseline exists, i.e. the accumulator has a value.
    pub fn is_known(&self) -> bool {
        self.total_at_day_start.is_some()
    }

    /// Last completed period in mol/d⋅m², used for status evaluation.
    pub fn last_period_value(&self) -> Option<f64> {
        self.is_known().then(|| self.last_period.to_f64()).flatten()
    }

    /// New source total. `None` (unknown source) freezes the accumulator.
    /// Returns whether the published value changed.
    pub fn on_source_changed(&mut self, total: Option<Decimal>) -> bool {
        let Some(total) = total else {
            return false;
        };
        self.total = Some(total);
        let baseline = match self.total_at_day_start {
            Some(baseline) if total >= baseline => baseline,
            Some(baseline) => {
                warn!(
                    "{}: source total {} dropped below day start {}, rebasing",
                    self.entity_id, total, baseline
                );
                total
            }
            None => total,
        };
        let was_known = self.is_known();
        self.total_at_day_start = Some(baseline);
        let delta = total - baseline;
        let changed = !was_known || delta != self.delta;
        self.delta = delta;
        changed
    }

    /// Close the current period at `now`.
    pub fn on_day_boundary(&mut self, now: DateTime<Utc>) {
        self.last_period = self.delta;
        if let Some(total) = self.total {
            self.total_at_day_start = Some(total);
        }
        self.delta = Decimal::ZERO;
        self.last_reset = now;
        info!(
            "{}: day closed with {} {}",
            self.entity_id, self.last_period, UNIT_DLI
        );
    }

    /// Fire the boundary if `now` is at or past the next one after the last
    /// reset. Returns whether a reset happened.
    pub fn check_boundary(&mut self, now: DateTime<Utc>) -> bool {
        if now < self.schedule.next_boundary_after(self.last_reset) {
            return false;
        }
        self.on_day_boundary(now);
        true
    }

    pub fn snapshot(&self) -> Option<DliSnapshot> {
        self.total_at_day_start.map(|total_at_day_start| DliSnapshot {
            total_at_day_start,
            last_period: self.last_period,
            last_reset: self.last_reset,
        })
    }

    /// Restore from persisted state, or baseline on `current_total` when the
    /// saved state is missing or corrupt.
    pub fn restore(&mut self, saved: Option<Value>, current_total: Option<Decimal>) {
        let snapshot = match saved {
            Some(value) => match serde_json::from_value::<DliSnapshot>(value) {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!("{}: discarding corrupt saved state: {}", self.entity_id, e);
                    None
                }
            },
            None => None,
        };

        match snapshot {
            Some(snapshot) => {
                self.total_at_day_start = Some(snapshot.total_at_day_start);
                self.last_period = snapshot.last_period;
                self.last_reset = snapshot.last_reset;
                self.total = None;
                self.on_source_changed(current_total);
            }
            None => {
                warn!(
                    "{}: no saved day start, using current total as baseline",
                    self.entity_id
                );
                self.total_at_day_start = current_total;
                self.total = current_total;
                self.delta = Decimal::ZERO;
            }
        }
    }

    pub fn to_host_state(&self, at: DateTime<Utc>) -> HostState {
        let state = if self.is_known() {
            self.delta.round_dp(2).normalize().to_string()
        } else {
            STATE_UNKNOWN.to_string()
        };
        HostState::new(state, at)
            .with_attribute(ATTR_UNIT_OF_MEASUREMENT, UNIT_DLI)
            .with_attribute("icon", "mdi:sun-compass")
            .with_attribute("source", self.source.clone())
            .with_attribute("last_period", self.last_period.round_dp(2).normalize().to_string())
            .with_attribute("last_reset", self.last_reset.to_rfc3339())
    }
}

/// Species databases give light in mmol/s⋅m²; convert to a DLI bound.
pub fn mmol_to_dli(mmol: f64) -> f64 {
    (mmol * PPFD_DLI_FACTOR).round_ties_even()
}
