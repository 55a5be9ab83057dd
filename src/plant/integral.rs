//! Trapezoidal time integral of PPFD (total light received).

use super::quantity::UNIT_TOTAL_LIGHT_INTEGRAL;
use crate::host::{HostState, ATTR_UNIT_OF_MEASUREMENT, STATE_UNKNOWN};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};

/// Digits of the published total.
pub const ROUND_DIGITS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub at: DateTime<Utc>,
    pub value: Decimal,
}

/// Persisted integrator state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegratorSnapshot {
    pub total: Decimal,
    pub last_sample_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SampleOutcome {
    /// First valid sample since start; recorded as the baseline only.
    Baseline,
    /// The total advanced by the given (non-negative) area.
    Advanced(Decimal),
    /// Unknown sample; the previous baseline is kept.
    Skipped,
    /// Timestamp not after the previous sample.
    Rejected,
}

/// Running integral `Σ (v_i + v_{i-1}) / 2 × (t_i − t_{i-1})` in seconds.
///
/// The total is kept at full decimal precision and never decreases.
#[derive(Debug, Clone)]
pub struct TrapezoidalIntegrator {
    entity_id: String,
    source: Option<String>,
    total: Decimal,
    last: Option<Sample>,
    /// Newest accepted timestamp, carried across restarts.
    last_seen: Option<DateTime<Utc>>,
    has_value: bool,
}

impl TrapezoidalIntegrator {
    pub fn new(entity_id: impl Into<String>, source: Option<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            source,
            total: Decimal::ZERO,
            last: None,
            last_seen: None,
            has_value: false,
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

    pub fn total(&self) -> Decimal {
        self.total
    }

    /// Total rounded for publishing, `None` before the first sample.
    pub fn published_total(&self) -> Option<Decimal> {
        self.has_value.then(|| self.total.round_dp(ROUND_DIGITS))
    }

    pub fn sample(&mut self, at: DateTime<Utc>, value: Option<f64>) -> SampleOutcome {
        if let Some(seen) = self.last_seen
            && at <= seen
        {
            debug!(
                "{}: rejecting sample at {} (last accepted {})",
                self.entity_id, at, seen
            );
            return SampleOutcome::Rejected;
        }
        let Some(value) = value.and_then(Decimal::from_f64) else {
            return SampleOutcome::Skipped;
        };

        let Some(previous) = self.last else {
            self.accept(Sample { at, value });
            return SampleOutcome::Baseline;
        };
        let elapsed = Decimal::new((at - previous.at).num_milliseconds(), 3);
        let Some(area) = trapezoid(previous.value, value, elapsed) else {
            warn!(
                "{}: area of {} over {}s overflows, keeping baseline at {}",
                self.entity_id, value, elapsed, previous.at
            );
            return SampleOutcome::Skipped;
        };
        if area.is_sign_negative() {
            debug!("{}: ignoring negative area {}", self.entity_id, area);
            self.accept(Sample { at, value });
            return SampleOutcome::Advanced(Decimal::ZERO);
        }
        let Some(total) = self.total.checked_add(area) else {
            warn!(
                "{}: total {} + {} overflows, keeping baseline at {}",
                self.entity_id, self.total, area, previous.at
            );
            return SampleOutcome::Skipped;
        };
        self.total = total;
        self.accept(Sample { at, value });
        SampleOutcome::Advanced(area)
    }

    fn accept(&mut self, sample: Sample) {
        self.last_seen = Some(sample.at);
        self.last = Some(sample);
        self.has_value = true;
    }

    pub fn snapshot(&self) -> IntegratorSnapshot {
        IntegratorSnapshot {
            total: self.total,
            last_sample_at: self.last_seen,
        }
    }

    /// Restore after restart. The next valid sample becomes the new baseline.
    pub fn restore(&mut self, snapshot: IntegratorSnapshot) {
        self.total = snapshot.total.max(Decimal::ZERO);
        self.last_seen = snapshot.last_sample_at;
        self.last = None;
        self.has_value = true;
    }

    pub fn to_host_state(&self, at: DateTime<Utc>) -> HostState {
        let state = self
            .published_total()
            .map(|t| t.normalize().to_string())
            .unwrap_or_else(|| STATE_UNKNOWN.to_string());
        HostState::new(state, at)
            .with_attribute(ATTR_UNIT_OF_MEASUREMENT, UNIT_TOTAL_LIGHT_INTEGRAL)
            .with_attribute("icon", "mdi:counter")
            .with_attribute("source", self.source.clone())
    }
}

fn trapezoid(a: Decimal, b: Decimal, elapsed: Decimal) -> Option<Decimal> {
    a.checked_add(b)?
        .checked_div(Decimal::TWO)?
        .checked_mul(elapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn integrator() -> TrapezoidalIntegrator {
        TrapezoidalIntegrator::new("sensor.fern_total_light_integral", Some("sensor.fern_ppfd".into()))
    }

    #[test]
    fn test_first_sample_is_baseline() {
        let mut integ = integrator();
        let t0 = Utc::now();
        assert_eq!(integ.published_total(), None);
        assert_eq!(integ.sample(t0, Some(2.0)), SampleOutcome::Baseline);
        assert_eq!(integ.total(), Decimal::ZERO);
        assert_eq!(integ.published_total(), Some(Decimal::ZERO));
    }

    #[test]
    fn test_trapezoid_area() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.sample(t0, Some(2.0));
        integ.sample(t0 + Duration::seconds(10), Some(4.0));
        // (2 + 4) / 2 * 10
        assert_eq!(integ.total(), Decimal::from(30));
        integ.sample(t0 + Duration::milliseconds(10_500), Some(4.0));
        assert_eq!(integ.total(), Decimal::new(320, 1));
    }

    #[test]
    fn test_out_of_order_samples_are_rejected() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.sample(t0, Some(1.0));
        integ.sample(t0 + Duration::seconds(4), Some(1.0));
        let total = integ.total();

        assert_eq!(integ.sample(t0 + Duration::seconds(2), Some(100.0)), SampleOutcome::Rejected);
        assert_eq!(integ.sample(t0 + Duration::seconds(4), Some(100.0)), SampleOutcome::Rejected);
        assert_eq!(integ.total(), total);
    }

    #[test]
    fn test_total_is_monotonic_under_jitter() {
        let mut integ = integrator();
        let t0 = Utc::now();
        let offsets = [0, 7, 3, 9, 9, 15, 12, 30, 31, 29, 60];
        let values = [0.0, 1.5, 3.0, 0.0, 2.0, 0.5, 8.0, 0.0, 4.0, 1.0, 0.25];
        let mut last_total = integ.total();
        for (offset, value) in offsets.iter().zip(values) {
            integ.sample(t0 + Duration::seconds(*offset), Some(value));
            assert!(integ.total() >= last_total);
            last_total = integ.total();
        }
    }

    #[test]
    fn test_unknown_keeps_previous_baseline() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.sample(t0, Some(1.0));
        assert_eq!(integ.sample(t0 + Duration::seconds(5), None), SampleOutcome::Skipped);
        assert_eq!(integ.total(), Decimal::ZERO);

        integ.sample(t0 + Duration::seconds(10), Some(3.0));
        // (1 + 3) / 2 * 10, bridged across the unknown sample
        assert_eq!(integ.total(), Decimal::from(20));
    }

    #[test]
    fn test_negative_area_is_not_added() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.sample(t0, Some(-5.0));
        integ.sample(t0 + Duration::seconds(10), Some(-1.0));
        assert_eq!(integ.total(), Decimal::ZERO);
    }

    #[test]
    fn test_overflowing_area_is_skipped() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.sample(t0, Some(1e27));
        assert_eq!(
            integ.sample(t0 + Duration::hours(2), Some(2e27)),
            SampleOutcome::Skipped
        );
        assert_eq!(integ.total(), Decimal::ZERO);

        // Still anchored at t0, so an earlier timestamp is accepted.
        assert!(matches!(
            integ.sample(t0 + Duration::seconds(1), Some(1.0)),
            SampleOutcome::Advanced(area) if area > Decimal::ZERO
        ));
    }

    #[test]
    fn test_overflowing_total_is_skipped() {
        let mut integ = integrator();
        let t0 = Utc::now();
        integ.restore(IntegratorSnapshot {
            total: Decimal::MAX,
            last_sample_at: None,
        });
        integ.sample(t0, Some(10.0));
        assert_eq!(integ.sample(t0 + Duration::seconds(10), Some(10.0)), SampleOutcome::Skipped);
        assert_eq!(integ.total(), Decimal::MAX);
    }

    #[test]
    fn test_restore_rebaselines() {
        let t0 = Utc::now();
        let mut integ = integrator();
        integ.restore(IntegratorSnapshot {
            total: Decimal::new(12345, 3),
            last_sample_at: Some(t0),
        });
        assert_eq!(integ.published_total(), Some(Decimal::new(1234, 2)));
        assert_eq!(integ.to_host_state(t0).state, "12.34");

        assert_eq!(integ.sample(t0, Some(1.0)), SampleOutcome::Rejected);
        assert_eq!(integ.sample(t0 + Duration::seconds(1), Some(1.0)), SampleOutcome::Baseline);
        assert_eq!(integ.total(), Decimal::new(12345, 3));
    }
}
