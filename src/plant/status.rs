//! Aggregate plant status.
//!
//! A recomputation takes one [`QuantityInput`] per quantity and classifies
//! each known value against its bounds. Quantities whose trigger is off are
//! still classified but never escalate the combined state.

use super::quantity::Quantity;
use super::reading::{PlantState, Status};
use std::collections::BTreeMap;

/// How a quantity is classified against its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    /// Low below min, high above max.
    Range,
    /// High above max only.
    UpperOnly,
    /// Range check, applied only when the value is strictly positive.
    PositiveOnly,
}

impl Evaluation {
    pub fn classify(self, value: f64, min: f64, max: f64) -> Status {
        match self {
            Evaluation::Range if value < min => Status::Low,
            Evaluation::Range if value > max => Status::High,
            Evaluation::UpperOnly if value > max => Status::High,
            Evaluation::PositiveOnly if value > 0.0 && value < min => Status::Low,
            Evaluation::PositiveOnly if value > 0.0 && value > max => Status::High,
            _ => Status::Ok,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuantityInput {
    pub quantity: Quantity,
    /// `None` when the reading is unknown.
    pub value: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub evaluation: Evaluation,
    /// Whether a problem with this quantity escalates the plant state.
    pub trigger: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: PlantState,
    /// `None` for quantities with an unknown reading.
    pub statuses: BTreeMap<Quantity, Option<Status>>,
}

impl StatusReport {
    pub fn status(&self, quantity: Quantity) -> Option<Status> {
        self.statuses.get(&quantity).copied().flatten()
    }
}

/// Classify every input. Returns `None` when no quantity is known, in which
/// case the previous report must be kept as is.
pub fn recompute(inputs: &[QuantityInput]) -> Option<StatusReport> {
    if inputs.iter().all(|input| input.value.is_none()) {
        return None;
    }

    let mut state = PlantState::Ok;
    let mut statuses = BTreeMap::new();
    for input in inputs {
        let status = input
            .value
            .map(|v| input.evaluation.classify(v, input.min, input.max));
        if input.trigger && matches!(status, Some(Status::Low | Status::High)) {
            state = PlantState::Problem;
        }
        statuses.insert(input.quantity, status);
    }
    Some(StatusReport { state, statuses })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(quantity: Quantity, value: Option<f64>, min: f64, max: f64) -> QuantityInput {
        let evaluation = match quantity {
            Quantity::Illuminance => Evaluation::UpperOnly,
            Quantity::Dli => Evaluation::PositiveOnly,
            _ => Evaluation::Range,
        };
        QuantityInput {
            quantity,
            value,
            min,
            max,
            evaluation,
            trigger: true,
        }
    }

    #[test]
    fn test_low_moisture_is_a_problem() {
        let report = recompute(&[input(Quantity::Moisture, Some(15.0), 20.0, 60.0)]).unwrap();
        assert_eq!(report.status(Quantity::Moisture), Some(Status::Low));
        assert_eq!(report.state, PlantState::Problem);
    }

    #[test]
    fn test_illuminance_has_no_low() {
        let report = recompute(&[input(Quantity::Illuminance, Some(5.0), 1000.0, 100_000.0)]).unwrap();
        assert_eq!(report.status(Quantity::Illuminance), Some(Status::Ok));
        assert_eq!(report.state, PlantState::Ok);
    }

    #[test]
    fn test_disabled_trigger_does_not_escalate() {
        let mut lux = input(Quantity::Illuminance, Some(150_000.0), 0.0, 100_000.0);
        lux.trigger = false;
        let report = recompute(&[lux]).unwrap();
        assert_eq!(report.status(Quantity::Illuminance), Some(Status::High));
        assert_eq!(report.state, PlantState::Ok);
    }

    #[test]
    fn test_dli_positivity_gate() {
        let report = recompute(&[input(Quantity::Dli, Some(0.0), 2.0, 30.0)]).unwrap();
        assert_eq!(report.status(Quantity::Dli), Some(Status::Ok));
        assert_eq!(report.state, PlantState::Ok);

        let report = recompute(&[input(Quantity::Dli, Some(1.0), 2.0, 30.0)]).unwrap();
        assert_eq!(report.status(Quantity::Dli), Some(Status::Low));
    }

    #[test]
    fn test_unknown_values_are_unset() {
        let report = recompute(&[
            input(Quantity::Moisture, Some(30.0), 20.0, 60.0),
            input(Quantity::Temperature, None, 10.0, 40.0),
        ])
        .unwrap();
        assert_eq!(report.status(Quantity::Temperature), None);
        assert_eq!(report.state, PlantState::Ok);
    }

    #[test]
    fn test_nothing_known_mutates_nothing() {
        assert_eq!(
            recompute(&[
                input(Quantity::Moisture, None, 20.0, 60.0),
                input(Quantity::Humidity, None, 20.0, 60.0),
            ]),
            None
        );
    }

    #[test]
    fn test_escalation_over_combinations() {
        let values = [None, Some(10.0), Some(40.0), Some(90.0)];
        for moisture in values {
            for humidity in values {
                for trigger in [true, false] {
                    let mut h = input(Quantity::Humidity, humidity, 20.0, 60.0);
                    h.trigger = trigger;
                    let inputs = [input(Quantity::Moisture, moisture, 20.0, 60.0), h];
                    let first = recompute(&inputs);
                    assert_eq!(first, recompute(&inputs));

                    let Some(report) = first else {
                        assert!(moisture.is_none() && humidity.is_none());
                        continue;
                    };
                    let problem = inputs.iter().any(|i| {
                        i.trigger && matches!(report.status(i.quantity), Some(Status::Low | Status::High))
                    });
                    let expected = if problem { PlantState::Problem } else { PlantState::Ok };
                    assert_eq!(report.state, expected);
                }
            }
        }
    }
}
