//! Sensor simulation for development.
//!
//! Writes random but plausible readings for a fixed set of dummy sensors
//! (`sensor.sim_<quantity>`) so a plant can be exercised without hardware.

use crate::host::{HostState, InMemoryHost};
use crate::plant::Quantity;
use crate::plant::quantity::{UNIT_CELSIUS, UNIT_CONDUCTIVITY, UNIT_LUX, UNIT_PERCENT};
use chrono::{Timelike, Utc};
use log::info;
use rand::Rng;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, interval};

pub const SIMULATED: [Quantity; 5] = [
    Quantity::Moisture,
    Quantity::Temperature,
    Quantity::Conductivity,
    Quantity::Illuminance,
    Quantity::Humidity,
];

pub fn sensor_id(quantity: Quantity) -> String {
    format!("sensor.sim_{}", quantity)
}

/// A dummy reading and its unit. Light follows a rough day curve by hour.
pub fn simulated_value(quantity: Quantity, hour: u32, rng: &mut impl Rng) -> Option<(f64, &'static str)> {
    let reading = match quantity {
        Quantity::Illuminance => {
            let lux = if (5..15).contains(&hour) {
                rng.gen_range(20..50) * 1000
            } else {
                rng.gen_range(1..10) * 100
            };
            (f64::from(lux), UNIT_LUX)
        }
        Quantity::Conductivity => (f64::from(rng.gen_range(400..2000)), UNIT_CONDUCTIVITY),
        Quantity::Moisture => (f64::from(rng.gen_range(10..70)), UNIT_PERCENT),
        Quantity::Temperature => (f64::from(rng.gen_range(15..20)), UNIT_CELSIUS),
        Quantity::Humidity => (f64::from(rng.gen_range(25..90)), UNIT_PERCENT),
        _ => return None,
    };
    Some(reading)
}

/// Write one round of readings.
pub fn tick(host: &InMemoryHost) {
    let now = Utc::now();
    let mut rng = rand::thread_rng();
    for quantity in SIMULATED {
        if let Some((value, unit)) = simulated_value(quantity, now.hour(), &mut rng) {
            let entity_id = sensor_id(quantity);
            info!("[Sim] {} = {} {}", entity_id, value, unit);
            host.write_state(&entity_id, HostState::new(value.to_string(), now).with_unit(unit));
        }
    }
}

/// Spawn a task that refreshes the dummy sensors every `period`.
pub fn run_sensor_simulation(host: Arc<InMemoryHost>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = interval(period);
        loop {
            interval.tick().await;
            tick(&host);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::StateStore;

    #[test]
    fn test_values_in_range() {
        let mut rng = rand::thread_rng();
        for _ in 0..50 {
            let (lux, _) = simulated_value(Quantity::Illuminance, 12, &mut rng).unwrap();
            assert!((20_000.0..50_000.0).contains(&lux));
            let (lux, _) = simulated_value(Quantity::Illuminance, 22, &mut rng).unwrap();
            assert!((100.0..1_000.0).contains(&lux));
            let (moisture, unit) = simulated_value(Quantity::Moisture, 0, &mut rng).unwrap();
            assert!((10.0..70.0).contains(&moisture));
            assert_eq!(unit, UNIT_PERCENT);
        }
        assert!(simulated_value(Quantity::Dli, 12, &mut rng).is_none());
    }

    #[test]
    fn test_tick_writes_sensors() {
        let host = InMemoryHost::default();
        tick(&host);
        let state = host.get_state("sensor.sim_temperature").unwrap();
        assert_eq!(state.unit(), Some(UNIT_CELSIUS));
        assert!(state.state.parse::<f64>().is_ok());
    }
}
