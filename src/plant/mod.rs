//! Plant domain: meters, thresholds, light integrals and status.
//!
//! Each plant is a [`PlantDevice`] built from a config entry. The modules
//! below hold its components; [`device`] wires them into one graph.

pub mod device;
pub mod dli;
pub mod follower;
pub mod helper;
pub mod integral;
pub mod ppfd;
pub mod quantity;
pub mod reading;
pub mod record;
pub mod status;
pub mod subscriptions;
pub mod threshold;

pub use device::{PlantContext, PlantDevice};
pub use dli::{DailyLightIntegral, DaySchedule};
pub use helper::PlantHelper;
pub use ppfd::ppfd;
pub use quantity::{Bound, Quantity, UNIT_CELSIUS, UNIT_FAHRENHEIT};
pub use reading::{PlantState, Reading, ReadingValue, Status};
pub use record::PlantRecord;
pub use threshold::ThresholdKind;
