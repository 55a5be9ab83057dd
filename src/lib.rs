//! Houseplant monitoring library.
//!
//! Builds plant devices on top of home-automation sensor entities: meters
//! following external sensors, min/max thresholds, PPFD, the total light
//! integral, the daily light integral and an aggregate plant status.

pub mod config;
pub mod error;
pub mod host;
pub mod input;
pub mod persistence;
pub mod plant;
pub mod service;

pub use error::{PlantError, Result};
