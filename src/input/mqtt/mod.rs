//! MQTT input: follows the host's state stream so plants see sensors that
//! live on another home-automation instance.

mod client;
mod statestream;

pub use client::{MqttClient, MqttMessage};
pub use statestream::{StatestreamBridge, StatestreamMessage};
