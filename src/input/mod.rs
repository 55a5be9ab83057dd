//! Input sources feeding sensor states into the host.
//!
//! - `mqtt`: mirrors a remote host's sensors from its MQTT state stream
//! - `simulation`: dummy sensors for development

pub mod mqtt;
pub mod simulation;
