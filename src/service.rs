//! Plant registry and the service surface on top of it.
//!
//! The registry owns every set-up plant, routes host events to them and
//! exposes the `replace_sensor` service, the `get_info` query and a
//! diagnostics dump.

use crate::error::{PlantError, Result};
use crate::host::{HostEvent, StateStore};
use crate::plant::{PlantDevice, Quantity};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

const SENSOR_DOMAIN: &str = "sensor.";

pub struct PlantRegistry {
    states: Arc<dyn StateStore>,
    plants: RwLock<Vec<Arc<PlantDevice>>>,
}

impl PlantRegistry {
    pub fn new(states: Arc<dyn StateStore>) -> Self {
        Self {
            states,
            plants: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, plant: Arc<PlantDevice>) {
        let mut plants = self.plants.write();
        plants.retain(|p| p.entry_id() != plant.entry_id());
        plants.push(plant);
    }

    fn take(&self, entry_id: &str) -> Option<Arc<PlantDevice>> {
        let mut plants = self.plants.write();
        let index = plants.iter().position(|p| p.entry_id() == entry_id)?;
        Some(plants.remove(index))
    }

    /// Stop handling a plant, keeping its saved state for the next setup.
    pub async fn unload(&self, entry_id: &str) -> Result<Arc<PlantDevice>> {
        let plant = self
            .take(entry_id)
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))?;
        plant.persist().await;
        info!("Unloaded plant {}", entry_id);
        Ok(plant)
    }

    /// Delete a plant with its entities, saved state and config entry.
    pub async fn remove(&self, entry_id: &str) -> Result<()> {
        let plant = self
            .take(entry_id)
            .ok_or_else(|| PlantError::PlantNotFound(entry_id.to_string()))?;
        plant.remove().await;
        Ok(())
    }

    pub fn plants(&self) -> Vec<Arc<PlantDevice>> {
        self.plants.read().clone()
    }

    pub fn len(&self) -> usize {
        self.plants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.plants.read().is_empty()
    }

    /// Plant by config entry id.
    pub fn get(&self, entry_id: &str) -> Option<Arc<PlantDevice>> {
        self.plants
            .read()
            .iter()
            .find(|p| p.entry_id() == entry_id)
            .cloned()
    }

    /// Plant by its `plant.*` entity id.
    pub fn find(&self, entity_id: &str) -> Option<Arc<PlantDevice>> {
        self.plants
            .read()
            .iter()
            .find(|p| p.entity_id() == entity_id)
            .cloned()
    }

    fn find_meter(&self, meter_entity_id: &str) -> Option<(Arc<PlantDevice>, Quantity)> {
        self.plants.read().iter().find_map(|p| {
            p.meter_quantity(meter_entity_id)
                .map(|quantity| (p.clone(), quantity))
        })
    }

    /// Deliver one host event to every plant, in registration order.
    pub async fn dispatch(&self, event: &HostEvent) {
        for plant in self.plants() {
            plant.handle_event(event).await;
        }
    }

    /// Process events until the bus closes.
    pub async fn run(self: Arc<Self>, mut rx: broadcast::Receiver<HostEvent>) {
        info!("Event loop started for {} plant(s)", self.len());
        loop {
            match rx.recv().await {
                Ok(event) => self.dispatch(&event).await,
                Err(RecvError::Lagged(skipped)) => {
                    // Missed values are picked up by the next periodic update.
                    warn!("Event loop lagged, {} event(s) skipped", skipped);
                }
                Err(RecvError::Closed) => {
                    info!("Event bus closed, stopping event loop");
                    break;
                }
            }
        }
    }

    pub async fn update_all(&self) {
        for plant in self.plants() {
            plant.update().await;
        }
    }

    pub async fn check_day_boundaries(&self) {
        for plant in self.plants() {
            plant.check_day_boundary().await;
        }
    }

    pub async fn persist_all(&self) {
        for plant in self.plants() {
            plant.persist().await;
        }
    }

    /// Point a meter at another sensor. An empty `new_sensor` detaches it.
    pub async fn try_replace_sensor(&self, meter_entity_id: &str, new_sensor: &str) -> Result<()> {
        let Some((plant, quantity)) = self.find_meter(meter_entity_id) else {
            return Err(PlantError::UnknownMeter(meter_entity_id.to_string()));
        };

        let new_sensor = new_sensor.trim();
        let source = if new_sensor.is_empty() {
            None
        } else {
            if !new_sensor.starts_with(SENSOR_DOMAIN) {
                return Err(PlantError::NotASensor(new_sensor.to_string()));
            }
            if self.states.get_state(new_sensor).is_none() {
                return Err(PlantError::EntityNotFound(new_sensor.to_string()));
            }
            Some(new_sensor.to_string())
        };

        info!(
            "Replacing {} sensor of {} with {:?}",
            quantity,
            plant.entity_id(),
            source
        );
        plant.set_follower_source(quantity, source).await;
        Ok(())
    }

    /// Service entry point: invalid calls are logged and ignored.
    pub async fn replace_sensor(&self, meter_entity_id: &str, new_sensor: &str) -> bool {
        match self.try_replace_sensor(meter_entity_id, new_sensor).await {
            Ok(()) => true,
            Err(e) => {
                warn!("replace_sensor rejected: {}", e);
                false
            }
        }
    }

    /// Per-quantity summary of one plant, keyed by quantity.
    pub fn get_info(&self, entity_id: &str) -> Result<Value> {
        let plant = self.find(entity_id).ok_or_else(|| {
            debug!("get_info for unknown plant {}", entity_id);
            PlantError::PlantNotFound(entity_id.to_string())
        })?;
        Ok(plant.info())
    }

    pub fn diagnostics(&self) -> Value {
        let plants: Map<String, Value> = self
            .plants()
            .iter()
            .map(|p| (p.entry_id().to_string(), p.diagnostics()))
            .collect();
        Value::Object(plants)
    }

    /// Write the diagnostics dump to the log.
    pub fn log_diagnostics(&self) {
        match serde_json::to_string_pretty(&self.diagnostics()) {
            Ok(dump) => info!("Diagnostics:\n{}", dump),
            Err(e) => error!("Failed to render diagnostics: {}", e),
        }
    }
}
