//! The plant device.
//!
//! A [`PlantDevice`] owns every derived entity of one plant: the meters
//! following external sensors, the thresholds, the PPFD, light integral and
//! DLI sensors, and the aggregate status. It keeps them consistent as host
//! events arrive.
//!
//! ## Event handling
//!
//! All components live in one [`PlantGraph`] behind a `parking_lot::Mutex`.
//! An event is handled synchronously under the lock: the change is applied,
//! propagated through the meter → PPFD → integral → DLI chain, and the
//! status is recomputed. The resulting state writes, config merges and
//! restore saves are collected and awaited only after the lock is released,
//! so the host never observes a partially updated graph.
//!
//! Events for the plant's own entities are ignored; the graph propagates
//! between its components directly.

use super::dli::{DailyLightIntegral, DaySchedule};
use super::follower::ExternalSensorFollower;
use super::helper::{PlantHelper, SpeciesData};
use super::integral::{IntegratorSnapshot, SampleOutcome, TrapezoidalIntegrator};
use super::ppfd::{PpfdSensor, is_photon_flux};
use super::quantity::{Bound, Quantity, slugify};
use super::reading::{PlantState, Reading, ReadingValue, Status};
use super::record::{PlantRecord, TriggerOptions};
use super::status::{self, Evaluation, QuantityInput, StatusReport};
use super::subscriptions::{Component, Subscriptions};
use super::threshold::{ThresholdKind, ThresholdSnapshot, ThresholdStore, convert_temperature};
use crate::error::Result;
use crate::host::{
    ConfigStore, EntityRegistry, HostEvent, HostState, InMemoryHost, RegistryAction,
    RegistryUpdate, RestoreStore, StateStore,
};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rust_decimal::prelude::*;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use strum::IntoEnumIterator;

const INTEGRAL_RESTORE_KEY: &str = "total_light_integral";
const DLI_RESTORE_KEY: &str = "dli";
const NOTES_KEY: &str = "notes";

/// Everything a plant needs from its host, passed in explicitly.
#[derive(Clone)]
pub struct PlantContext {
    pub entry_id: String,
    pub states: Arc<dyn StateStore>,
    pub config: Arc<dyn ConfigStore>,
    pub restore: Arc<dyn RestoreStore>,
    pub registry: Arc<dyn EntityRegistry>,
    pub helper: PlantHelper,
    pub schedule: DaySchedule,
    pub temperature_unit: String,
}

impl PlantContext {
    /// Context backed entirely by one in-memory host.
    pub fn in_memory(entry_id: impl Into<String>, host: Arc<InMemoryHost>) -> Self {
        Self {
            entry_id: entry_id.into(),
            temperature_unit: host.temperature_unit(),
            states: host.clone(),
            config: host.clone(),
            restore: host.clone(),
            registry: host,
            helper: PlantHelper::new(None),
            schedule: DaySchedule::default(),
        }
    }

    pub fn with_helper(mut self, helper: PlantHelper) -> Self {
        self.helper = helper;
        self
    }

    pub fn with_schedule(mut self, schedule: DaySchedule) -> Self {
        self.schedule = schedule;
        self
    }

    /// Use separate stores for config entries and restore data.
    pub fn with_stores(
        mut self,
        config: Arc<dyn ConfigStore>,
        restore: Arc<dyn RestoreStore>,
    ) -> Self {
        self.config = config;
        self.restore = restore;
        self
    }

    fn restore_key(&self, key: &str) -> String {
        format!("{}.{}", self.entry_id, key)
    }
}

/// Side effects of one graph operation, applied after the lock is released.
#[derive(Default)]
struct Effects {
    writes: Vec<(String, HostState)>,
    merges: Vec<(String, Value)>,
    saves: Vec<(String, Value)>,
}

impl Effects {
    fn save<T: Serialize>(&mut self, key: String, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.saves.push((key, value)),
            Err(e) => warn!("Failed to serialize restore data for {}: {}", key, e),
        }
    }
}

struct PlantGraph {
    entity_id: String,
    name: String,
    species: String,
    display_species: Option<String>,
    entity_picture: Option<String>,
    temperature_unit: String,
    triggers: TriggerOptions,
    followers: BTreeMap<Quantity, ExternalSensorFollower>,
    thresholds: BTreeMap<ThresholdKind, ThresholdStore>,
    ppfd: PpfdSensor,
    integral: TrapezoidalIntegrator,
    dli: DailyLightIntegral,
    notes_id: String,
    notes: String,
    report: Option<StatusReport>,
    subscriptions: Subscriptions,
}

impl PlantGraph {
    /// Build the graph. Every entity id derives from `slug`, the object id
    /// of the registered plant entity.
    fn build(
        ctx: &PlantContext,
        slug: &str,
        record: &PlantRecord,
        species: SpeciesData,
        now: DateTime<Utc>,
    ) -> Self {
        let unit = ctx.temperature_unit.as_str();
        let mut subscriptions = Subscriptions::default();

        let mut followers = BTreeMap::new();
        for quantity in Quantity::measured() {
            let entity_id = format!("sensor.{}_{}", slug, quantity.meter_suffix());
            let source = record.sensor(quantity).map(str::to_string);
            if let Some(source) = &source {
                subscriptions.track(source, Component::Meter(quantity));
            }
            followers.insert(
                quantity,
                ExternalSensorFollower::new(quantity, entity_id, source),
            );
        }

        let thresholds = ThresholdKind::all()
            .map(|kind| {
                let value = kind.seed(record.limit(kind), species.limits.get(&kind).copied(), unit);
                let entity_id = format!("number.{}_{}", slug, kind.config_key());
                (kind, ThresholdStore::new(kind, entity_id, value, kind.unit(unit)))
            })
            .collect();

        let illuminance_meter = format!("sensor.{}_{}", slug, Quantity::Illuminance.meter_suffix());
        let ppfd_id = format!("sensor.{}_ppfd", slug);
        let integral_id = format!("sensor.{}_total_light_integral", slug);
        let dli_id = format!("sensor.{}_dli", slug);
        subscriptions.track(&illuminance_meter, Component::Ppfd);
        subscriptions.track(&ppfd_id, Component::Integral);
        subscriptions.track(&integral_id, Component::Dli);

        Self {
            entity_id: format!("plant.{}", slug),
            name: record.name.clone(),
            species: record.species.clone(),
            display_species: record.display_pid.clone().or(species.display_pid),
            entity_picture: record.entity_picture.clone().or(species.image_url),
            temperature_unit: unit.to_string(),
            triggers: record.options,
            followers,
            thresholds,
            ppfd: PpfdSensor::new(ppfd_id.clone(), Some(illuminance_meter)),
            integral: TrapezoidalIntegrator::new(integral_id.clone(), Some(ppfd_id)),
            dli: DailyLightIntegral::new(dli_id, Some(integral_id), ctx.schedule, now),
            notes_id: format!("text.{}_notes", slug),
            notes: record.notes.clone().unwrap_or_default(),
            report: None,
            subscriptions,
        }
    }

    fn owns(&self, entity_id: &str) -> bool {
        self.entity_id == entity_id
            || self.followers.values().any(|f| f.entity_id() == entity_id)
            || self.thresholds.values().any(|t| t.entity_id() == entity_id)
            || self.ppfd.entity_id() == entity_id
            || self.integral.entity_id() == entity_id
            || self.dli.entity_id() == entity_id
            || self.notes_id == entity_id
    }

    /// Every entity published by this plant.
    fn entity_ids(&self) -> Vec<String> {
        let mut ids = vec![self.entity_id.clone()];
        ids.extend(self.followers.values().map(|f| f.entity_id().to_string()));
        ids.extend(self.thresholds.values().map(|t| t.entity_id().to_string()));
        ids.extend([
            self.ppfd.entity_id().to_string(),
            self.integral.entity_id().to_string(),
            self.dli.entity_id().to_string(),
            self.notes_id.clone(),
        ]);
        ids
    }

    fn meter_quantity(&self, entity_id: &str) -> Option<Quantity> {
        self.followers
            .values()
            .find(|f| f.entity_id() == entity_id)
            .map(ExternalSensorFollower::quantity)
    }

    fn threshold_value(&self, kind: ThresholdKind) -> f64 {
        self.thresholds
            .get(&kind)
            .map(ThresholdStore::value)
            .unwrap_or_else(|| kind.default_value(&self.temperature_unit))
    }

    fn component_id(&self, component: Component) -> Option<String> {
        match component {
            Component::Meter(q) => self.followers.get(&q).map(|f| f.entity_id().to_string()),
            Component::Ppfd => Some(self.ppfd.entity_id().to_string()),
            Component::Integral => Some(self.integral.entity_id().to_string()),
            Component::Dli => Some(self.dli.entity_id().to_string()),
        }
    }

    fn component_state(&self, component: Component, at: DateTime<Utc>) -> Option<HostState> {
        match component {
            Component::Meter(q) => self.followers.get(&q).map(|f| {
                let at = f.reading().updated_at.unwrap_or(at);
                f.to_host_state(at, &self.temperature_unit)
            }),
            Component::Ppfd => Some(self.ppfd.to_host_state(at)),
            Component::Integral => Some(self.integral.to_host_state(at)),
            Component::Dli => Some(self.dli.to_host_state(at)),
        }
    }

    /// Feed an upstream state into a component. Returns whether its
    /// published state changed.
    fn apply(&mut self, component: Component, upstream: Option<&HostState>, at: DateTime<Utc>) -> bool {
        match component {
            Component::Meter(q) => self
                .followers
                .get_mut(&q)
                .is_some_and(|f| f.on_upstream_changed(upstream)),
            Component::Ppfd => {
                let factor = self.threshold_value(ThresholdKind::LuxToPpfd);
                self.ppfd.update(upstream, factor)
            }
            Component::Integral => {
                let value = self
                    .integral
                    .source()
                    .and_then(|source| Reading::from_host_state(source, upstream).as_f64());
                matches!(
                    self.integral.sample(at, value),
                    SampleOutcome::Baseline | SampleOutcome::Advanced(_)
                )
            }
            Component::Dli => {
                let total = match (self.dli.source(), upstream) {
                    (Some(_), Some(state)) => Decimal::from_str(&state.state).ok(),
                    _ => None,
                };
                self.dli.on_source_changed(total)
            }
        }
    }

    /// Publish a component and queue everything listening to it.
    fn emit(
        &mut self,
        ctx: &PlantContext,
        component: Component,
        at: DateTime<Utc>,
        queue: &mut VecDeque<(Component, Option<HostState>)>,
        fx: &mut Effects,
    ) {
        let (Some(entity_id), Some(state)) =
            (self.component_id(component), self.component_state(component, at))
        else {
            return;
        };
        for next in self.subscriptions.subscribers(&entity_id) {
            queue.push_back((next, Some(state.clone())));
        }
        self.save_component(ctx, component, fx);
        fx.writes.push((entity_id, state));
    }

    fn drain(
        &mut self,
        ctx: &PlantContext,
        mut queue: VecDeque<(Component, Option<HostState>)>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        while let Some((component, upstream)) = queue.pop_front() {
            let at = upstream.as_ref().map_or(now, |s| s.last_updated);
            if self.apply(component, upstream.as_ref(), at) {
                self.emit(ctx, component, at, &mut queue, fx);
            }
        }
    }

    fn propagate(
        &mut self,
        ctx: &PlantContext,
        component: Component,
        upstream: Option<HostState>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        self.drain(ctx, VecDeque::from([(component, upstream)]), now, fx);
    }

    /// Publish a component that was already updated, then propagate.
    fn publish_and_propagate(
        &mut self,
        ctx: &PlantContext,
        component: Component,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let mut queue = VecDeque::new();
        self.emit(ctx, component, now, &mut queue, fx);
        self.drain(ctx, queue, now, fx);
    }

    fn save_component(&self, ctx: &PlantContext, component: Component, fx: &mut Effects) {
        match component {
            Component::Integral => {
                fx.save(ctx.restore_key(INTEGRAL_RESTORE_KEY), &self.integral.snapshot());
            }
            Component::Dli => {
                if let Some(snapshot) = self.dli.snapshot() {
                    fx.save(ctx.restore_key(DLI_RESTORE_KEY), &snapshot);
                }
            }
            Component::Meter(_) | Component::Ppfd => {}
        }
    }

    fn status_inputs(&self) -> Vec<QuantityInput> {
        Quantity::iter()
            .map(|quantity| {
                let reading = self.followers.get(&quantity).map(ExternalSensorFollower::reading);
                let (value, evaluation) = match quantity {
                    Quantity::Dli => (self.dli.last_period_value(), Evaluation::PositiveOnly),
                    // Thresholds are in lux; a photon-flux source cannot be compared.
                    Quantity::Illuminance => (
                        reading
                            .filter(|r| !is_photon_flux(r.unit.as_deref()))
                            .and_then(Reading::as_f64),
                        Evaluation::UpperOnly,
                    ),
                    _ => (
                        reading.and_then(|r| self.comparable_value(quantity, r)),
                        Evaluation::Range,
                    ),
                };
                QuantityInput {
                    quantity,
                    value,
                    min: self.threshold_value(ThresholdKind::Limit(quantity, Bound::Min)),
                    max: self.threshold_value(ThresholdKind::Limit(quantity, Bound::Max)),
                    evaluation,
                    trigger: self.triggers.is_enabled(quantity),
                }
            })
            .collect()
    }

    /// Reading value in the unit its thresholds are kept in. Temperatures
    /// are converted to the host unit.
    fn comparable_value(&self, quantity: Quantity, reading: &Reading) -> Option<f64> {
        let value = reading.as_f64()?;
        if !quantity.is_temperature() {
            return Some(value);
        }
        let Some(unit) = reading.unit.as_deref() else {
            return Some(value);
        };
        match convert_temperature(value, unit, &self.temperature_unit) {
            Some(converted) => Some(converted),
            None => {
                debug!(
                    "{}: cannot convert {} {} to {}, comparing as is",
                    self.entity_id, value, unit, self.temperature_unit
                );
                Some(value)
            }
        }
    }

    fn notes_state(&self, at: DateTime<Utc>) -> HostState {
        HostState::new(self.notes.as_str(), at)
            .with_attribute("friendly_name", format!("{} Notes", self.name))
            .with_attribute("icon", "mdi:note-text-outline")
    }

    fn recompute_status(&mut self, now: DateTime<Utc>, fx: &mut Effects) {
        let Some(report) = status::recompute(&self.status_inputs()) else {
            debug!("{}: no known readings, keeping status", self.entity_id);
            return;
        };
        if self.report.as_ref() == Some(&report) {
            return;
        }
        if self.report.as_ref().map(|r| r.state) != Some(report.state) {
            info!("{}: state is now {}", self.entity_id, report.state);
        }
        self.report = Some(report);
        fx.writes.push((self.entity_id.clone(), self.plant_state(now)));
    }

    fn plant_state(&self, at: DateTime<Utc>) -> HostState {
        let state = self.report.as_ref().map_or(PlantState::Unknown, |r| r.state);
        let display = self
            .display_species
            .clone()
            .unwrap_or_else(|| self.species.clone());
        let mut host_state = HostState::new(state.to_string(), at)
            .with_attribute("friendly_name", self.name.as_str())
            .with_attribute("species", display)
            .with_attribute("species_original", self.species.as_str());
        if let Some(picture) = &self.entity_picture {
            host_state = host_state.with_attribute("entity_picture", picture.as_str());
        }
        for quantity in Quantity::iter() {
            let status = self.report.as_ref().and_then(|r| r.status(quantity));
            host_state = host_state.with_attribute(
                &format!("{}_status", quantity),
                status.map(|s| s.to_string()),
            );
        }
        host_state
    }

    /// Entities that only make sense while a quantity has a sensor.
    fn related_entities(&self, quantity: Quantity) -> Vec<String> {
        let mut ids: Vec<String> = self.followers.get(&quantity).map(|f| f.entity_id().to_string()).into_iter().collect();
        let mut kinds = vec![
            ThresholdKind::Limit(quantity, Bound::Min),
            ThresholdKind::Limit(quantity, Bound::Max),
        ];
        if quantity == Quantity::Illuminance {
            kinds.extend([
                ThresholdKind::Limit(Quantity::Dli, Bound::Min),
                ThresholdKind::Limit(Quantity::Dli, Bound::Max),
                ThresholdKind::LuxToPpfd,
            ]);
            ids.extend([
                self.ppfd.entity_id().to_string(),
                self.integral.entity_id().to_string(),
                self.dli.entity_id().to_string(),
            ]);
        }
        ids.extend(
            kinds
                .iter()
                .filter_map(|k| self.thresholds.get(k))
                .map(|t| t.entity_id().to_string()),
        );
        ids
    }

    fn refresh_disabled(&self, ctx: &PlantContext, quantity: Quantity) {
        let disabled = self
            .followers
            .get(&quantity)
            .is_none_or(|f| f.external_sensor().is_none());
        for entity_id in self.related_entities(quantity) {
            ctx.registry.set_disabled(&entity_id, disabled);
        }
    }

    fn set_follower_source(
        &mut self,
        ctx: &PlantContext,
        quantity: Quantity,
        source: Option<String>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        let Some(follower) = self.followers.get_mut(&quantity) else {
            return;
        };
        let previous = follower.replace_source(source.clone());
        follower.pull(ctx.states.as_ref());
        info!(
            "{}: external sensor {:?} -> {:?}",
            follower.entity_id(),
            previous,
            source
        );

        if let Some(previous) = &previous {
            self.subscriptions.untrack(previous, Component::Meter(quantity));
        }
        if let Some(source) = &source {
            self.subscriptions.track(source, Component::Meter(quantity));
        }
        self.publish_and_propagate(ctx, Component::Meter(quantity), now, fx);

        if let Some(key) = quantity.sensor_key() {
            fx.merges.push((key, source.map_or(Value::Null, Value::String)));
        }
        self.refresh_disabled(ctx, quantity);
    }

    fn on_state_changed(
        &mut self,
        ctx: &PlantContext,
        entity_id: &str,
        new_state: Option<&HostState>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> bool {
        if self.owns(entity_id) {
            return false;
        }
        let subscribers = self.subscriptions.subscribers(entity_id);
        for component in &subscribers {
            self.propagate(ctx, *component, new_state.cloned(), now, fx);
        }
        !subscribers.is_empty()
    }

    fn on_registry_updated(
        &mut self,
        ctx: &PlantContext,
        update: &RegistryUpdate,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> bool {
        match (update.action, &update.old_entity_id) {
            (RegistryAction::Update, Some(old)) if old != &update.entity_id => {
                self.on_renamed(ctx, old, &update.entity_id, now, fx)
            }
            (RegistryAction::Remove, _) => self.on_removed(ctx, &update.entity_id, now, fx),
            _ => false,
        }
    }

    fn on_renamed(
        &mut self,
        ctx: &PlantContext,
        old: &str,
        new: &str,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> bool {
        let mut touched = false;

        let following: Vec<Quantity> = self
            .followers
            .values()
            .filter(|f| f.external_sensor() == Some(old))
            .map(ExternalSensorFollower::quantity)
            .collect();
        for quantity in following {
            self.set_follower_source(ctx, quantity, Some(new.to_string()), now, fx);
            touched = true;
        }

        if self.entity_id == old {
            self.entity_id = new.to_string();
            touched = true;
        }
        for follower in self.followers.values_mut().filter(|f| f.entity_id() == old) {
            follower.rename(new);
            touched = true;
        }
        for threshold in self.thresholds.values_mut().filter(|t| t.entity_id() == old) {
            threshold.rename(new);
            touched = true;
        }
        if self.ppfd.entity_id() == old {
            self.ppfd.rename(new);
            touched = true;
        }
        if self.integral.entity_id() == old {
            self.integral.rename(new);
            touched = true;
        }
        if self.dli.entity_id() == old {
            self.dli.rename(new);
            touched = true;
        }
        if self.notes_id == old {
            self.notes_id = new.to_string();
            touched = true;
        }

        if self.ppfd.source() == Some(old) {
            self.ppfd.set_source(Some(new.to_string()));
            touched = true;
        }
        if self.integral.source() == Some(old) {
            self.integral.set_source(Some(new.to_string()));
            touched = true;
        }
        if self.dli.source() == Some(old) {
            self.dli.set_source(Some(new.to_string()));
            touched = true;
        }
        if self.subscriptions.is_tracked(old) {
            self.subscriptions.rekey(old, new);
            touched = true;
        }

        if touched {
            info!("{}: followed rename {} -> {}", self.entity_id, old, new);
        }
        touched
    }

    fn on_removed(
        &mut self,
        ctx: &PlantContext,
        entity_id: &str,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> bool {
        let mut touched = false;

        let following: Vec<Quantity> = self
            .followers
            .values()
            .filter(|f| f.external_sensor() == Some(entity_id))
            .map(ExternalSensorFollower::quantity)
            .collect();
        for quantity in following {
            warn!(
                "{}: {} sensor {} was removed",
                self.entity_id, quantity, entity_id
            );
            self.set_follower_source(ctx, quantity, None, now, fx);
            touched = true;
        }

        if self.ppfd.source() == Some(entity_id) {
            self.ppfd.set_source(None);
            self.subscriptions.untrack(entity_id, Component::Ppfd);
            self.propagate(ctx, Component::Ppfd, None, now, fx);
            touched = true;
        }
        if self.integral.source() == Some(entity_id) {
            self.integral.set_source(None);
            self.subscriptions.untrack(entity_id, Component::Integral);
            self.publish_and_propagate(ctx, Component::Integral, now, fx);
            touched = true;
        }
        if self.dli.source() == Some(entity_id) {
            self.dli.set_source(None);
            self.subscriptions.untrack(entity_id, Component::Dli);
            self.publish_and_propagate(ctx, Component::Dli, now, fx);
            touched = true;
        }
        touched
    }

    fn on_unit_system_changed(
        &mut self,
        ctx: &PlantContext,
        old: Option<&str>,
        new: Option<&str>,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) {
        if let Some(new) = new {
            self.temperature_unit = new.to_string();
        }
        for store in self.thresholds.values_mut() {
            if store.on_unit_system_changed(old, new) {
                fx.writes.push((store.entity_id().to_string(), store.to_host_state(now)));
                fx.save(ctx.restore_key(&store.kind().config_key()), &store.snapshot());
            }
        }
    }

    fn set_threshold(
        &mut self,
        ctx: &PlantContext,
        kind: ThresholdKind,
        value: f64,
        now: DateTime<Utc>,
        fx: &mut Effects,
    ) -> bool {
        let Some(store) = self.thresholds.get_mut(&kind) else {
            return false;
        };
        store.set_value(value);
        fx.writes.push((store.entity_id().to_string(), store.to_host_state(now)));
        fx.save(ctx.restore_key(&kind.config_key()), &store.snapshot());

        if kind == ThresholdKind::LuxToPpfd {
            let source_state = self
                .ppfd
                .source()
                .map(str::to_string)
                .and_then(|source| self.source_state(ctx, &source, now))
                .map(|mut state| {
                    state.last_updated = now;
                    state
                });
            self.propagate(ctx, Component::Ppfd, source_state, now, fx);
        }
        true
    }

    /// Current state of an entity, preferring the graph's own view.
    fn source_state(&self, ctx: &PlantContext, entity_id: &str, now: DateTime<Utc>) -> Option<HostState> {
        match self.meter_quantity(entity_id) {
            Some(quantity) => self.component_state(Component::Meter(quantity), now),
            None => ctx.states.get_state(entity_id),
        }
    }

    /// Re-read every tracked sensor and propagate values the event stream
    /// did not deliver.
    fn pull_all(&mut self, ctx: &PlantContext, now: DateTime<Utc>, fx: &mut Effects) {
        let quantities: Vec<Quantity> = self.followers.keys().copied().collect();
        for quantity in quantities {
            let Some(follower) = self.followers.get_mut(&quantity) else {
                continue;
            };
            if follower.external_sensor().is_none() {
                continue;
            }
            if follower.pull(ctx.states.as_ref()) {
                debug!(
                    "{}: pulled {} from {:?}",
                    follower.entity_id(),
                    follower.reading().state_string(),
                    follower.external_sensor()
                );
                self.publish_and_propagate(ctx, Component::Meter(quantity), now, fx);
            }
        }
    }

    fn check_day_boundary(&mut self, ctx: &PlantContext, now: DateTime<Utc>, fx: &mut Effects) -> bool {
        if !self.dli.check_boundary(now) {
            return false;
        }
        self.save_component(ctx, Component::Integral, fx);
        self.publish_and_propagate(ctx, Component::Dli, now, fx);
        true
    }

    fn publish_all(&self, now: DateTime<Utc>, fx: &mut Effects) {
        for component in self
            .followers
            .keys()
            .map(|q| Component::Meter(*q))
            .chain([Component::Ppfd, Component::Integral, Component::Dli])
        {
            if let (Some(id), Some(state)) =
                (self.component_id(component), self.component_state(component, now))
            {
                fx.writes.push((id, state));
            }
        }
        for store in self.thresholds.values() {
            fx.writes.push((store.entity_id().to_string(), store.to_host_state(now)));
        }
        fx.writes.push((self.notes_id.clone(), self.notes_state(now)));
        fx.writes.push((self.entity_id.clone(), self.plant_state(now)));
    }
}

/// Saved state loaded before the graph is locked.
struct RestoredState {
    thresholds: Vec<(ThresholdKind, Value)>,
    integral: Option<Value>,
    dli: Option<Value>,
}

pub struct PlantDevice {
    ctx: PlantContext,
    graph: Mutex<PlantGraph>,
}

impl PlantDevice {
    /// Build a plant from its config entry.
    ///
    /// Thresholds are seeded from the config entry, then the species lookup,
    /// then defaults; saved user edits win over all of them. Saved integral
    /// and DLI state is restored, a day boundary missed while down is
    /// closed, and every sensor is read once before the states are
    /// published.
    pub async fn setup(ctx: PlantContext) -> Result<Arc<Self>> {
        let entry = ctx.config.read_entry(&ctx.entry_id).await?;
        let record = PlantRecord::from_config(&ctx.entry_id, entry)?;

        let species = if record.has_missing_limits() || record.display_pid.is_none() {
            ctx.helper
                .species_data(&record.species, &ctx.temperature_unit)
                .await
                .unwrap_or_default()
        } else {
            SpeciesData::default()
        };

        let suggested = format!("plant.{}", slugify(&record.name));
        let entity_id = ctx.registry.get_or_create(&ctx.entry_id, &suggested);
        let slug = entity_id.strip_prefix("plant.").unwrap_or(&entity_id).to_string();

        let now = Utc::now();
        let mut graph = PlantGraph::build(&ctx, &slug, &record, species, now);
        let restored = Self::load_restored(&ctx).await;

        let mut fx = Effects::default();
        Self::restore(&mut graph, restored);
        let quantities: Vec<Quantity> = graph.followers.keys().copied().collect();
        for quantity in &quantities {
            if let Some(follower) = graph.followers.get_mut(quantity)
                && follower.pull(ctx.states.as_ref())
            {
                graph.publish_and_propagate(&ctx, Component::Meter(*quantity), now, &mut fx);
            }
        }
        graph.check_day_boundary(&ctx, now, &mut fx);
        graph.recompute_status(now, &mut fx);
        graph.publish_all(now, &mut fx);
        for quantity in &quantities {
            graph.refresh_disabled(&ctx, *quantity);
        }

        info!(
            "[Plant] {} ({}) set up as {}",
            record.name, ctx.entry_id, graph.entity_id
        );
        let device = Arc::new(Self {
            ctx,
            graph: Mutex::new(graph),
        });
        device.apply(fx).await;
        Ok(device)
    }

    fn restore_keys(ctx: &PlantContext) -> Vec<String> {
        ThresholdKind::all()
            .map(|kind| kind.config_key())
            .chain([INTEGRAL_RESTORE_KEY.to_string(), DLI_RESTORE_KEY.to_string()])
            .map(|key| ctx.restore_key(&key))
            .collect()
    }

    async fn load_restored(ctx: &PlantContext) -> RestoredState {
        let mut thresholds = Vec::new();
        for kind in ThresholdKind::all() {
            if let Some(value) = ctx.restore.load(&ctx.restore_key(&kind.config_key())).await {
                thresholds.push((kind, value));
            }
        }
        RestoredState {
            thresholds,
            integral: ctx.restore.load(&ctx.restore_key(INTEGRAL_RESTORE_KEY)).await,
            dli: ctx.restore.load(&ctx.restore_key(DLI_RESTORE_KEY)).await,
        }
    }

    fn restore(graph: &mut PlantGraph, restored: RestoredState) {
        for (kind, value) in restored.thresholds {
            let Some(store) = graph.thresholds.get_mut(&kind) else {
                continue;
            };
            match serde_json::from_value::<ThresholdSnapshot>(value) {
                Ok(snapshot) => store.restore(snapshot),
                Err(e) => warn!("{}: ignoring saved value: {}", store.entity_id(), e),
            }
        }
        if let Some(value) = restored.integral {
            match serde_json::from_value::<IntegratorSnapshot>(value) {
                Ok(snapshot) => graph.integral.restore(snapshot),
                Err(e) => warn!("{}: ignoring saved total: {}", graph.integral.entity_id(), e),
            }
        }
        let total = graph.integral.published_total();
        graph.dli.restore(restored.dli, total);
    }

    async fn apply(&self, fx: Effects) {
        for (entity_id, state) in fx.writes {
            self.ctx.states.set_state(&entity_id, state).await;
        }
        for (key, value) in fx.merges {
            if let Err(e) = self.ctx.config.merge_key(&self.ctx.entry_id, &key, value).await {
                error!(
                    "Failed to persist {} for entry {}: {}",
                    key, self.ctx.entry_id, e
                );
            }
        }
        for (key, value) in fx.saves {
            if let Err(e) = self.ctx.restore.save(&key, value).await {
                warn!("Failed to save restore data {}: {}", key, e);
            }
        }
    }

    /// Run one graph operation under the lock, then apply its effects.
    async fn run<F>(&self, op: F)
    where
        F: FnOnce(&mut PlantGraph, &PlantContext, DateTime<Utc>, &mut Effects),
    {
        let fx = {
            let mut graph = self.graph.lock();
            let mut fx = Effects::default();
            op(&mut *graph, &self.ctx, Utc::now(), &mut fx);
            fx
        };
        self.apply(fx).await;
    }

    pub async fn handle_event(&self, event: &HostEvent) {
        self.run(|graph, ctx, now, fx| {
            let changed = match event {
                HostEvent::StateChanged {
                    entity_id,
                    new_state,
                    ..
                } => graph.on_state_changed(ctx, entity_id, new_state.as_ref(), now, fx),
                HostEvent::RegistryUpdated(update) => {
                    graph.on_registry_updated(ctx, update, now, fx)
                }
                HostEvent::UnitSystemChanged { old, new } => {
                    graph.on_unit_system_changed(ctx, old.as_deref(), new.as_deref(), now, fx);
                    true
                }
            };
            if changed {
                graph.recompute_status(now, fx);
            }
        })
        .await;
    }

    /// Point a meter at another external sensor (`None` to detach).
    /// The choice is persisted in the config entry.
    pub async fn set_follower_source(&self, quantity: Quantity, source: Option<String>) {
        self.run(|graph, ctx, now, fx| {
            graph.set_follower_source(ctx, quantity, source, now, fx);
            graph.recompute_status(now, fx);
        })
        .await;
    }

    pub async fn set_threshold(&self, kind: ThresholdKind, value: f64) {
        self.run(|graph, ctx, now, fx| {
            if graph.set_threshold(ctx, kind, value, now, fx) {
                graph.recompute_status(now, fx);
            }
        })
        .await;
    }

    /// Periodic poll: re-read sensors, close the day if due, recompute.
    pub async fn update(&self) {
        self.run(|graph, ctx, now, fx| {
            graph.pull_all(ctx, now, fx);
            graph.check_day_boundary(ctx, now, fx);
            graph.recompute_status(now, fx);
        })
        .await;
    }

    pub async fn check_day_boundary(&self) {
        self.run(|graph, ctx, now, fx| {
            if graph.check_day_boundary(ctx, now, fx) {
                graph.recompute_status(now, fx);
            }
        })
        .await;
    }

    /// Replace the plant notes. The text is persisted in the config entry.
    pub async fn set_notes(&self, notes: impl Into<String>) {
        let notes = notes.into();
        self.run(|graph, _ctx, now, fx| {
            if graph.notes == notes {
                return;
            }
            debug!("{}: updating notes", graph.notes_id);
            graph.notes = notes;
            fx.writes.push((graph.notes_id.clone(), graph.notes_state(now)));
            fx.merges.push((NOTES_KEY.to_string(), Value::String(graph.notes.clone())));
        })
        .await;
    }

    /// Delete the plant for good: its entities, restore data and config
    /// entry. The device must no longer receive events.
    pub async fn remove(&self) {
        let entity_ids = self.graph.lock().entity_ids();
        for key in Self::restore_keys(&self.ctx) {
            if let Err(e) = self.ctx.restore.remove(&key).await {
                warn!("Failed to remove restore data {}: {}", key, e);
            }
        }
        if let Err(e) = self.ctx.config.remove_entry(&self.ctx.entry_id).await {
            warn!("Failed to remove entry {}: {}", self.ctx.entry_id, e);
        }
        for entity_id in &entity_ids {
            self.ctx.registry.delete_entity(entity_id);
        }
        info!(
            "[Plant] {} removed with {} entities",
            self.ctx.entry_id,
            entity_ids.len()
        );
    }

    /// Save the integral and DLI state, e.g. before shutdown.
    pub async fn persist(&self) {
        self.run(|graph, ctx, _now, fx| {
            graph.save_component(ctx, Component::Integral, fx);
            graph.save_component(ctx, Component::Dli, fx);
        })
        .await;
    }

    pub fn entry_id(&self) -> &str {
        &self.ctx.entry_id
    }

    pub fn entity_id(&self) -> String {
        self.graph.lock().entity_id.clone()
    }

    pub fn name(&self) -> String {
        self.graph.lock().name.clone()
    }

    pub fn notes(&self) -> String {
        self.graph.lock().notes.clone()
    }

    pub fn state(&self) -> PlantState {
        self.graph
            .lock()
            .report
            .as_ref()
            .map_or(PlantState::Unknown, |r| r.state)
    }

    pub fn status(&self, quantity: Quantity) -> Option<Status> {
        self.graph
            .lock()
            .report
            .as_ref()
            .and_then(|r| r.status(quantity))
    }

    pub fn reading(&self, quantity: Quantity) -> Option<Reading> {
        self.graph
            .lock()
            .followers
            .get(&quantity)
            .map(|f| f.reading().clone())
    }

    pub fn external_sensor(&self, quantity: Quantity) -> Option<String> {
        self.graph
            .lock()
            .followers
            .get(&quantity)
            .and_then(|f| f.external_sensor().map(str::to_string))
    }

    pub fn meter_entity_id(&self, quantity: Quantity) -> Option<String> {
        self.graph
            .lock()
            .followers
            .get(&quantity)
            .map(|f| f.entity_id().to_string())
    }

    /// Quantity of a meter entity owned by this plant.
    pub fn meter_quantity(&self, entity_id: &str) -> Option<Quantity> {
        self.graph.lock().meter_quantity(entity_id)
    }

    pub fn threshold(&self, kind: ThresholdKind) -> Option<f64> {
        self.graph.lock().thresholds.get(&kind).map(ThresholdStore::value)
    }

    pub fn threshold_entity_id(&self, kind: ThresholdKind) -> Option<String> {
        self.graph
            .lock()
            .thresholds
            .get(&kind)
            .map(|t| t.entity_id().to_string())
    }

    pub fn ppfd(&self) -> ReadingValue {
        self.graph.lock().ppfd.value()
    }

    pub fn total_light_integral(&self) -> Decimal {
        self.graph.lock().integral.total()
    }

    /// Light accumulated since the last day boundary, `None` until known.
    pub fn dli(&self) -> Option<Decimal> {
        let graph = self.graph.lock();
        graph.dli.is_known().then(|| graph.dli.delta())
    }

    pub fn dli_last_period(&self) -> Decimal {
        self.graph.lock().dli.last_period()
    }

    /// Per-quantity summary for the frontend card.
    pub fn info(&self) -> Value {
        let graph = self.graph.lock();
        let mut response = Map::new();
        for (quantity, follower) in &graph.followers {
            if follower.external_sensor().is_none() {
                continue;
            }
            let unit = follower
                .reading()
                .unit
                .clone()
                .unwrap_or_else(|| quantity.spec().unit.resolve(&graph.temperature_unit));
            response.insert(
                quantity.to_string(),
                json!({
                    "max": graph.threshold_value(ThresholdKind::Limit(*quantity, Bound::Max)),
                    "min": graph.threshold_value(ThresholdKind::Limit(*quantity, Bound::Min)),
                    "current": follower.reading().state_string(),
                    "icon": quantity.spec().icon,
                    "unit_of_measurement": unit,
                    "sensor": follower.entity_id(),
                }),
            );
        }
        if graph.dli.is_known() {
            response.insert(
                Quantity::Dli.to_string(),
                json!({
                    "max": graph.threshold_value(ThresholdKind::Limit(Quantity::Dli, Bound::Max)),
                    "min": graph.threshold_value(ThresholdKind::Limit(Quantity::Dli, Bound::Min)),
                    "current": graph.dli.delta().to_f64(),
                    "icon": Quantity::Dli.spec().icon,
                    "unit_of_measurement": super::quantity::UNIT_DLI,
                    "sensor": graph.dli.entity_id(),
                }),
            );
        }
        Value::Object(response)
    }

    /// Full internal state, for debugging.
    pub fn diagnostics(&self) -> Value {
        let graph = self.graph.lock();
        let followers: Map<String, Value> = graph
            .followers
            .iter()
            .map(|(q, f)| {
                (
                    q.to_string(),
                    json!({
                        "entity_id": f.entity_id(),
                        "external_sensor": f.external_sensor(),
                        "state": f.reading().state_string(),
                        "unit": f.reading().unit,
                    }),
                )
            })
            .collect();
        let thresholds: Map<String, Value> = graph
            .thresholds
            .iter()
            .map(|(kind, t)| (kind.config_key(), json!(t.value())))
            .collect();
        let statuses: Map<String, Value> = Quantity::iter()
            .map(|q| {
                let status = graph.report.as_ref().and_then(|r| r.status(q));
                (q.to_string(), json!(status.map(|s| s.to_string())))
            })
            .collect();
        json!({
            "entry_id": self.ctx.entry_id,
            "entity_id": graph.entity_id,
            "name": graph.name,
            "species": graph.species,
            "notes": graph.notes,
            "state": graph.report.as_ref().map_or(PlantState::Unknown, |r| r.state).to_string(),
            "statuses": statuses,
            "followers": followers,
            "thresholds": thresholds,
            "ppfd": super::reading::format_value(graph.ppfd.value()),
            "total_light_integral": graph.integral.total().to_string(),
            "dli": {
                "delta": graph.dli.delta().to_string(),
                "total_at_day_start": graph.dli.total_at_day_start().map(|d| d.to_string()),
                "last_period": graph.dli.last_period().to_string(),
                "last_reset": graph.dli.last_reset().to_rfc3339(),
            },
            "tracked": graph.subscriptions.tracked_ids(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ConfigRecord;
    use crate::plant::dli::DliSnapshot;
    use crate::plant::quantity::{UNIT_CELSIUS, UNIT_FAHRENHEIT};
    use chrono::Duration;
    use tokio::sync::broadcast;

    fn entry(value: Value) -> ConfigRecord {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn fern(host: &Arc<InMemoryHost>, record: Value) -> Arc<PlantDevice> {
        host.add_entry("e1", entry(record));
        PlantDevice::setup(PlantContext::in_memory("e1", host.clone()))
            .await
            .unwrap()
    }

    async fn pump(device: &PlantDevice, rx: &mut broadcast::Receiver<HostEvent>) {
        while let Ok(event) = rx.try_recv() {
            device.handle_event(&event).await;
        }
    }

    fn soil(value: &str) -> HostState {
        HostState::new(value, Utc::now()).with_unit("%")
    }

    #[tokio::test]
    async fn test_setup_publishes_entities() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("45"));
        let device = fern(
            &host,
            json!({"name": "Fern", "species": "nephrolepis", "moisture_sensor": "sensor.soil"}),
        )
        .await;

        assert_eq!(device.entity_id(), "plant.fern");
        assert_eq!(device.state(), PlantState::Ok);
        assert_eq!(device.status(Quantity::Moisture), Some(Status::Ok));
        assert_eq!(device.status(Quantity::Temperature), None);

        let meter = host.get_state("sensor.fern_current_moisture").unwrap();
        assert_eq!(meter.state, "45");
        assert_eq!(meter.attribute_str("external_sensor"), Some("sensor.soil"));

        let plant = host.get_state("plant.fern").unwrap();
        assert_eq!(plant.state, "ok");
        assert_eq!(plant.attribute_str("species"), Some("nephrolepis"));
        assert_eq!(plant.attribute_str("moisture_status"), Some("ok"));
        assert_eq!(plant.attributes["temperature_status"], Value::Null);

        assert_eq!(host.get_state("number.fern_max_moisture").unwrap().state, "60");
        assert!(!host.is_disabled("sensor.fern_current_moisture"));
        assert!(host.is_disabled("sensor.fern_current_temperature"));
        assert!(host.is_disabled("number.fern_min_temperature"));
        assert!(host.is_disabled("sensor.fern_dli"));
    }

    #[tokio::test]
    async fn test_out_of_range_reading_is_a_problem() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("45"));
        let device = fern(&host, json!({"name": "Fern", "moisture_sensor": "sensor.soil"})).await;
        let mut rx = host.subscribe();

        host.write_state("sensor.soil", soil("10"));
        pump(&device, &mut rx).await;

        assert_eq!(device.status(Quantity::Moisture), Some(Status::Low));
        assert_eq!(device.state(), PlantState::Problem);
        let plant = host.get_state("plant.fern").unwrap();
        assert_eq!(plant.state, "problem");
        assert_eq!(plant.attribute_str("moisture_status"), Some("Low"));
    }

    #[tokio::test]
    async fn test_disabled_trigger_does_not_escalate() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("10"));
        let device = fern(
            &host,
            json!({
                "name": "Fern",
                "moisture_sensor": "sensor.soil",
                "options": {"moisture_trigger": false}
            }),
        )
        .await;

        assert_eq!(device.status(Quantity::Moisture), Some(Status::Low));
        assert_eq!(device.state(), PlantState::Ok);
    }

    #[tokio::test]
    async fn test_nothing_known_stays_unknown() {
        let host = Arc::new(InMemoryHost::default());
        let device = fern(&host, json!({"name": "Fern", "moisture_sensor": "sensor.soil"})).await;
        assert_eq!(device.state(), PlantState::Unknown);
        assert_eq!(host.get_state("plant.fern").unwrap().state, "unknown");
    }

    #[tokio::test]
    async fn test_follows_renamed_sensor() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("45"));
        let device = fern(&host, json!({"name": "Fern", "moisture_sensor": "sensor.soil"})).await;
        let mut rx = host.subscribe();

        host.rename_entity("sensor.soil", "sensor.soil_2");
        pump(&device, &mut rx).await;

        assert_eq!(device.external_sensor(Quantity::Moisture).as_deref(), Some("sensor.soil_2"));
        assert_eq!(device.reading(Quantity::Moisture).unwrap().as_f64(), Some(45.0));
        assert_eq!(
            host.entry("e1").unwrap()["moisture_sensor"],
            json!("sensor.soil_2")
        );

        host.write_state("sensor.soil", soil("99"));
        pump(&device, &mut rx).await;
        assert_eq!(device.reading(Quantity::Moisture).unwrap().as_f64(), Some(45.0));

        host.write_state("sensor.soil_2", soil("30"));
        pump(&device, &mut rx).await;
        assert_eq!(device.reading(Quantity::Moisture).unwrap().as_f64(), Some(30.0));
    }

    #[tokio::test]
    async fn test_removed_sensor_detaches_meter() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("45"));
        let device = fern(&host, json!({"name": "Fern", "moisture_sensor": "sensor.soil"})).await;
        let mut rx = host.subscribe();

        host.remove_entity("sensor.soil");
        pump(&device, &mut rx).await;

        assert_eq!(device.external_sensor(Quantity::Moisture), None);
        assert!(!device.reading(Quantity::Moisture).unwrap().is_known());
        assert_eq!(host.entry("e1").unwrap()["moisture_sensor"], Value::Null);
        assert_eq!(host.get_state("sensor.fern_current_moisture").unwrap().state, "unknown");
        assert!(host.is_disabled("sensor.fern_current_moisture"));
        assert!(host.is_disabled("number.fern_max_moisture"));
    }

    #[tokio::test]
    async fn test_replace_source_persists_and_enables() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.air", HostState::new("21", Utc::now()).with_unit(UNIT_CELSIUS));
        let device = fern(&host, json!({"name": "Fern", "species": "fern"})).await;
        assert!(host.is_disabled("sensor.fern_current_temperature"));

        device
            .set_follower_source(Quantity::Temperature, Some("sensor.air".into()))
            .await;

        assert_eq!(device.reading(Quantity::Temperature).unwrap().as_f64(), Some(21.0));
        assert_eq!(host.entry("e1").unwrap()["temperature_sensor"], json!("sensor.air"));
        assert_eq!(host.entry("e1").unwrap()["species"], json!("fern"));
        assert!(!host.is_disabled("sensor.fern_current_temperature"));
        assert!(!host.is_disabled("number.fern_max_temperature"));
        assert_eq!(device.state(), PlantState::Ok);
    }

    #[tokio::test]
    async fn test_light_cascade() {
        let host = Arc::new(InMemoryHost::default());
        let t0 = Utc::now() - Duration::hours(2);
        host.write_state("sensor.lux", HostState::new("10000", t0).with_unit("lx"));
        let device = fern(&host, json!({"name": "Fern", "illuminance_sensor": "sensor.lux"})).await;
        let mut rx = host.subscribe();

        assert_eq!(device.dli(), Some(Decimal::ZERO));
        assert!(!host.is_disabled("sensor.fern_dli"));

        host.write_state(
            "sensor.lux",
            HostState::new("20000", t0 + Duration::hours(1)).with_unit("lx"),
        );
        pump(&device, &mut rx).await;

        let ReadingValue::Value(ppfd) = device.ppfd() else {
            panic!("expected a PPFD value");
        };
        assert!((ppfd - 0.00037).abs() < 1e-12);
        let total = device.total_light_integral().to_f64().unwrap();
        assert!((total - 0.999).abs() < 1e-6);
        assert_eq!(host.get_state("sensor.fern_total_light_integral").unwrap().state, "1");
        assert_eq!(device.dli(), Some(Decimal::ONE));

        // unavailable light leaves the totals untouched
        host.write_state(
            "sensor.lux",
            HostState::new("unavailable", t0 + Duration::minutes(90)),
        );
        pump(&device, &mut rx).await;
        assert_eq!(device.ppfd(), ReadingValue::Unknown);
        assert_eq!(host.get_state("sensor.fern_ppfd").unwrap().state, "unknown");
        assert_eq!(device.total_light_integral().to_f64(), Some(total));
        assert_eq!(device.dli(), Some(Decimal::ONE));
    }

    async fn lit_fern(host: &Arc<InMemoryHost>) -> (Arc<PlantDevice>, broadcast::Receiver<HostEvent>, DateTime<Utc>) {
        let t0 = Utc::now() - Duration::hours(2);
        host.write_state("sensor.lux", HostState::new("10000", t0).with_unit("lx"));
        let device = fern(host, json!({"name": "Fern", "illuminance_sensor": "sensor.lux"})).await;
        let mut rx = host.subscribe();
        host.write_state(
            "sensor.lux",
            HostState::new("20000", t0 + Duration::hours(1)).with_unit("lx"),
        );
        pump(&device, &mut rx).await;
        assert_eq!(device.dli(), Some(Decimal::ONE));
        (device, rx, t0)
    }

    #[tokio::test]
    async fn test_removed_light_sensor_freezes_chain() {
        let host = Arc::new(InMemoryHost::default());
        let (device, mut rx, _t0) = lit_fern(&host).await;
        let total = device.total_light_integral();

        host.remove_entity("sensor.lux");
        pump(&device, &mut rx).await;

        assert_eq!(device.external_sensor(Quantity::Illuminance), None);
        assert_eq!(host.entry("e1").unwrap()["illuminance_sensor"], Value::Null);
        assert_eq!(device.ppfd(), ReadingValue::Unknown);
        assert_eq!(host.get_state("sensor.fern_ppfd").unwrap().state, "unknown");
        assert_eq!(device.total_light_integral(), total);
        assert_eq!(device.dli(), Some(Decimal::ONE));
        assert!(host.is_disabled("sensor.fern_current_illuminance"));
        assert!(host.is_disabled("sensor.fern_ppfd"));
        assert!(host.is_disabled("sensor.fern_total_light_integral"));
        assert!(host.is_disabled("sensor.fern_dli"));
    }

    #[tokio::test]
    async fn test_removed_ppfd_detaches_integral() {
        let host = Arc::new(InMemoryHost::default());
        let (device, mut rx, t0) = lit_fern(&host).await;
        let total = device.total_light_integral();

        host.remove_entity("sensor.fern_ppfd");
        pump(&device, &mut rx).await;
        let integral = host.get_state("sensor.fern_total_light_integral").unwrap();
        assert_eq!(integral.attributes["source"], Value::Null);

        host.write_state(
            "sensor.lux",
            HostState::new("30000", t0 + Duration::minutes(90)).with_unit("lx"),
        );
        pump(&device, &mut rx).await;

        let ReadingValue::Value(ppfd) = device.ppfd() else {
            panic!("expected a PPFD value");
        };
        assert!((ppfd - 0.000555).abs() < 1e-12);
        assert_eq!(device.total_light_integral(), total);
        assert_eq!(device.dli(), Some(Decimal::ONE));
    }

    #[tokio::test]
    async fn test_huge_light_reading_does_not_overflow() {
        let host = Arc::new(InMemoryHost::default());
        let t0 = Utc::now() - Duration::hours(3);
        host.write_state("sensor.lux", HostState::new("1e33", t0).with_unit("lx"));
        let device = fern(&host, json!({"name": "Fern", "illuminance_sensor": "sensor.lux"})).await;
        let mut rx = host.subscribe();

        host.write_state(
            "sensor.lux",
            HostState::new("2e33", t0 + Duration::hours(2)).with_unit("lx"),
        );
        pump(&device, &mut rx).await;

        assert_eq!(device.total_light_integral(), Decimal::ZERO);
        assert_eq!(host.get_state("sensor.fern_total_light_integral").unwrap().state, "0");
        assert!(matches!(device.ppfd(), ReadingValue::Value(v) if v > 1e25));

        // Later events are still handled.
        host.write_state("sensor.lux", HostState::new("unavailable", Utc::now()));
        pump(&device, &mut rx).await;
        assert_eq!(device.ppfd(), ReadingValue::Unknown);
    }

    #[tokio::test]
    async fn test_celsius_sensor_on_fahrenheit_host() {
        let host = Arc::new(InMemoryHost::new(UNIT_FAHRENHEIT));
        host.write_state("sensor.air", HostState::new("21", Utc::now()).with_unit(UNIT_CELSIUS));
        let device = fern(&host, json!({"name": "Fern", "temperature_sensor": "sensor.air"})).await;
        let mut rx = host.subscribe();

        assert_eq!(
            device.threshold(ThresholdKind::Limit(Quantity::Temperature, Bound::Min)),
            Some(50.0)
        );
        assert_eq!(device.status(Quantity::Temperature), Some(Status::Ok));
        assert_eq!(device.state(), PlantState::Ok);

        // 5 °C is 41 °F
        host.write_state("sensor.air", HostState::new("5", Utc::now()).with_unit(UNIT_CELSIUS));
        pump(&device, &mut rx).await;
        assert_eq!(device.status(Quantity::Temperature), Some(Status::Low));

        host.write_state("sensor.air", HostState::new("60", Utc::now()).with_unit(UNIT_FAHRENHEIT));
        pump(&device, &mut rx).await;
        assert_eq!(device.status(Quantity::Temperature), Some(Status::Ok));
    }

    #[tokio::test]
    async fn test_notes_are_published_and_saved() {
        let host = Arc::new(InMemoryHost::default());
        let device = fern(&host, json!({"name": "Fern", "notes": "water weekly"})).await;

        let notes = host.get_state("text.fern_notes").unwrap();
        assert_eq!(notes.state, "water weekly");
        assert_eq!(notes.attribute_str("friendly_name"), Some("Fern Notes"));

        device.set_notes("repot in spring").await;
        assert_eq!(device.notes(), "repot in spring");
        assert_eq!(host.get_state("text.fern_notes").unwrap().state, "repot in spring");
        assert_eq!(host.entry("e1").unwrap()["notes"], json!("repot in spring"));
        assert_eq!(host.entry("e1").unwrap()["name"], json!("Fern"));

        let device = fern(&host, json!({"name": "Fern", "notes": "repot in spring"})).await;
        assert_eq!(device.notes(), "repot in spring");
    }

    #[tokio::test]
    async fn test_lux_factor_change_rederives_ppfd() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state(
            "sensor.lux",
            HostState::new("10000", Utc::now() - Duration::minutes(5)).with_unit("lx"),
        );
        let device = fern(&host, json!({"name": "Fern", "illuminance_sensor": "sensor.lux"})).await;

        device.set_threshold(ThresholdKind::LuxToPpfd, 0.02).await;

        let ReadingValue::Value(ppfd) = device.ppfd() else {
            panic!("expected a PPFD value");
        };
        assert!((ppfd - 0.0002).abs() < 1e-12);
        assert!(host.load("e1.lux_to_ppfd").await.is_some());
    }

    #[tokio::test]
    async fn test_saved_threshold_wins_over_config() {
        let host = Arc::new(InMemoryHost::default());
        let record = json!({"name": "Fern", "limits": {"max_moisture": 55}});
        let kind = ThresholdKind::Limit(Quantity::Moisture, Bound::Max);

        let device = fern(&host, record.clone()).await;
        assert_eq!(device.threshold(kind), Some(55.0));
        device.set_threshold(kind, 70.0).await;
        assert_eq!(host.get_state("number.fern_max_moisture").unwrap().state, "70");

        let device = fern(&host, record).await;
        assert_eq!(device.threshold(kind), Some(70.0));
    }

    #[tokio::test]
    async fn test_unit_system_change_converts_thresholds() {
        let host = Arc::new(InMemoryHost::new(UNIT_CELSIUS));
        let device = fern(&host, json!({"name": "Fern"})).await;
        let mut rx = host.subscribe();

        host.set_temperature_unit(UNIT_FAHRENHEIT);
        pump(&device, &mut rx).await;

        let kind = ThresholdKind::Limit(Quantity::Temperature, Bound::Min);
        assert_eq!(device.threshold(kind), Some(50.0));
        let published = host.get_state("number.fern_min_temperature").unwrap();
        assert_eq!(published.state, "50");
        assert_eq!(published.unit(), Some(UNIT_FAHRENHEIT));
        assert_eq!(
            device.threshold(ThresholdKind::Limit(Quantity::Moisture, Bound::Min)),
            Some(20.0)
        );
    }

    #[tokio::test]
    async fn test_missed_day_boundary_closes_period_on_setup() {
        let host = Arc::new(InMemoryHost::default());
        let long_ago = Utc::now() - Duration::days(3);
        let integral = IntegratorSnapshot {
            total: Decimal::ONE,
            last_sample_at: Some(long_ago),
        };
        let dli = DliSnapshot {
            total_at_day_start: Decimal::ZERO,
            last_period: Decimal::ZERO,
            last_reset: long_ago,
        };
        host.save("e1.total_light_integral", serde_json::to_value(integral).unwrap())
            .await
            .unwrap();
        host.save("e1.dli", serde_json::to_value(dli).unwrap())
            .await
            .unwrap();

        let device = fern(&host, json!({"name": "Fern"})).await;

        assert_eq!(device.dli_last_period(), Decimal::ONE);
        assert_eq!(device.dli(), Some(Decimal::ZERO));
        assert_eq!(device.status(Quantity::Dli), Some(Status::Low));
        assert_eq!(device.state(), PlantState::Problem);

        let saved: DliSnapshot =
            serde_json::from_value(host.load("e1.dli").await.unwrap()).unwrap();
        assert_eq!(saved.last_period, Decimal::ONE);
        assert_eq!(saved.total_at_day_start, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_own_meter_rename_keeps_cascade() {
        let host = Arc::new(InMemoryHost::default());
        let t0 = Utc::now() - Duration::hours(1);
        host.write_state("sensor.lux", HostState::new("10000", t0).with_unit("lx"));
        let device = fern(&host, json!({"name": "Fern", "illuminance_sensor": "sensor.lux"})).await;
        let mut rx = host.subscribe();

        host.rename_entity("sensor.fern_current_illuminance", "sensor.fern_light");
        pump(&device, &mut rx).await;
        assert_eq!(
            device.meter_entity_id(Quantity::Illuminance).as_deref(),
            Some("sensor.fern_light")
        );
        assert_eq!(device.meter_quantity("sensor.fern_light"), Some(Quantity::Illuminance));

        host.write_state(
            "sensor.lux",
            HostState::new("20000", t0 + Duration::minutes(30)).with_unit("lx"),
        );
        pump(&device, &mut rx).await;
        let ReadingValue::Value(ppfd) = device.ppfd() else {
            panic!("expected a PPFD value");
        };
        assert!((ppfd - 0.00037).abs() < 1e-12);
        assert!(device.total_light_integral() > Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_info_lists_configured_meters() {
        let host = Arc::new(InMemoryHost::default());
        host.write_state("sensor.soil", soil("45"));
        let device = fern(&host, json!({"name": "Fern", "moisture_sensor": "sensor.soil"})).await;

        let info = device.info();
        assert_eq!(info["moisture"]["current"], json!("45"));
        assert_eq!(info["moisture"]["max"], json!(60.0));
        assert_eq!(info["moisture"]["sensor"], json!("sensor.fern_current_moisture"));
        assert!(info.get("temperature").is_none());

        let diagnostics = device.diagnostics();
        assert_eq!(diagnostics["entry_id"], json!("e1"));
        assert_eq!(diagnostics["followers"]["moisture"]["external_sensor"], json!("sensor.soil"));
    }
}
