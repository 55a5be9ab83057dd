//! Entity-id to component routing.

use super::quantity::Quantity;
use std::collections::{BTreeSet, HashMap};

/// A component of the plant graph that consumes some entity's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Component {
    Meter(Quantity),
    Ppfd,
    Integral,
    Dli,
}

/// Which components listen to which entity ids.
///
/// Replaces per-entity listener callbacks: tracking is a table lookup, and a
/// rename moves every listener of the old id to the new one.
#[derive(Debug, Default, Clone)]
pub struct Subscriptions {
    by_entity: HashMap<String, BTreeSet<Component>>,
}

impl Subscriptions {
    pub fn track(&mut self, entity_id: &str, component: Component) {
        self.by_entity
            .entry(entity_id.to_string())
            .or_default()
            .insert(component);
    }

    pub fn untrack(&mut self, entity_id: &str, component: Component) {
        if let Some(components) = self.by_entity.get_mut(entity_id) {
            components.remove(&component);
            if components.is_empty() {
                self.by_entity.remove(entity_id);
            }
        }
    }

    pub fn subscribers(&self, entity_id: &str) -> Vec<Component> {
        self.by_entity
            .get(entity_id)
            .map(|c| c.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn is_tracked(&self, entity_id: &str) -> bool {
        self.by_entity.contains_key(entity_id)
    }

    /// Move all listeners of `old` to `new`.
    pub fn rekey(&mut self, old: &str, new: &str) {
        if let Some(components) = self.by_entity.remove(old) {
            self.by_entity
                .entry(new.to_string())
                .or_default()
                .extend(components);
        }
    }

    pub fn tracked_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.by_entity.keys().cloned().collect();
        ids.sort();
        ids
    }
}
