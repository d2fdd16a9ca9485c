//! Delta snapshots: reversible differences between two match projections
//!
//! `apply(from, delta(from, to)) == to` holds exactly: per-field deltas are
//! arithmetic differences (XOR for booleans), and component data appearing
//! only in the target snapshot rides along as absolute values.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::component::{ComponentValue, FieldValue};
use crate::error::{EngineError, Result};
use crate::snapshot::Snapshot;

/// Per-(entity, component) difference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeltaEntry {
    /// Per-field deltas for a component present in both snapshots
    Changed(Vec<FieldValue>),
    /// Absolute values for a component present only in the target
    Set(ComponentValue),
    /// Component present only in the source
    Removed,
}

/// Reversible difference between two snapshots of the same match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSnapshot {
    pub match_id: u64,
    pub from_tick: u64,
    pub to_tick: u64,
    /// module -> component -> (entity id, entry), entities ascending
    pub changed: BTreeMap<String, BTreeMap<String, Vec<(u64, DeltaEntry)>>>,
    pub added_entities: Vec<u64>,
    pub removed_entities: Vec<u64>,
    /// Sum of per-field differences
    pub change_count: usize,
    /// Delta field entries over the target's full field slots
    pub compression_ratio: f64,
}

impl DeltaSnapshot {
    /// Compute the delta between two snapshots of the same match.
    pub fn between(from: &Snapshot, to: &Snapshot) -> Result<Self> {
        if from.match_id != to.match_id {
            return Err(EngineError::CommandInvalid(format!(
                "delta across matches {} and {}",
                from.match_id, to.match_id
            )));
        }

        let added_entities: Vec<u64> = to
            .entity_ids
            .iter()
            .filter(|id| from.entity_ids.binary_search(id).is_err())
            .copied()
            .collect();
        let removed_entities: Vec<u64> = from
            .entity_ids
            .iter()
            .filter(|id| to.entity_ids.binary_search(id).is_err())
            .copied()
            .collect();

        let mut changed: BTreeMap<String, BTreeMap<String, Vec<(u64, DeltaEntry)>>> =
            BTreeMap::new();
        let mut change_count = 0usize;
        let mut delta_fields = 0usize;

        for (module, component) in component_union(from, to) {
            let mut entries: Vec<(u64, DeltaEntry)> = Vec::new();

            for &entity_id in &to.entity_ids {
                let before = from.value_for(&module, &component, entity_id);
                let after = to.value_for(&module, &component, entity_id);
                let is_added = from.entity_ids.binary_search(&entity_id).is_err();

                match (before, after) {
                    (Some(a), Some(b)) => {
                        if a != b {
                            let diffs = a
                                .iter()
                                .zip(b.iter())
                                .filter(|(x, y)| x != y)
                                .count();
                            let deltas: Vec<FieldValue> = a
                                .iter()
                                .zip(b.iter())
                                .map(|(x, y)| x.delta_to(y).unwrap_or(*y))
                                .collect();
                            change_count += diffs;
                            delta_fields += deltas.len();
                            entries.push((entity_id, DeltaEntry::Changed(deltas)));
                        }
                    }
                    (None, Some(b)) => {
                        change_count += b.len().max(1);
                        delta_fields += b.len();
                        entries.push((entity_id, DeltaEntry::Set(b.clone())));
                    }
                    (Some(a), None) if !is_added => {
                        change_count += a.len().max(1);
                        entries.push((entity_id, DeltaEntry::Removed));
                    }
                    _ => {}
                }
            }

            if !entries.is_empty() {
                changed
                    .entry(module.clone())
                    .or_default()
                    .insert(component.clone(), entries);
            }
        }

        let full_fields = to.field_slot_count();
        let compression_ratio = if full_fields == 0 {
            0.0
        } else {
            delta_fields as f64 / full_fields as f64
        };

        Ok(Self {
            match_id: from.match_id,
            from_tick: from.tick,
            to_tick: to.tick,
            changed,
            added_entities,
            removed_entities,
            change_count,
            compression_ratio,
        })
    }

    /// Reconstruct the target snapshot from the source.
    pub fn apply(&self, from: &Snapshot) -> Result<Snapshot> {
        if from.match_id != self.match_id {
            return Err(EngineError::CommandInvalid(format!(
                "delta for match {} applied to match {}",
                self.match_id, from.match_id
            )));
        }

        let mut entity_ids: Vec<u64> = from
            .entity_ids
            .iter()
            .filter(|id| self.removed_entities.binary_search(id).is_err())
            .copied()
            .collect();
        for &id in &self.added_entities {
            if let Err(pos) = entity_ids.binary_search(&id) {
                entity_ids.insert(pos, id);
            }
        }

        // Column universe: everything the source had plus everything the
        // delta touches.
        let mut universe: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (module, components) in &from.modules {
            universe
                .entry(module.clone())
                .or_default()
                .extend(components.keys().cloned());
        }
        for (module, components) in &self.changed {
            let names = universe.entry(module.clone()).or_default();
            for name in components.keys() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }

        let mut modules: BTreeMap<String, BTreeMap<String, Vec<Option<ComponentValue>>>> =
            BTreeMap::new();

        for (module, components) in universe {
            let mut out_components = BTreeMap::new();
            for component in components {
                let entries = self
                    .changed
                    .get(&module)
                    .and_then(|c| c.get(&component));

                let column: Vec<Option<ComponentValue>> = entity_ids
                    .iter()
                    .map(|&entity_id| {
                        let base = from.value_for(&module, &component, entity_id).cloned();
                        let entry = entries.and_then(|entries| {
                            entries
                                .binary_search_by_key(&entity_id, |(id, _)| *id)
                                .ok()
                                .map(|i| &entries[i].1)
                        });
                        match entry {
                            None => base,
                            Some(DeltaEntry::Removed) => None,
                            Some(DeltaEntry::Set(values)) => Some(values.clone()),
                            Some(DeltaEntry::Changed(deltas)) => base.map(|values| {
                                values
                                    .iter()
                                    .zip(deltas)
                                    .map(|(v, d)| v.apply_delta(d).unwrap_or(*d))
                                    .collect()
                            }),
                        }
                    })
                    .collect();
                out_components.insert(component, column);
            }
            modules.insert(module, out_components);
        }

        Ok(Snapshot {
            match_id: self.match_id,
            tick: self.to_tick,
            entity_ids,
            modules,
        })
    }
}

fn component_union(from: &Snapshot, to: &Snapshot) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = Vec::new();
    for snapshot in [from, to] {
        for (module, components) in &snapshot.modules {
            for component in components.keys() {
                let pair = (module.clone(), component.clone());
                if !out.contains(&pair) {
                    out.push(pair);
                }
            }
        }
    }
    out
}
