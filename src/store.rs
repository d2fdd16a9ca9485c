// Copyright 2024 Saptak Santra
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Entity store: central entity, component, and archetype storage
//!
//! Single-writer contract: all mutation happens on the container worker.
//! Readers borrow the store immutably; the borrow checker enforces that a
//! live query iterator is invalidated by any mutation.

use ahash::AHashMap;
use rustc_hash::FxHashSet;
use tracing::debug;

use crate::archetype::{canonical_signature, Archetype, ArchetypeSignature};
use crate::component::{
    ComponentRegistry, ComponentSchema, ComponentTypeId, ComponentValue, FieldValue,
};
use crate::entity::{EntityAllocator, EntityId, EntityLocation, EntityMeta};
use crate::error::{EngineError, Result};
use crate::query::QueryIter;

/// Accumulated (entity, component) mutations since the last drain,
/// plus entity lifecycle events. Consumed by the snapshot engine.
#[derive(Debug, Default)]
pub struct ChangeLog {
    pairs: FxHashSet<(EntityId, ComponentTypeId)>,
    spawned: Vec<EntityId>,
    despawned: Vec<EntityId>,
}

impl ChangeLog {
    pub fn pairs(&self) -> impl Iterator<Item = &(EntityId, ComponentTypeId)> {
        self.pairs.iter()
    }

    pub fn spawned(&self) -> &[EntityId] {
        &self.spawned
    }

    pub fn despawned(&self) -> &[EntityId] {
        &self.despawned
    }

    pub fn len(&self) -> usize {
        self.pairs.len() + self.spawned.len() + self.despawned.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty() && self.spawned.is_empty() && self.despawned.is_empty()
    }

    pub fn contains(&self, entity: EntityId, type_id: ComponentTypeId) -> bool {
        self.pairs.contains(&(entity, type_id))
    }

    fn record(&mut self, entity: EntityId, type_id: ComponentTypeId) {
        self.pairs.insert((entity, type_id));
    }
}

/// Central ECS store for one container.
pub struct EntityStore {
    allocator: EntityAllocator,

    /// Slot-indexed location and ownership metadata, valid while alive
    locations: Vec<EntityLocation>,
    meta: Vec<EntityMeta>,

    /// All archetypes; index 0 is the empty archetype
    archetypes: Vec<Archetype>,

    /// Sorted type-set -> archetype index
    archetype_index: AHashMap<ArchetypeSignature, usize>,

    registry: ComponentRegistry,

    changes: ChangeLog,
}

impl EntityStore {
    pub fn new(max_entities: usize, max_components: usize) -> Self {
        let mut store = Self {
            allocator: EntityAllocator::new(max_entities),
            locations: Vec::new(),
            meta: Vec::new(),
            archetypes: Vec::with_capacity(16),
            archetype_index: AHashMap::with_capacity(16),
            registry: ComponentRegistry::new(max_components),
            changes: ChangeLog::default(),
        };

        // Bootstrap the empty archetype (entities with no components).
        // Always index 0; simplifies creation and migration logic.
        let empty = canonical_signature(&[]);
        store.archetype_index.insert(empty.clone(), 0);
        store.archetypes.push(Archetype::new(empty, &[]));
        store
    }

    // ========== Component type registration ==========

    /// Register a component schema; idempotent on an identical schema.
    pub fn register_component_type(&mut self, schema: ComponentSchema) -> Result<ComponentTypeId> {
        self.registry.register(schema)
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    pub fn component_id(&self, name: &str) -> Option<ComponentTypeId> {
        self.registry.lookup(name)
    }

    // ========== Entity lifecycle ==========

    /// Allocate an entity in the empty archetype.
    pub fn create_entity(&mut self, match_id: u64, owner: u64) -> Result<EntityId> {
        let id = self.allocator.allocate()?;

        let slot = id.index() as usize - 1;
        if slot >= self.locations.len() {
            self.locations.resize(
                slot + 1,
                EntityLocation { archetype_id: 0, archetype_row: 0 },
            );
            self.meta.resize(slot + 1, EntityMeta { match_id: 0, owner: 0 });
        }

        let row = self.archetypes[0].allocate_row(id);
        self.locations[slot] = EntityLocation { archetype_id: 0, archetype_row: row };
        self.meta[slot] = EntityMeta { match_id, owner };
        self.changes.spawned.push(id);
        Ok(id)
    }

    /// Destroy an entity. Stale handles fail with `StaleHandle`, which
    /// callers treat as non-fatal.
    pub fn destroy_entity(&mut self, id: EntityId) -> Result<()> {
        if !self.allocator.is_alive(id) {
            return Err(EngineError::StaleHandle);
        }

        let slot = id.index() as usize - 1;
        let location = self.locations[slot];

        let former_types: Vec<ComponentTypeId> =
            self.archetypes[location.archetype_id].signature().to_vec();
        for type_id in former_types {
            self.changes.record(id, type_id);
        }

        let archetype = &mut self.archetypes[location.archetype_id];
        if let Some(swapped) = archetype.swap_remove_row(location.archetype_row) {
            self.locations[swapped.index() as usize - 1].archetype_row = location.archetype_row;
        }

        self.allocator.deallocate(id)?;
        self.changes.despawned.push(id);
        Ok(())
    }

    /// Destroy every entity belonging to `match_id`; returns how many.
    pub fn destroy_match_entities(&mut self, match_id: u64) -> usize {
        let doomed = self.entities_in_match(match_id);
        let count = doomed.len();
        for id in doomed {
            let _ = self.destroy_entity(id);
        }
        count
    }

    pub fn is_alive(&self, id: EntityId) -> bool {
        self.allocator.is_alive(id)
    }

    pub fn entity_count(&self) -> usize {
        self.allocator.live_count()
    }

    pub fn entity_capacity(&self) -> usize {
        self.allocator.capacity()
    }

    pub fn entity_meta(&self, id: EntityId) -> Option<EntityMeta> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        self.meta.get(id.index() as usize - 1).copied()
    }

    /// Live entities of a match, ascending by slot index.
    pub fn entities_in_match(&self, match_id: u64) -> Vec<EntityId> {
        let mut out = Vec::new();
        for archetype in &self.archetypes {
            for &id in archetype.entities() {
                if self.meta[id.index() as usize - 1].match_id == match_id {
                    out.push(id);
                }
            }
        }
        out.sort_unstable_by_key(EntityId::index);
        out
    }

    // ========== Component access ==========

    /// Add a component, migrating the entity to the wider archetype.
    /// Overwrites in place if the component is already present.
    pub fn add_component(
        &mut self,
        id: EntityId,
        type_id: ComponentTypeId,
        values: &[FieldValue],
    ) -> Result<()> {
        if !self.allocator.is_alive(id) {
            return Err(EngineError::StaleHandle);
        }
        self.registry.validate_values(type_id, values)?;

        let slot = id.index() as usize - 1;
        let location = self.locations[slot];
        let old_archetype = &mut self.archetypes[location.archetype_id];

        if let Some(column) = old_archetype.column_mut(type_id) {
            column.set_row(location.archetype_row, values);
            self.changes.record(id, type_id);
            return Ok(());
        }

        let mut new_types: Vec<ComponentTypeId> =
            old_archetype.signature().iter().copied().collect();
        new_types.push(type_id);
        let target = self.get_or_create_archetype(&new_types)?;

        self.move_entity(id, location, target, Some((type_id, values)))?;
        self.changes.record(id, type_id);
        Ok(())
    }

    /// Remove a component, migrating to the narrower archetype.
    /// No-op if the entity does not carry the component.
    pub fn remove_component(&mut self, id: EntityId, type_id: ComponentTypeId) -> Result<()> {
        if !self.allocator.is_alive(id) {
            return Err(EngineError::StaleHandle);
        }

        let slot = id.index() as usize - 1;
        let location = self.locations[slot];
        let old_archetype = &self.archetypes[location.archetype_id];

        if !old_archetype.has_type(type_id) {
            return Ok(());
        }

        let new_types: Vec<ComponentTypeId> = old_archetype
            .signature()
            .iter()
            .copied()
            .filter(|t| *t != type_id)
            .collect();
        let target = self.get_or_create_archetype(&new_types)?;

        self.move_entity(id, location, target, None)?;
        self.changes.record(id, type_id);
        Ok(())
    }

    pub fn get_component(&self, id: EntityId, type_id: ComponentTypeId) -> Option<&[FieldValue]> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        let location = self.locations[id.index() as usize - 1];
        let archetype = self.archetypes.get(location.archetype_id)?;
        if !archetype.has_type(type_id) {
            return None;
        }
        let column = archetype.column(type_id)?;
        if column.arity() == 0 {
            // Tag component: present but empty
            return Some(&[]);
        }
        Some(column.row(location.archetype_row))
    }

    pub fn has_component(&self, id: EntityId, type_id: ComponentTypeId) -> bool {
        if !self.allocator.is_alive(id) {
            return false;
        }
        let location = self.locations[id.index() as usize - 1];
        self.archetypes[location.archetype_id].has_type(type_id)
    }

    /// Write into an existing row; fails if the component is absent.
    pub fn set_component(
        &mut self,
        id: EntityId,
        type_id: ComponentTypeId,
        values: &[FieldValue],
    ) -> Result<()> {
        if !self.allocator.is_alive(id) {
            return Err(EngineError::StaleHandle);
        }
        self.registry.validate_values(type_id, values)?;

        let location = self.locations[id.index() as usize - 1];
        let archetype = &mut self.archetypes[location.archetype_id];
        let Some(column) = archetype.column_mut(type_id) else {
            let component = self
                .registry
                .name_of(type_id)
                .unwrap_or("<unknown>")
                .to_string();
            return Err(EngineError::ComponentMissing { component });
        };
        if column.arity() > 0 {
            column.set_row(location.archetype_row, values);
        }
        self.changes.record(id, type_id);
        Ok(())
    }

    /// Full component tuple as an owned value.
    pub fn component_value(
        &self,
        id: EntityId,
        type_id: ComponentTypeId,
    ) -> Option<ComponentValue> {
        self.get_component(id, type_id).map(|v| v.to_vec())
    }

    // ========== Queries ==========

    /// Lazy iterator over entities whose archetype is a superset of
    /// `required` and disjoint from `excluded`. Archetype-insertion order,
    /// then row order within each archetype. Obtain a fresh iterator per
    /// pass; any mutation of the store ends the borrow.
    pub fn query<'w>(
        &'w self,
        required: &[ComponentTypeId],
        excluded: &[ComponentTypeId],
    ) -> QueryIter<'w> {
        QueryIter::new(&self.archetypes, required, excluded)
    }

    /// Mutate `target` component rows of all matching entities in place.
    /// The hot path for module systems; dirty entries are recorded per row.
    pub fn update_components<F>(
        &mut self,
        required: &[ComponentTypeId],
        excluded: &[ComponentTypeId],
        target: ComponentTypeId,
        mut f: F,
    ) -> Result<()>
    where
        F: FnMut(EntityId, &mut [FieldValue]),
    {
        let mut required_all: Vec<ComponentTypeId> = required.to_vec();
        if !required_all.contains(&target) {
            required_all.push(target);
        }

        for archetype in &mut self.archetypes {
            if !archetype.matches(&required_all, excluded) {
                continue;
            }
            let entities: Vec<EntityId> = archetype.entities().to_vec();
            let column = archetype
                .column_mut(target)
                .expect("matched archetype has target column");
            for (row, id) in entities.iter().enumerate() {
                f(*id, column.row_mut(row));
                self.changes.record(*id, target);
            }
        }
        Ok(())
    }

    // ========== Change log ==========

    /// Return and clear the accumulated dirty-set.
    pub fn change_log(&mut self) -> ChangeLog {
        std::mem::take(&mut self.changes)
    }

    /// Inspect the pending dirty-set without clearing it.
    pub fn pending_changes(&self) -> &ChangeLog {
        &self.changes
    }

    // ========== Introspection ==========

    pub fn archetypes(&self) -> &[Archetype] {
        &self.archetypes
    }

    pub fn archetype_count(&self) -> usize {
        self.archetypes.len()
    }

    pub fn location_of(&self, id: EntityId) -> Option<EntityLocation> {
        if !self.allocator.is_alive(id) {
            return None;
        }
        self.locations.get(id.index() as usize - 1).copied()
    }

    /// Coarse memory estimate for budget accounting.
    pub fn estimated_bytes(&self) -> usize {
        let slot_bytes = self.allocator.high_water_mark()
            * (std::mem::size_of::<EntityLocation>() + std::mem::size_of::<EntityMeta>());
        let archetype_bytes: usize = self
            .archetypes
            .iter()
            .map(|a| {
                let rows = a.len();
                let fields: usize = a
                    .signature()
                    .iter()
                    .filter_map(|t| self.registry.arity_of(*t))
                    .sum();
                rows * (std::mem::size_of::<EntityId>()
                    + fields * std::mem::size_of::<FieldValue>())
            })
            .sum();
        slot_bytes + archetype_bytes
    }

    // ========== Internals ==========

    fn get_or_create_archetype(&mut self, types: &[ComponentTypeId]) -> Result<usize> {
        let signature = canonical_signature(types);
        if let Some(&id) = self.archetype_index.get(&signature) {
            return Ok(id);
        }

        let mut arities = Vec::with_capacity(signature.len());
        for &type_id in &signature {
            let arity = self
                .registry
                .arity_of(type_id)
                .ok_or_else(|| EngineError::UnknownComponentType(format!("#{}", type_id.0)))?;
            arities.push(arity);
        }

        let archetype = Archetype::new(signature.clone(), &arities);
        self.archetypes.push(archetype);
        let id = self.archetypes.len() - 1;
        self.archetype_index.insert(signature, id);
        debug!(archetype_id = id, types = signature_len(&self.archetypes[id]), "archetype created");
        Ok(id)
    }

    /// Migrate an entity between archetypes.
    ///
    /// Shared columns are copied across, the old row is swap-removed (fixing
    /// up the displaced entity's location), and `added` initializes the one
    /// new column when widening.
    fn move_entity(
        &mut self,
        id: EntityId,
        old_loc: EntityLocation,
        new_archetype_id: usize,
        added: Option<(ComponentTypeId, &[FieldValue])>,
    ) -> Result<()> {
        if old_loc.archetype_id == new_archetype_id {
            return Ok(());
        }

        // Access both archetypes via split_at_mut
        let (old_arch, new_arch) = if old_loc.archetype_id < new_archetype_id {
            let (left, right) = self.archetypes.split_at_mut(new_archetype_id);
            (&mut left[old_loc.archetype_id], &mut right[0])
        } else {
            let (left, right) = self.archetypes.split_at_mut(old_loc.archetype_id);
            (&mut right[0], &mut left[new_archetype_id])
        };

        let new_row = new_arch.allocate_row(id);

        let new_signature: Vec<ComponentTypeId> = new_arch.signature().to_vec();
        for type_id in new_signature {
            if let Some((added_type, values)) = added {
                if type_id == added_type {
                    if let Some(column) = new_arch.column_mut(type_id) {
                        column.push_row(values);
                    }
                    continue;
                }
            }
            if let Some(old_column) = old_arch.column(type_id) {
                let values: ComponentValue = if old_column.arity() == 0 {
                    Vec::new()
                } else {
                    old_column.row(old_loc.archetype_row).to_vec()
                };
                if let Some(new_column) = new_arch.column_mut(type_id) {
                    new_column.push_row(&values);
                }
            }
        }

        if let Some(swapped) = old_arch.swap_remove_row(old_loc.archetype_row) {
            self.locations[swapped.index() as usize - 1].archetype_row = old_loc.archetype_row;
        }

        self.locations[id.index() as usize - 1] = EntityLocation {
            archetype_id: new_archetype_id,
            archetype_row: new_row,
        };
        Ok(())
    }
}

fn signature_len(archetype: &Archetype) -> usize {
    archetype.signature().len()
}
