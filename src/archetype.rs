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

//! Archetype storage with row allocation and removal

use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::component::{ComponentTypeId, FieldValue};
use crate::entity::EntityId;

/// Sorted set of component type ids identifying an archetype
pub type ArchetypeSignature = SmallVec<[ComponentTypeId; 8]>;

/// Canonical (sorted, deduplicated) signature for index lookup
pub fn canonical_signature(types: &[ComponentTypeId]) -> ArchetypeSignature {
    let mut signature: ArchetypeSignature = SmallVec::from_slice(types);
    signature.sort_unstable();
    signature.dedup();
    signature
}

/// Dense per-component column: row-major field tuples of fixed arity.
#[derive(Debug, Clone)]
pub struct Column {
    arity: usize,
    data: Vec<FieldValue>,
}

impl Column {
    pub fn new(arity: usize) -> Self {
        Self { arity, data: Vec::new() }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn len(&self) -> usize {
        if self.arity == 0 {
            // Tag columns carry no data; length is tracked by the archetype
            0
        } else {
            self.data.len() / self.arity
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Append a row. Caller validates arity against the schema.
    pub fn push_row(&mut self, values: &[FieldValue]) {
        debug_assert_eq!(values.len(), self.arity);
        self.data.extend_from_slice(values);
    }

    pub fn row(&self, row: usize) -> &[FieldValue] {
        let start = row * self.arity;
        &self.data[start..start + self.arity]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [FieldValue] {
        let start = row * self.arity;
        &mut self.data[start..start + self.arity]
    }

    pub fn set_row(&mut self, row: usize, values: &[FieldValue]) {
        debug_assert_eq!(values.len(), self.arity);
        let start = row * self.arity;
        self.data[start..start + self.arity].copy_from_slice(values);
    }

    /// O(1) removal: the last row moves into `row`.
    pub fn swap_remove_row(&mut self, row: usize) {
        if self.arity == 0 {
            return;
        }
        let len = self.data.len() / self.arity;
        debug_assert!(row < len);
        let start = row * self.arity;
        let last_start = (len - 1) * self.arity;
        if start != last_start {
            for i in 0..self.arity {
                self.data[start + i] = self.data[last_start + i];
            }
        }
        self.data.truncate(last_start);
    }

    pub fn reserve_rows(&mut self, additional: usize) {
        self.data.reserve(additional * self.arity);
    }
}

/// Archetype: an equivalence class of entities sharing a component type set.
///
/// Structure of Arrays: one dense column per component type, plus the entity
/// list giving row -> entity. Archetypes are never destroyed during a
/// container's lifetime.
pub struct Archetype {
    signature: ArchetypeSignature,
    entities: Vec<EntityId>,
    columns: Vec<Column>,
    column_index: FxHashMap<ComponentTypeId, usize>,
}

impl Archetype {
    pub fn new(signature: ArchetypeSignature, arities: &[usize]) -> Self {
        debug_assert_eq!(signature.len(), arities.len());
        let mut column_index = FxHashMap::default();
        let mut columns = Vec::with_capacity(signature.len());
        for (i, (&type_id, &arity)) in signature.iter().zip(arities).enumerate() {
            column_index.insert(type_id, i);
            columns.push(Column::new(arity));
        }
        Self {
            signature,
            entities: Vec::new(),
            columns,
            column_index,
        }
    }

    pub fn signature(&self) -> &ArchetypeSignature {
        &self.signature
    }

    pub fn has_type(&self, type_id: ComponentTypeId) -> bool {
        self.column_index.contains_key(&type_id)
    }

    /// Superset of `required` and disjoint from `excluded`.
    pub fn matches(&self, required: &[ComponentTypeId], excluded: &[ComponentTypeId]) -> bool {
        required.iter().all(|t| self.has_type(*t))
            && !excluded.iter().any(|t| self.has_type(*t))
    }

    /// Reserve the next row for `entity`. Columns are filled by the caller.
    pub fn allocate_row(&mut self, entity: EntityId) -> usize {
        let row = self.entities.len();
        self.entities.push(entity);
        row
    }

    /// Swap-remove a row from the entity list and every column.
    /// Returns the entity that was swapped into `row`, if any.
    pub fn swap_remove_row(&mut self, row: usize) -> Option<EntityId> {
        debug_assert!(row < self.entities.len());
        self.entities.swap_remove(row);
        for column in &mut self.columns {
            column.swap_remove_row(row);
        }
        if row < self.entities.len() {
            Some(self.entities[row])
        } else {
            None
        }
    }

    pub fn column(&self, type_id: ComponentTypeId) -> Option<&Column> {
        let idx = *self.column_index.get(&type_id)?;
        self.columns.get(idx)
    }

    pub fn column_mut(&mut self, type_id: ComponentTypeId) -> Option<&mut Column> {
        let idx = *self.column_index.get(&type_id)?;
        self.columns.get_mut(idx)
    }

    pub fn entities(&self) -> &[EntityId] {
        &self.entities
    }

    pub fn entity_at(&self, row: usize) -> Option<EntityId> {
        self.entities.get(row).copied()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn reserve_rows(&mut self, additional: usize) {
        self.entities.reserve(additional);
        for column in &mut self.columns {
            column.reserve_rows(additional);
        }
    }

    /// Archetype-integrity check: every non-tag column holds exactly one row
    /// per entity.
    pub fn columns_consistent(&self) -> bool {
        self.columns
            .iter()
            .all(|c| c.arity() == 0 || c.len() == self.entities.len())
    }
}
