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

//! Read queries over archetype storage
//!
//! A query visits archetypes whose type-set is a superset of the required
//! set and disjoint from the excluded set, in archetype-insertion order,
//! then by row within each archetype. Iterators are lazy, finite, and not
//! restartable; the immutable borrow of the store keeps mutation out while
//! one is live.

use smallvec::SmallVec;

use crate::archetype::Archetype;
use crate::component::{ComponentTypeId, FieldValue};
use crate::entity::EntityId;

/// One matched entity with access to its row
pub struct QueryItem<'w> {
    pub entity: EntityId,
    archetype: &'w Archetype,
    row: usize,
}

impl<'w> QueryItem<'w> {
    /// Field values of `type_id` on this entity; `Some(&[])` for tags.
    pub fn get(&self, type_id: ComponentTypeId) -> Option<&'w [FieldValue]> {
        let column = self.archetype.column(type_id)?;
        if column.arity() == 0 {
            return Some(&[]);
        }
        Some(column.row(self.row))
    }

    pub fn has(&self, type_id: ComponentTypeId) -> bool {
        self.archetype.has_type(type_id)
    }
}

/// Lazy iterator over matching (entity, row) pairs
pub struct QueryIter<'w> {
    archetypes: &'w [Archetype],
    required: SmallVec<[ComponentTypeId; 8]>,
    excluded: SmallVec<[ComponentTypeId; 4]>,
    archetype_cursor: usize,
    row_cursor: usize,
}

impl<'w> QueryIter<'w> {
    pub(crate) fn new(
        archetypes: &'w [Archetype],
        required: &[ComponentTypeId],
        excluded: &[ComponentTypeId],
    ) -> Self {
        Self {
            archetypes,
            required: SmallVec::from_slice(required),
            excluded: SmallVec::from_slice(excluded),
            archetype_cursor: 0,
            row_cursor: 0,
        }
    }
}

impl<'w> Iterator for QueryIter<'w> {
    type Item = QueryItem<'w>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let archetype = self.archetypes.get(self.archetype_cursor)?;

            if !archetype.matches(&self.required, &self.excluded) {
                self.archetype_cursor += 1;
                self.row_cursor = 0;
                continue;
            }

            if let Some(entity) = archetype.entity_at(self.row_cursor) {
                let row = self.row_cursor;
                self.row_cursor += 1;
                return Some(QueryItem { entity, archetype, row });
            }

            self.archetype_cursor += 1;
            self.row_cursor = 0;
        }
    }
}
