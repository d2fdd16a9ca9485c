//! Snapshot engine: cached per-match projections of the store
//!
//! Each cached snapshot keeps one sorted entity-index for its match and one
//! index-aligned column per (module, component); a slot is `None` where the
//! entity lacks the component. Snapshots are immutable value objects once
//! handed out; the cache is maintained incrementally from the store's
//! change log and falls back to a full rebuild when a tick dirties more
//! than `rebuild_threshold_ratio` of the match.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Instant;

use ahash::AHashMap;
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::component::{ComponentTypeId, ComponentValue};
use crate::entity::EntityId;
use crate::metrics::{SnapshotMetrics, SnapshotMetricsSummary};
use crate::store::{ChangeLog, EntityStore};

/// Well-known tag granting all players visibility of an entity
pub const PUBLIC_COMPONENT: &str = "Public";

/// Index-aligned component column; `None` where the component is absent
pub type SnapshotColumn = Vec<Option<ComponentValue>>;

/// What a module contributes to a match projection
#[derive(Debug, Clone)]
pub struct ModuleProjection {
    pub module: String,
    /// (type id, component name) pairs in declaration order
    pub components: Vec<(ComponentTypeId, String)>,
}

/// A point-in-time projection of one match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub match_id: u64,
    pub tick: u64,
    /// Raw entity ids of the match, ascending (the `ENTITY_ID` companion)
    pub entity_ids: Vec<u64>,
    /// module -> component -> column aligned to `entity_ids`
    pub modules: BTreeMap<String, BTreeMap<String, SnapshotColumn>>,
}

impl Snapshot {
    fn empty(match_id: u64, tick: u64) -> Self {
        Self {
            match_id,
            tick,
            entity_ids: Vec::new(),
            modules: BTreeMap::new(),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entity_ids.len()
    }

    fn index_of(&self, entity_id: u64) -> Option<usize> {
        self.entity_ids.binary_search(&entity_id).ok()
    }

    pub fn column(&self, module: &str, component: &str) -> Option<&SnapshotColumn> {
        self.modules.get(module)?.get(component)
    }

    /// Values of entities that carry the component, in entity-id order.
    pub fn component_values(&self, module: &str, component: &str) -> Vec<ComponentValue> {
        self.column(module, component)
            .map(|column| column.iter().flatten().cloned().collect())
            .unwrap_or_default()
    }

    /// Raw ids of entities that carry the component, aligned with
    /// [`Snapshot::component_values`].
    pub fn component_entity_ids(&self, module: &str, component: &str) -> Vec<u64> {
        self.column(module, component)
            .map(|column| {
                column
                    .iter()
                    .zip(&self.entity_ids)
                    .filter(|(slot, _)| slot.is_some())
                    .map(|(_, id)| *id)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn value_for(&self, module: &str, component: &str, entity_id: u64) -> Option<&ComponentValue> {
        let pos = self.index_of(entity_id)?;
        self.column(module, component)?.get(pos)?.as_ref()
    }

    /// Total field slots, used for delta compression ratios.
    pub fn field_slot_count(&self) -> usize {
        self.modules
            .values()
            .flat_map(|components| components.values())
            .flat_map(|column| column.iter().flatten())
            .map(Vec::len)
            .sum()
    }
}

struct CachedMatch {
    snapshot: Snapshot,
}

/// Per-container snapshot cache and projection builder.
pub struct SnapshotEngine {
    cached: AHashMap<u64, CachedMatch>,
    player_cache: LruCache<(u64, u64), Snapshot>,
    rebuild_threshold_ratio: f64,
    metrics: SnapshotMetrics,
}

impl SnapshotEngine {
    pub fn new(rebuild_threshold_ratio: f64, player_cache_slots: usize) -> Self {
        Self {
            cached: AHashMap::new(),
            player_cache: LruCache::new(
                NonZeroUsize::new(player_cache_slots.max(1)).unwrap(),
            ),
            rebuild_threshold_ratio,
            metrics: SnapshotMetrics::new(),
        }
    }

    // ========== Projection builders ==========

    /// Materialize a full projection straight from the store.
    pub fn build_full(
        store: &EntityStore,
        match_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
    ) -> Snapshot {
        let entities = store.entities_in_match(match_id);
        Self::build_for_entities(store, match_id, projections, tick, &entities)
    }

    fn build_for_entities(
        store: &EntityStore,
        match_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
        entities: &[EntityId],
    ) -> Snapshot {
        let mut snapshot = Snapshot::empty(match_id, tick);
        snapshot.entity_ids = entities.iter().map(|e| u64::from(e.index())).collect();

        for projection in projections {
            let mut components = BTreeMap::new();
            for (type_id, name) in &projection.components {
                let column: SnapshotColumn = entities
                    .iter()
                    .map(|&entity| store.component_value(entity, *type_id))
                    .collect();
                components.insert(name.clone(), column);
            }
            snapshot.modules.insert(projection.module.clone(), components);
        }
        snapshot
    }

    /// Player-scoped projection: entities owned by the player or carrying
    /// the public tag. Always built fresh; see
    /// [`SnapshotEngine::get_for_match_and_player`] for the cached variant.
    pub fn build_for_player(
        store: &EntityStore,
        match_id: u64,
        player_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
    ) -> Snapshot {
        let public = store.component_id(PUBLIC_COMPONENT);
        let entities: Vec<EntityId> = store
            .entities_in_match(match_id)
            .into_iter()
            .filter(|&entity| {
                let owned = store
                    .entity_meta(entity)
                    .map(|meta| meta.owner == player_id)
                    .unwrap_or(false);
                owned || public.map(|p| store.has_component(entity, p)).unwrap_or(false)
            })
            .collect();
        Self::build_for_entities(store, match_id, projections, tick, &entities)
    }

    // ========== Cache access ==========

    /// Current snapshot for a match, building and caching on first request.
    pub fn get_for_match(
        &mut self,
        store: &EntityStore,
        match_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
    ) -> Snapshot {
        if let Some(cached) = self.cached.get(&match_id) {
            self.metrics.record_hit();
            return cached.snapshot.clone();
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let snapshot = Self::build_full(store, match_id, projections, tick);
        self.metrics.record_generation(started.elapsed());
        self.cached.insert(match_id, CachedMatch { snapshot: snapshot.clone() });
        snapshot
    }

    /// Player-scoped read; `cached` opts into the bounded LRU variant for
    /// players with active sessions.
    pub fn get_for_match_and_player(
        &mut self,
        store: &EntityStore,
        match_id: u64,
        player_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
        cached: bool,
    ) -> Snapshot {
        if cached {
            if let Some(snapshot) = self.player_cache.get(&(match_id, player_id)) {
                if snapshot.tick == tick {
                    self.metrics.record_hit();
                    return snapshot.clone();
                }
            }
        }

        self.metrics.record_miss();
        let started = Instant::now();
        let snapshot = Self::build_for_player(store, match_id, player_id, projections, tick);
        self.metrics.record_generation(started.elapsed());
        if cached {
            self.player_cache.put((match_id, player_id), snapshot.clone());
        }
        snapshot
    }

    /// Matches with a live cache entry (the incremental-update working set).
    pub fn cached_matches(&self) -> Vec<u64> {
        self.cached.keys().copied().collect()
    }

    /// Borrow a cached snapshot without touching hit/miss counters.
    pub fn cached_snapshot(&self, match_id: u64) -> Option<&Snapshot> {
        self.cached.get(&match_id).map(|cached| &cached.snapshot)
    }

    pub fn is_cached(&self, match_id: u64) -> bool {
        self.cached.contains_key(&match_id)
    }

    /// Build and pin the cache entry for a match (new subscriber).
    pub fn ensure_cached(
        &mut self,
        store: &EntityStore,
        match_id: u64,
        projections: &[ModuleProjection],
        tick: u64,
    ) {
        if !self.cached.contains_key(&match_id) {
            let started = Instant::now();
            let snapshot = Self::build_full(store, match_id, projections, tick);
            self.metrics.record_generation(started.elapsed());
            self.cached.insert(match_id, CachedMatch { snapshot });
        }
    }

    /// Drop a match's cache (match deleted).
    pub fn invalidate_match(&mut self, match_id: u64) {
        self.cached.remove(&match_id);
        let stale: Vec<(u64, u64)> = self
            .player_cache
            .iter()
            .map(|(key, _)| *key)
            .filter(|(m, _)| *m == match_id)
            .collect();
        for key in stale {
            self.player_cache.pop(&key);
        }
    }

    /// Release everything (container stop).
    pub fn clear(&mut self) {
        self.cached.clear();
        self.player_cache.clear();
    }

    pub fn metrics(&self) -> SnapshotMetricsSummary {
        self.metrics.summary()
    }

    // ========== Incremental maintenance ==========

    /// Consume one tick's change log, updating every cached match.
    ///
    /// `projections_by_match` must cover every cached match id.
    pub fn apply_changes(
        &mut self,
        store: &EntityStore,
        projections_by_match: &AHashMap<u64, Vec<ModuleProjection>>,
        changes: &ChangeLog,
        tick: u64,
    ) {
        if changes.is_empty() {
            for cached in self.cached.values_mut() {
                cached.snapshot.tick = tick;
            }
            return;
        }

        // Player-scoped caches are request-time optimizations; any change
        // invalidates them wholesale.
        self.player_cache.clear();

        let match_ids: Vec<u64> = self.cached.keys().copied().collect();
        for match_id in match_ids {
            let Some(projections) = projections_by_match.get(&match_id) else {
                continue;
            };
            self.apply_changes_to_match(store, match_id, projections, changes, tick);
        }
    }

    fn apply_changes_to_match(
        &mut self,
        store: &EntityStore,
        match_id: u64,
        projections: &[ModuleProjection],
        changes: &ChangeLog,
        tick: u64,
    ) {
        let cached = self.cached.get_mut(&match_id).expect("cached match");
        let snapshot = &mut cached.snapshot;

        // Count the portion of the change log relevant to this match before
        // touching anything; a large enough set means rebuilding wholesale
        // is cheaper than splicing.
        let relevant = count_relevant(store, snapshot, changes, match_id);
        let threshold =
            (self.rebuild_threshold_ratio * snapshot.entity_count().max(1) as f64) as usize;

        if relevant > threshold.max(1) {
            debug!(match_id, relevant, "snapshot full rebuild");
            let started = Instant::now();
            let rebuilt = Self::build_full(store, match_id, projections, tick);
            self.metrics.record_generation(started.elapsed());
            self.metrics.record_full_rebuild();
            cached.snapshot = rebuilt;
            return;
        }

        let started = Instant::now();

        // Removals first so a slot recycled within the tick re-inserts cleanly
        for &dead in changes.despawned() {
            let raw = u64::from(dead.index());
            if let Some(pos) = snapshot.index_of(raw) {
                snapshot.entity_ids.remove(pos);
                for components in snapshot.modules.values_mut() {
                    for column in components.values_mut() {
                        column.remove(pos);
                    }
                }
            }
        }

        for &born in changes.spawned() {
            if !store.is_alive(born) {
                continue;
            }
            let Some(meta) = store.entity_meta(born) else { continue };
            if meta.match_id != match_id {
                continue;
            }
            let raw = u64::from(born.index());
            if let Err(pos) = snapshot.entity_ids.binary_search(&raw) {
                snapshot.entity_ids.insert(pos, raw);
                for components in snapshot.modules.values_mut() {
                    for column in components.values_mut() {
                        column.insert(pos, None);
                    }
                }
            }
        }

        // Deterministic application order
        let mut pairs: Vec<(EntityId, ComponentTypeId)> =
            changes.pairs().copied().collect();
        pairs.sort_unstable();

        for (entity, type_id) in pairs {
            if !store.is_alive(entity) {
                continue;
            }
            let Some(meta) = store.entity_meta(entity) else { continue };
            if meta.match_id != match_id {
                continue;
            }
            let raw = u64::from(entity.index());
            let Some(pos) = snapshot.index_of(raw) else {
                trace!(match_id, entity = raw, "dirty entity missing from index");
                continue;
            };

            let value = store.component_value(entity, type_id);
            for projection in projections {
                for (proj_type, name) in &projection.components {
                    if *proj_type != type_id {
                        continue;
                    }
                    if let Some(column) = snapshot
                        .modules
                        .get_mut(&projection.module)
                        .and_then(|components| components.get_mut(name))
                    {
                        column[pos] = value.clone();
                    }
                }
            }
        }

        snapshot.tick = tick;
        self.metrics.record_generation(started.elapsed());
        self.metrics.record_incremental();
    }
}

fn count_relevant(
    store: &EntityStore,
    snapshot: &Snapshot,
    changes: &ChangeLog,
    match_id: u64,
) -> usize {
    let mut count = 0;
    for &dead in changes.despawned() {
        if snapshot.index_of(u64::from(dead.index())).is_some() {
            count += 1;
        }
    }
    for &born in changes.spawned() {
        if store
            .entity_meta(born)
            .map(|meta| meta.match_id == match_id)
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    for (entity, _) in changes.pairs() {
        if store
            .entity_meta(*entity)
            .map(|meta| meta.match_id == match_id)
            .unwrap_or(false)
        {
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{ComponentSchema, FieldDef, FieldType, FieldValue};
    use crate::error::Result;

    fn setup() -> (EntityStore, ComponentTypeId, Vec<ModuleProjection>) {
        let mut store = EntityStore::new(32, 8);
        let pos = store
            .register_component_type(ComponentSchema::new(
                "Pos",
                vec![FieldDef::new("x", FieldType::I32), FieldDef::new("y", FieldType::I32)],
            ))
            .unwrap();
        let projections = vec![ModuleProjection {
            module: "movement".to_string(),
            components: vec![(pos, "Pos".to_string())],
        }];
        (store, pos, projections)
    }

    #[test]
    fn test_full_build_sorted_by_entity_id() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let a = store.create_entity(1, 0)?;
        let b = store.create_entity(1, 0)?;
        store.add_component(a, pos, &[FieldValue::I32(1), FieldValue::I32(1)])?;
        store.add_component(b, pos, &[FieldValue::I32(2), FieldValue::I32(2)])?;

        let snapshot = SnapshotEngine::build_full(&store, 1, &projections, 1);
        assert_eq!(snapshot.entity_ids, vec![1, 2]);
        assert_eq!(
            snapshot.component_values("movement", "Pos"),
            vec![
                vec![FieldValue::I32(1), FieldValue::I32(1)],
                vec![FieldValue::I32(2), FieldValue::I32(2)],
            ]
        );
        Ok(())
    }

    #[test]
    fn test_cache_hit_and_idempotence() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let e = store.create_entity(1, 0)?;
        store.add_component(e, pos, &[FieldValue::I32(0), FieldValue::I32(0)])?;

        let mut engine = SnapshotEngine::new(0.25, 4);
        let first = engine.get_for_match(&store, 1, &projections, 0);
        let second = engine.get_for_match(&store, 1, &projections, 0);
        assert_eq!(first, second);

        let metrics = engine.metrics();
        assert_eq!(metrics.cache_misses, 1);
        assert_eq!(metrics.cache_hits, 1);
        Ok(())
    }

    #[test]
    fn test_incremental_value_update() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let e = store.create_entity(1, 0)?;
        store.add_component(e, pos, &[FieldValue::I32(0), FieldValue::I32(0)])?;
        store.change_log();

        let mut engine = SnapshotEngine::new(1.0, 4);
        engine.ensure_cached(&store, 1, &projections, 0);

        store.set_component(e, pos, &[FieldValue::I32(7), FieldValue::I32(8)])?;
        let changes = store.change_log();
        let mut by_match = AHashMap::new();
        by_match.insert(1u64, projections.clone());
        engine.apply_changes(&store, &by_match, &changes, 1);

        let snapshot = engine.get_for_match(&store, 1, &projections, 1);
        assert_eq!(snapshot.tick, 1);
        assert_eq!(
            snapshot.value_for("movement", "Pos", u64::from(e.index())),
            Some(&vec![FieldValue::I32(7), FieldValue::I32(8)])
        );
        Ok(())
    }

    #[test]
    fn test_incremental_spawn_and_despawn() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let a = store.create_entity(1, 0)?;
        store.add_component(a, pos, &[FieldValue::I32(1), FieldValue::I32(1)])?;
        store.change_log();

        let mut engine = SnapshotEngine::new(10.0, 4);
        engine.ensure_cached(&store, 1, &projections, 0);

        let b = store.create_entity(1, 0)?;
        store.add_component(b, pos, &[FieldValue::I32(2), FieldValue::I32(2)])?;
        store.destroy_entity(a)?;
        let changes = store.change_log();

        let mut by_match = AHashMap::new();
        by_match.insert(1u64, projections.clone());
        engine.apply_changes(&store, &by_match, &changes, 1);

        let snapshot = engine.get_for_match(&store, 1, &projections, 1);
        assert_eq!(snapshot.entity_ids, vec![u64::from(b.index())]);
        assert_eq!(
            snapshot.component_values("movement", "Pos"),
            vec![vec![FieldValue::I32(2), FieldValue::I32(2)]]
        );
        Ok(())
    }

    #[test]
    fn test_incremental_matches_full_rebuild() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let mut entities = Vec::new();
        for i in 0..6 {
            let e = store.create_entity(1, 0)?;
            store.add_component(e, pos, &[FieldValue::I32(i), FieldValue::I32(0)])?;
            entities.push(e);
        }
        store.change_log();

        let mut engine = SnapshotEngine::new(10.0, 4);
        engine.ensure_cached(&store, 1, &projections, 0);

        store.set_component(entities[2], pos, &[FieldValue::I32(99), FieldValue::I32(1)])?;
        store.destroy_entity(entities[4])?;
        let changes = store.change_log();

        let mut by_match = AHashMap::new();
        by_match.insert(1u64, projections.clone());
        engine.apply_changes(&store, &by_match, &changes, 1);

        let incremental = engine.get_for_match(&store, 1, &projections, 1);
        let rebuilt = SnapshotEngine::build_full(&store, 1, &projections, 1);
        assert_eq!(incremental, rebuilt);
        Ok(())
    }

    #[test]
    fn test_rebuild_threshold_triggers_full() -> Result<()> {
        let (mut store, pos, projections) = setup();
        for i in 0..4 {
            let e = store.create_entity(1, 0)?;
            store.add_component(e, pos, &[FieldValue::I32(i), FieldValue::I32(0)])?;
        }
        store.change_log();

        // Threshold ratio 0: any change forces a rebuild
        let mut engine = SnapshotEngine::new(0.0, 4);
        engine.ensure_cached(&store, 1, &projections, 0);

        store.update_components(&[], &[], pos, |_, row| row[0] = FieldValue::I32(5))?;
        let changes = store.change_log();
        let mut by_match = AHashMap::new();
        by_match.insert(1u64, projections.clone());
        engine.apply_changes(&store, &by_match, &changes, 1);

        assert_eq!(engine.metrics().full_rebuilds, 1);
        assert_eq!(engine.metrics().incremental_updates, 0);
        Ok(())
    }

    #[test]
    fn test_player_scoped_projection() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let public = store.register_component_type(ComponentSchema::flag(PUBLIC_COMPONENT))?;

        let mine = store.create_entity(1, 42)?;
        store.add_component(mine, pos, &[FieldValue::I32(1), FieldValue::I32(0)])?;
        let shared = store.create_entity(1, 7)?;
        store.add_component(shared, pos, &[FieldValue::I32(2), FieldValue::I32(0)])?;
        store.add_component(shared, public, &[])?;
        let hidden = store.create_entity(1, 7)?;
        store.add_component(hidden, pos, &[FieldValue::I32(3), FieldValue::I32(0)])?;

        let snapshot = SnapshotEngine::build_for_player(&store, 1, 42, &projections, 0);
        assert_eq!(
            snapshot.entity_ids,
            vec![u64::from(mine.index()), u64::from(shared.index())]
        );
        Ok(())
    }

    #[test]
    fn test_invalidate_match() -> Result<()> {
        let (mut store, pos, projections) = setup();
        let e = store.create_entity(1, 0)?;
        store.add_component(e, pos, &[FieldValue::I32(0), FieldValue::I32(0)])?;

        let mut engine = SnapshotEngine::new(0.25, 4);
        engine.get_for_match(&store, 1, &projections, 0);
        assert!(engine.is_cached(1));

        engine.invalidate_match(1);
        assert!(!engine.is_cached(1));
        Ok(())
    }
}
