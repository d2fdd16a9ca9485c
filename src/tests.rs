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

//! Cross-module integration tests and engine invariants

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::command::{Command, CommandDescriptor, ParamSpec, ParamType, Scalar};
    use crate::component::{ComponentSchema, ComponentTypeId, FieldDef, FieldType, FieldValue};
    use crate::config::{ContainerConfig, EngineConfig};
    use crate::container::ExecutionContainer;
    use crate::entity::EntityId;
    use crate::error::Result;
    use crate::module::{CommandSpec, Module, PluginCatalog, SystemDescriptor};
    use crate::store::EntityStore;

    /// Deterministic pseudo-random stream for stress sequences
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> u64 {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            self.0 >> 33
        }
    }

    fn registered_store() -> (EntityStore, Vec<ComponentTypeId>) {
        let mut store = EntityStore::new(256, 16);
        let a = store
            .register_component_type(ComponentSchema::new(
                "A",
                vec![FieldDef::new("v", FieldType::I64)],
            ))
            .unwrap();
        let b = store
            .register_component_type(ComponentSchema::new(
                "B",
                vec![FieldDef::new("x", FieldType::F64), FieldDef::new("y", FieldType::F64)],
            ))
            .unwrap();
        let c = store.register_component_type(ComponentSchema::flag("C")).unwrap();
        (store, vec![a, b, c])
    }

    fn value_for(store: &EntityStore, type_id: ComponentTypeId, seed: i64) -> Vec<FieldValue> {
        let arity = store.registry().arity_of(type_id).unwrap();
        let schema = store.registry().schema(type_id).unwrap().clone();
        (0..arity)
            .map(|i| match schema.fields[i].ty {
                FieldType::I64 => FieldValue::I64(seed + i as i64),
                FieldType::F64 => FieldValue::F64((seed + i as i64) as f64),
                FieldType::I32 => FieldValue::I32(seed as i32),
                FieldType::F32 => FieldValue::F32(seed as f32),
                FieldType::Bool => FieldValue::Bool(seed % 2 == 0),
            })
            .collect()
    }

    /// Every live entity has a valid row in every column of exactly one
    /// archetype, and column lengths agree with archetype entity counts.
    fn assert_archetype_integrity(store: &EntityStore) {
        let mut seen = std::collections::HashSet::new();
        for archetype in store.archetypes() {
            assert!(archetype.columns_consistent());
            for &entity in archetype.entities() {
                assert!(store.is_alive(entity), "dead entity in archetype");
                assert!(seen.insert(entity), "entity in two archetypes");
            }
        }
        assert_eq!(seen.len(), store.entity_count());
    }

    #[test]
    fn test_archetype_integrity_under_stress() -> Result<()> {
        let (mut store, types) = registered_store();
        let mut rng = Lcg(42);
        let mut live: Vec<EntityId> = Vec::new();

        for step in 0..2000 {
            match rng.next() % 5 {
                0 => {
                    if let Ok(entity) = store.create_entity(1 + rng.next() % 3, 0) {
                        live.push(entity);
                    }
                }
                1 if !live.is_empty() => {
                    let victim = live.swap_remove((rng.next() as usize) % live.len());
                    store.destroy_entity(victim)?;
                }
                2 if !live.is_empty() => {
                    let entity = live[(rng.next() as usize) % live.len()];
                    let ty = types[(rng.next() as usize) % types.len()];
                    let values = value_for(&store, ty, step);
                    store.add_component(entity, ty, &values)?;
                }
                3 if !live.is_empty() => {
                    let entity = live[(rng.next() as usize) % live.len()];
                    let ty = types[(rng.next() as usize) % types.len()];
                    store.remove_component(entity, ty)?;
                }
                _ if !live.is_empty() => {
                    let entity = live[(rng.next() as usize) % live.len()];
                    let ty = types[(rng.next() as usize) % types.len()];
                    if store.has_component(entity, ty) {
                        let values = value_for(&store, ty, step);
                        store.set_component(entity, ty, &values)?;
                    }
                }
                _ => {}
            }

            if step % 250 == 0 {
                assert_archetype_integrity(&store);
            }
        }
        assert_archetype_integrity(&store);
        Ok(())
    }

    #[test]
    fn test_generation_monotonicity() -> Result<()> {
        let (mut store, _) = registered_store();
        let mut last_generation = vec![0u32; 8];

        for _ in 0..50 {
            let mut batch = Vec::new();
            for _ in 0..8 {
                batch.push(store.create_entity(1, 0)?);
            }
            for entity in batch {
                let slot = entity.index() as usize - 1;
                assert!(
                    entity.generation() >= last_generation[slot],
                    "generation decreased on slot {slot}"
                );
                last_generation[slot] = entity.generation();
                store.destroy_entity(entity)?;
            }
        }
        Ok(())
    }

    #[test]
    fn test_dirty_set_completeness() -> Result<()> {
        let (mut store, types) = registered_store();
        let a = types[0];

        let mut entities = Vec::new();
        for _ in 0..10 {
            let entity = store.create_entity(1, 0)?;
            store.add_component(entity, a, &[FieldValue::I64(0)])?;
            entities.push(entity);
        }
        store.change_log();

        // Mutate a known subset; the consumed dirty-set must equal it
        let mutated: Vec<EntityId> = entities.iter().copied().step_by(2).collect();
        for &entity in &mutated {
            store.set_component(entity, a, &[FieldValue::I64(9)])?;
        }

        let changes = store.change_log();
        let pairs: std::collections::HashSet<_> = changes.pairs().copied().collect();
        let expected: std::collections::HashSet<_> =
            mutated.iter().map(|&e| (e, a)).collect();
        assert_eq!(pairs, expected);
        Ok(())
    }

    // ===== Container-level scenarios =====

    /// Counter module: `Count{n:i64}` incremented by its system each tick,
    /// `AddCounter` command spawns a counting entity.
    struct CounterModule;

    impl Module for CounterModule {
        fn name(&self) -> &str {
            "counter"
        }

        fn components(&self) -> Vec<ComponentSchema> {
            vec![ComponentSchema::new(
                "Count",
                vec![FieldDef::new("n", FieldType::I64)],
            )]
        }

        fn systems(&self) -> Vec<SystemDescriptor> {
            vec![SystemDescriptor::new(
                "Increment",
                Arc::new(|store, _ctx| {
                    let count = store.component_id("Count").expect("registered");
                    store.update_components(&[], &[], count, |_, row| {
                        if let FieldValue::I64(n) = row[0] {
                            row[0] = FieldValue::I64(n + 1);
                        }
                    })
                }),
            )]
        }

        fn commands(&self) -> Vec<CommandSpec> {
            vec![CommandSpec {
                descriptor: CommandDescriptor::new(
                    "AddCounter",
                    vec![ParamSpec::required("start", ParamType::Int)],
                ),
                handler: Arc::new(|store, match_id, player_id, params| {
                    let start = params["start"].as_i64().unwrap_or(0);
                    let entity = store.create_entity(match_id, player_id)?;
                    let count = store.component_id("Count").expect("registered");
                    store.add_component(entity, count, &[FieldValue::I64(start)])
                }),
            }]
        }
    }

    fn counter_container() -> ExecutionContainer {
        let mut catalog = PluginCatalog::new();
        catalog.register_module("counter", Arc::new(|| Box::new(CounterModule)));

        let mut config = ContainerConfig::from_engine("test", &EngineConfig::default());
        config.max_entities = 64;
        config.modules = vec!["counter".to_string()];
        let mut container = ExecutionContainer::new(1, config).unwrap();
        container.start(&catalog).unwrap();
        container
    }

    fn add_counter(match_id: u64, start: i64) -> Command {
        Command::new("AddCounter", match_id, 0).with_param("start", Scalar::Int(start))
    }

    #[test]
    fn test_command_ordering_across_ticks() -> Result<()> {
        let mut container = counter_container();
        let match_id = container.create_match(vec!["counter".to_string()], Vec::new())?;

        // c1 enqueued before c2: c1's entity gets the lower id
        container.enqueue_command(add_counter(match_id, 100))?;
        container.enqueue_command(add_counter(match_id, 200))?;
        container.advance()?;

        let snapshot = container.snapshot_for_match(match_id)?;
        let values = snapshot.component_values("counter", "Count");
        // Both incremented once by the system after spawning
        assert_eq!(values, vec![vec![FieldValue::I64(101)], vec![FieldValue::I64(201)]]);
        Ok(())
    }

    #[test]
    fn test_snapshot_idempotent_between_ticks() -> Result<()> {
        let mut container = counter_container();
        let match_id = container.create_match(vec!["counter".to_string()], Vec::new())?;
        container.enqueue_command(add_counter(match_id, 0))?;
        container.advance()?;

        let first = container.snapshot_for_match(match_id)?;
        let second = container.snapshot_for_match(match_id)?;
        assert_eq!(first, second);

        container.advance()?;
        let third = container.snapshot_for_match(match_id)?;
        assert_ne!(first, third);
        Ok(())
    }

    #[test]
    fn test_delta_roundtrip_through_history() -> Result<()> {
        let mut container = counter_container();
        let match_id = container.create_match(vec!["counter".to_string()], Vec::new())?;

        for i in 0..4 {
            container.enqueue_command(add_counter(match_id, i * 10))?;
        }
        container.record_history(match_id)?;

        for _ in 0..5 {
            container.advance()?;
        }

        // Every retained (from, to) pair must replay exactly
        for from in 0..5u64 {
            for to in (from + 1)..=5u64 {
                let delta = container.snapshot_delta(match_id, from, to)?;
                let from_snapshot = container.history_snapshot(match_id, from)?;
                let to_snapshot = container.history_snapshot(match_id, to)?;
                assert_eq!(delta.apply(&from_snapshot)?, to_snapshot);
            }
        }
        Ok(())
    }

    #[test]
    fn test_incremental_snapshot_tracks_live_changes() -> Result<()> {
        let mut catalog = PluginCatalog::new();
        catalog.register_module("counter", Arc::new(|| Box::new(CounterModule)));

        let mut config = ContainerConfig::from_engine("test", &EngineConfig::default());
        config.max_entities = 64;
        config.modules = vec!["counter".to_string()];
        // A steady-state tick dirties every entity; keep those incremental
        config.rebuild_threshold_ratio = 1.0;
        let mut container = ExecutionContainer::new(1, config).unwrap();
        container.start(&catalog)?;
        let match_id = container.create_match(vec!["counter".to_string()], Vec::new())?;

        for i in 0..3 {
            container.enqueue_command(add_counter(match_id, i * 10))?;
        }
        container.advance()?;

        // Pin the cache, then let the tick loop maintain it
        container.snapshot_for_match(match_id)?;
        container.advance()?;
        container.advance()?;

        let cached = container.snapshot_for_match(match_id)?;
        assert_eq!(cached.tick, 3);
        assert_eq!(
            cached.component_values("counter", "Count"),
            vec![
                vec![FieldValue::I64(3)],
                vec![FieldValue::I64(13)],
                vec![FieldValue::I64(23)],
            ]
        );
        assert!(container.snapshot_metrics().incremental_updates >= 2);

        // The incrementally maintained cache matches a from-scratch build
        let rebuilt = crate::snapshot::SnapshotEngine::build_full(
            container.store(),
            match_id,
            &[crate::snapshot::ModuleProjection {
                module: "counter".to_string(),
                components: vec![(
                    container.store().component_id("Count").unwrap(),
                    "Count".to_string(),
                )],
            }],
            3,
        );
        assert_eq!(cached, rebuilt);
        Ok(())
    }
}
