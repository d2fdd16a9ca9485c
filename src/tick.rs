//! Deterministic tick execution
//!
//! One tick runs five phases in fixed order: CommandDrain, SystemsRun,
//! AIRun, SnapshotUpdate, TickFinalize. The loop is single-threaded
//! cooperative; tick N fully completes before tick N+1 begins, and a
//! command enqueued by an AI at tick N drains no earlier than tick N+1.
//!
//! Failure semantics: a failing system or AI aborts the tick (counter not
//! advanced, dirty-set preserved), the error is broadcast, and the
//! container pauses awaiting operator intervention -- unless `auto_halt`
//! is off, in which case the failure is recorded per-system and the tick
//! proceeds. Plugin programming errors (stale handles, schema misuse) only
//! halt under `strict_plugins`.

use std::time::Instant;

use ahash::AHashMap;
use tracing::{debug, warn};

use crate::broadcast::{EngineEvent, TickCompleted};
use crate::container::{projections_for_match, ContainerState, ExecutionContainer};
use crate::error::{EngineError, Result};
use crate::metrics::{CommandTiming, SystemTiming, TickRecord};
use crate::module::{AiContext, TickContext};
use crate::snapshot::Snapshot;

/// Errors plugins produce by misusing the store; non-fatal unless
/// `strict_plugins` is set.
fn is_plugin_programming_error(error: &EngineError) -> bool {
    matches!(
        error,
        EngineError::StaleHandle
            | EngineError::UnknownComponentType(_)
            | EngineError::ArityMismatch { .. }
            | EngineError::SchemaConflict(_)
            | EngineError::ComponentMissing { .. }
    )
}

impl ExecutionContainer {
    /// Perform exactly one tick.
    ///
    /// Legal in Running, Playing, or Paused (manual single-step).
    pub fn advance(&mut self) -> Result<()> {
        if !matches!(
            self.state,
            ContainerState::Running | ContainerState::Playing | ContainerState::Paused
        ) {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: self.state,
            });
        }

        let tick = self.tick_counter + 1;
        let started = Instant::now();
        let mut record = TickRecord { tick, ..Default::default() };

        // Phase 1: CommandDrain
        self.drain_commands(tick, &mut record);

        // Phase 2: SystemsRun
        // An aborted tick skips the remaining phases, including the
        // TickFinalize metric recording; the rolling window only ever
        // holds completed ticks.
        if let Err(failure) = self.run_systems(tick, &mut record) {
            self.halt_on_failure(failure.to_string());
            return Err(failure);
        }

        // Phase 3: AIRun
        if let Err(failure) = self.run_ais(tick, &mut record) {
            self.halt_on_failure(failure.to_string());
            return Err(failure);
        }

        // Phase 4: SnapshotUpdate
        self.update_snapshots(tick);

        // Phase 5: TickFinalize
        self.finalize_tick(tick, started, record);
        Ok(())
    }

    fn drain_commands(&mut self, tick: u64, record: &mut TickRecord) {
        let batch = self.queue.drain_up_to(self.config.max_commands_per_tick);
        for command in batch {
            // Commands for a match deleted since enqueue are skipped, with
            // a metric rather than an error.
            if !self.matches.contains(command.match_id) {
                record.skipped_commands += 1;
                continue;
            }

            let command_started = Instant::now();
            let outcome = match self.commands.get(&command.name) {
                Some(registered) => (registered.handler)(
                    &mut self.store,
                    command.match_id,
                    command.player_id,
                    &command.params,
                ),
                // Module uninstalled between enqueue and drain
                None => Err(EngineError::CommandInvalid(format!(
                    "unresolved command {:?}",
                    command.name
                ))),
            };
            let nanos = command_started.elapsed().as_nanos() as u64;

            match outcome {
                Ok(()) => record.commands.push(CommandTiming {
                    command: command.name,
                    nanos,
                    success: true,
                    error: None,
                }),
                Err(err) => {
                    // Handler failures never abort the tick
                    self.broadcaster.publish(EngineEvent::CommandFailed {
                        container_id: self.id,
                        tick,
                        command: command.name.clone(),
                        error: err.to_string(),
                    });
                    record.commands.push(CommandTiming {
                        command: command.name,
                        nanos,
                        success: false,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
    }

    fn run_systems(&mut self, tick: u64, record: &mut TickRecord) -> Result<()> {
        for module_idx in 0..self.modules.len() {
            let ctx = TickContext { tick, flag: self.modules[module_idx].flag };

            for system_idx in 0..self.modules[module_idx].systems.len() {
                let (name, run) = {
                    let system = &self.modules[module_idx].systems[system_idx];
                    (system.name.clone(), system.run.clone())
                };

                let system_started = Instant::now();
                let outcome = run(&mut self.store, &ctx);
                let nanos = system_started.elapsed().as_nanos() as u64;

                match outcome {
                    Ok(()) => record.systems.push(SystemTiming {
                        system: name,
                        nanos,
                        success: true,
                        error: None,
                    }),
                    Err(cause) => {
                        self.broadcaster.publish(EngineEvent::SystemFailure {
                            container_id: self.id,
                            tick,
                            system: name.clone(),
                            error: cause.to_string(),
                        });
                        record.systems.push(SystemTiming {
                            system: name.clone(),
                            nanos,
                            success: false,
                            error: Some(cause.to_string()),
                        });

                        let lenient = !self.config.auto_halt
                            || (is_plugin_programming_error(&cause)
                                && !self.config.strict_plugins);
                        if lenient {
                            warn!(
                                container_id = self.id,
                                system = %name,
                                error = %cause,
                                "system failed; continuing"
                            );
                            continue;
                        }
                        return Err(EngineError::SystemFailure {
                            system: name,
                            cause: Box::new(cause),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    fn run_ais(&mut self, tick: u64, record: &mut TickRecord) -> Result<()> {
        let active = self.sessions.active_sessions();
        let mut produced = Vec::new();

        for ai_idx in 0..self.ais.len() {
            let name = self.ais[ai_idx].name.clone();
            let ai_started = Instant::now();

            let outcome = {
                let mut ctx = AiContext::new(&self.store, tick, &active);
                let result = self.ais[ai_idx].ai.tick(&mut ctx);
                produced.append(&mut ctx.into_produced());
                result
            };
            let nanos = ai_started.elapsed().as_nanos() as u64;

            match outcome {
                Ok(()) => record.ais.push(SystemTiming {
                    system: name,
                    nanos,
                    success: true,
                    error: None,
                }),
                Err(cause) => {
                    self.broadcaster.publish(EngineEvent::AiFailure {
                        container_id: self.id,
                        tick,
                        ai: name.clone(),
                        error: cause.to_string(),
                    });
                    record.ais.push(SystemTiming {
                        system: name.clone(),
                        nanos,
                        success: false,
                        error: Some(cause.to_string()),
                    });

                    let lenient = !self.config.auto_halt
                        || (is_plugin_programming_error(&cause) && !self.config.strict_plugins);
                    if lenient {
                        warn!(container_id = self.id, ai = %name, error = %cause, "ai failed; continuing");
                        continue;
                    }
                    return Err(EngineError::AiFailure { ai: name, cause: Box::new(cause) });
                }
            }
        }

        // AI-produced commands target the same bounded queue and share the
        // per-tick budget; they drain at tick N+1 at the earliest.
        for command in produced {
            if !self.matches.contains(command.match_id) {
                record.skipped_commands += 1;
                continue;
            }
            let name = command.name.clone();
            let outcome = self
                .commands
                .validate(&command)
                .and_then(|_| self.queue.enqueue(command));
            if let Err(err) = outcome {
                self.broadcaster.publish(EngineEvent::CommandFailed {
                    container_id: self.id,
                    tick,
                    command: name,
                    error: err.to_string(),
                });
            }
        }
        Ok(())
    }

    fn update_snapshots(&mut self, tick: u64) {
        let changes = self.store.change_log();

        let mut by_match = AHashMap::new();
        for match_id in self.snapshots.cached_matches() {
            if let Ok(mtch) = self.matches.get(match_id) {
                by_match.insert(match_id, projections_for_match(&self.modules, mtch));
            }
        }
        self.snapshots.apply_changes(&self.store, &by_match, &changes, tick);
    }

    fn finalize_tick(&mut self, tick: u64, started: Instant, mut record: TickRecord) {
        self.tick_counter = tick;

        let now = Instant::now();
        self.sessions.sweep_expired(now);

        // Per-tick history for matches that opted in
        let recording: Vec<u64> = self.history_enabled.iter().copied().collect();
        for match_id in recording {
            let Ok(mtch) = self.matches.get(match_id) else { continue };
            let projections = projections_for_match(&self.modules, mtch);
            let snapshot =
                self.snapshots
                    .get_for_match(&self.store, match_id, &projections, tick);
            if let Err(err) = self.check_memory_budget(snapshot.field_slot_count() * 16) {
                warn!(container_id = self.id, match_id, error = %err, "history recording skipped");
                continue;
            }
            self.history.record(snapshot);
        }
        self.history.evict_older_than(tick);

        // Tick listeners (persistence, external fan-out) see every cached
        // match at this tick.
        let mut snapshots: Vec<Snapshot> = Vec::new();
        for match_id in self.snapshots.cached_matches() {
            if let Some(snapshot) = self.snapshots.cached_snapshot(match_id) {
                snapshots.push(snapshot.clone());
            }
        }
        let completed = TickCompleted { container_id: self.id, tick, snapshots: &snapshots };
        for listener in &mut self.listeners {
            listener.on_tick_completed(&completed);
        }

        // Interval-gated snapshot streams
        {
            let snapshots_engine = &mut self.snapshots;
            let store = &self.store;
            let matches = &self.matches;
            let modules = &self.modules;
            let sessions = &self.sessions;
            self.subscriptions.broadcast(now, |match_id, player| {
                let mtch = matches.get(match_id).ok()?;
                let projections = projections_for_match(modules, mtch);
                match player {
                    None => {
                        Some(snapshots_engine.get_for_match(store, match_id, &projections, tick))
                    }
                    Some(player_id) => Some(snapshots_engine.get_for_match_and_player(
                        store,
                        match_id,
                        player_id,
                        &projections,
                        tick,
                        sessions.is_active(player_id, match_id),
                    )),
                }
            });
        }

        record.total = started.elapsed();
        let budget_ms = self.config.tick_budget_ms;
        let elapsed_ms = record.total.as_millis() as u64;
        if budget_ms > 0 && elapsed_ms > budget_ms {
            // Soft budget: warn, never interrupt
            self.metrics.record_budget_warning();
            self.broadcaster.publish(EngineEvent::BudgetWarning {
                container_id: self.id,
                tick,
                elapsed_ms,
                budget_ms,
            });
        }

        debug!(
            container_id = self.id,
            tick,
            commands = record.commands.len(),
            systems = record.systems.len(),
            elapsed_us = record.total.as_micros() as u64,
            "tick completed"
        );
        self.metrics.record(record);
    }
}
