//! Execution container: one isolated simulation instance
//!
//! A container exclusively owns its entity store, command queue, snapshot
//! cache, sessions, resources, and plugin instances. The lifecycle state
//! machine gates every operation; illegal edges fail with
//! `InvalidLifecycleTransition`.

use std::time::Duration;

use ahash::AHashSet;
use crossbeam::channel::Receiver;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broadcast::{EngineEvent, ErrorBroadcaster, SnapshotSubscriptions, TickListener};
use crate::command::{Command, CommandInfo, CommandQueue, CommandRegistry};
use crate::component::ComponentTypeId;
use crate::config::ContainerConfig;
use crate::delta::DeltaSnapshot;
use crate::error::{EngineError, Result};
use crate::history::{HistoryInfo, SnapshotHistory};
use crate::matches::{Match, MatchRegistry, PlayerRegistry};
use crate::metrics::{TickMetrics, TickMetricsSummary};
use crate::module::{Ai, Module, PluginCatalog, SystemFn};
use crate::resource::{ResourceBlob, ResourceCatalog, ResourceInfo, ResourceKind};
use crate::session::{SessionInfo, SessionService, SessionState};
use crate::snapshot::{ModuleProjection, Snapshot, SnapshotEngine};
use crate::store::EntityStore;

/// Process-wide coarse memory ceiling containers are clamped against
const PROCESS_MEMORY_BUDGET_MB: usize = 4096;

/// Container lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Running,
    Playing,
    Paused,
    Stopped,
}

pub(crate) struct InstalledSystem {
    pub name: String,
    pub run: SystemFn,
}

pub(crate) struct InstalledModule {
    pub name: String,
    pub flag: Option<ComponentTypeId>,
    pub components: Vec<(ComponentTypeId, String)>,
    pub systems: Vec<InstalledSystem>,
}

pub(crate) struct InstalledAi {
    pub name: String,
    pub ai: Box<dyn Ai>,
}

/// Point-in-time container statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: u64,
    pub name: String,
    pub state: ContainerState,
    pub tick: u64,
    pub entity_count: usize,
    pub entity_capacity: usize,
    pub archetype_count: usize,
    pub match_count: usize,
    pub player_count: usize,
    pub session_count: usize,
    pub resource_count: usize,
    pub queue_depth: usize,
    pub reserved_bytes: usize,
    pub installed_modules: Vec<String>,
    pub installed_ais: Vec<String>,
}

/// One isolated simulation instance.
pub struct ExecutionContainer {
    pub(crate) id: u64,
    pub(crate) config: ContainerConfig,
    pub(crate) state: ContainerState,
    /// State to return to when leaving Paused
    pub(crate) resume_to: ContainerState,
    pub(crate) store: EntityStore,
    pub(crate) queue: CommandQueue,
    pub(crate) commands: CommandRegistry,
    pub(crate) modules: Vec<InstalledModule>,
    pub(crate) ais: Vec<InstalledAi>,
    pub(crate) matches: MatchRegistry,
    pub(crate) players: PlayerRegistry,
    pub(crate) sessions: SessionService,
    pub(crate) resources: ResourceCatalog,
    pub(crate) snapshots: SnapshotEngine,
    pub(crate) history: SnapshotHistory,
    /// Matches recording a history snapshot every tick
    pub(crate) history_enabled: AHashSet<u64>,
    pub(crate) subscriptions: SnapshotSubscriptions,
    pub(crate) broadcaster: ErrorBroadcaster,
    pub(crate) listeners: Vec<Box<dyn TickListener>>,
    pub(crate) metrics: TickMetrics,
    pub(crate) tick_counter: u64,
    memory_budget_bytes: usize,
}

impl ExecutionContainer {
    pub fn new(id: u64, config: ContainerConfig) -> Result<Self> {
        config.validate()?;
        let memory_budget_bytes =
            config.max_memory_mb.min(PROCESS_MEMORY_BUDGET_MB) * 1024 * 1024;

        Ok(Self {
            id,
            state: ContainerState::Created,
            resume_to: ContainerState::Running,
            store: EntityStore::new(config.max_entities, config.max_components),
            queue: CommandQueue::new(config.command_queue_capacity()),
            commands: CommandRegistry::new(),
            modules: Vec::new(),
            ais: Vec::new(),
            matches: MatchRegistry::new(),
            players: PlayerRegistry::new(),
            sessions: SessionService::new(Duration::from_secs(config.reconnect_window_seconds)),
            resources: ResourceCatalog::new(),
            snapshots: SnapshotEngine::new(
                config.rebuild_threshold_ratio,
                config.player_snapshot_cache,
            ),
            history: SnapshotHistory::new(
                config.history_max_snapshots,
                config.history_max_snapshots as u64,
            ),
            history_enabled: AHashSet::new(),
            subscriptions: SnapshotSubscriptions::new(Duration::from_millis(
                config.broadcast_interval_ms,
            )),
            broadcaster: ErrorBroadcaster::new(),
            listeners: Vec::new(),
            metrics: TickMetrics::new(256),
            tick_counter: 0,
            memory_budget_bytes,
            config,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> ContainerState {
        self.state
    }

    pub fn tick_counter(&self) -> u64 {
        self.tick_counter
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    // ========== Lifecycle ==========

    /// Created -> Running: instantiate plugins into this container's private
    /// sandbox and register their schemas and commands.
    pub fn start(&mut self, catalog: &PluginCatalog) -> Result<()> {
        if self.state != ContainerState::Created {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: ContainerState::Running,
            });
        }

        if let Err(err) = self.install_plugins(catalog) {
            // Partial installs are rolled back so a fixed catalog can retry
            self.modules.clear();
            self.ais.clear();
            self.commands = CommandRegistry::new();
            return Err(err);
        }

        self.state = ContainerState::Running;
        self.resume_to = ContainerState::Running;
        info!(
            container_id = self.id,
            modules = self.modules.len(),
            ais = self.ais.len(),
            "container started"
        );
        Ok(())
    }

    fn install_plugins(&mut self, catalog: &PluginCatalog) -> Result<()> {
        for name in self.config.modules.clone() {
            let module = catalog.instantiate_module(&name)?;
            self.install_module_instance(module)?;
        }
        for name in self.config.ais.clone() {
            let ai = catalog.instantiate_ai(&name)?;
            self.ais.push(InstalledAi { name, ai });
        }
        Ok(())
    }

    fn install_module_instance(&mut self, module: Box<dyn Module>) -> Result<()> {
        let name = module.name().to_string();

        let flag = match module.flag_component() {
            Some(schema) => Some(self.store.register_component_type(schema)?),
            None => None,
        };

        let mut components = Vec::new();
        if let Some(flag_id) = flag {
            let flag_name = self
                .store
                .registry()
                .name_of(flag_id)
                .expect("registered flag")
                .to_string();
            components.push((flag_id, flag_name));
        }
        for schema in module.components() {
            let component_name = schema.name.clone();
            let type_id = self.store.register_component_type(schema)?;
            components.push((type_id, component_name));
        }

        for spec in module.commands() {
            self.commands.register(&name, spec.descriptor, spec.handler)?;
        }

        let systems = module
            .systems()
            .into_iter()
            .map(|s| InstalledSystem { name: s.name, run: s.run })
            .collect();

        debug!(container_id = self.id, module = %name, "module installed");
        self.modules.push(InstalledModule { name, flag, components, systems });
        Ok(())
    }

    /// Quiesced plugin reload: fresh instances replace the installed set.
    /// Legal from Running or Paused only (never mid-play).
    pub fn reload_plugins(&mut self, catalog: &PluginCatalog) -> Result<()> {
        if !matches!(self.state, ContainerState::Running | ContainerState::Paused) {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: self.state,
            });
        }

        self.modules.clear();
        self.ais.clear();
        self.commands = CommandRegistry::new();

        self.install_plugins(catalog)?;
        info!(container_id = self.id, "plugins reloaded");
        Ok(())
    }

    /// Uninstall one module and its commands. Legal when quiesced.
    pub fn uninstall_module(&mut self, name: &str) -> Result<()> {
        if !matches!(self.state, ContainerState::Running | ContainerState::Paused) {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: self.state,
            });
        }
        let before = self.modules.len();
        self.modules.retain(|m| m.name != name);
        if self.modules.len() == before {
            return Err(EngineError::PluginLoadFailure(name.to_string()));
        }
        self.commands.unregister_module(name);
        self.config.modules.retain(|m| m != name);
        Ok(())
    }

    pub fn uninstall_ai(&mut self, name: &str) -> Result<()> {
        if !matches!(self.state, ContainerState::Running | ContainerState::Paused) {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: self.state,
            });
        }
        let before = self.ais.len();
        self.ais.retain(|a| a.name != name);
        if self.ais.len() == before {
            return Err(EngineError::PluginLoadFailure(name.to_string()));
        }
        self.config.ais.retain(|a| a != name);
        Ok(())
    }

    /// Running <-> Playing edge, driven by the manager's timer.
    pub(crate) fn set_playing(&mut self) -> Result<()> {
        match self.state {
            ContainerState::Running => {
                self.state = ContainerState::Playing;
                Ok(())
            }
            ContainerState::Playing => Ok(()),
            from => Err(EngineError::InvalidLifecycleTransition {
                from,
                to: ContainerState::Playing,
            }),
        }
    }

    pub(crate) fn stop_auto(&mut self) -> Result<()> {
        match self.state {
            ContainerState::Playing => {
                self.state = ContainerState::Running;
                Ok(())
            }
            ContainerState::Running => Ok(()),
            from => Err(EngineError::InvalidLifecycleTransition {
                from,
                to: ContainerState::Running,
            }),
        }
    }

    /// Suspend auto-advance, preserving state. Single-step `advance()`
    /// remains legal while Paused.
    pub fn pause(&mut self) -> Result<()> {
        match self.state {
            ContainerState::Running | ContainerState::Playing => {
                self.resume_to = self.state;
                self.state = ContainerState::Paused;
                Ok(())
            }
            ContainerState::Paused => Ok(()),
            from => Err(EngineError::InvalidLifecycleTransition {
                from,
                to: ContainerState::Paused,
            }),
        }
    }

    pub fn resume(&mut self) -> Result<()> {
        match self.state {
            ContainerState::Paused => {
                self.state = self.resume_to;
                Ok(())
            }
            from => Err(EngineError::InvalidLifecycleTransition {
                from,
                to: self.resume_to,
            }),
        }
    }

    /// Teardown: release plugin instances, caches, queue, and the store.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == ContainerState::Stopped {
            return Err(EngineError::InvalidLifecycleTransition {
                from: ContainerState::Stopped,
                to: ContainerState::Stopped,
            });
        }

        self.queue.clear();
        self.snapshots.clear();
        self.history.clear();
        self.history_enabled.clear();
        self.subscriptions.clear();
        self.modules.clear();
        self.ais.clear();
        self.commands = CommandRegistry::new();
        self.store = EntityStore::new(self.config.max_entities, self.config.max_components);
        self.listeners.clear();

        self.state = ContainerState::Stopped;
        info!(container_id = self.id, "container stopped");
        Ok(())
    }

    pub(crate) fn started(&self) -> bool {
        matches!(
            self.state,
            ContainerState::Running | ContainerState::Playing | ContainerState::Paused
        )
    }

    /// Tick-fatal failure: suspend and remember where to resume.
    pub(crate) fn halt_on_failure(&mut self, reason: String) {
        if self.started() && self.state != ContainerState::Paused {
            self.resume_to = self.state;
        }
        self.state = ContainerState::Paused;
        warn!(container_id = self.id, %reason, "container paused on failure");
        self.broadcaster.publish(EngineEvent::ContainerPaused {
            container_id: self.id,
            reason,
        });
    }

    // ========== Matches and players ==========

    pub fn create_match(
        &mut self,
        enabled_modules: Vec<String>,
        enabled_ais: Vec<String>,
    ) -> Result<u64> {
        for module in &enabled_modules {
            if !self.modules.iter().any(|m| &m.name == module) {
                return Err(EngineError::PluginLoadFailure(module.clone()));
            }
        }
        for ai in &enabled_ais {
            if !self.ais.iter().any(|a| &a.name == ai) {
                return Err(EngineError::PluginLoadFailure(ai.clone()));
            }
        }
        Ok(self.matches.create(self.id, enabled_modules, enabled_ais))
    }

    pub fn get_match(&self, match_id: u64) -> Result<&Match> {
        self.matches.get(match_id)
    }

    pub fn list_matches(&self) -> Vec<Match> {
        self.matches.list().into_iter().cloned().collect()
    }

    /// Deletion cascades: entities destroyed, sessions abandoned, caches,
    /// history and streams dropped.
    pub fn delete_match(&mut self, match_id: u64) -> Result<()> {
        self.matches.remove(match_id)?;
        let destroyed = self.store.destroy_match_entities(match_id);
        self.sessions.abandon_match(match_id);
        self.snapshots.invalidate_match(match_id);
        self.history.clear_match(match_id);
        self.history_enabled.remove(&match_id);
        self.subscriptions.remove_match(match_id);
        debug!(container_id = self.id, match_id, destroyed, "match deleted");
        Ok(())
    }

    pub fn create_player(&mut self) -> u64 {
        self.players.create()
    }

    pub fn delete_player(&mut self, player_id: u64) -> Result<()> {
        self.players.remove(player_id)?;
        for match_id in self.matches.ids() {
            let _ = self.sessions.abandon(player_id, match_id);
        }
        Ok(())
    }

    pub fn list_players(&self) -> Vec<u64> {
        self.players.list()
    }

    pub fn has_player(&self, player_id: u64) -> bool {
        self.players.contains(player_id)
    }

    // ========== Sessions ==========

    pub fn connect_session(&mut self, player_id: u64, match_id: u64) -> Result<SessionState> {
        if !self.players.contains(player_id) {
            return Err(EngineError::PlayerNotFound(player_id));
        }
        if !self.matches.contains(match_id) {
            return Err(EngineError::MatchNotFound(match_id));
        }
        Ok(self.sessions.connect(player_id, match_id))
    }

    pub fn disconnect_session(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        self.sessions.disconnect(player_id, match_id)
    }

    pub fn reconnect_session(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        self.sessions.reconnect(player_id, match_id)
    }

    pub fn abandon_session(&mut self, player_id: u64, match_id: u64) -> Result<()> {
        self.sessions.abandon(player_id, match_id)
    }

    pub fn can_reconnect(&self, player_id: u64, match_id: u64) -> bool {
        self.sessions.can_reconnect(player_id, match_id)
    }

    pub fn get_session(&self, player_id: u64, match_id: u64) -> Option<SessionInfo> {
        self.sessions.get(player_id, match_id)
    }

    // ========== Commands ==========

    /// Validate and enqueue a command.
    ///
    /// Authority: a non-zero player id must hold an Active session for the
    /// target match. Player id zero is the operator surface and bypasses
    /// gating. Invalid commands are rejected here and never occupy queue
    /// space.
    pub fn enqueue_command(&mut self, command: Command) -> Result<()> {
        if !self.started() {
            return Err(EngineError::InvalidLifecycleTransition {
                from: self.state,
                to: ContainerState::Running,
            });
        }
        if !self.matches.contains(command.match_id) {
            return Err(EngineError::MatchNotFound(command.match_id));
        }
        if command.player_id != 0 && !self.sessions.is_active(command.player_id, command.match_id)
        {
            return Err(EngineError::Unauthorized {
                player_id: command.player_id,
                match_id: command.match_id,
            });
        }
        self.commands.validate(&command)?;
        self.queue.enqueue(command)
    }

    pub fn list_commands(&self) -> Vec<CommandInfo> {
        self.commands.list()
    }

    pub fn queue_depth(&self) -> usize {
        self.queue.len()
    }

    // ========== Snapshots ==========

    pub(crate) fn projections_for(&self, mtch: &Match) -> Vec<ModuleProjection> {
        projections_for_match(&self.modules, mtch)
    }

    /// Current full-match projection; cached after the first request.
    pub fn snapshot_for_match(&mut self, match_id: u64) -> Result<Snapshot> {
        let mtch = self.matches.get(match_id)?.clone();
        let projections = self.projections_for(&mtch);
        Ok(self
            .snapshots
            .get_for_match(&self.store, match_id, &projections, self.tick_counter))
    }

    /// Player-scoped projection; players with an active session get the
    /// bounded cached variant.
    pub fn snapshot_for_player(&mut self, match_id: u64, player_id: u64) -> Result<Snapshot> {
        let mtch = self.matches.get(match_id)?.clone();
        let projections = self.projections_for(&mtch);
        let cached = self.sessions.is_active(player_id, match_id);
        Ok(self.snapshots.get_for_match_and_player(
            &self.store,
            match_id,
            player_id,
            &projections,
            self.tick_counter,
            cached,
        ))
    }

    /// Delta between two retained history ticks.
    pub fn snapshot_delta(&self, match_id: u64, from: u64, to: u64) -> Result<DeltaSnapshot> {
        if !self.matches.contains(match_id) {
            return Err(EngineError::MatchNotFound(match_id));
        }
        self.history.delta(match_id, from, to)
    }

    /// Enable per-tick history for a match and record the current tick.
    pub fn record_history(&mut self, match_id: u64) -> Result<()> {
        let snapshot = self.snapshot_for_match(match_id)?;
        self.check_memory_budget(snapshot.field_slot_count() * 16)?;
        self.history.record(snapshot);
        self.history_enabled.insert(match_id);
        Ok(())
    }

    /// Seed the history ring with a previously persisted snapshot and
    /// re-enable per-tick recording for its match. The tick counter
    /// fast-forwards to the restored tick so new ticks continue past the
    /// persisted ones instead of colliding with them. Snapshots over the
    /// memory budget are skipped.
    pub fn restore_history(&mut self, snapshot: Snapshot) {
        if let Err(err) = self.check_memory_budget(snapshot.field_slot_count() * 16) {
            warn!(
                container_id = self.id,
                match_id = snapshot.match_id,
                error = %err,
                "history restore skipped"
            );
            return;
        }
        self.tick_counter = self.tick_counter.max(snapshot.tick);
        self.history_enabled.insert(snapshot.match_id);
        self.history.record(snapshot);
    }

    pub fn history_info(&self, match_id: u64) -> HistoryInfo {
        self.history.info(match_id)
    }

    /// Retained history snapshot at an exact tick.
    pub fn history_snapshot(&self, match_id: u64, tick: u64) -> Result<Snapshot> {
        self.history
            .get(match_id, tick)
            .cloned()
            .ok_or(EngineError::SnapshotNotInHistory { match_id, tick })
    }

    pub fn clear_history(&mut self, match_id: u64) {
        self.history.clear_match(match_id);
        self.history_enabled.remove(&match_id);
    }

    /// Open a snapshot stream for a match, optionally player-scoped.
    /// Player streams require an Active session.
    pub fn subscribe(&mut self, match_id: u64, player_id: Option<u64>) -> Result<Receiver<Snapshot>> {
        let mtch = self.matches.get(match_id)?.clone();
        if let Some(player) = player_id {
            if !self.sessions.is_active(player, match_id) {
                return Err(EngineError::Unauthorized { player_id: player, match_id });
            }
        }
        let projections = self.projections_for(&mtch);
        self.snapshots
            .ensure_cached(&self.store, match_id, &projections, self.tick_counter);
        Ok(self.subscriptions.subscribe(match_id, player_id))
    }

    /// Immediate out-of-band push to every stream of a match.
    pub fn refresh_subscribers(&mut self, match_id: u64) -> Result<()> {
        let mtch = self.matches.get(match_id)?.clone();
        let projections = self.projections_for(&mtch);
        let tick = self.tick_counter;

        let snapshots = &mut self.snapshots;
        let store = &self.store;
        self.subscriptions.refresh(match_id, |m, player| match player {
            None => Some(snapshots.get_for_match(store, m, &projections, tick)),
            Some(p) => Some(snapshots.get_for_match_and_player(
                store,
                m,
                p,
                &projections,
                tick,
                false,
            )),
        });
        Ok(())
    }

    /// Subscribe to engine error/lifecycle events.
    pub fn subscribe_errors(&mut self) -> Receiver<EngineEvent> {
        self.broadcaster.subscribe()
    }

    pub fn add_tick_listener(&mut self, listener: Box<dyn TickListener>) {
        self.listeners.push(listener);
    }

    // ========== Resources ==========

    pub fn upload_resource(
        &mut self,
        name: impl Into<String>,
        kind: ResourceKind,
        bytes: Vec<u8>,
    ) -> Result<u64> {
        self.check_memory_budget(bytes.len())?;
        Ok(self.resources.upload(name, kind, bytes))
    }

    pub fn get_resource(&self, id: u64) -> Result<&ResourceBlob> {
        self.resources.get(id)
    }

    pub fn delete_resource(&mut self, id: u64) -> Result<()> {
        self.resources.delete(id)
    }

    pub fn list_resources(&self) -> Vec<ResourceInfo> {
        self.resources.list()
    }

    // ========== Stats and metrics ==========

    pub fn stats(&self) -> ContainerStats {
        ContainerStats {
            id: self.id,
            name: self.config.name.clone(),
            state: self.state,
            tick: self.tick_counter,
            entity_count: self.store.entity_count(),
            entity_capacity: self.store.entity_capacity(),
            archetype_count: self.store.archetype_count(),
            match_count: self.matches.len(),
            player_count: self.players.len(),
            session_count: self.sessions.len(),
            resource_count: self.resources.len(),
            queue_depth: self.queue.len(),
            reserved_bytes: self.reserved_bytes(),
            installed_modules: self.modules.iter().map(|m| m.name.clone()).collect(),
            installed_ais: self.ais.iter().map(|a| a.name.clone()).collect(),
        }
    }

    pub fn tick_metrics(&self) -> TickMetricsSummary {
        self.metrics.summary()
    }

    /// Per-system and per-command detail of the last completed tick.
    pub fn last_tick_record(&self) -> Option<&crate::metrics::TickRecord> {
        self.metrics.last_tick()
    }

    pub fn reset_tick_metrics(&mut self) {
        self.metrics.reset();
    }

    pub fn snapshot_metrics(&self) -> crate::metrics::SnapshotMetricsSummary {
        self.snapshots.metrics()
    }

    /// Coarse reservation estimate: store plus retained history plus blobs.
    pub fn reserved_bytes(&self) -> usize {
        self.store.estimated_bytes()
            + self.history.estimated_bytes()
            + self.resources.total_bytes()
    }

    pub(crate) fn check_memory_budget(&self, additional: usize) -> Result<()> {
        let reserved = self.reserved_bytes();
        if reserved + additional > self.memory_budget_bytes {
            return Err(EngineError::MemoryBudgetExceeded {
                requested: additional,
                budget: self.memory_budget_bytes.saturating_sub(reserved),
            });
        }
        Ok(())
    }

    /// Direct store access for operator tooling and tests.
    pub fn store(&self) -> &EntityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut EntityStore {
        &mut self.store
    }
}

pub(crate) fn projections_for_match(
    modules: &[InstalledModule],
    mtch: &Match,
) -> Vec<ModuleProjection> {
    modules
        .iter()
        .filter(|module| mtch.enabled_modules.iter().any(|name| name == &module.name))
        .map(|module| ModuleProjection {
            module: module.name.clone(),
            components: module.components.clone(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn config(name: &str) -> ContainerConfig {
        let mut config = ContainerConfig::from_engine(name, &EngineConfig::default());
        config.max_entities = 64;
        config
    }

    #[test]
    fn test_lifecycle_edges() -> Result<()> {
        let catalog = PluginCatalog::new();
        let mut container = ExecutionContainer::new(1, config("c"))?;
        assert_eq!(container.state(), ContainerState::Created);

        // Pause before start is illegal
        assert!(matches!(
            container.pause(),
            Err(EngineError::InvalidLifecycleTransition { .. })
        ));

        container.start(&catalog)?;
        assert_eq!(container.state(), ContainerState::Running);

        // Double start is illegal
        assert!(container.start(&catalog).is_err());

        container.pause()?;
        assert_eq!(container.state(), ContainerState::Paused);
        container.resume()?;
        assert_eq!(container.state(), ContainerState::Running);

        container.stop()?;
        assert_eq!(container.state(), ContainerState::Stopped);
        assert!(container.stop().is_err());
        Ok(())
    }

    #[test]
    fn test_pause_remembers_playing() -> Result<()> {
        let catalog = PluginCatalog::new();
        let mut container = ExecutionContainer::new(1, config("c"))?;
        container.start(&catalog)?;
        container.set_playing()?;

        container.pause()?;
        container.resume()?;
        assert_eq!(container.state(), ContainerState::Playing);

        container.stop_auto()?;
        assert_eq!(container.state(), ContainerState::Running);
        Ok(())
    }

    #[test]
    fn test_start_unknown_module_fails() -> Result<()> {
        let catalog = PluginCatalog::new();
        let mut cfg = config("c");
        cfg.modules.push("ghost".to_string());
        let mut container = ExecutionContainer::new(1, cfg)?;

        assert!(matches!(
            container.start(&catalog),
            Err(EngineError::PluginLoadFailure(_))
        ));
        assert_eq!(container.state(), ContainerState::Created);
        Ok(())
    }

    #[test]
    fn test_match_cascade_on_delete() -> Result<()> {
        let catalog = PluginCatalog::new();
        let mut container = ExecutionContainer::new(1, config("c"))?;
        container.start(&catalog)?;

        let match_id = container.create_match(Vec::new(), Vec::new())?;
        let player = container.create_player();
        container.connect_session(player, match_id)?;
        container.store_mut().create_entity(match_id, player)?;

        container.delete_match(match_id)?;
        assert_eq!(container.store().entity_count(), 0);
        assert!(!container.sessions.is_active(player, match_id));
        assert!(matches!(
            container.get_match(match_id),
            Err(EngineError::MatchNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_match_requires_installed_modules() -> Result<()> {
        let catalog = PluginCatalog::new();
        let mut container = ExecutionContainer::new(1, config("c"))?;
        container.start(&catalog)?;

        assert!(matches!(
            container.create_match(vec!["ghost".to_string()], Vec::new()),
            Err(EngineError::PluginLoadFailure(_))
        ));
        Ok(())
    }

    #[test]
    fn test_memory_budget_on_resources() -> Result<()> {
        let mut cfg = config("c");
        cfg.max_memory_mb = 1;
        let catalog = PluginCatalog::new();
        let mut container = ExecutionContainer::new(1, cfg)?;
        container.start(&catalog)?;

        // 2 MiB into a 1 MiB budget
        assert!(matches!(
            container.upload_resource("big", ResourceKind::Data, vec![0u8; 2 * 1024 * 1024]),
            Err(EngineError::MemoryBudgetExceeded { .. })
        ));
        Ok(())
    }
}
