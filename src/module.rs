//! Plugin contract: modules, AIs, and the sandbox catalog
//!
//! A module contributes component schemas, systems, and commands; an AI
//! produces commands each tick. Plugins are held as opaque capability sets
//! keyed by name. The catalog stores factory closures; every container
//! install instantiates a fresh plugin object, so two containers running
//! the same plugin share no state.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::debug;

use crate::command::{Command, CommandDescriptor, CommandHandler};
use crate::component::{ComponentSchema, ComponentTypeId};
use crate::error::{EngineError, Result};
use crate::store::EntityStore;

/// Per-tick context handed to systems.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Tick being executed (the counter advances after a successful tick)
    pub tick: u64,
    /// The running module's flag component, when it declares one; systems
    /// include it in their required set to scope the module's view.
    pub flag: Option<ComponentTypeId>,
}

/// A module system: stateless, all state lives in the store.
pub type SystemFn = Arc<dyn Fn(&mut EntityStore, &TickContext) -> Result<()> + Send + Sync>;

/// Named system in declaration order
#[derive(Clone)]
pub struct SystemDescriptor {
    pub name: String,
    pub run: SystemFn,
}

impl SystemDescriptor {
    pub fn new(name: impl Into<String>, run: SystemFn) -> Self {
        Self { name: name.into(), run }
    }
}

/// Command declaration bundled with its handler
#[derive(Clone)]
pub struct CommandSpec {
    pub descriptor: CommandDescriptor,
    pub handler: CommandHandler,
}

/// A game module plugin.
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Component schemas this module registers at install
    fn components(&self) -> Vec<ComponentSchema>;

    /// Tag component scoping this module's entity view; entities lacking it
    /// are excluded from the module's systems.
    fn flag_component(&self) -> Option<ComponentSchema> {
        None
    }

    /// Systems in declaration order
    fn systems(&self) -> Vec<SystemDescriptor>;

    /// Commands this module handles
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
}

/// Read-only tick context handed to AIs.
///
/// AIs see the store, the matches' active sessions, and an enqueue callback;
/// produced commands land in the queue for the next tick's drain.
pub struct AiContext<'a> {
    store: &'a EntityStore,
    tick: u64,
    active_sessions: &'a [(u64, u64)],
    produced: Vec<Command>,
}

impl<'a> AiContext<'a> {
    pub(crate) fn new(store: &'a EntityStore, tick: u64, active_sessions: &'a [(u64, u64)]) -> Self {
        Self { store, tick, active_sessions, produced: Vec::new() }
    }

    pub fn store(&self) -> &EntityStore {
        self.store
    }

    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Players with an active session in `match_id`
    pub fn active_players(&self, match_id: u64) -> impl Iterator<Item = u64> + '_ {
        self.active_sessions
            .iter()
            .filter(move |(_, m)| *m == match_id)
            .map(|(p, _)| *p)
    }

    /// Queue a command for the next tick.
    pub fn enqueue_command(&mut self, command: Command) {
        self.produced.push(command);
    }

    pub(crate) fn into_produced(self) -> Vec<Command> {
        self.produced
    }
}

/// An AI plugin: produces commands each tick.
pub trait Ai: Send + Sync {
    fn name(&self) -> &str;

    fn tick(&mut self, ctx: &mut AiContext<'_>) -> Result<()>;
}

pub type ModuleFactory = Arc<dyn Fn() -> Box<dyn Module> + Send + Sync>;
pub type AiFactory = Arc<dyn Fn() -> Box<dyn Ai> + Send + Sync>;

/// Node-wide catalog of plugin factories.
///
/// The host registers factories once; containers install by name and get a
/// private instance each time. The catalog is the sandbox boundary: nothing
/// instantiated for one container is reachable from another.
#[derive(Default, Clone)]
pub struct PluginCatalog {
    modules: AHashMap<String, ModuleFactory>,
    ais: AHashMap<String, AiFactory>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module(&mut self, name: impl Into<String>, factory: ModuleFactory) {
        let name = name.into();
        debug!(module = %name, "module factory registered");
        self.modules.insert(name, factory);
    }

    pub fn register_ai(&mut self, name: impl Into<String>, factory: AiFactory) {
        let name = name.into();
        debug!(ai = %name, "ai factory registered");
        self.ais.insert(name, factory);
    }

    /// Fresh module instance for one container.
    pub fn instantiate_module(&self, name: &str) -> Result<Box<dyn Module>> {
        let factory = self
            .modules
            .get(name)
            .ok_or_else(|| EngineError::PluginLoadFailure(name.to_string()))?;
        let module = factory();
        if module.name() != name {
            return Err(EngineError::PluginIsolationFailure(format!(
                "factory for {name:?} produced module named {:?}",
                module.name()
            )));
        }
        Ok(module)
    }

    /// Fresh AI instance for one container.
    pub fn instantiate_ai(&self, name: &str) -> Result<Box<dyn Ai>> {
        let factory = self
            .ais
            .get(name)
            .ok_or_else(|| EngineError::PluginLoadFailure(name.to_string()))?;
        let ai = factory();
        if ai.name() != name {
            return Err(EngineError::PluginIsolationFailure(format!(
                "factory for {name:?} produced ai named {:?}",
                ai.name()
            )));
        }
        Ok(ai)
    }

    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn ai_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ais.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has_module(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn has_ai(&self, name: &str) -> bool {
        self.ais.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullModule;

    impl Module for NullModule {
        fn name(&self) -> &str {
            "null"
        }
        fn components(&self) -> Vec<ComponentSchema> {
            Vec::new()
        }
        fn systems(&self) -> Vec<SystemDescriptor> {
            Vec::new()
        }
    }

    #[test]
    fn test_catalog_instantiates_fresh() -> Result<()> {
        let mut catalog = PluginCatalog::new();
        catalog.register_module("null", Arc::new(|| Box::new(NullModule)));

        let a = catalog.instantiate_module("null")?;
        let b = catalog.instantiate_module("null")?;
        assert_eq!(a.name(), b.name());

        assert!(matches!(
            catalog.instantiate_module("missing"),
            Err(EngineError::PluginLoadFailure(_))
        ));
        Ok(())
    }

    #[test]
    fn test_catalog_rejects_name_mismatch() {
        let mut catalog = PluginCatalog::new();
        catalog.register_module("other", Arc::new(|| Box::new(NullModule)));
        assert!(matches!(
            catalog.instantiate_module("other"),
            Err(EngineError::PluginIsolationFailure(_))
        ));
    }

    #[test]
    fn test_ai_context_collects_commands() {
        let store = EntityStore::new(4, 4);
        let sessions = [(1u64, 10u64), (2, 11)];
        let mut ctx = AiContext::new(&store, 3, &sessions);

        assert_eq!(ctx.tick(), 3);
        assert_eq!(ctx.active_players(10).collect::<Vec<_>>(), vec![1]);

        ctx.enqueue_command(Command::new("Spawn", 10, 0));
        assert_eq!(ctx.into_produced().len(), 1);
    }
}
