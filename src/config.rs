//! Engine and container configuration
//!
//! Configuration is a flat string key/value map; [`EngineConfig::from_pairs`]
//! parses the known keys and rejects malformed values. [`ContainerConfig`]
//! is the per-container subset plus isolation budgets.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const KEY_MAX_ENTITIES: &str = "ecs.max-entities";
pub const KEY_MAX_COMPONENTS: &str = "ecs.max-components";
pub const KEY_MAX_COMMANDS_PER_TICK: &str = "gameloop.max-commands-per-tick";
pub const KEY_TICK_BUDGET_MS: &str = "gameloop.tick-budget-ms";
pub const KEY_BROADCAST_INTERVAL_MS: &str = "snapshot.broadcast-interval-ms";
pub const KEY_HISTORY_MAX_SNAPSHOTS: &str = "snapshot.history-max-snapshots";
pub const KEY_REBUILD_THRESHOLD_RATIO: &str = "snapshot.rebuild-threshold-ratio";
pub const KEY_RECONNECT_WINDOW_SECONDS: &str = "session.reconnect-window-seconds";
pub const KEY_MODULES_PATH: &str = "storage.modules-path";
pub const KEY_AI_PATH: &str = "storage.ai-path";
pub const KEY_RESOURCES_PATH: &str = "storage.resources-path";
pub const KEY_PERSISTENCE_ENABLED: &str = "snapshot.persistence.enabled";

/// Multiplier applied to `max_commands_per_tick` to size the command queue
pub const COMMAND_QUEUE_DEPTH_FACTOR: usize = 4;

/// Node-wide engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_entities: usize,
    pub max_components: usize,
    pub max_commands_per_tick: usize,
    pub tick_budget_ms: u64,
    pub broadcast_interval_ms: u64,
    pub history_max_snapshots: usize,
    pub rebuild_threshold_ratio: f64,
    pub reconnect_window_seconds: u64,
    pub modules_path: PathBuf,
    pub ai_path: PathBuf,
    pub resources_path: PathBuf,
    pub persistence_enabled: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_entities: 1_000_000,
            max_components: 100,
            max_commands_per_tick: 10_000,
            tick_budget_ms: 100,
            broadcast_interval_ms: 100,
            history_max_snapshots: 256,
            rebuild_threshold_ratio: 0.25,
            reconnect_window_seconds: 300,
            modules_path: PathBuf::from("modules"),
            ai_path: PathBuf::from("ai"),
            resources_path: PathBuf::from("resources"),
            persistence_enabled: false,
        }
    }
}

impl EngineConfig {
    /// Parse a flat key/value map, starting from defaults.
    ///
    /// Unknown keys are ignored (adapters may carry their own namespaces);
    /// known keys with malformed values fail with `ConfigError`.
    pub fn from_pairs(pairs: &BTreeMap<String, String>) -> Result<Self> {
        let mut config = Self::default();

        for (key, value) in pairs {
            match key.as_str() {
                KEY_MAX_ENTITIES => config.max_entities = parse_usize(key, value)?,
                KEY_MAX_COMPONENTS => config.max_components = parse_usize(key, value)?,
                KEY_MAX_COMMANDS_PER_TICK => {
                    config.max_commands_per_tick = parse_usize(key, value)?
                }
                KEY_TICK_BUDGET_MS => config.tick_budget_ms = parse_u64(key, value)?,
                KEY_BROADCAST_INTERVAL_MS => {
                    config.broadcast_interval_ms = parse_u64(key, value)?
                }
                KEY_HISTORY_MAX_SNAPSHOTS => {
                    config.history_max_snapshots = parse_usize(key, value)?
                }
                KEY_REBUILD_THRESHOLD_RATIO => {
                    let ratio = parse_f64(key, value)?;
                    if !(0.0..=1.0).contains(&ratio) {
                        return Err(EngineError::ConfigError(format!(
                            "{key} must be within 0..1, got {ratio}"
                        )));
                    }
                    config.rebuild_threshold_ratio = ratio;
                }
                KEY_RECONNECT_WINDOW_SECONDS => {
                    config.reconnect_window_seconds = parse_u64(key, value)?
                }
                KEY_MODULES_PATH => config.modules_path = PathBuf::from(value),
                KEY_AI_PATH => config.ai_path = PathBuf::from(value),
                KEY_RESOURCES_PATH => config.resources_path = PathBuf::from(value),
                KEY_PERSISTENCE_ENABLED => config.persistence_enabled = parse_bool(key, value)?,
                _ => {}
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.max_entities == 0 {
            return Err(EngineError::ConfigError(format!(
                "{KEY_MAX_ENTITIES} must be positive"
            )));
        }
        if self.max_components == 0 {
            return Err(EngineError::ConfigError(format!(
                "{KEY_MAX_COMPONENTS} must be positive"
            )));
        }
        if self.max_commands_per_tick == 0 {
            return Err(EngineError::ConfigError(format!(
                "{KEY_MAX_COMMANDS_PER_TICK} must be positive"
            )));
        }
        Ok(())
    }
}

/// Per-container configuration and isolation budgets
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    pub name: String,
    pub max_entities: usize,
    pub max_components: usize,
    pub max_commands_per_tick: usize,
    /// Coarse memory budget; clamped against the process budget at creation
    pub max_memory_mb: usize,
    /// Module names to install at start, in installation order
    pub modules: Vec<String>,
    /// AI names to install at start
    pub ais: Vec<String>,
    pub tick_budget_ms: u64,
    pub broadcast_interval_ms: u64,
    pub history_max_snapshots: usize,
    pub rebuild_threshold_ratio: f64,
    pub reconnect_window_seconds: u64,
    /// Player-scoped cached snapshot slots
    pub player_snapshot_cache: usize,
    /// Halt (pause) the container when a system or AI fails mid-tick
    pub auto_halt: bool,
    /// Treat plugin programming errors (stale handles, schema misuse) as fatal
    pub strict_plugins: bool,
    pub auto_restore: bool,
}

impl ContainerConfig {
    /// Container config inheriting engine-wide limits.
    pub fn from_engine(name: impl Into<String>, engine: &EngineConfig) -> Self {
        Self {
            name: name.into(),
            max_entities: engine.max_entities,
            max_components: engine.max_components,
            max_commands_per_tick: engine.max_commands_per_tick,
            max_memory_mb: 256,
            modules: Vec::new(),
            ais: Vec::new(),
            tick_budget_ms: engine.tick_budget_ms,
            broadcast_interval_ms: engine.broadcast_interval_ms,
            history_max_snapshots: engine.history_max_snapshots,
            rebuild_threshold_ratio: engine.rebuild_threshold_ratio,
            reconnect_window_seconds: engine.reconnect_window_seconds,
            player_snapshot_cache: 64,
            auto_halt: true,
            strict_plugins: false,
            auto_restore: engine.persistence_enabled,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(EngineError::ConfigError("container name is empty".to_string()));
        }
        if self.max_entities == 0 || self.max_commands_per_tick == 0 {
            return Err(EngineError::ConfigError(format!(
                "container {}: entity and command budgets must be positive",
                self.name
            )));
        }
        if !(0.0..=1.0).contains(&self.rebuild_threshold_ratio) {
            return Err(EngineError::ConfigError(format!(
                "container {}: rebuild threshold ratio out of range",
                self.name
            )));
        }
        Ok(())
    }

    /// Bounded queue capacity derived from the per-tick drain budget.
    pub fn command_queue_capacity(&self) -> usize {
        self.max_commands_per_tick.saturating_mul(COMMAND_QUEUE_DEPTH_FACTOR)
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self::from_engine("default", &EngineConfig::default())
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| {
        EngineError::ConfigError(format!("{key}: expected integer, got {value:?}"))
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value.parse().map_err(|_| {
        EngineError::ConfigError(format!("{key}: expected integer, got {value:?}"))
    })
}

fn parse_f64(key: &str, value: &str) -> Result<f64> {
    value.parse().map_err(|_| {
        EngineError::ConfigError(format!("{key}: expected number, got {value:?}"))
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(EngineError::ConfigError(format!(
            "{key}: expected boolean, got {value:?}"
        ))),
    }
}
