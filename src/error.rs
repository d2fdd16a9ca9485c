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

//! Error types

use std::fmt;

use crate::container::ContainerState;

/// Engine error type
#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Entity budget exhausted
    CapacityExceeded { attempted: usize, capacity: usize },

    /// Coarse memory reservation would exceed the container budget
    MemoryBudgetExceeded { requested: usize, budget: usize },

    /// Entity handle refers to a destroyed or recycled slot
    StaleHandle,

    /// Component type name is not registered in this container
    UnknownComponentType(String),

    /// Value count does not match the component schema arity
    ArityMismatch { component: String, expected: usize, got: usize },

    /// Component type re-registered with a different schema
    SchemaConflict(String),

    /// Entity does not carry the component
    ComponentMissing { component: String },

    /// Component type budget exhausted
    ComponentLimitExceeded { capacity: usize },

    /// Command queue is at capacity
    QueueFull { capacity: usize },

    /// Command rejected at enqueue validation
    CommandInvalid(String),

    /// Two modules declare the same command name
    CommandNameConflict(String),

    /// No active session for the (player, match) pair
    Unauthorized { player_id: u64, match_id: u64 },

    /// A module system failed during the tick
    SystemFailure { system: String, cause: Box<EngineError> },

    /// An AI failed during the tick
    AiFailure { ai: String, cause: Box<EngineError> },

    /// Lifecycle edge not permitted from the current state
    InvalidLifecycleTransition { from: ContainerState, to: ContainerState },

    /// Entity not found
    EntityNotFound,

    /// Match not found
    MatchNotFound(u64),

    /// Player not found
    PlayerNotFound(u64),

    /// Container not found
    ContainerNotFound(u64),

    /// Resource not found
    ResourceNotFound(u64),

    /// Session not found for the (player, match) pair
    SessionNotFound { player_id: u64, match_id: u64 },

    /// Reconnect attempted after the window elapsed
    ReconnectExpired { player_id: u64, match_id: u64 },

    /// Delta requested for a tick outside the retained history
    SnapshotNotInHistory { match_id: u64, tick: u64 },

    /// Plugin could not be resolved or instantiated
    PluginLoadFailure(String),

    /// Plugin sandbox could not be established
    PluginIsolationFailure(String),

    /// Configuration key rejected
    ConfigError(String),

    /// Plugin-declared handler error with free-form context
    PluginError(String),

    /// IO error (persistence path)
    IoError(String),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::CapacityExceeded { attempted, capacity } => {
                write!(f, "Entity capacity exceeded: attempted {attempted}, max is {capacity}")
            }
            EngineError::MemoryBudgetExceeded { requested, budget } => {
                write!(f, "Memory budget exceeded: {requested} bytes requested, {budget} available")
            }
            EngineError::StaleHandle => write!(f, "Stale entity handle"),
            EngineError::UnknownComponentType(name) => {
                write!(f, "Unknown component type: {name}")
            }
            EngineError::ArityMismatch { component, expected, got } => {
                write!(f, "Arity mismatch for {component}: schema has {expected} fields, got {got}")
            }
            EngineError::SchemaConflict(name) => {
                write!(f, "Component {name} already registered with a different schema")
            }
            EngineError::ComponentMissing { component } => {
                write!(f, "Entity does not have component {component}")
            }
            EngineError::ComponentLimitExceeded { capacity } => {
                write!(f, "Component type limit exceeded (max {capacity})")
            }
            EngineError::QueueFull { capacity } => {
                write!(f, "Command queue full (capacity {capacity})")
            }
            EngineError::CommandInvalid(reason) => write!(f, "Invalid command: {reason}"),
            EngineError::CommandNameConflict(name) => {
                write!(f, "Command name conflict: {name}")
            }
            EngineError::Unauthorized { player_id, match_id } => {
                write!(f, "Player {player_id} has no active session in match {match_id}")
            }
            EngineError::SystemFailure { system, cause } => {
                write!(f, "System {system} failed: {cause}")
            }
            EngineError::AiFailure { ai, cause } => write!(f, "AI {ai} failed: {cause}"),
            EngineError::InvalidLifecycleTransition { from, to } => {
                write!(f, "Invalid lifecycle transition: {from:?} -> {to:?}")
            }
            EngineError::EntityNotFound => write!(f, "Entity not found"),
            EngineError::MatchNotFound(id) => write!(f, "Match not found: {id}"),
            EngineError::PlayerNotFound(id) => write!(f, "Player not found: {id}"),
            EngineError::ContainerNotFound(id) => write!(f, "Container not found: {id}"),
            EngineError::ResourceNotFound(id) => write!(f, "Resource not found: {id}"),
            EngineError::SessionNotFound { player_id, match_id } => {
                write!(f, "No session for player {player_id} in match {match_id}")
            }
            EngineError::ReconnectExpired { player_id, match_id } => {
                write!(f, "Reconnect window expired for player {player_id} in match {match_id}")
            }
            EngineError::SnapshotNotInHistory { match_id, tick } => {
                write!(f, "No snapshot retained for match {match_id} at tick {tick}")
            }
            EngineError::PluginLoadFailure(name) => write!(f, "Plugin load failure: {name}"),
            EngineError::PluginIsolationFailure(msg) => {
                write!(f, "Plugin isolation failure: {msg}")
            }
            EngineError::ConfigError(msg) => write!(f, "Config error: {msg}"),
            EngineError::PluginError(msg) => write!(f, "Plugin error: {msg}"),
            EngineError::IoError(msg) => write!(f, "IO error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::IoError(err.to_string())
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = EngineError::CapacityExceeded { attempted: 3, capacity: 2 };
        assert_eq!(
            err.to_string(),
            "Entity capacity exceeded: attempted 3, max is 2"
        );

        let err = EngineError::ArityMismatch {
            component: "Pos".to_string(),
            expected: 2,
            got: 3,
        };
        assert!(err.to_string().contains("Pos"));
    }

    #[test]
    fn test_system_failure_wraps_cause() {
        let cause = EngineError::EntityNotFound;
        let err = EngineError::SystemFailure {
            system: "Move".to_string(),
            cause: Box::new(cause),
        };
        assert_eq!(err.to_string(), "System Move failed: Entity not found");
    }
}
