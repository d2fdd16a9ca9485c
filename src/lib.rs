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

//! Simcell - multi-tenant deterministic game-simulation engine
//!
//! Containers run isolated, single-threaded simulations over an
//! archetype-indexed entity store: plugins contribute components, systems,
//! commands and AIs; the tick loop drains a bounded command queue, runs
//! systems in declared order, and maintains incrementally-updated match
//! snapshots with delta compression and bounded history.

pub mod archetype;
pub mod broadcast;
pub mod command;
pub mod component;
pub mod config;
pub mod container;
pub mod delta;
pub mod entity;
pub mod error;
pub mod history;
pub mod manager;
pub mod matches;
pub mod metrics;
pub mod module;
pub mod query;
pub mod resource;
pub mod session;
pub mod snapshot;
pub mod store;
pub mod tick;

// Re-exports for convenience
pub use command::{Command, CommandDescriptor, CommandInfo, ParamSpec, ParamType, Scalar};
pub use component::{ComponentSchema, ComponentTypeId, FieldDef, FieldType, FieldValue};
pub use config::{ContainerConfig, EngineConfig};
pub use container::{ContainerState, ContainerStats, ExecutionContainer};
pub use delta::{DeltaEntry, DeltaSnapshot};
pub use entity::EntityId;
pub use error::{EngineError, Result};
pub use manager::ContainerManager;
pub use module::{Ai, AiContext, CommandSpec, Module, PluginCatalog, SystemDescriptor, TickContext};
pub use session::SessionState;
pub use snapshot::Snapshot;
pub use store::EntityStore;

/// Install a JSON tracing subscriber writing to a daily-rolled file.
///
/// Keep the returned guard alive for the duration of the run; dropping it
/// flushes the non-blocking writer.
#[cfg(feature = "profiling")]
pub fn init_profiling(
    dir: impl AsRef<std::path::Path>,
) -> tracing_appender::non_blocking::WorkerGuard {
    let appender = tracing_appender::rolling::daily(dir, "simcell.log");
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt().json().with_writer(writer).init();
    guard
}

#[cfg(test)]
mod tests;
