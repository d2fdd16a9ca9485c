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

//! Command pipeline: scalar payloads, descriptors, registry, bounded queue
//!
//! Commands are value objects resolved against plugin-declared descriptors.
//! Validation happens synchronously at enqueue; invalid commands never
//! occupy queue space.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};
use crate::store::EntityStore;

/// Scalar command parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Scalar {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    List(Vec<Scalar>),
}

impl Scalar {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Scalar::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Numeric read; integers widen to float.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Scalar::Int(v) => Some(*v as f64),
            Scalar::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Scalar::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Scalar::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Scalar]> {
        match self {
            Scalar::List(v) => Some(v),
            _ => None,
        }
    }
}

/// Declared parameter type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Int,
    Float,
    Bool,
    Str,
    List,
}

impl ParamType {
    /// Parse-compatibility: `Int` values are accepted where `Float` is
    /// declared; everything else matches exactly.
    pub fn accepts(&self, value: &Scalar) -> bool {
        matches!(
            (self, value),
            (ParamType::Int, Scalar::Int(_))
                | (ParamType::Float, Scalar::Float(_))
                | (ParamType::Float, Scalar::Int(_))
                | (ParamType::Bool, Scalar::Bool(_))
                | (ParamType::Str, Scalar::Str(_))
                | (ParamType::List, Scalar::List(_))
        )
    }
}

/// Declared command parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ParamType,
    pub required: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ParamType) -> Self {
        Self { name: name.into(), ty, required: true, description: String::new() }
    }

    pub fn optional(name: impl Into<String>, ty: ParamType) -> Self {
        Self { name: name.into(), ty, required: false, description: String::new() }
    }
}

/// Plugin-declared command shape
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    pub parameters: Vec<ParamSpec>,
}

impl CommandDescriptor {
    pub fn new(name: impl Into<String>, parameters: Vec<ParamSpec>) -> Self {
        Self { name: name.into(), description: String::new(), parameters }
    }
}

/// A queued command instance. Value object, no identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub match_id: u64,
    pub player_id: u64,
    pub params: BTreeMap<String, Scalar>,
}

impl Command {
    pub fn new(name: impl Into<String>, match_id: u64, player_id: u64) -> Self {
        Self {
            name: name.into(),
            match_id,
            player_id,
            params: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, value: Scalar) -> Self {
        self.params.insert(name.into(), value);
        self
    }
}

/// Handler invoked at drain time with `(store, match_id, player_id, params)`
pub type CommandHandler =
    Arc<dyn Fn(&mut EntityStore, u64, u64, &BTreeMap<String, Scalar>) -> Result<()> + Send + Sync>;

/// Registry entry: descriptor plus owning module and handler
#[derive(Clone)]
pub struct RegisteredCommand {
    pub descriptor: CommandDescriptor,
    pub module: String,
    pub handler: CommandHandler,
}

/// Wire-facing command listing (no handler)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandInfo {
    pub name: String,
    pub description: String,
    pub module: String,
    pub parameters: Vec<ParamSpec>,
}

/// Container-scoped command registry, populated at module install.
#[derive(Default)]
pub struct CommandRegistry {
    by_name: AHashMap<String, RegisteredCommand>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module's command; names are unique within a container.
    pub fn register(
        &mut self,
        module: &str,
        descriptor: CommandDescriptor,
        handler: CommandHandler,
    ) -> Result<()> {
        if self.by_name.contains_key(&descriptor.name) {
            return Err(EngineError::CommandNameConflict(descriptor.name));
        }
        let name = descriptor.name.clone();
        self.by_name.insert(
            name,
            RegisteredCommand { descriptor, module: module.to_string(), handler },
        );
        Ok(())
    }

    /// Drop all commands declared by `module` (module uninstall).
    pub fn unregister_module(&mut self, module: &str) {
        self.by_name.retain(|_, cmd| cmd.module != module);
    }

    pub fn get(&self, name: &str) -> Option<&RegisteredCommand> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }

    /// Available commands sorted by name.
    pub fn list(&self) -> Vec<CommandInfo> {
        let mut out: Vec<CommandInfo> = self
            .by_name
            .values()
            .map(|cmd| CommandInfo {
                name: cmd.descriptor.name.clone(),
                description: cmd.descriptor.description.clone(),
                module: cmd.module.clone(),
                parameters: cmd.descriptor.parameters.clone(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Validate a command against its descriptor: the name resolves, required
    /// params are present, and values are parse-compatible with declarations.
    pub fn validate(&self, command: &Command) -> Result<()> {
        let registered = self.by_name.get(&command.name).ok_or_else(|| {
            EngineError::CommandInvalid(format!("unknown command {:?}", command.name))
        })?;

        for spec in &registered.descriptor.parameters {
            match command.params.get(&spec.name) {
                Some(value) => {
                    if !spec.ty.accepts(value) {
                        return Err(EngineError::CommandInvalid(format!(
                            "param {:?} of {:?} expects {:?}",
                            spec.name, command.name, spec.ty
                        )));
                    }
                }
                None if spec.required => {
                    return Err(EngineError::CommandInvalid(format!(
                        "missing required param {:?} of {:?}",
                        spec.name, command.name
                    )));
                }
                None => {}
            }
        }

        for name in command.params.keys() {
            if !registered
                .descriptor
                .parameters
                .iter()
                .any(|spec| &spec.name == name)
            {
                return Err(EngineError::CommandInvalid(format!(
                    "unknown param {:?} of {:?}",
                    name, command.name
                )));
            }
        }

        Ok(())
    }
}

/// Bounded FIFO command queue.
///
/// Capacity is `max_commands_per_tick x COMMAND_QUEUE_DEPTH_FACTOR`; a full
/// queue rejects with `QueueFull` and the caller retries or is rate-limited
/// upstream.
#[derive(Debug)]
pub struct CommandQueue {
    queue: std::collections::VecDeque<Command>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: std::collections::VecDeque::with_capacity(capacity.min(1024)),
            capacity,
        }
    }

    pub fn enqueue(&mut self, command: Command) -> Result<()> {
        if self.queue.len() >= self.capacity {
            return Err(EngineError::QueueFull { capacity: self.capacity });
        }
        self.queue.push_back(command);
        Ok(())
    }

    /// Pop up to `limit` commands in enqueue order.
    pub fn drain_up_to(&mut self, limit: usize) -> Vec<Command> {
        let n = limit.min(self.queue.len());
        self.queue.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}
