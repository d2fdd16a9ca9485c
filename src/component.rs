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

//! Component schemas and field values
//!
//! Component types are plugin-registered at runtime: a stable string name
//! plus a fixed ordered list of primitive fields. There is no compile-time
//! component type; a component instance is a `Vec<FieldValue>` whose length
//! and types match the schema.

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Primitive field type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    I32,
    I64,
    F32,
    F64,
    Bool,
}

/// A single field value
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    Bool(bool),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::I32(_) => FieldType::I32,
            FieldValue::I64(_) => FieldType::I64,
            FieldValue::F32(_) => FieldType::F32,
            FieldValue::F64(_) => FieldType::F64,
            FieldValue::Bool(_) => FieldType::Bool,
        }
    }

    /// Zero value for a field type (new-column fill)
    pub fn zero(ty: FieldType) -> Self {
        match ty {
            FieldType::I32 => FieldValue::I32(0),
            FieldType::I64 => FieldValue::I64(0),
            FieldType::F32 => FieldValue::F32(0.0),
            FieldType::F64 => FieldValue::F64(0.0),
            FieldType::Bool => FieldValue::Bool(false),
        }
    }

    /// Reversible per-field delta: arithmetic difference for numerics,
    /// XOR for booleans. `self.apply_delta(self.delta_to(other)) == other`.
    pub fn delta_to(&self, other: &FieldValue) -> Option<FieldValue> {
        match (self, other) {
            (FieldValue::I32(a), FieldValue::I32(b)) => Some(FieldValue::I32(b.wrapping_sub(*a))),
            (FieldValue::I64(a), FieldValue::I64(b)) => Some(FieldValue::I64(b.wrapping_sub(*a))),
            (FieldValue::F32(a), FieldValue::F32(b)) => Some(FieldValue::F32(b - a)),
            (FieldValue::F64(a), FieldValue::F64(b)) => Some(FieldValue::F64(b - a)),
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(FieldValue::Bool(a != b)),
            _ => None,
        }
    }

    pub fn apply_delta(&self, delta: &FieldValue) -> Option<FieldValue> {
        match (self, delta) {
            (FieldValue::I32(a), FieldValue::I32(d)) => Some(FieldValue::I32(a.wrapping_add(*d))),
            (FieldValue::I64(a), FieldValue::I64(d)) => Some(FieldValue::I64(a.wrapping_add(*d))),
            (FieldValue::F32(a), FieldValue::F32(d)) => Some(FieldValue::F32(a + d)),
            (FieldValue::F64(a), FieldValue::F64(d)) => Some(FieldValue::F64(a + d)),
            (FieldValue::Bool(a), FieldValue::Bool(d)) => Some(FieldValue::Bool(a ^ d)),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::I32(v) => Some(i64::from(*v)),
            FieldValue::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::F32(v) => Some(f64::from(*v)),
            FieldValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

/// A component instance: field values in schema order
pub type ComponentValue = Vec<FieldValue>;

/// Field declaration within a component schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub ty: FieldType,
    /// Optional display label for GUI adapters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self { name: name.into(), ty, display: None }
    }
}

/// Plugin-declared component schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSchema {
    /// Stable name, unique within a container
    pub name: String,
    pub fields: Vec<FieldDef>,
    /// Tag component used for module inclusion
    pub flag: bool,
}

impl ComponentSchema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldDef>) -> Self {
        Self { name: name.into(), fields, flag: false }
    }

    /// Zero-field tag schema
    pub fn flag(name: impl Into<String>) -> Self {
        Self { name: name.into(), fields: Vec::new(), flag: true }
    }

    pub fn arity(&self) -> usize {
        self.fields.len()
    }

    /// Schema equality that ignores display metadata.
    fn compatible_with(&self, other: &ComponentSchema) -> bool {
        self.name == other.name
            && self.flag == other.flag
            && self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .zip(&other.fields)
                .all(|(a, b)| a.name == b.name && a.ty == b.ty)
    }
}

/// Dense per-container component type id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ComponentTypeId(pub u16);

/// Container-scoped registry of component schemas
#[derive(Debug, Default)]
pub struct ComponentRegistry {
    schemas: Vec<ComponentSchema>,
    by_name: AHashMap<String, ComponentTypeId>,
    capacity: usize,
}

impl ComponentRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            schemas: Vec::new(),
            by_name: AHashMap::new(),
            capacity,
        }
    }

    /// Register a schema. Idempotent on an identical schema; re-registration
    /// with a different shape fails with `SchemaConflict`.
    pub fn register(&mut self, schema: ComponentSchema) -> Result<ComponentTypeId> {
        if let Some(&id) = self.by_name.get(&schema.name) {
            let existing = &self.schemas[id.0 as usize];
            if existing.compatible_with(&schema) {
                return Ok(id);
            }
            return Err(EngineError::SchemaConflict(schema.name));
        }

        if self.schemas.len() >= self.capacity {
            return Err(EngineError::ComponentLimitExceeded { capacity: self.capacity });
        }

        let id = ComponentTypeId(self.schemas.len() as u16);
        self.by_name.insert(schema.name.clone(), id);
        self.schemas.push(schema);
        Ok(id)
    }

    pub fn lookup(&self, name: &str) -> Option<ComponentTypeId> {
        self.by_name.get(name).copied()
    }

    pub fn schema(&self, id: ComponentTypeId) -> Option<&ComponentSchema> {
        self.schemas.get(id.0 as usize)
    }

    pub fn name_of(&self, id: ComponentTypeId) -> Option<&str> {
        self.schema(id).map(|s| s.name.as_str())
    }

    pub fn arity_of(&self, id: ComponentTypeId) -> Option<usize> {
        self.schema(id).map(ComponentSchema::arity)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ComponentTypeId, &ComponentSchema)> {
        self.schemas
            .iter()
            .enumerate()
            .map(|(i, s)| (ComponentTypeId(i as u16), s))
    }

    /// Validate a value tuple against the schema: arity and field types.
    pub fn validate_values(&self, id: ComponentTypeId, values: &[FieldValue]) -> Result<()> {
        let schema = self
            .schema(id)
            .ok_or_else(|| EngineError::UnknownComponentType(format!("#{}", id.0)))?;

        if values.len() != schema.arity() {
            return Err(EngineError::ArityMismatch {
                component: schema.name.clone(),
                expected: schema.arity(),
                got: values.len(),
            });
        }

        for (field, value) in schema.fields.iter().zip(values) {
            if field.ty != value.field_type() {
                return Err(EngineError::ArityMismatch {
                    component: schema.name.clone(),
                    expected: schema.arity(),
                    got: values.len(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos_schema() -> ComponentSchema {
        ComponentSchema::new(
            "Pos",
            vec![FieldDef::new("x", FieldType::I32), FieldDef::new("y", FieldType::I32)],
        )
    }

    #[test]
    fn test_register_idempotent() -> Result<()> {
        let mut registry = ComponentRegistry::new(10);
        let a = registry.register(pos_schema())?;
        let b = registry.register(pos_schema())?;
        assert_eq!(a, b);
        assert_eq!(registry.len(), 1);
        Ok(())
    }

    #[test]
    fn test_schema_conflict() -> Result<()> {
        let mut registry = ComponentRegistry::new(10);
        registry.register(pos_schema())?;

        let conflicting = ComponentSchema::new("Pos", vec![FieldDef::new("x", FieldType::F64)]);
        assert!(matches!(
            registry.register(conflicting),
            Err(EngineError::SchemaConflict(_))
        ));
        Ok(())
    }

    #[test]
    fn test_component_limit() -> Result<()> {
        let mut registry = ComponentRegistry::new(1);
        registry.register(pos_schema())?;
        assert!(matches!(
            registry.register(ComponentSchema::flag("Tag")),
            Err(EngineError::ComponentLimitExceeded { capacity: 1 })
        ));
        Ok(())
    }

    #[test]
    fn test_validate_values() -> Result<()> {
        let mut registry = ComponentRegistry::new(10);
        let id = registry.register(pos_schema())?;

        registry.validate_values(id, &[FieldValue::I32(1), FieldValue::I32(2)])?;
        assert!(registry
            .validate_values(id, &[FieldValue::I32(1)])
            .is_err());
        assert!(registry
            .validate_values(id, &[FieldValue::I32(1), FieldValue::F64(2.0)])
            .is_err());
        Ok(())
    }

    #[test]
    fn test_delta_roundtrip_per_field() {
        let cases = [
            (FieldValue::I32(3), FieldValue::I32(-4)),
            (FieldValue::I64(10), FieldValue::I64(12)),
            (FieldValue::F64(0.5), FieldValue::F64(2.25)),
            (FieldValue::Bool(false), FieldValue::Bool(true)),
        ];
        for (from, to) in cases {
            let delta = from.delta_to(&to).unwrap();
            assert_eq!(from.apply_delta(&delta).unwrap(), to);
        }
    }
}
