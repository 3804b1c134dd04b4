//! Schemas and particle-facing entities.
//!
//! A schema names an entity shape: singleton and collection fields over
//! primitive types, optionally refined by predicates at field and entity
//! level. The schema hash is a sha256 over canonical JSON bytes, giving a
//! stable identity for caching and wire references.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::crdt::Referenceable;
use crate::error::{Effect, Transience};
use crate::refine::{EvalType, Expression, RefinementError, TypeEnv};

/// Opaque entity identifier.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferenceId(String);

impl ReferenceId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReferenceId({:?})", self.0)
    }
}

impl fmt::Display for ReferenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Primitive field value.
///
/// Numbers order and compare via `total_cmp`, so values are usable as
/// BTree keys; the NaN corner orders deterministically instead of
/// poisoning comparisons.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SchemaValue {
    Text(String),
    Number(f64),
    Boolean(bool),
}

impl SchemaValue {
    pub fn kind(&self) -> PrimitiveKind {
        match self {
            SchemaValue::Text(_) => PrimitiveKind::Text,
            SchemaValue::Number(_) => PrimitiveKind::Number,
            SchemaValue::Boolean(_) => PrimitiveKind::Boolean,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SchemaValue::Text(_) => 0,
            SchemaValue::Number(_) => 1,
            SchemaValue::Boolean(_) => 2,
        }
    }
}

impl PartialEq for SchemaValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SchemaValue {}

impl PartialOrd for SchemaValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SchemaValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SchemaValue::Text(l), SchemaValue::Text(r)) => l.cmp(r),
            (SchemaValue::Number(l), SchemaValue::Number(r)) => l.total_cmp(r),
            (SchemaValue::Boolean(l), SchemaValue::Boolean(r)) => l.cmp(r),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Referenceable for SchemaValue {
    fn unique_id(&self) -> String {
        match self {
            SchemaValue::Text(t) => format!("t:{t}"),
            SchemaValue::Number(n) => format!("n:{}", n.to_bits()),
            SchemaValue::Boolean(b) => format!("b:{b}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrimitiveKind {
    Text,
    Number,
    Boolean,
}

impl PrimitiveKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PrimitiveKind::Text => "Text",
            PrimitiveKind::Number => "Number",
            PrimitiveKind::Boolean => "Boolean",
        }
    }

    pub fn eval_type(self) -> EvalType {
        match self {
            PrimitiveKind::Text => EvalType::Text,
            PrimitiveKind::Number => EvalType::Number,
            PrimitiveKind::Boolean => EvalType::Boolean,
        }
    }
}

/// A field's declared type, optionally refined.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldType {
    pub kind: PrimitiveKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Expression>,
}

impl FieldType {
    pub fn plain(kind: PrimitiveKind) -> Self {
        Self {
            kind,
            refinement: None,
        }
    }

    pub fn refined(kind: PrimitiveKind, refinement: Expression) -> Self {
        Self {
            kind,
            refinement: Some(refinement),
        }
    }
}

/// Canonical error enum for schema validation (the ingest path).
#[derive(Debug, Error, Clone, PartialEq)]
#[non_exhaustive]
pub enum SchemaViolation {
    #[error("entity {id} carries unknown field `{field}`")]
    UnknownField { id: ReferenceId, field: String },
    #[error("entity {id} field `{field}` expects {expected}, got {found}")]
    FieldTypeMismatch {
        id: ReferenceId,
        field: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("entity {id} fails refinement on field `{field}`")]
    FieldRefinement { id: ReferenceId, field: String },
    #[error("entity {id} fails the entity-level refinement")]
    EntityRefinement { id: ReferenceId },
    #[error("refinement evaluation failed for entity {id}: {source}")]
    Evaluation {
        id: ReferenceId,
        #[source]
        source: RefinementError,
    },
    #[error("schema hash failed: {detail}")]
    Hash { detail: String },
}

impl SchemaViolation {
    pub fn transience(&self) -> Transience {
        Transience::Permanent
    }

    pub fn effect(&self) -> Effect {
        // The ingest point rejects before any partial commit.
        Effect::None
    }
}

/// Particle-facing entity: materialized field values keyed by id.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub id: ReferenceId,
    #[serde(default)]
    pub singletons: BTreeMap<String, SchemaValue>,
    #[serde(default)]
    pub collections: BTreeMap<String, BTreeSet<SchemaValue>>,
}

impl Entity {
    pub fn new(id: ReferenceId) -> Self {
        Self {
            id,
            singletons: BTreeMap::new(),
            collections: BTreeMap::new(),
        }
    }

    pub fn with_singleton(mut self, field: impl Into<String>, value: SchemaValue) -> Self {
        self.singletons.insert(field.into(), value);
        self
    }

    pub fn with_collection_item(mut self, field: impl Into<String>, value: SchemaValue) -> Self {
        self.collections.entry(field.into()).or_default().insert(value);
        self
    }
}

impl Referenceable for Entity {
    fn unique_id(&self) -> String {
        self.id.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub names: Vec<String>,
    pub singletons: BTreeMap<String, FieldType>,
    pub collections: BTreeMap<String, FieldType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refinement: Option<Expression>,
    hash: String,
}

impl Schema {
    pub fn new(
        names: Vec<String>,
        singletons: BTreeMap<String, FieldType>,
        collections: BTreeMap<String, FieldType>,
        refinement: Option<Expression>,
    ) -> Result<Self, SchemaViolation> {
        let mut schema = Self {
            names,
            singletons,
            collections,
            refinement,
            hash: String::new(),
        };
        schema.hash = schema.compute_hash()?;
        Ok(schema)
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    fn compute_hash(&self) -> Result<String, SchemaViolation> {
        #[derive(Serialize)]
        struct Canonical<'a> {
            names: &'a [String],
            singletons: &'a BTreeMap<String, FieldType>,
            collections: &'a BTreeMap<String, FieldType>,
            refinement: &'a Option<Expression>,
        }
        let bytes = serde_json::to_vec(&Canonical {
            names: &self.names,
            singletons: &self.singletons,
            collections: &self.collections,
            refinement: &self.refinement,
        })
        .map_err(|err| SchemaViolation::Hash {
            detail: err.to_string(),
        })?;
        let digest = Sha256::digest(&bytes);
        Ok(format!("{digest:x}"))
    }

    /// Type environment for refinement construction.
    pub fn type_env(&self) -> TypeEnv {
        self.singletons
            .iter()
            .chain(self.collections.iter())
            .map(|(name, field)| (name.clone(), field.kind.eval_type()))
            .collect()
    }

    pub fn field(&self, name: &str) -> Option<&FieldType> {
        self.singletons.get(name).or_else(|| self.collections.get(name))
    }

    /// Validate an entity on the ingest path. No partial commit: callers
    /// only store the entity when this returns Ok.
    pub fn validate_entity(&self, entity: &Entity) -> Result<(), SchemaViolation> {
        for (field, value) in &entity.singletons {
            let declared = self.singletons.get(field).ok_or_else(|| {
                SchemaViolation::UnknownField {
                    id: entity.id.clone(),
                    field: field.clone(),
                }
            })?;
            self.check_value(entity, field, declared, value)?;
        }
        for (field, values) in &entity.collections {
            let declared = self.collections.get(field).ok_or_else(|| {
                SchemaViolation::UnknownField {
                    id: entity.id.clone(),
                    field: field.clone(),
                }
            })?;
            for value in values {
                self.check_value(entity, field, declared, value)?;
            }
        }

        if let Some(refinement) = &self.refinement {
            let passed = refinement
                .validate_data(&entity.singletons)
                .map_err(|source| SchemaViolation::Evaluation {
                    id: entity.id.clone(),
                    source,
                })?;
            if !passed {
                return Err(SchemaViolation::EntityRefinement {
                    id: entity.id.clone(),
                });
            }
        }
        Ok(())
    }

    fn check_value(
        &self,
        entity: &Entity,
        field: &str,
        declared: &FieldType,
        value: &SchemaValue,
    ) -> Result<(), SchemaViolation> {
        if value.kind() != declared.kind {
            return Err(SchemaViolation::FieldTypeMismatch {
                id: entity.id.clone(),
                field: field.to_string(),
                expected: declared.kind.as_str(),
                found: value.kind().as_str(),
            });
        }
        if let Some(refinement) = &declared.refinement {
            let record = BTreeMap::from([(field.to_string(), value.clone())]);
            let passed = refinement.validate_data(&record).map_err(|source| {
                SchemaViolation::Evaluation {
                    id: entity.id.clone(),
                    source,
                }
            })?;
            if !passed {
                return Err(SchemaViolation::FieldRefinement {
                    id: entity.id.clone(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}
