//! The value model of the rule language.

use std::collections::BTreeMap;

use quarry_common::{ArtifactDescription, EntityName};

use crate::error::{EvalError, Result};

/// The result stage a target exposes to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct TargetResult {
    /// Artifacts produced by the target, by logical path.
    pub artifact_stage: BTreeMap<String, ArtifactDescription>,
    /// The interface stage consumers may stage, by logical path.
    pub runfiles: BTreeMap<String, ArtifactDescription>,
    /// Opaque value exported to consumers.
    pub provides: Value,
}

/// An immutable expression value.
///
/// Values are freely shared between targets and configurations; maps are
/// ordered so hashing and rendering are canonical. Numbers are `f64`,
/// compared and hashed by their bit pattern.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// Reference to another entity.
    Name(EntityName),
    /// A first-class artifact.
    Artifact(ArtifactDescription),
    /// The analysed result of a target.
    Result(Box<TargetResult>),
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Name(a), Value::Name(b)) => a == b,
            (Value::Artifact(a), Value::Artifact(b)) => a == b,
            (Value::Result(a), Value::Result(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            Value::Null => {}
            Value::Bool(b) => b.hash(state),
            Value::Number(n) => n.to_bits().hash(state),
            Value::String(s) => s.hash(state),
            Value::List(items) => items.hash(state),
            Value::Map(map) => map.hash(state),
            Value::Name(name) => name.hash(state),
            Value::Artifact(artifact) => artifact.hash(state),
            Value::Result(result) => result.hash(state),
        }
    }
}

impl Value {
    /// Truthiness: null, false, 0, "", empty list and empty map are false.
    #[must_use]
    pub fn is_true(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(map) => !map.is_empty(),
            Value::Name(_) | Value::Artifact(_) | Value::Result(_) => true,
        }
    }

    /// A short name of the value's type for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Name(_) => "name",
            Value::Artifact(_) => "artifact",
            Value::Result(_) => "result",
        }
    }

    /// Interpret a plain JSON literal as a value.
    #[must_use]
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Render the value as JSON; entities render as name lists, artifacts
    /// and results in their tagged forms.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => {
                // Integral numbers render as integers so literals
                // round-trip through evaluation unchanged.
                #[allow(clippy::cast_possible_truncation)]
                if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::Value::Number((*n as i64).into())
                } else {
                    serde_json::Number::from_f64(*n)
                        .map_or(serde_json::Value::Null, serde_json::Value::Number)
                }
            }
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::List(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::Name(name) => serde_json::json!([name.repository, name.module, name.name]),
            Value::Artifact(artifact) => artifact.to_json(),
            Value::Result(result) => serde_json::json!({
                "artifact_stage": stage_json(&result.artifact_stage),
                "runfiles": stage_json(&result.runfiles),
                "provides": result.provides.to_json(),
            }),
        }
    }

    /// The string inside, or a type error.
    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::String(s) => Ok(s),
            other => Err(EvalError::TypeMismatch {
                expected: "string",
                got: other.type_name().to_string(),
            }),
        }
    }

    /// The list inside, or a type error.
    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(EvalError::TypeMismatch {
                expected: "list",
                got: other.type_name().to_string(),
            }),
        }
    }

    /// The map inside, or a type error.
    pub fn as_map(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Ok(map),
            other => Err(EvalError::TypeMismatch {
                expected: "map",
                got: other.type_name().to_string(),
            }),
        }
    }
}

fn stage_json(stage: &BTreeMap<String, ArtifactDescription>) -> serde_json::Value {
    serde_json::Value::Object(
        stage
            .iter()
            .map(|(path, artifact)| (path.clone(), artifact.to_json()))
            .collect(),
    )
}
