//! Expression values and the transformation chain
//!
//! A node parameter is either a literal constant or a reference into the
//! output of an earlier node (`node_id.field.0.name`), optionally followed by
//! an ordered list of transformations applied left to right.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use super::context::ExecutionContext;
use super::error::ResolutionError;

/// Runtime type of a resolved value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    String,
    Number,
    Boolean,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::String(_) => Self::String,
            Value::Number(_) => Self::Number,
            Value::Bool(_) => Self::Boolean,
            Value::Array(_) => Self::Array,
            Value::Object(_) => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_separator() -> String {
    ",".to_string()
}

/// A single step in a transformation chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transformation {
    ToNumber,
    ToBoolean,
    ToArray,
    ToObject,
    ToJson,
    Count,
    Empty,
    Join {
        #[serde(default = "default_separator")]
        separator: String,
    },
}

impl Transformation {
    pub fn join(separator: impl Into<String>) -> Self {
        Self::Join {
            separator: separator.into(),
        }
    }

    /// Name used in the DSL and in error messages
    pub fn name(&self) -> &'static str {
        match self {
            Self::ToNumber => "toNumber",
            Self::ToBoolean => "toBoolean",
            Self::ToArray => "toArray",
            Self::ToObject => "toObject",
            Self::ToJson => "toJson",
            Self::Count => "count",
            Self::Empty => "empty",
            Self::Join { .. } => "join",
        }
    }

    /// Apply this transformation to a value, consuming it
    pub fn apply(&self, value: Value) -> Result<Value, ResolutionError> {
        let kind = ValueKind::of(&value);
        let incompatible = || ResolutionError::incompatible(self.name(), kind.as_str());

        match (self, value) {
            (Self::ToNumber, Value::String(s)) => parse_number(&s)
                .map(Value::Number)
                .ok_or_else(|| ResolutionError::conversion("toNumber", "string", format!("'{}' is not a number", s))),
            (Self::ToNumber, Value::Bool(b)) => Ok(Value::from(if b { 1 } else { 0 })),
            (Self::ToNumber, value @ (Value::Array(_) | Value::Object(_))) => {
                let coerced = coerce_numbers(value, kind)?;
                Ok(Value::String(coerced.to_string()))
            }

            (Self::ToBoolean, Value::String(s)) => parse_bool(&s)
                .map(Value::Bool)
                .ok_or_else(|| ResolutionError::conversion("toBoolean", "string", format!("'{}' is not a boolean", s))),
            (Self::ToBoolean, Value::Number(n)) => Ok(Value::Bool(n.as_f64().is_some_and(|f| f != 0.0))),

            (Self::ToArray, Value::String(s)) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed @ Value::Array(_)) => Ok(parsed),
                _ => Ok(Value::Array(vec![Value::String(s)])),
            },
            (Self::ToArray, value @ (Value::Number(_) | Value::Bool(_))) => Ok(Value::Array(vec![value])),
            (Self::ToArray, value @ Value::Array(_)) => Ok(value),
            (Self::ToArray, Value::Object(map)) => Ok(Value::Array(map.into_iter().map(|(_, v)| v).collect())),

            (Self::ToObject, Value::String(s)) => match serde_json::from_str::<Value>(&s) {
                Ok(parsed @ Value::Object(_)) => Ok(parsed),
                _ => Err(ResolutionError::conversion(
                    "toObject",
                    "string",
                    "not a JSON object",
                )),
            },

            (Self::ToJson, value @ (Value::Array(_) | Value::Object(_))) => Ok(Value::String(value.to_string())),

            (Self::Count, Value::Array(items)) => Ok(Value::from(items.len())),

            (Self::Empty, Value::Array(items)) => Ok(Value::Bool(items.is_empty())),
            (Self::Empty, Value::Object(map)) => Ok(Value::Bool(map.is_empty())),

            (Self::Join { separator }, Value::Array(items)) => Ok(Value::String(
                items
                    .iter()
                    .map(stringify)
                    .collect::<Vec<_>>()
                    .join(separator),
            )),

            _ => Err(incompatible()),
        }
    }
}

/// Parse a decimal string, preferring an integer representation
fn parse_number(s: &str) -> Option<Number> {
    let trimmed = s.trim();
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(Number::from(i));
    }
    trimmed.parse::<f64>().ok().and_then(Number::from_f64)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn coerce_number(value: Value, container: ValueKind) -> Result<Value, ResolutionError> {
    match value {
        Value::Number(n) => Ok(Value::Number(n)),
        Value::Bool(b) => Ok(Value::from(if b { 1 } else { 0 })),
        Value::String(s) => parse_number(&s).map(Value::Number).ok_or_else(|| {
            ResolutionError::conversion(
                "toNumber",
                container.as_str(),
                format!("element '{}' is not a number", s),
            )
        }),
        other => Err(ResolutionError::conversion(
            "toNumber",
            container.as_str(),
            format!("element of type {} is not a number", ValueKind::of(&other)),
        )),
    }
}

fn coerce_numbers(value: Value, kind: ValueKind) -> Result<Value, ResolutionError> {
    match value {
        Value::Array(items) => items
            .into_iter()
            .map(|v| coerce_number(v, kind))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| coerce_number(v, kind).map(|n| (k, n)))
            .collect::<Result<Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other),
    }
}

/// Render a value as text: strings raw, everything else as JSON
pub fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A node parameter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExpressionValue {
    /// Literal payload, independent of the context
    Const { value: Value },

    /// Reference into an earlier node's output
    Expression {
        path: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        transforms: Vec<Transformation>,
    },
}

impl ExpressionValue {
    pub fn constant(value: impl Into<Value>) -> Self {
        Self::Const {
            value: value.into(),
        }
    }

    pub fn reference(path: impl Into<String>) -> Self {
        Self::Expression {
            path: path.into(),
            transforms: Vec::new(),
        }
    }

    /// Append a transformation; no-op on constants
    pub fn with_transform(mut self, transform: Transformation) -> Self {
        if let Self::Expression { transforms, .. } = &mut self {
            transforms.push(transform);
        }
        self
    }

    /// Node id this value depends on, if any
    pub fn referenced_node(&self) -> Option<&str> {
        match self {
            Self::Const { .. } => None,
            Self::Expression { path, .. } => path.split('.').next(),
        }
    }

    /// Materialize the value against the context
    ///
    /// Pure: the context is never modified, so callers may resolve the same
    /// value any number of times.
    pub fn resolve(&self, ctx: &ExecutionContext) -> Result<Value, ResolutionError> {
        match self {
            Self::Const { value } => Ok(value.clone()),
            Self::Expression { path, transforms } => {
                let base = ctx.lookup(path)?.clone();
                transforms
                    .iter()
                    .try_fold(base, |value, transform| transform.apply(value))
            }
        }
    }
}
