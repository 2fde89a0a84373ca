//! Frozen argument bags and free-form metadata attached to a job run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Metadata key naming the entity that owns a run (organisation, consumer).
pub const OWNER_KEY: &str = "owner";
/// Metadata key holding the per-job minimum log level.
pub const LOG_LEVEL_KEY: &str = "log_level";

/// Free-form string metadata. Used for owner lookups and job logging.
pub type JobMetadata = BTreeMap<String, String>;

/// A single typed argument value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// Opaque structured payload.
    Json(Value),
}

impl ArgValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            ArgValue::Null => "null",
            ArgValue::Bool(_) => "bool",
            ArgValue::Int(_) => "int",
            ArgValue::Float(_) => "float",
            ArgValue::Str(_) => "string",
            ArgValue::Json(_) => "json",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            ArgValue::Null => Value::Null,
            ArgValue::Bool(b) => Value::Bool(*b),
            ArgValue::Int(i) => Value::from(*i),
            ArgValue::Float(f) => Value::from(*f),
            ArgValue::Str(s) => Value::String(s.clone()),
            ArgValue::Json(v) => v.clone(),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(value: &str) -> Self {
        ArgValue::Str(value.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(value: String) -> Self {
        ArgValue::Str(value)
    }
}

impl From<bool> for ArgValue {
    fn from(value: bool) -> Self {
        ArgValue::Bool(value)
    }
}

impl From<i64> for ArgValue {
    fn from(value: i64) -> Self {
        ArgValue::Int(value)
    }
}

impl From<i32> for ArgValue {
    fn from(value: i32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<u32> for ArgValue {
    fn from(value: u32) -> Self {
        ArgValue::Int(i64::from(value))
    }
}

impl From<f64> for ArgValue {
    fn from(value: f64) -> Self {
        ArgValue::Float(value)
    }
}

impl From<Value> for ArgValue {
    fn from(value: Value) -> Self {
        ArgValue::Json(value)
    }
}

impl<T: Into<ArgValue>> From<Option<T>> for ArgValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ArgValue::Null, Into::into)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ArgumentError {
    #[error("missing required argument `{0}`")]
    Missing(String),

    #[error("argument `{key}` has type {found}, expected {expected}")]
    WrongType {
        key: String,
        expected: &'static str,
        found: &'static str,
    },

    #[error("argument `{key}` could not be decoded: {message}")]
    Decode { key: String, message: String },
}

/// Immutable argument bag. Cloning shares the underlying map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "BTreeMap<String, ArgValue>", into = "BTreeMap<String, ArgValue>")]
pub struct JobArguments(Arc<BTreeMap<String, ArgValue>>);

impl From<BTreeMap<String, ArgValue>> for JobArguments {
    fn from(map: BTreeMap<String, ArgValue>) -> Self {
        Self(Arc::new(map))
    }
}

impl From<JobArguments> for BTreeMap<String, ArgValue> {
    fn from(args: JobArguments) -> Self {
        Arc::unwrap_or_clone(args.0)
    }
}

impl JobArguments {
    pub fn get(&self, key: &str) -> Option<&ArgValue> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArgValue)> {
        self.0.iter()
    }

    fn required(&self, key: &str) -> Result<&ArgValue, ArgumentError> {
        self.0
            .get(key)
            .ok_or_else(|| ArgumentError::Missing(key.to_string()))
    }

    fn wrong_type(key: &str, expected: &'static str, found: &ArgValue) -> ArgumentError {
        ArgumentError::WrongType {
            key: key.to_string(),
            expected,
            found: found.type_name(),
        }
    }

    pub fn get_str(&self, key: &str) -> Result<&str, ArgumentError> {
        match self.required(key)? {
            ArgValue::Str(s) => Ok(s),
            other => Err(Self::wrong_type(key, "string", other)),
        }
    }

    /// Optional string argument; `Null` and absent both read as `None`.
    pub fn get_opt_str(&self, key: &str) -> Result<Option<&str>, ArgumentError> {
        match self.0.get(key) {
            None | Some(ArgValue::Null) => Ok(None),
            Some(ArgValue::Str(s)) => Ok(Some(s)),
            Some(other) => Err(Self::wrong_type(key, "string", other)),
        }
    }

    pub fn get_i64(&self, key: &str) -> Result<i64, ArgumentError> {
        match self.required(key)? {
            ArgValue::Int(i) => Ok(*i),
            other => Err(Self::wrong_type(key, "int", other)),
        }
    }

    /// Integers widen to float.
    pub fn get_f64(&self, key: &str) -> Result<f64, ArgumentError> {
        match self.required(key)? {
            ArgValue::Float(f) => Ok(*f),
            ArgValue::Int(i) => Ok(*i as f64),
            other => Err(Self::wrong_type(key, "float", other)),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ArgumentError> {
        match self.required(key)? {
            ArgValue::Bool(b) => Ok(*b),
            other => Err(Self::wrong_type(key, "bool", other)),
        }
    }

    pub fn get_json(&self, key: &str) -> Result<&Value, ArgumentError> {
        match self.required(key)? {
            ArgValue::Json(v) => Ok(v),
            other => Err(Self::wrong_type(key, "json", other)),
        }
    }

    /// Decode any argument into `T` through its JSON form.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<T, ArgumentError> {
        let value = self.required(key)?.to_json();
        serde_json::from_value(value).map_err(|e| ArgumentError::Decode {
            key: key.to_string(),
            message: e.to_string(),
        })
    }
}
