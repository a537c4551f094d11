use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single user parameter value as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParameterValue {
    Bool(bool),
    Int(i64),
    Double(f64),
}

/// Named per-type parameters. Lookups never fall back to a sentinel:
/// a missing name is reported as [`ConfigError::NotConfigured`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Parameters {
    values: BTreeMap<String, ParameterValue>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: ParameterValue) {
        self.values.insert(name.into(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    fn get(&self, name: &str) -> Result<ParameterValue, ConfigError> {
        self.values
            .get(name)
            .copied()
            .ok_or_else(|| ConfigError::NotConfigured(name.to_string()))
    }

    /// Reads a double. Integers are widened, since TOML writes `5` and `5.0` differently.
    pub fn double(&self, name: &str) -> Result<f64, ConfigError> {
        match self.get(name)? {
            ParameterValue::Double(v) => Ok(v),
            ParameterValue::Int(v) => Ok(v as f64),
            ParameterValue::Bool(_) => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "double",
            }),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, ConfigError> {
        match self.get(name)? {
            ParameterValue::Int(v) => Ok(v),
            _ => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "integer",
            }),
        }
    }

    pub fn bool(&self, name: &str) -> Result<bool, ConfigError> {
        match self.get(name)? {
            ParameterValue::Bool(v) => Ok(v),
            _ => Err(ConfigError::WrongType {
                name: name.to_string(),
                expected: "bool",
            }),
        }
    }

    /// Reads a double, using `default` only when the name is absent.
    /// A present value of the wrong type is still an error.
    pub fn double_or(&self, name: &str, default: f64) -> Result<f64, ConfigError> {
        if self.contains(name) {
            self.double(name)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ParameterValue)> {
        self.values.iter()
    }
}
