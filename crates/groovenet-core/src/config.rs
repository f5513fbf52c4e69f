//! Model configuration
//!
//! Each model instance is configured from a string-keyed parameter
//! dictionary. A model declares its parameters (default, description,
//! type) up front; typed getters report the offending key on failure so
//! the loader can surface the error and keep loading other models.
//! Configuration is read only at init/save time, never on the hot path.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Declared type of a parameter, used for validation and UI hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParamType {
    Bool,
    Int,
    Float,
    Text,
    Address,
}

/// Declaration of one parameter: default value, human description, type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamSpec {
    pub default: String,
    pub description: String,
    pub param_type: ParamType,
}

impl ParamSpec {
    pub fn new(default: &str, description: &str, param_type: ParamType) -> Self {
        Self {
            default: default.to_string(),
            description: description.to_string(),
            param_type,
        }
    }
}

/// String-keyed parameter dictionary for one model instance.
///
/// Values are kept as strings (the on-disk form); typed access goes
/// through the `get_*` methods, which fall back to a declared default
/// when the key is absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelParams {
    /// Model instance name, echoed in error messages
    pub model: String,
    values: BTreeMap<String, String>,
    #[serde(skip)]
    specs: BTreeMap<String, ParamSpec>,
}

impl ModelParams {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            values: BTreeMap::new(),
            specs: BTreeMap::new(),
        }
    }

    /// Declare a parameter with its default, description, and type
    pub fn declare(&mut self, key: &str, spec: ParamSpec) {
        self.specs.insert(key.to_string(), spec);
    }

    /// Set a raw value
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(key.to_string(), value.into());
    }

    /// Builder-style set
    pub fn with(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Raw value, falling back to the declared default
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .or_else(|| self.specs.get(key).map(|s| s.default.as_str()))
    }

    /// Raw value, error if neither set nor declared
    pub fn get_required(&self, key: &str) -> Result<&str, ConfigError> {
        self.get(key).ok_or_else(|| ConfigError::MissingParam {
            model: self.model.clone(),
            key: key.to_string(),
        })
    }

    fn invalid(&self, key: &str, reason: impl Into<String>) -> ConfigError {
        ConfigError::InvalidParam {
            model: self.model.clone(),
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn get_f64(&self, key: &str) -> Result<f64, ConfigError> {
        let raw = self.get_required(key)?;
        raw.parse::<f64>()
            .map_err(|e| self.invalid(key, e.to_string()))
    }

    pub fn get_u32(&self, key: &str) -> Result<u32, ConfigError> {
        let raw = self.get_required(key)?;
        raw.parse::<u32>()
            .map_err(|e| self.invalid(key, e.to_string()))
    }

    pub fn get_u64(&self, key: &str) -> Result<u64, ConfigError> {
        let raw = self.get_required(key)?;
        raw.parse::<u64>()
            .map_err(|e| self.invalid(key, e.to_string()))
    }

    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let raw = self.get_required(key)?;
        match raw {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(self.invalid(key, format!("`{}` is not a boolean", other))),
        }
    }

    pub fn get_text(&self, key: &str) -> Result<String, ConfigError> {
        Ok(self.get_required(key)?.to_string())
    }

    /// Parse a dotted-quad address
    pub fn get_address(&self, key: &str) -> Result<crate::net::packet::Address, ConfigError> {
        let raw = self.get_required(key)?;
        let ip: std::net::Ipv4Addr = raw
            .parse()
            .map_err(|_| self.invalid(key, format!("`{}` is not a dotted-quad address", raw)))?;
        Ok(crate::net::packet::Address::from_ipv4(ip))
    }

    /// Declared specs, for save/introspection
    pub fn specs(&self) -> impl Iterator<Item = (&str, &ParamSpec)> {
        self.specs.iter().map(|(k, v)| (k.as_str(), v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_fallback() {
        let mut params = ModelParams::new("car0");
        params.declare(
            "range_m",
            ParamSpec::new("200.0", "radio range threshold", ParamType::Float),
        );
        assert_eq!(params.get_f64("range_m").unwrap(), 200.0);

        params.set("range_m", "350.5");
        assert_eq!(params.get_f64("range_m").unwrap(), 350.5);
    }

    #[test]
    fn test_missing_and_invalid_are_distinguished() {
        let params = ModelParams::new("car0").with("count", "notanumber");
        assert!(matches!(
            params.get_f64("absent"),
            Err(ConfigError::MissingParam { .. })
        ));
        assert!(matches!(
            params.get_u32("count"),
            Err(ConfigError::InvalidParam { .. })
        ));
    }

    #[test]
    fn test_address_param() {
        let params = ModelParams::new("car0").with("addr", "10.0.0.7");
        let addr = params.get_address("addr").unwrap();
        assert_eq!(addr.as_bytes(), &[10, 0, 0, 7]);
    }
}
