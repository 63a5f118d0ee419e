use crate::core::{Result, SessionError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Per-deployment session behaviour
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Buffer writes locally and flush them once per request
    pub deferred_write: bool,

    /// Attribute names that are never replicated
    pub transient_attributes: HashSet<String>,
}

impl SessionConfig {
    /// Write-through configuration without transient attributes
    pub fn write_through() -> Self {
        Self::default()
    }

    /// Deferred-write configuration without transient attributes
    pub fn deferred() -> Self {
        Self {
            deferred_write: true,
            ..Self::default()
        }
    }

    /// Mark `name` as process-local
    pub fn transient(mut self, name: &str) -> Self {
        self.transient_attributes.insert(name.to_string());
        self
    }

    pub fn is_transient(&self, name: &str) -> bool {
        self.transient_attributes.contains(name)
    }

    /// Read deployment parameters (`deferred-write`, `transient-attributes`).
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self> {
        let deferred_write = match params.get("deferred-write") {
            Some(raw) => parse_flag("deferred-write", raw)?,
            None => false,
        };
        let transient_attributes = params
            .get("transient-attributes")
            .map(|raw| parse_transient_attributes(raw))
            .unwrap_or_default();
        Ok(Self {
            deferred_write,
            transient_attributes,
        })
    }
}

/// Splits a comma-separated name list, dropping blanks.
pub fn parse_transient_attributes(raw: &str) -> HashSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_flag(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        other => Err(SessionError::Config(format!(
            "'{}' must be a boolean, got '{}'",
            key, other
        ))),
    }
}
