//! Environment-variable lookups used by every `from_env` constructor.

use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing environment variable {0}")]
    Missing(String),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: String, value: String },
}

pub fn required(name: &str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ConfigError::Missing(name.to_string())),
    }
}

pub fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

pub fn or_default(name: &str, default: &str) -> String {
    optional(name).unwrap_or_else(|| default.to_string())
}

/// Parse a variable, falling back to `default` when it is unset.
/// A set but unparsable value is an error rather than silently ignored.
pub fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match optional(name) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
            name: name.to_string(),
            value,
        }),
        None => Ok(default),
    }
}

pub fn parse_required<T: FromStr>(name: &str) -> Result<T, ConfigError> {
    let value = required(name)?;
    value.trim().parse().map_err(|_| ConfigError::Invalid {
        name: name.to_string(),
        value,
    })
}

/// `true` only for the literal string "true".
pub fn flag(name: &str) -> bool {
    optional(name).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// Split a comma separated list, dropping empty entries.
pub fn list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
