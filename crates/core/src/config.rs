//! Run-wide configuration lookup
//!
//! The engine consumes configuration as a read-only, string-keyed lookup. Loading
//! it from files is the host's business; this module only offers the lookup itself,
//! a few constructors (pairs, `TRELLIS_*` environment variables, serde) and typed
//! helpers for the well-known engine keys.

use crate::errors::ConfigError;
use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, warn};

/// Environment variable prefix mapped into configuration keys
pub const ENV_PREFIX: &str = "TRELLIS_";

/// Well-known configuration keys
pub mod keys {
    pub const PREFIX: &str = "trellis";
    pub const ENGINE_CLASS_PARALLELISM: &str = "trellis.engine.class.parallelism";
    pub const ENGINE_ARGUMENT_PARALLELISM: &str = "trellis.engine.argument.parallelism";
    pub const ENGINE_INTERCEPTORS_INCLUDE_REGEX: &str =
        "trellis.engine.interceptors.include.regex";
    pub const ENGINE_INTERCEPTORS_EXCLUDE_REGEX: &str =
        "trellis.engine.interceptors.exclude.regex";
    pub const CLASS_INTERCEPTORS_INCLUDE_REGEX: &str =
        "trellis.engine.class.interceptors.include.regex";
    pub const CLASS_INTERCEPTORS_EXCLUDE_REGEX: &str =
        "trellis.engine.class.interceptors.exclude.regex";
}

/// Read-only key/value configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Configuration {
    entries: IndexMap<String, String>,
}

impl Configuration {
    /// Create an empty configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a configuration from key/value pairs
    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<String>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Create a configuration from `TRELLIS_*` environment variables
    ///
    /// `TRELLIS_ENGINE_CLASS_PARALLELISM=4` becomes
    /// `trellis.engine.class.parallelism = "4"`.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Create a configuration from an arbitrary set of environment-style variables
    pub fn from_vars<I>(vars: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut entries = IndexMap::new();
        for (name, value) in vars {
            if let Some(key) = env_var_to_key(&name) {
                debug!("configuration {} from environment variable {}", key, name);
                entries.insert(key, value);
            }
        }
        Self { entries }
    }

    /// Builder-style setter
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Look up a raw value; absent keys yield `None`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Look up and parse a value, warning and yielding `None` if it does not parse
    pub fn get_parsed<T: FromStr>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match raw.trim().parse::<T>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Invalid value '{}' for {}, ignoring", raw, key);
                None
            }
        }
    }

    /// Whether the key is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// All keys in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the configuration is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of classes executed concurrently (default 1)
    ///
    /// Accepts a positive integer or `auto` (logical CPU count).
    pub fn class_parallelism(&self) -> usize {
        match self.get(keys::ENGINE_CLASS_PARALLELISM).map(str::trim) {
            None => 1,
            Some("auto") => num_cpus::get().max(1),
            Some(_) => clamp_parallelism(
                keys::ENGINE_CLASS_PARALLELISM,
                self.get_parsed::<i64>(keys::ENGINE_CLASS_PARALLELISM)
                    .unwrap_or(1),
            ),
        }
    }

    /// Argument parallelism for classes that do not declare their own
    pub fn default_argument_parallelism(&self) -> Option<i64> {
        self.get_parsed::<i64>(keys::ENGINE_ARGUMENT_PARALLELISM)
    }

    /// Compile the regex stored under `key`, if present
    pub fn regex(&self, key: &str) -> Result<Option<Regex>, ConfigError> {
        match self.get(key) {
            None => Ok(None),
            Some(pattern) => Regex::new(pattern)
                .map(Some)
                .map_err(|source| ConfigError::InvalidRegex {
                    key: key.to_string(),
                    source,
                }),
        }
    }
}

/// Clamp a declared parallelism to at least 1, warning when it was lower
pub fn clamp_parallelism(what: &str, value: i64) -> usize {
    if value < 1 {
        warn!(
            "{} parallelism [{}] less than [1], defaulting to [1]",
            what, value
        );
        1
    } else {
        usize::try_from(value).unwrap_or(usize::MAX)
    }
}

fn env_var_to_key(name: &str) -> Option<String> {
    let rest = name.strip_prefix(ENV_PREFIX)?;
    if rest.is_empty() || rest == "LOG" || rest.starts_with("LOG_") {
        // Logging variables are consumed by the logging module
        return None;
    }
    Some(format!(
        "{}.{}",
        keys::PREFIX,
        rest.to_ascii_lowercase().replace('_', ".")
    ))
}
