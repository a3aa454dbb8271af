// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime configuration.
use serde::{Deserialize, Serialize};

use crate::error::RuntimeError;

const fn default_release_buffer() -> usize {
    10
}

const fn default_lookup_cache() -> usize {
    256
}

/// Store and environment tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Zero-ref roots kept before they become collectable. `0` frees
    /// immediately.
    #[serde(default = "default_release_buffer")]
    pub gc_release_buffer_size: usize,
    /// Age after which a fetched query counts as stale.
    pub query_cache_expiration_ms: Option<u64>,
    /// Entries kept in the lookup cache.
    #[serde(default = "default_lookup_cache")]
    pub lookup_cache_capacity: usize,
    /// Write `null` for selected fields a payload omits.
    pub treat_missing_fields_as_null: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            gc_release_buffer_size: default_release_buffer(),
            query_cache_expiration_ms: None,
            lookup_cache_capacity: default_lookup_cache(),
            treat_missing_fields_as_null: false,
        }
    }
}

impl RuntimeConfig {
    /// Parses a JSON config; absent keys take their defaults.
    pub fn from_json(json: &str) -> Result<Self, RuntimeError> {
        serde_json::from_str(json).map_err(|e| RuntimeError::Config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = RuntimeConfig::from_json(r#"{"gc_release_buffer_size": 0}"#).unwrap();
        assert_eq!(config.gc_release_buffer_size, 0);
        assert_eq!(config.lookup_cache_capacity, 256);
        assert!(RuntimeConfig::from_json("[").is_err());
    }

    #[test]
    fn mistyped_values_are_config_errors() {
        let err = RuntimeConfig::from_json(r#"{"query_cache_expiration_ms": "soon"}"#).unwrap_err();
        assert!(matches!(err, RuntimeError::Config(message) if message.contains("invalid type")));
        let empty = RuntimeConfig::from_json("{}").unwrap();
        assert_eq!(empty, RuntimeConfig::default());
        assert_eq!(empty.gc_release_buffer_size, 10);
    }
}
