//! Process-wide configuration, read once at caller-controlled startup.
//!
//! There is no global configuration singleton inside the core — callers
//! build a [`Config`] (directly or via [`Config::from_env`]) and pass it
//! into the components that need it. Environment overrides take
//! precedence over defaults.

use std::env;
use std::path::PathBuf;

use crate::fhe::DEFAULT_RANGE_WIDTH;

/// Shared configuration for the crypto core and the persistence layer.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory holding BFV and symmetric key material.
    pub keys_dir: PathBuf,
    /// Capacity of the record-by-id cache.
    pub record_cache_size: usize,
    /// Capacity of the equality-query-result cache.
    pub equality_cache_size: usize,
    /// Capacity of the range-query-result cache.
    pub range_cache_size: usize,
    /// zstd compression level used for ciphertext and key-file compression.
    pub compression_level: i32,
    /// Database query timeout, in milliseconds.
    pub query_timeout_ms: u64,
    /// Range-comparator bit width `W`.
    pub range_width: usize,
    /// PBKDF2-HMAC-SHA256 iteration count for key wrapping.
    pub pbkdf2_iterations: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            keys_dir: PathBuf::from("keys"),
            record_cache_size: 2000,
            equality_cache_size: 2000,
            range_cache_size: 2000,
            compression_level: 9,
            query_timeout_ms: 30_000,
            range_width: DEFAULT_RANGE_WIDTH,
            pbkdf2_iterations: 1_000_000,
        }
    }
}

impl Config {
    /// Build a [`Config`] from defaults, overridden by any `FHEDB_*`
    /// environment variables that are set and well-formed. A malformed
    /// override (non-numeric where a number is expected) is ignored and the
    /// default is kept — this function never fails.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = env::var("FHEDB_KEYS_DIR") {
            config.keys_dir = PathBuf::from(dir);
        }
        if let Some(v) = parse_env("FHEDB_CACHE_SIZE") {
            config.record_cache_size = v;
            config.equality_cache_size = v;
            config.range_cache_size = v;
        }
        if let Some(v) = parse_env("FHEDB_RECORD_CACHE_SIZE") {
            config.record_cache_size = v;
        }
        if let Some(v) = parse_env("FHEDB_EQUALITY_CACHE_SIZE") {
            config.equality_cache_size = v;
        }
        if let Some(v) = parse_env("FHEDB_RANGE_CACHE_SIZE") {
            config.range_cache_size = v;
        }
        if let Some(v) = parse_env("FHEDB_COMPRESSION_LEVEL") {
            config.compression_level = v;
        }
        if let Some(v) = parse_env("FHEDB_QUERY_TIMEOUT_MS") {
            config.query_timeout_ms = v;
        }
        if let Some(v) = parse_env("FHEDB_RANGE_WIDTH") {
            config.range_width = v;
        }
        if let Some(v) = parse_env("FHEDB_PBKDF2_ITERATIONS") {
            config.pbkdf2_iterations = v;
        }

        config
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_design_parameters() {
        let config = Config::default();
        assert_eq!(config.range_width, 32);
        assert_eq!(config.compression_level, 9);
        assert_eq!(config.query_timeout_ms, 30_000);
        assert!(config.pbkdf2_iterations >= 100_000);
    }

    #[test]
    fn from_env_falls_back_to_defaults_when_unset() {
        env::remove_var("FHEDB_RANGE_WIDTH");
        env::remove_var("FHEDB_COMPRESSION_LEVEL");
        let config = Config::from_env();
        assert_eq!(config.range_width, 32);
        assert_eq!(config.compression_level, 9);
    }

    #[test]
    fn from_env_applies_overrides() {
        // SAFETY-irrelevant: std::env::set_var in a single-threaded test.
        env::set_var("FHEDB_RANGE_WIDTH", "16");
        env::set_var("FHEDB_COMPRESSION_LEVEL", "3");
        let config = Config::from_env();
        assert_eq!(config.range_width, 16);
        assert_eq!(config.compression_level, 3);
        env::remove_var("FHEDB_RANGE_WIDTH");
        env::remove_var("FHEDB_COMPRESSION_LEVEL");
    }

    #[test]
    fn from_env_ignores_malformed_override() {
        env::set_var("FHEDB_RANGE_WIDTH", "not-a-number");
        let config = Config::from_env();
        assert_eq!(config.range_width, 32);
        env::remove_var("FHEDB_RANGE_WIDTH");
    }
}
