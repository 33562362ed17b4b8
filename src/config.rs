//! Server configuration.
//!
//! The on-disk format is a flat `key=value` text file, one directive per
//! line; `#` starts a comment, blank lines are ignored. This is a direct
//! translation of the recognized keys, not a general-purpose config
//! language — there is no nesting, no includes, no types beyond the handful
//! each key needs.

use std::fs;
use std::path::Path;

use crate::error::ConfigError;
use crate::storage::eviction::PolicyKind;

/// Fully-resolved server configuration, after defaults are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Size of the fixed worker cohort.
    pub n_workers: usize,
    /// Capacity of the thread pool's task queue (`None` = unbounded).
    pub dim_workers_queue: Option<usize>,
    /// Maximum number of files storage may hold at once.
    pub max_file_num: usize,
    /// Maximum aggregate payload bytes storage may hold at once.
    pub max_bytes: usize,
    /// Upper bound on file-table shard count.
    pub max_locks: usize,
    /// Expected concurrent client count, used to size the client registry.
    pub expected_clients: usize,
    /// Path of the listening Unix domain socket.
    pub socket_path: String,
    /// Path of the append-only CSV request log.
    pub log_file_path: String,
    /// Active eviction policy.
    pub eviction_policy: PolicyKind,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            n_workers: 4,
            dim_workers_queue: None,
            max_file_num: 10,
            max_bytes: 1_000_000,
            max_locks: 100,
            expected_clients: 10,
            socket_path: "./storage_socket".to_string(),
            log_file_path: "./log.csv".to_string(),
            eviction_policy: PolicyKind::Fifo,
        }
    }
}

impl Config {
    /// Load a configuration file, falling back to documented defaults for
    /// any key it does not mention. Unrecognized keys are ignored (logged
    /// at `warn`) rather than treated as an error, so a newer client config
    /// still runs against an older server.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_ref.display().to_string(),
            source,
        })?;

        let mut config = Self::default();
        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("ignoring malformed config line: {raw_line:?}");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            config.apply(key, value)?;
        }
        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };
        match key {
            "n_workers" => self.n_workers = value.parse().map_err(|_| invalid())?,
            "dim_workers_queue" => {
                self.dim_workers_queue = Some(value.parse().map_err(|_| invalid())?)
            }
            "max_file_num" => self.max_file_num = value.parse().map_err(|_| invalid())?,
            "max_bytes" => self.max_bytes = value.parse().map_err(|_| invalid())?,
            "max_locks" => self.max_locks = value.parse().map_err(|_| invalid())?,
            "expected_clients" => self.expected_clients = value.parse().map_err(|_| invalid())?,
            "socket_path" => self.socket_path = value.to_string(),
            "log_file_path" => self.log_file_path = value.to_string(),
            "eviction_policy" => self.eviction_policy = value.parse().map_err(|_| invalid())?,
            _ => log::warn!("ignoring unrecognized config key `{key}`"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_spec() {
        let config = Config::default();
        assert_eq!(config.n_workers, 4);
        assert_eq!(config.max_file_num, 10);
        assert_eq!(config.max_bytes, 1_000_000);
        assert_eq!(config.max_locks, 100);
        assert_eq!(config.eviction_policy, PolicyKind::Fifo);
    }

    #[test]
    fn parses_recognized_keys_and_skips_unknown() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "# comment\n\nn_workers=8\nmax_bytes=2048\neviction_policy=LRU\nnonsense=1\n"
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.n_workers, 8);
        assert_eq!(config.max_bytes, 2048);
        assert_eq!(config.eviction_policy, PolicyKind::Lru);
        // defaults preserved for untouched keys
        assert_eq!(config.max_file_num, 10);
    }

    #[test]
    fn rejects_bad_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_bytes=not_a_number").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(Config::from_file("/nonexistent/path/does/not/exist").is_err());
    }
}
