//! Factory configuration from environment variables or a TOML file.
//!
//! Invalid environment values fall back to defaults without failing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `MODEL_FACTORY_SNIFF_PREFIX` | 65536 | Bytes read when sniffing content |
//! | `MODEL_FACTORY_MAX_HEADER` | 100000000 | Largest header a loader will parse (bytes) |
//! | `MODEL_FACTORY_MAX_METADATA_ENTRIES` | 1000000 | Largest key/tensor/node count accepted |
//! | `MODEL_FACTORY_MEMORY_LIMIT` | unset | Reject loads estimated above this (bytes) |
//! | `MODEL_FACTORY_USE_MMAP` | true | Memory-map weights on load |
//! | `MODEL_FACTORY_LOG_FORMAT` | json | `json` or `pretty` |
//! | `MODEL_FACTORY_LOG_LEVEL` | info | `EnvFilter` directive |
//! | `MODEL_FACTORY_LOG_FILE` | unset | Log file (stderr when unset) |

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::loaders::{HeaderLimits, LoadConfig};
use crate::telemetry::LogConfig;

const DEFAULT_SNIFF_PREFIX: usize = 64 * 1024;
const MIN_SNIFF_PREFIX: usize = 1024;
const DEFAULT_MAX_HEADER: u64 = 100_000_000;
const MIN_MAX_HEADER: u64 = 1024 * 1024;
const DEFAULT_MAX_ENTRIES: u64 = 1_000_000;
const MIN_MAX_ENTRIES: u64 = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Factory-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FactoryConfig {
    pub sniff_prefix_bytes: usize,
    pub max_header_bytes: u64,
    pub max_metadata_entries: u64,
    pub memory_limit_bytes: Option<u64>,
    pub use_mmap: bool,
    pub log: LogConfig,
}

impl Default for FactoryConfig {
    fn default() -> Self {
        Self {
            sniff_prefix_bytes: DEFAULT_SNIFF_PREFIX,
            max_header_bytes: DEFAULT_MAX_HEADER,
            max_metadata_entries: DEFAULT_MAX_ENTRIES,
            memory_limit_bytes: None,
            use_mmap: true,
            log: LogConfig::default(),
        }
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).map(|v| v.trim().to_ascii_lowercase()) {
        Ok(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => true,
        Ok(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => false,
        _ => default,
    }
}

fn load_log_config() -> LogConfig {
    let defaults = LogConfig::default();
    LogConfig {
        format: std::env::var("MODEL_FACTORY_LOG_FORMAT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.format),
        level: std::env::var("MODEL_FACTORY_LOG_LEVEL").unwrap_or(defaults.level),
        output_path: std::env::var_os("MODEL_FACTORY_LOG_FILE").map(PathBuf::from),
    }
}

impl FactoryConfig {
    /// Load from `MODEL_FACTORY_*` variables.
    pub fn from_env() -> Self {
        let memory_limit_bytes = match parse_u64("MODEL_FACTORY_MEMORY_LIMIT", 0) {
            0 => None,
            limit => Some(limit),
        };
        Self {
            sniff_prefix_bytes: parse_usize("MODEL_FACTORY_SNIFF_PREFIX", DEFAULT_SNIFF_PREFIX),
            max_header_bytes: parse_u64("MODEL_FACTORY_MAX_HEADER", DEFAULT_MAX_HEADER),
            max_metadata_entries: parse_u64("MODEL_FACTORY_MAX_METADATA_ENTRIES", DEFAULT_MAX_ENTRIES),
            memory_limit_bytes,
            use_mmap: parse_bool("MODEL_FACTORY_USE_MMAP", true),
            log: load_log_config(),
        }
        .clamped()
    }

    /// Load from a TOML file. Missing keys take their defaults.
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(config.clamped())
    }

    fn clamped(mut self) -> Self {
        self.sniff_prefix_bytes = self.sniff_prefix_bytes.max(MIN_SNIFF_PREFIX);
        self.max_header_bytes = self.max_header_bytes.max(MIN_MAX_HEADER);
        self.max_metadata_entries = self.max_metadata_entries.max(MIN_MAX_ENTRIES);
        self
    }

    pub fn header_limits(&self) -> HeaderLimits {
        HeaderLimits {
            max_header_bytes: self.max_header_bytes,
            max_metadata_entries: self.max_metadata_entries,
        }
    }

    /// Per-call load configuration seeded from these settings.
    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            use_mmap: self.use_mmap,
            memory_limit_bytes: self.memory_limit_bytes,
            ..LoadConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "MODEL_FACTORY_SNIFF_PREFIX",
        "MODEL_FACTORY_MAX_HEADER",
        "MODEL_FACTORY_MAX_METADATA_ENTRIES",
        "MODEL_FACTORY_MEMORY_LIMIT",
        "MODEL_FACTORY_USE_MMAP",
        "MODEL_FACTORY_LOG_FORMAT",
        "MODEL_FACTORY_LOG_LEVEL",
        "MODEL_FACTORY_LOG_FILE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn test_defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = FactoryConfig::from_env();
        assert_eq!(cfg, FactoryConfig::default());
        assert_eq!(cfg.header_limits(), HeaderLimits::default());
        assert!(cfg.load_config().use_mmap);
    }

    #[test]
    fn test_env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("MODEL_FACTORY_MEMORY_LIMIT", "4096");
        std::env::set_var("MODEL_FACTORY_USE_MMAP", "off");
        std::env::set_var("MODEL_FACTORY_LOG_FORMAT", "pretty");
        let cfg = FactoryConfig::from_env();
        assert_eq!(cfg.memory_limit_bytes, Some(4096));
        assert!(!cfg.use_mmap);
        assert_eq!(cfg.log.format, crate::telemetry::LogFormat::Pretty);
        assert_eq!(cfg.load_config().memory_limit_bytes, Some(4096));
        clear_env_vars();
    }

    #[test]
    fn test_invalid_env_falls_back_and_floors_apply() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("MODEL_FACTORY_SNIFF_PREFIX", "lots");
        std::env::set_var("MODEL_FACTORY_MAX_HEADER", "1");
        std::env::set_var("MODEL_FACTORY_USE_MMAP", "maybe");
        let cfg = FactoryConfig::from_env();
        assert_eq!(cfg.sniff_prefix_bytes, DEFAULT_SNIFF_PREFIX);
        assert_eq!(cfg.max_header_bytes, MIN_MAX_HEADER);
        assert!(cfg.use_mmap);
        clear_env_vars();
    }

    #[test]
    fn test_toml_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "memory_limit_bytes = 1048576\nsniff_prefix_bytes = 8192\n[log]\nformat = \"pretty\"").unwrap();
        let cfg = FactoryConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(cfg.memory_limit_bytes, Some(1_048_576));
        assert_eq!(cfg.sniff_prefix_bytes, 8192);
        assert_eq!(cfg.max_header_bytes, DEFAULT_MAX_HEADER);
        assert_eq!(cfg.log.level, "info");
    }

    #[test]
    fn test_toml_file_errors() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "use_mmap = \"sometimes\"").unwrap();
        assert!(matches!(FactoryConfig::from_toml_file(file.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            FactoryConfig::from_toml_file(Path::new("/no/such/factory.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
