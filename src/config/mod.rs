//! Processor configuration.
//!
//! Loaded from YAML files and `COURIER__`-prefixed environment variables.

use serde::Deserialize;

use crate::descriptor::HandlerLifetime;
use crate::error::{DispatchError, Result};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable naming an additional configuration file.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for environment overrides, e.g. `COURIER__QUEUE__WORKERS=8`.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";

/// Runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ProcessorConfig {
    /// Stop dispatch and return the handler's default result when
    /// validation fails. Otherwise the handler runs with the failures
    /// attached to its request.
    pub abort_on_invalid_message: bool,
    /// Lifetime for registrations that do not choose one.
    pub default_lifetime: HandlerLifetime,
    pub queue: QueueConfig,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            abort_on_invalid_message: false,
            default_lifetime: HandlerLifetime::Transient,
            queue: QueueConfig::default(),
        }
    }
}

/// Queue consumer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Number of concurrent consumer loops.
    pub workers: usize,
    /// Maximum number of queued messages before `enqueue` waits.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
        }
    }
}

impl ProcessorConfig {
    /// Load configuration.
    ///
    /// Sources, later ones overriding earlier ones:
    /// 1. `courier.yaml` in the working directory (if present)
    /// 2. `path` (if given)
    /// 3. File named by `COURIER_CONFIG` (if set)
    /// 4. Environment variables with the `COURIER__` prefix
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| DispatchError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| DispatchError::Config(e.to_string()))
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| DispatchError::Config(e.to_string()))
    }

    /// Configuration for tests.
    pub fn for_test() -> Self {
        Self {
            queue: QueueConfig {
                workers: 2,
                capacity: 16,
            },
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ProcessorConfig::default();
        assert!(!config.abort_on_invalid_message);
        assert_eq!(config.default_lifetime, HandlerLifetime::Transient);
        assert_eq!(config.queue.workers, 4);
        assert_eq!(config.queue.capacity, 1024);
    }

    #[test]
    fn test_from_yaml_partial_document() {
        let config = ProcessorConfig::from_yaml(
            "abort_on_invalid_message: true\ndefault_lifetime: scoped\nqueue:\n  workers: 8\n",
        )
        .unwrap();
        assert!(config.abort_on_invalid_message);
        assert_eq!(config.default_lifetime, HandlerLifetime::Scoped);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.capacity, 1024);
    }

    #[test]
    fn test_from_yaml_rejects_unknown_lifetime() {
        let err = ProcessorConfig::from_yaml("default_lifetime: forever\n").unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "default_lifetime: singleton").unwrap();
        writeln!(file, "queue:").unwrap();
        writeln!(file, "  capacity: 32").unwrap();

        let config = ProcessorConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.default_lifetime, HandlerLifetime::Singleton);
        assert_eq!(config.queue.capacity, 32);
        assert_eq!(config.queue.workers, 4);
    }

    #[test]
    #[serial]
    fn test_load_missing_explicit_file_fails() {
        let err = ProcessorConfig::load(Some("/nonexistent/courier-test.yaml")).unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    #[serial]
    fn test_environment_overrides() {
        std::env::set_var("COURIER__QUEUE__WORKERS", "9");
        std::env::set_var("COURIER__ABORT_ON_INVALID_MESSAGE", "true");
        let config = ProcessorConfig::load(None);
        std::env::remove_var("COURIER__QUEUE__WORKERS");
        std::env::remove_var("COURIER__ABORT_ON_INVALID_MESSAGE");

        let config = config.unwrap();
        assert_eq!(config.queue.workers, 9);
        assert!(config.abort_on_invalid_message);
    }

    #[test]
    fn test_for_test_is_small() {
        let config = ProcessorConfig::for_test();
        assert_eq!(config.queue.workers, 2);
        assert_eq!(config.queue.capacity, 16);
    }
}
