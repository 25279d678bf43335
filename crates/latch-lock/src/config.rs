//! Locker configuration
//!
//! Settings come from an optional config file (format inferred from its
//! extension) overlaid by `LATCH_*` environment variables, e.g.
//! `LATCH_TABLE_NAME` or `LATCH_LEASE_DURATION_MS`.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use latch_common::{
    DEFAULT_CLOCK_SKEW_TOLERANCE_MS, DEFAULT_LEASE_DURATION_MS, DEFAULT_REGION, HEARTBEAT_DIVISOR,
    LatchError,
};

use crate::lease::LeaseOptions;

pub const ENV_PREFIX: &str = "LATCH";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Lock table name
    pub table_name: String,
    pub region: String,
    /// Store endpoint override (local DynamoDB and similar)
    pub endpoint_url: Option<String>,
    pub lease_duration_ms: u64,
    /// Renewals per lease window
    pub heartbeat_divisor: u32,
    pub clock_skew_tolerance_ms: u64,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            region: DEFAULT_REGION.to_string(),
            endpoint_url: None,
            lease_duration_ms: DEFAULT_LEASE_DURATION_MS,
            heartbeat_divisor: HEARTBEAT_DIVISOR,
            clock_skew_tolerance_ms: DEFAULT_CLOCK_SKEW_TOLERANCE_MS,
        }
    }
}

impl LockerConfig {
    /// Load from `file` (if any) and the process environment
    pub fn load(file: Option<&Path>) -> Result<Self, LatchError> {
        Self::load_with_env(file, Environment::with_prefix(ENV_PREFIX))
    }

    /// Load from `file` (if any) and an explicit environment source
    pub fn load_with_env(file: Option<&Path>, env: Environment) -> Result<Self, LatchError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }

        let config: LockerConfig = builder
            .add_source(env.try_parsing(true))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| LatchError::ConfigError(e.to_string()))?;

        config.lease_options()?;
        Ok(config)
    }

    /// Lease policy described by this configuration
    pub fn lease_options(&self) -> Result<LeaseOptions, LatchError> {
        LeaseOptions::with_heartbeat_divisor(
            Duration::from_millis(self.lease_duration_ms),
            self.heartbeat_divisor,
        )
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        Duration::from_millis(self.clock_skew_tolerance_ms)
    }

    /// Store connection settings; the table name must be set
    #[cfg(feature = "dynamodb")]
    pub fn store_config(&self) -> Result<latch_store::DynamoStoreConfig, LatchError> {
        if self.table_name.is_empty() {
            return Err(LatchError::ConfigError("table_name is required".to_string()));
        }
        Ok(latch_store::DynamoStoreConfig {
            table_name: self.table_name.clone(),
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::io::Write;

    fn env(vars: &[(&str, &str)]) -> Environment {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Environment::with_prefix(ENV_PREFIX).source(Some(map))
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let config = LockerConfig::load_with_env(None, env(&[])).unwrap();
        assert_eq!(config, LockerConfig::default());
        assert_eq!(config.region, "us-east-1");

        let options = config.lease_options().unwrap();
        assert_eq!(options.lease_duration(), Duration::from_secs(60));
        assert_eq!(options.renewal_period(), Duration::from_secs(20));
        assert_eq!(config.clock_skew_tolerance(), Duration::from_secs(1));
    }

    #[test]
    fn test_load_from_file() {
        let file = config_file(
            r#"
table_name = "uploads-locks"
region = "eu-west-1"
lease_duration_ms = 9000
"#,
        );

        let config = LockerConfig::load_with_env(Some(file.path()), env(&[])).unwrap();
        assert_eq!(config.table_name, "uploads-locks");
        assert_eq!(config.region, "eu-west-1");
        assert_eq!(config.lease_duration_ms, 9000);
        assert_eq!(config.heartbeat_divisor, HEARTBEAT_DIVISOR);
        assert_eq!(
            config.lease_options().unwrap().renewal_period(),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_environment_overrides_file() {
        let file = config_file("table_name = \"from-file\"\nlease_duration_ms = 9000\n");

        let config = LockerConfig::load_with_env(
            Some(file.path()),
            env(&[
                ("LATCH_TABLE_NAME", "from-env"),
                ("LATCH_CLOCK_SKEW_TOLERANCE_MS", "250"),
                ("LATCH_ENDPOINT_URL", "http://localhost:8000"),
            ]),
        )
        .unwrap();
        assert_eq!(config.table_name, "from-env");
        assert_eq!(config.lease_duration_ms, 9000);
        assert_eq!(config.clock_skew_tolerance(), Duration::from_millis(250));
        assert_eq!(config.endpoint_url.as_deref(), Some("http://localhost:8000"));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = LockerConfig::load_with_env(None, env(&[("LATCH_HEARTBEAT_DIVISOR", "1")]))
            .unwrap_err();
        assert!(matches!(err, LatchError::IllegalArgument(_)));

        let err = LockerConfig::load_with_env(None, env(&[("LATCH_LEASE_DURATION_MS", "soon")]))
            .unwrap_err();
        assert!(matches!(err, LatchError::ConfigError(_)));
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        assert!(LockerConfig::load_with_env(Some(&missing), env(&[])).is_err());
    }

    #[cfg(feature = "dynamodb")]
    #[test]
    fn test_store_config_requires_table() {
        let config = LockerConfig::default();
        assert!(config.store_config().is_err());

        let config = LockerConfig {
            table_name: "locks".to_string(),
            ..LockerConfig::default()
        };
        let store = config.store_config().unwrap();
        assert_eq!(store.table_name, "locks");
        assert_eq!(store.region, "us-east-1");
    }
}
