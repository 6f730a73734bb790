//! Configuration for reconciliation runs.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (scd2.toml)
//! ```toml
//! schema = "schemas/player_rating.json"
//!
//! [engine]
//! malformed_policy = "skip"
//! validate_after_merge = true
//!
//! [store]
//! data_dir = "/var/lib/scd2/dim_player_rating"
//! sync_writes = true
//! ```
//!
//! Environment variables use the `SCD2_` prefix with `__` between nested keys,
//! e.g. `SCD2_STORE__DATA_DIR=/tmp/dim`.

pub mod defaults;

pub use defaults::*;

use crate::persistence::PersistentOpenOptions;
use crate::schema::DimensionSchema;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Main configuration for a reconciliation job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scd2Config {
    pub engine: EngineConfig,
    pub store: StoreConfig,
    /// Path to a dimension schema (JSON); the player rating preset otherwise
    pub schema: Option<PathBuf>,
}

impl Scd2Config {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(
        config_path: Option<&Path>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Scd2Config::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split(ENV_NESTING_SEPARATOR));

        figment = figment.merge(Serialized::defaults(overrides));

        figment.extract().map_err(ConfigError::from)
    }

    /// The configured schema, or the player rating preset
    pub fn load_schema(&self) -> Result<DimensionSchema, ConfigError> {
        match &self.schema {
            None => Ok(DimensionSchema::player_rating()),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|err| ConfigError {
                    message: format!("cannot read schema {}: {}", path.display(), err),
                })?;
                DimensionSchema::from_json(&raw).map_err(|err| ConfigError {
                    message: format!("{}: {}", path.display(), err),
                })
            }
        }
    }
}

/// What to do with a record that fails normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MalformedPolicy {
    /// Abort the run on the first malformed record
    #[default]
    FailFast,
    /// Drop the record, count it and continue
    Skip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub malformed_policy: MalformedPolicy,
    /// Run the validator after every applied changeset
    pub validate_after_merge: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            malformed_policy: MalformedPolicy::default(),
            validate_after_merge: DEFAULT_VALIDATE_AFTER_MERGE,
        }
    }
}

/// Historical store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// RocksDB directory; an in-memory store is used when unset
    pub data_dir: Option<PathBuf>,
    pub sync_writes: bool,
    /// Run repair on open
    pub repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            sync_writes: DEFAULT_SYNC_WRITES,
            repair: DEFAULT_REPAIR,
        }
    }
}

impl StoreConfig {
    pub fn open_options(&self) -> PersistentOpenOptions {
        PersistentOpenOptions {
            repair: self.repair,
            sync_writes: self.sync_writes,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub engine: Option<EngineOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub malformed_policy: Option<MalformedPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validate_after_merge: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_writes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug, Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Scd2Config::default();
        assert_eq!(config.engine.malformed_policy, MalformedPolicy::FailFast);
        assert!(config.engine.validate_after_merge);
        assert_eq!(config.store.data_dir, None);
        assert_eq!(config.store.sync_writes, DEFAULT_SYNC_WRITES);
        assert_eq!(config.load_schema().unwrap(), DimensionSchema::player_rating());
    }

    #[test]
    fn test_policy_serde() {
        let json = serde_json::to_string(&MalformedPolicy::FailFast).unwrap();
        assert_eq!(json, "\"fail-fast\"");

        let policy: MalformedPolicy = serde_json::from_str("\"skip\"").unwrap();
        assert_eq!(policy, MalformedPolicy::Skip);
    }

    // Loading reads process env, so every test that loads runs inside a Jail.
    #[test]
    fn test_file_then_overrides() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "scd2.toml",
                "[engine]\nmalformed_policy = \"skip\"\n\n[store]\ndata_dir = \"/tmp/from-file\"\nrepair = true",
            )?;

            let overrides = ConfigOverrides {
                store: Some(StoreOverrides {
                    data_dir: Some(PathBuf::from("/tmp/from-cli")),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let config = Scd2Config::load(Some(Path::new("scd2.toml")), overrides)
                .map_err(|err| err.message)?;
            assert_eq!(config.engine.malformed_policy, MalformedPolicy::Skip);
            assert_eq!(config.store.data_dir, Some(PathBuf::from("/tmp/from-cli")));
            assert!(config.store.repair);
            assert!(config.store.open_options().repair);
            Ok(())
        });
    }

    #[test]
    fn test_env_layer_nests_on_double_underscore() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("SCD2_ENGINE__MALFORMED_POLICY", "skip");
            jail.set_env("SCD2_STORE__SYNC_WRITES", "false");
            jail.set_env("SCD2_STORE__DATA_DIR", "/tmp/from-env");
            jail.set_env("SCD2_SCHEMA", "schemas/custom.json");

            let config = Scd2Config::load(None, ConfigOverrides::default())
                .map_err(|err| err.message)?;
            assert_eq!(config.engine.malformed_policy, MalformedPolicy::Skip);
            assert!(!config.store.sync_writes);
            assert_eq!(config.store.data_dir, Some(PathBuf::from("/tmp/from-env")));
            assert_eq!(config.schema, Some(PathBuf::from("schemas/custom.json")));
            assert!(config.engine.validate_after_merge);

            let overrides = ConfigOverrides {
                store: Some(StoreOverrides {
                    data_dir: Some(PathBuf::from("/tmp/from-cli")),
                    ..Default::default()
                }),
                ..Default::default()
            };
            let config = Scd2Config::load(None, overrides).map_err(|err| err.message)?;
            assert_eq!(config.store.data_dir, Some(PathBuf::from("/tmp/from-cli")));
            assert!(!config.store.sync_writes);
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        figment::Jail::expect_with(|jail| {
            jail.create_file("scd2.toml", "[store]\nrepair = true\nsync_writes = true")?;
            jail.set_env("SCD2_STORE__REPAIR", "false");

            let config = Scd2Config::load(Some(Path::new("scd2.toml")), ConfigOverrides::default())
                .map_err(|err| err.message)?;
            assert!(!config.store.repair);
            assert!(config.store.sync_writes);
            Ok(())
        });
    }

    #[test]
    fn test_missing_schema_file_is_config_error() {
        let config = Scd2Config {
            schema: Some(PathBuf::from("/nonexistent/schema.json")),
            ..Default::default()
        };
        let err = config.load_schema().unwrap_err();
        assert!(err.to_string().contains("/nonexistent/schema.json"));
    }
}
