use std::path::{Path, PathBuf};

use anyhow::Context;
use config::{Config, Environment, File};
use serde::Deserialize;
use tether_query::DataSourceSettings;

/// CLI configuration.
///
/// Sources, lowest priority first: the optional config file, then
/// `TETHER_*` environment variables (`__` separates nested keys, e.g.
/// `TETHER_DATA_SOURCE__STRICT_MODE=true`), then command-line flags.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Database file used when `--db` is not given
    pub database: Option<PathBuf>,

    /// Data source name reported in lifecycle events
    pub name: String,

    pub data_source: DataSourceSettings,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            database: None,
            name: "tether".to_string(),
            data_source: DataSourceSettings::default(),
        }
    }
}

impl CliConfig {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path));
        }

        builder = builder.add_source(
            Environment::with_prefix("TETHER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .context("Failed to load configuration")?;
        config
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// The database to open, preferring an explicit flag
    pub fn database_path(&self, flag: Option<PathBuf>) -> anyhow::Result<PathBuf> {
        flag.or_else(|| self.database.clone()).ok_or_else(|| {
            anyhow::anyhow!("No database given: pass --db or set `database` in the configuration")
        })
    }
}
