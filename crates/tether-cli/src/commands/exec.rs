use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use serde_json::Value;
use tether_query::CachePolicy;
use tether_query_sqlite::{LockType, SqliteDataSource};
use tracing::debug;

use crate::settings::CliConfig;

#[derive(Args)]
pub struct ExecCommand {
    /// SQLite database file
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Statement to execute, with `?` placeholders
    pub statement: String,

    /// Positional argument as JSON; anything that is not valid JSON is passed as text
    #[arg(long = "arg")]
    pub args: Vec<String>,

    /// Cache the result for this many seconds
    #[arg(long)]
    pub cache_ttl: Option<u64>,

    /// Run the statement this many times
    #[arg(long, default_value_t = 1)]
    pub repeat: u32,

    /// Command timeout in milliseconds, overriding the configuration
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Share access with other reads; file databases run the statement read-only
    #[arg(long)]
    pub read: bool,
}

/// `42` binds an integer, `"42"` or `abc` bind text
pub fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

impl ExecCommand {
    pub fn execute(self, config: CliConfig) -> anyhow::Result<()> {
        let path = config.database_path(self.db.clone())?;
        let mut settings = config.data_source.clone();
        if let Some(timeout_ms) = self.timeout_ms {
            settings = settings.with_default_command_timeout(Duration::from_millis(timeout_ms));
        }

        debug!("Executing against {}", path.display());
        let ds = SqliteDataSource::open(&path, config.name.as_str(), settings)?;

        let rt = tokio::runtime::Runtime::new()?;
        rt.block_on(self.run(&ds))
    }

    async fn run(&self, ds: &SqliteDataSource) -> anyhow::Result<()> {
        let args: Vec<Value> = self.args.iter().map(|raw| parse_arg(raw)).collect();
        let lock = if self.read {
            LockType::Read
        } else {
            LockType::Write
        };

        for _ in 0..self.repeat.max(1) {
            let mut command = ds.sql_with_lock(self.statement.as_str(), args.clone(), lock);
            if let Some(ttl) = self.cache_ttl {
                command = command.with_cache(CachePolicy::ttl(Duration::from_secs(ttl)));
            }

            let rows = command.to_rows().await?;
            println!("{}", serde_json::to_string_pretty(&rows)?);
        }

        Ok(())
    }
}
