use std::path::PathBuf;

use clap::Args;
use tether_query_sqlite::SqliteDataSource;

use crate::settings::CliConfig;

#[derive(Args)]
pub struct TablesCommand {
    /// SQLite database file
    #[arg(long)]
    pub db: Option<PathBuf>,

    /// Also print each table's columns
    #[arg(long)]
    pub columns: bool,
}

impl TablesCommand {
    pub fn execute(self, config: CliConfig) -> anyhow::Result<()> {
        let path = config.database_path(self.db.clone())?;
        let ds = SqliteDataSource::open(&path, config.name.as_str(), config.data_source.clone())?;

        let rt = tokio::runtime::Runtime::new()?;
        let listing = rt.block_on(async {
            let mut listing = serde_json::Map::new();
            for table in ds.table_names().await? {
                let columns = if self.columns {
                    serde_json::to_value(ds.columns(&table).await?.as_ref())?
                } else {
                    serde_json::Value::Null
                };
                listing.insert(table, columns);
            }
            Ok::<_, anyhow::Error>(listing)
        })?;

        if self.columns {
            println!("{}", serde_json::to_string_pretty(&listing)?);
        } else {
            for table in listing.keys() {
                println!("{}", table);
            }
        }
        Ok(())
    }
}
