use std::path::Path;
use std::sync::Arc;

use rusqlite::Connection;
use serde_json::Value;
use tether_query::{
    DataSource, DataSourceCore, DataSourceSettings, DeleteOptions, FilterOptions, QueryError,
};
use tracing::debug;

use crate::command::{CommandKind, Filter, SqliteCommand};
use crate::connection::{Connections, LockType};
use crate::error::{Result, SqliteError};
use crate::schema::TableColumns;

pub(crate) const BACKEND: &str = "sqlite";

/// SQLite data source.
///
/// Statements run on tokio's blocking pool. Writes hold the data source
/// alone; reads share it, and on file databases run on read-only
/// connections of their own.
pub struct SqliteDataSource {
    core: DataSourceCore,
    conns: Arc<Connections>,
}

impl SqliteDataSource {
    /// Open (or create) a database file
    pub fn open(
        path: impl AsRef<Path>,
        name: impl Into<String>,
        settings: DataSourceSettings,
    ) -> Result<Self> {
        let path = path.as_ref();
        debug!("Opening SQLite database: {}", path.display());

        let conn = Connection::open(path)?;
        let core = DataSourceCore::builder(name).settings(settings).build()?;
        Ok(Self::with_core(conn, core))
    }

    /// Open a private in-memory database
    pub fn open_in_memory(name: impl Into<String>, settings: DataSourceSettings) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let core = DataSourceCore::builder(name).settings(settings).build()?;
        Ok(Self::with_core(conn, core))
    }

    /// Wrap an existing connection with a custom-built core (isolated bus or cache)
    pub fn with_core(conn: Connection, core: DataSourceCore) -> Self {
        Self {
            core,
            conns: Arc::new(Connections::new(conn)),
        }
    }

    /// A data source over the same connection, cache, global bus and
    /// extensions, with its own settings and instance listeners
    pub fn with_settings(&self, settings: DataSourceSettings) -> Result<Self> {
        let core = DataSourceCore::builder(self.core.name())
            .settings(settings)
            .cache(self.core.cache().clone())
            .global_events(self.core.global_events().clone())
            .shared_extensions(self.core.extensions().clone())
            .build()?;

        Ok(Self {
            core,
            conns: self.conns.clone(),
        })
    }

    pub(crate) fn connections(&self) -> Arc<Connections> {
        self.conns.clone()
    }

    /// Identifies the database in cache keys
    pub(crate) fn scope(&self) -> &str {
        self.conns.scope()
    }

    /// The database file, or `None` for an in-memory database
    pub fn path(&self) -> Option<&Path> {
        self.conns.path()
    }

    /// Raw SQL with positional `?` arguments, run with exclusive access
    pub fn sql(&self, statement: impl Into<String>, args: Vec<Value>) -> SqliteCommand<'_> {
        self.sql_with_lock(statement, args, LockType::Write)
    }

    /// Raw SQL with an explicit lock type.
    ///
    /// With [`LockType::Read`] on a file database the statement runs on a
    /// read-only connection, so it cannot change data.
    pub fn sql_with_lock(
        &self,
        statement: impl Into<String>,
        args: Vec<Value>,
        lock: LockType,
    ) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::Sql {
                statement: statement.into(),
                args,
                lock,
            },
        )
    }

    /// Every row of a table
    pub fn from(&self, table: impl Into<String>) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::From {
                table: table.into(),
                filter: Filter::All,
            },
        )
    }

    /// Rows matching each member of a JSON object by equality
    pub fn from_filter(
        &self,
        table: impl Into<String>,
        filter: Value,
        options: FilterOptions,
    ) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::From {
                table: table.into(),
                filter: Filter::Object(filter, options),
            },
        )
    }

    /// Rows matching a SQL expression with positional arguments
    pub fn from_where(
        &self,
        table: impl Into<String>,
        expression: impl Into<String>,
        args: Vec<Value>,
    ) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::From {
                table: table.into(),
                filter: Filter::Where(expression.into(), args),
            },
        )
    }

    /// Insert a JSON object as a row; materializers see the inserted row
    pub fn insert(&self, table: impl Into<String>, row: Value) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::Insert {
                table: table.into(),
                row,
            },
        )
    }

    /// Delete rows matching the key members of a JSON object; materializers see the deleted rows
    pub fn delete(
        &self,
        table: impl Into<String>,
        keys: Value,
        options: DeleteOptions,
    ) -> SqliteCommand<'_> {
        SqliteCommand::new(
            self,
            CommandKind::Delete {
                table: table.into(),
                keys,
                options,
            },
        )
    }

    /// Column names of `table`, cached in the [`TableColumns`] extension
    pub async fn columns(&self, table: &str) -> tether_query::Result<Arc<Vec<String>>> {
        let metadata = self.core.extension::<TableColumns>()?;
        if let Some(columns) = metadata.get(table) {
            return Ok(columns);
        }

        let name = table.to_string();
        let columns = self
            .conns
            .call(LockType::Read, move |conn| {
                metadata.load(conn, &name).map_err(SqliteError::from)
            })
            .await
            .map_err(|e| QueryError::metadata(table, e))?;

        if columns.is_empty() {
            return Err(QueryError::mapping(format!("Cannot find table {}", table)));
        }
        Ok(columns)
    }

    /// Forget cached column lists, e.g. after altering tables
    pub fn refresh_metadata(&self) -> tether_query::Result<()> {
        self.core.extension::<TableColumns>()?.clear();
        Ok(())
    }

    /// Names of the user tables in the database
    pub async fn table_names(&self) -> tether_query::Result<Vec<String>> {
        let rows = self
            .sql_with_lock(
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
                vec![],
                LockType::Read,
            )
            .to_rows()
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|row| row.get("name").and_then(Value::as_str).map(String::from))
            .collect())
    }
}

impl DataSource for SqliteDataSource {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    fn core(&self) -> &DataSourceCore {
        &self.core
    }
}
