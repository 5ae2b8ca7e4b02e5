//! Fluent command builders and their materializers.
//!
//! A [`SqliteCommand`] is produced by one of the entry points on
//! [`SqliteDataSource`](crate::SqliteDataSource). It is inert until a
//! materializer (`to_rows`, `to_row`, `to_value`, `to_i64`, `execute`) is
//! awaited; the materializer resolves table metadata, renders the SQL and
//! runs it through the core pipeline on a blocking worker.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use serde_json::Value;
use tether_query::{
    fingerprint, CachePolicy, CancellationToken, Completed, DataSource, DeleteOptions, EventState,
    ExecutionToken, FilterOptions, Materialization, NullHandling, QueryError, Result,
};
use tracing::debug;

use crate::connection::{Interrupter, LockType};
use crate::error::SqliteError;
use crate::source::{SqliteDataSource, BACKEND};
use crate::value::{from_sql, quote_identifier, to_sql, DataRow};

pub(crate) enum CommandKind {
    Sql {
        statement: String,
        args: Vec<Value>,
        lock: LockType,
    },
    From {
        table: String,
        filter: Filter,
    },
    Insert {
        table: String,
        row: Value,
    },
    Delete {
        table: String,
        keys: Value,
        options: DeleteOptions,
    },
}

impl CommandKind {
    fn lock(&self) -> LockType {
        match self {
            CommandKind::Sql { lock, .. } => *lock,
            CommandKind::From { .. } => LockType::Read,
            CommandKind::Insert { .. } | CommandKind::Delete { .. } => LockType::Write,
        }
    }
}

pub(crate) enum Filter {
    All,
    Object(Value, FilterOptions),
    Where(String, Vec<Value>),
}

enum CacheKey {
    Fingerprint(CachePolicy),
    Explicit(String, CachePolicy),
}

/// Rendered SQL ready to run
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
    pub label: String,
    /// Table named in the error when a checked statement changes nothing
    pub require_rows_in: Option<String>,
}

/// Raw output of one statement
#[derive(Debug, Default)]
pub(crate) struct StatementOutput {
    pub columns: Vec<String>,
    pub values: Vec<Vec<Value>>,
    pub rows_affected: Option<u64>,
}

impl StatementOutput {
    fn into_rows(self) -> Vec<DataRow> {
        let columns = self.columns;
        self.values
            .into_iter()
            .map(|values| columns.iter().cloned().zip(values).collect())
            .collect()
    }

    fn first_value(self) -> Option<(String, Value)> {
        let column = self.columns.into_iter().next()?;
        let value = self.values.into_iter().next()?.into_iter().next()?;
        Some((column, value))
    }
}

/// A command bound to a data source, configured fluently and run by a materializer
pub struct SqliteCommand<'a> {
    source: &'a SqliteDataSource,
    kind: CommandKind,
    cache: Option<CacheKey>,
    invalidates: Vec<String>,
    timeout: Option<Option<Duration>>,
    cancellation: Option<CancellationToken>,
    state: Option<EventState>,
}

impl<'a> SqliteCommand<'a> {
    pub(crate) fn new(source: &'a SqliteDataSource, kind: CommandKind) -> Self {
        Self {
            source,
            kind,
            cache: None,
            invalidates: Vec::new(),
            timeout: None,
            cancellation: None,
            state: None,
        }
    }

    /// Cache the result under a key derived from the SQL, its parameters and the materializer
    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(CacheKey::Fingerprint(policy));
        self
    }

    /// Cache the result under a caller-chosen key, e.g. to invalidate it from a write later
    pub fn with_cache_key(mut self, key: impl Into<String>, policy: CachePolicy) -> Self {
        self.cache = Some(CacheKey::Explicit(key.into(), policy));
        self
    }

    /// Drop a cache entry once this command succeeds
    pub fn invalidates(mut self, key: impl Into<String>) -> Self {
        self.invalidates.push(key.into());
        self
    }

    /// Override the data source's default command timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(Some(timeout));
        self
    }

    pub fn without_timeout(mut self) -> Self {
        self.timeout = Some(None);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// Caller state handed to every lifecycle event of this command
    pub fn with_state<S: Any + Send + Sync>(mut self, state: S) -> Self {
        self.state = Some(Arc::new(state));
        self
    }

    /// All rows; an empty result (or a cached absence) gives an empty list
    pub async fn to_rows(self) -> Result<Vec<DataRow>> {
        let rows = self
            .materialize("rows", |output| Ok(Some(output.into_rows())))
            .await?;
        Ok(rows.unwrap_or_default())
    }

    /// The first row, if any
    pub async fn to_row(self) -> Result<Option<DataRow>> {
        self.materialize("row", |output| Ok(output.into_rows().into_iter().next()))
            .await
    }

    /// First column of the first row. SQL NULL is reported as `None`.
    pub async fn to_value(self) -> Result<Option<Value>> {
        self.materialize("value", |output| {
            Ok(output
                .first_value()
                .map(|(_, value)| value)
                .filter(|value| !value.is_null()))
        })
        .await
    }

    /// First column of the first row as an integer; no row or NULL gives 0
    pub async fn to_i64(self) -> Result<i64> {
        let value = self
            .materialize("i64", |output| match output.first_value() {
                None | Some((_, Value::Null)) => Ok(None),
                Some((column, value)) => match value.as_i64() {
                    Some(i) => Ok(Some(i)),
                    None => Err(SqliteError::UnexpectedValue {
                        column,
                        expected: "integer",
                        found: value.to_string(),
                    }),
                },
            })
            .await?;
        Ok(value.unwrap_or_default())
    }

    /// Run for effect, returning the number of rows changed
    pub async fn execute(self) -> Result<u64> {
        let rows = self
            .materialize("execute", |output| {
                Ok(Some(output.rows_affected.unwrap_or_default()))
            })
            .await?;
        Ok(rows.unwrap_or_default())
    }

    async fn materialize<T, F>(self, shape: &'static str, project: F) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce(StatementOutput) -> std::result::Result<Option<T>, SqliteError> + Send + 'static,
    {
        let statement = self.prepare().await?;
        let token = ExecutionToken::new(statement.sql.clone(), statement.params.clone())?
            .with_label(statement.label.clone());

        let mut pass = Materialization::new(self.source.core(), token).with_state(self.state);
        if let Some(timeout) = self.timeout {
            pass = pass.with_timeout(timeout);
        }
        if let Some(cancellation) = self.cancellation {
            pass = pass.with_cancellation(cancellation);
        }
        match self.cache {
            Some(CacheKey::Fingerprint(policy)) => {
                let key = fingerprint(
                    BACKEND,
                    self.source.scope(),
                    shape,
                    &statement.sql,
                    &statement.params,
                );
                pass = pass.with_cache(key, policy);
            }
            Some(CacheKey::Explicit(key, policy)) => pass = pass.with_cache(key, policy),
            None => {}
        }
        for key in self.invalidates {
            pass = pass.invalidates(key);
        }

        let connections = self.source.connections();
        let lock = self.kind.lock();
        let Statement {
            sql,
            params,
            require_rows_in,
            ..
        } = statement;

        pass.run_interruptible(move |interrupt| async move {
            let output = connections
                .run_statement(lock, sql, params, interrupt)
                .await?;

            if let (Some(table), Some(0)) = (require_rows_in, output.rows_affected) {
                return Err(SqliteError::NoRowsAffected { table });
            }

            let rows_affected = output.rows_affected;
            let value = project(output)?;
            Ok::<_, SqliteError>(Completed {
                value,
                rows_affected,
            })
        })
        .await
    }

    pub(crate) async fn prepare(&self) -> Result<Statement> {
        let strict = self.source.core().strict_mode();

        match &self.kind {
            CommandKind::Sql { statement, args, .. } => Ok(Statement {
                sql: statement.clone(),
                params: args.clone(),
                label: "sql".to_string(),
                require_rows_in: None,
            }),

            CommandKind::From { table, filter } => {
                let columns = self.source.columns(table).await?;
                let mut sql = format!("SELECT * FROM {}", quote_identifier(table));
                let mut params = Vec::new();

                match filter {
                    Filter::All => {}
                    Filter::Object(object, options) => {
                        let object = as_object(object, table)?;
                        let (clauses, values) =
                            conditions(strict, table, &columns, object, options.null_handling)?;
                        if !clauses.is_empty() {
                            sql.push_str(" WHERE ");
                            sql.push_str(&clauses.join(" AND "));
                        }
                        params = values;
                    }
                    Filter::Where(expression, args) => {
                        sql.push_str(&format!(" WHERE {}", expression));
                        params = args.clone();
                    }
                }

                Ok(Statement {
                    sql,
                    params,
                    label: format!("from {}", table),
                    require_rows_in: None,
                })
            }

            CommandKind::Insert { table, row } => {
                let columns = self.source.columns(table).await?;
                let object = as_object(row, table)?;
                let members = map_members(strict, table, &columns, object)?;

                let sql = if members.is_empty() {
                    format!(
                        "INSERT INTO {} DEFAULT VALUES RETURNING *",
                        quote_identifier(table)
                    )
                } else {
                    let names: Vec<_> = members
                        .iter()
                        .map(|(column, _)| quote_identifier(column))
                        .collect();
                    let placeholders = vec!["?"; members.len()].join(", ");
                    format!(
                        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
                        quote_identifier(table),
                        names.join(", "),
                        placeholders
                    )
                };

                Ok(Statement {
                    sql,
                    params: members.into_iter().map(|(_, v)| v.clone()).collect(),
                    label: format!("insert into {}", table),
                    require_rows_in: None,
                })
            }

            CommandKind::Delete {
                table,
                keys,
                options,
            } => {
                let columns = self.source.columns(table).await?;
                let object = as_object(keys, table)?;
                let (clauses, params) =
                    conditions(strict, table, &columns, object, options.null_handling)?;
                if clauses.is_empty() {
                    return Err(QueryError::invalid_argument(format!(
                        "delete from {} needs at least one key",
                        table
                    )));
                }

                Ok(Statement {
                    sql: format!(
                        "DELETE FROM {} WHERE {} RETURNING *",
                        quote_identifier(table),
                        clauses.join(" AND ")
                    ),
                    params,
                    label: format!("delete from {}", table),
                    require_rows_in: options.check_rows_affected.then(|| table.clone()),
                })
            }
        }
    }
}

fn as_object<'v>(value: &'v Value, table: &str) -> Result<&'v DataRow> {
    value.as_object().ok_or_else(|| {
        QueryError::invalid_argument(format!(
            "expected a JSON object for table {}, got {}",
            table, value
        ))
    })
}

/// Pair object members with table columns (matched case-insensitively)
fn map_members<'r>(
    strict: bool,
    table: &str,
    columns: &'r [String],
    object: &'r DataRow,
) -> Result<Vec<(&'r str, &'r Value)>> {
    let mut mapped = Vec::with_capacity(object.len());

    for (member, value) in object {
        match columns.iter().find(|c| c.eq_ignore_ascii_case(member)) {
            Some(column) => mapped.push((column.as_str(), value)),
            None if strict => {
                return Err(QueryError::mapping(format!(
                    "Cannot find a column named {} on table {}",
                    member, table
                )))
            }
            None => debug!("Skipping member {} with no column on table {}", member, table),
        }
    }

    Ok(mapped)
}

fn conditions(
    strict: bool,
    table: &str,
    columns: &[String],
    object: &DataRow,
    null_handling: NullHandling,
) -> Result<(Vec<String>, Vec<Value>)> {
    let mut clauses = Vec::new();
    let mut params = Vec::new();

    for (column, value) in map_members(strict, table, columns, object)? {
        if value.is_null() {
            if null_handling == NullHandling::MatchNulls {
                clauses.push(format!("{} IS NULL", quote_identifier(column)));
            }
            continue;
        }
        clauses.push(format!("{} = ?", quote_identifier(column)));
        params.push(value.clone());
    }

    Ok((clauses, params))
}

fn total_changes(conn: &Connection) -> rusqlite::Result<i64> {
    conn.query_row("SELECT total_changes()", [], |row| row.get(0))
}

fn read_rows(
    stmt: &mut rusqlite::Statement<'_>,
    params: &[Value],
    width: usize,
) -> rusqlite::Result<Vec<Vec<Value>>> {
    let bound: Vec<_> = params.iter().map(to_sql).collect();
    let mut rows = stmt.query(rusqlite::params_from_iter(bound.iter()))?;
    let mut values = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Vec::with_capacity(width);
        for idx in 0..width {
            record.push(from_sql(row.get_ref(idx)?));
        }
        values.push(record);
    }
    Ok(values)
}

/// Run one statement, registering it with `interrupter` while it steps
pub(crate) fn execute_statement(
    conn: &Connection,
    sql: &str,
    params: &[Value],
    interrupter: Option<&Interrupter>,
) -> std::result::Result<StatementOutput, SqliteError> {
    let mut stmt = conn.prepare(sql)?;
    let readonly = stmt.readonly();
    let columns: Vec<String> = stmt
        .column_names()
        .into_iter()
        .map(String::from)
        .collect();

    let before = if readonly { 0 } else { total_changes(conn)? };

    if let Some(interrupter) = interrupter {
        if !interrupter.arm(conn) {
            return Err(SqliteError::Interrupted);
        }
    }
    let values = read_rows(&mut stmt, params, columns.len());
    if let Some(interrupter) = interrupter {
        interrupter.disarm();
    }
    let values = values?;

    let rows_affected = if readonly {
        None
    } else {
        let after = total_changes(conn)?;
        Some(u64::try_from(after - before).unwrap_or_default())
    };

    Ok(StatementOutput {
        columns,
        values,
        rows_affected,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run_statement(
        conn: &Connection,
        sql: &str,
        params: &[Value],
    ) -> std::result::Result<StatementOutput, SqliteError> {
        execute_statement(conn, sql, params, None)
    }

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL, color TEXT);
             INSERT INTO items (name, color) VALUES ('bolt', 'grey'), ('nut', NULL);",
        )
        .unwrap();
        conn
    }

    #[test]
    fn test_run_select_reports_no_rows_affected() {
        let output = run_statement(&conn(), "SELECT name FROM items ORDER BY id", &[]).unwrap();
        assert_eq!(output.columns, vec!["name"]);
        assert_eq!(output.values, vec![vec![json!("bolt")], vec![json!("nut")]]);
        assert_eq!(output.rows_affected, None);
    }

    #[test]
    fn test_run_update_counts_changes() {
        let output = run_statement(
            &conn(),
            "UPDATE items SET color = ? WHERE color IS NULL",
            &[json!("black")],
        )
        .unwrap();
        assert!(output.values.is_empty());
        assert_eq!(output.rows_affected, Some(1));
    }

    #[test]
    fn test_run_returning_counts_changes_and_rows() {
        let output = run_statement(
            &conn(),
            "DELETE FROM items WHERE name = ? RETURNING *",
            &[json!("bolt")],
        )
        .unwrap();
        assert_eq!(output.values.len(), 1);
        assert_eq!(output.rows_affected, Some(1));
    }

    #[test]
    fn test_run_ddl_changes_nothing() {
        let output = run_statement(&conn(), "CREATE TABLE other (a TEXT)", &[]).unwrap();
        assert_eq!(output.rows_affected, Some(0));
    }

    #[test]
    fn test_rows_keep_column_names() {
        let output = run_statement(&conn(), "SELECT id, name FROM items WHERE id = 1", &[]).unwrap();
        let rows = output.into_rows();
        assert_eq!(rows[0].get("name"), Some(&json!("bolt")));
        assert_eq!(rows[0].get("id"), Some(&json!(1)));
    }

    #[test]
    fn test_map_members_strict_and_lenient() {
        let columns = vec!["id".to_string(), "name".to_string()];
        let object = json!({"NAME": "bolt", "weight": 3});
        let object = object.as_object().unwrap();

        let lenient = map_members(false, "items", &columns, object).unwrap();
        assert_eq!(lenient, vec![("name", &json!("bolt"))]);

        let err = map_members(true, "items", &columns, object).unwrap_err();
        assert!(matches!(err, QueryError::Mapping(message) if message.contains("weight")));
    }

    #[test]
    fn test_conditions_null_handling() {
        let columns = vec!["name".to_string(), "color".to_string()];
        let object = json!({"color": null, "name": "nut"});
        let object = object.as_object().unwrap();

        let (clauses, params) =
            conditions(false, "items", &columns, object, NullHandling::IgnoreNulls).unwrap();
        assert_eq!(clauses, vec!["\"name\" = ?"]);
        assert_eq!(params, vec![json!("nut")]);

        let (clauses, params) =
            conditions(false, "items", &columns, object, NullHandling::MatchNulls).unwrap();
        assert_eq!(clauses, vec!["\"color\" IS NULL", "\"name\" = ?"]);
        assert_eq!(params, vec![json!("nut")]);
    }
}
