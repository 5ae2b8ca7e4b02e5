//! Connections behind a data source.
//!
//! Every statement takes the reader/writer gate for its [`LockType`] first:
//! reads share it, writes hold it alone. File databases also keep a pool of
//! read-only connections, so shared reads run side by side while the writer
//! connection serves writes. In-memory databases have one connection only,
//! and reads fall back to it.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use tether_query::CancellationToken;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;
use uuid::Uuid;

use crate::command::{execute_statement, StatementOutput};
use crate::error::{Result, SqliteError};

const MAX_IDLE_READERS: usize = 8;
const READER_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Access a command needs to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockType {
    /// Shared with other reads; runs on a read-only connection when one is available
    Read,
    /// Exclusive: no other statement of this data source runs meanwhile
    #[default]
    Write,
}

enum Gate<'a> {
    Shared { _guard: RwLockReadGuard<'a, ()> },
    Exclusive { _guard: RwLockWriteGuard<'a, ()> },
}

struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl ReaderPool {
    fn checkout(&self) -> Result<Connection> {
        let idle = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        if let Some(conn) = idle {
            return Ok(conn);
        }

        debug!("Opening read-only connection to {}", self.path.display());
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(READER_BUSY_TIMEOUT)?;
        Ok(conn)
    }

    fn checkin(&self, conn: Connection) {
        let mut idle = self.idle.lock().unwrap_or_else(PoisonError::into_inner);
        if idle.len() < MAX_IDLE_READERS {
            idle.push(conn);
        }
    }
}

/// Stops a statement running on a blocking worker.
///
/// The worker registers its connection right before stepping the statement
/// and clears it right after, so an interrupt never reaches a statement that
/// belongs to another command.
pub(crate) struct Interrupter {
    requested: CancellationToken,
    running: Mutex<Option<InterruptHandle>>,
}

impl Interrupter {
    pub(crate) fn new(requested: CancellationToken) -> Self {
        Self {
            requested,
            running: Mutex::new(None),
        }
    }

    /// Register `conn` as running; false when the caller already gave up
    pub(crate) fn arm(&self, conn: &Connection) -> bool {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if self.requested.is_cancelled() {
            return false;
        }
        *running = Some(conn.get_interrupt_handle());
        true
    }

    pub(crate) fn disarm(&self) {
        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    fn interrupt(&self) {
        if let Some(handle) = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            debug!("Interrupting running statement");
            handle.interrupt();
        }
    }
}

pub(crate) struct Connections {
    scope: String,
    gate: RwLock<()>,
    writer: Mutex<Connection>,
    readers: Option<ReaderPool>,
}

impl Connections {
    pub(crate) fn new(conn: Connection) -> Self {
        let path = conn
            .path()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from);
        let scope = match &path {
            Some(path) => path.display().to_string(),
            None => format!("memory:{}", Uuid::new_v4()),
        };

        Self {
            scope,
            gate: RwLock::new(()),
            writer: Mutex::new(conn),
            readers: path.map(|path| ReaderPool {
                path,
                idle: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Names the database; data sources over the same file share it
    pub(crate) fn scope(&self) -> &str {
        &self.scope
    }

    pub(crate) fn path(&self) -> Option<&Path> {
        self.readers.as_ref().map(|readers| readers.path.as_path())
    }

    async fn gate(&self, lock: LockType) -> Gate<'_> {
        match lock {
            LockType::Read => Gate::Shared {
                _guard: self.gate.read().await,
            },
            LockType::Write => Gate::Exclusive {
                _guard: self.gate.write().await,
            },
        }
    }

    fn with_connection<T>(
        &self,
        lock: LockType,
        f: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<T> {
        match (lock, &self.readers) {
            (LockType::Read, Some(readers)) => {
                let conn = readers.checkout()?;
                let result = f(&conn);
                readers.checkin(conn);
                result
            }
            _ => {
                let conn = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
                f(&conn)
            }
        }
    }

    /// Run `f` on a blocking worker under the gate for `lock`
    pub(crate) async fn call<T, F>(self: &Arc<Self>, lock: LockType, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let _gate = self.gate(lock).await;
        let connections = self.clone();
        tokio::task::spawn_blocking(move || connections.with_connection(lock, f)).await?
    }

    /// Run one statement, interrupting it once `interrupt` fires.
    ///
    /// Returns only after the worker let go of its connection.
    pub(crate) async fn run_statement(
        self: &Arc<Self>,
        lock: LockType,
        sql: String,
        params: Vec<Value>,
        interrupt: CancellationToken,
    ) -> Result<StatementOutput> {
        let _gate = tokio::select! {
            gate = self.gate(lock) => gate,
            _ = interrupt.cancelled() => return Err(SqliteError::Interrupted),
        };

        let interrupter = Arc::new(Interrupter::new(interrupt.clone()));
        let mut worker = {
            let connections = self.clone();
            let interrupter = interrupter.clone();
            tokio::task::spawn_blocking(move || {
                connections.with_connection(lock, |conn| {
                    execute_statement(conn, &sql, &params, Some(interrupter.as_ref()))
                })
            })
        };

        tokio::select! {
            joined = &mut worker => joined?,
            _ = interrupt.cancelled() => {
                interrupter.interrupt();
                worker.await?
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_db(dir: &tempfile::TempDir) -> Arc<Connections> {
        let conn = Connection::open(dir.path().join("gate.db")).unwrap();
        conn.execute_batch("CREATE TABLE items (name TEXT); INSERT INTO items VALUES ('bolt');")
            .unwrap();
        Arc::new(Connections::new(conn))
    }

    #[test]
    fn test_scope_names_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let file = file_db(&dir);
        assert!(file.scope().ends_with("gate.db"));
        assert!(file.path().is_some());

        let first = Connections::new(Connection::open_in_memory().unwrap());
        let second = Connections::new(Connection::open_in_memory().unwrap());
        assert!(first.scope().starts_with("memory:"));
        assert_ne!(first.scope(), second.scope());
        assert!(first.path().is_none());
    }

    #[tokio::test]
    async fn test_reads_share_the_gate_and_writes_wait() {
        let dir = tempfile::tempdir().unwrap();
        let connections = file_db(&dir);
        let wait = Duration::from_millis(20);

        let _first = connections.gate(LockType::Read).await;
        assert!(tokio::time::timeout(wait, connections.gate(LockType::Read))
            .await
            .is_ok());
        assert!(tokio::time::timeout(wait, connections.gate(LockType::Write))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_reads_use_read_only_connections() {
        let dir = tempfile::tempdir().unwrap();
        let connections = file_db(&dir);

        let name: String = connections
            .call(LockType::Read, |conn| {
                Ok(conn.query_row("SELECT name FROM items", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(name, "bolt");

        let err = connections
            .call(LockType::Read, |conn| {
                Ok(conn.execute("INSERT INTO items VALUES ('nut')", [])?)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SqliteError::Sqlite(_)));
    }

    #[test]
    fn test_pool_hands_out_separate_readers() {
        let dir = tempfile::tempdir().unwrap();
        let connections = file_db(&dir);
        let readers = connections.readers.as_ref().unwrap();

        let first = readers.checkout().unwrap();
        let second = readers.checkout().unwrap();
        for conn in [&first, &second] {
            let count: i64 = conn
                .query_row("SELECT count(*) FROM items", [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 1);
        }
        readers.checkin(first);
        readers.checkin(second);
        assert_eq!(readers.idle.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_reads_use_the_writer() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE items (name TEXT)").unwrap();
        let connections = Arc::new(Connections::new(conn));

        let changed = connections
            .call(LockType::Read, |conn| {
                Ok(conn.execute("INSERT INTO items VALUES ('bolt')", [])?)
            })
            .await
            .unwrap();
        assert_eq!(changed, 1);
    }

    #[test]
    fn test_arm_refuses_after_interrupt_request() {
        let conn = Connection::open_in_memory().unwrap();
        let requested = CancellationToken::new();
        let interrupter = Interrupter::new(requested.clone());

        assert!(interrupter.arm(&conn));
        interrupter.disarm();
        requested.cancel();
        assert!(!interrupter.arm(&conn));
    }
}
