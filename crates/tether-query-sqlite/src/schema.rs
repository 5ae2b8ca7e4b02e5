//! Column metadata, cached per data source as an extension

use std::sync::Arc;

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::debug;

/// Column names of each table seen so far, in declaration order.
///
/// Stored in the data source's extension registry, so derived data sources
/// sharing the registry share the metadata too.
#[derive(Debug, Default)]
pub struct TableColumns {
    tables: DashMap<String, Arc<Vec<String>>>,
}

impl TableColumns {
    pub fn get(&self, table: &str) -> Option<Arc<Vec<String>>> {
        self.tables.get(table).map(|columns| columns.clone())
    }

    /// Load the columns of `table`, reusing a previous lookup.
    ///
    /// A table that does not exist yields an empty list and is not remembered.
    pub fn load(&self, conn: &Connection, table: &str) -> rusqlite::Result<Arc<Vec<String>>> {
        if let Some(columns) = self.get(table) {
            return Ok(columns);
        }

        let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")?;
        let columns = stmt
            .query_map([table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let columns = Arc::new(columns);
        if !columns.is_empty() {
            debug!("Loaded {} columns for table {}", columns.len(), table);
            self.tables.insert(table.to_string(), columns.clone());
        }
        Ok(columns)
    }

    /// Forget a table, e.g. after it was altered
    pub fn forget(&self, table: &str) {
        self.tables.remove(table);
    }

    pub fn clear(&self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reads_declaration_order() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE people (id INTEGER PRIMARY KEY, name TEXT, age INTEGER)")
            .unwrap();

        let cache = TableColumns::default();
        let columns = cache.load(&conn, "people").unwrap();
        assert_eq!(*columns, vec!["id", "name", "age"]);
        assert!(Arc::ptr_eq(&columns, &cache.get("people").unwrap()));
    }

    #[test]
    fn test_missing_table_is_not_remembered() {
        let conn = Connection::open_in_memory().unwrap();
        let cache = TableColumns::default();

        assert!(cache.load(&conn, "ghost").unwrap().is_empty());
        assert!(cache.get("ghost").is_none());
    }

    #[test]
    fn test_forget() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (a TEXT)").unwrap();
        let cache = TableColumns::default();
        cache.load(&conn, "t").unwrap();

        cache.forget("t");
        assert!(cache.get("t").is_none());
    }
}
