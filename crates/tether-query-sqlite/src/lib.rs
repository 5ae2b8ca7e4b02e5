//! SQLite backend for tether-query
//!
//! Implements `DataSource` over a `rusqlite` writer connection (plus
//! read-only readers for file databases) and exposes fluent command builders
//! (`sql`, `sql_with_lock`, `from`, `from_filter`, `from_where`, `insert`,
//! `delete`) whose materializers run through the core pipeline.
//!
//! ```rust,no_run
//! use serde_json::json;
//! use tether_query::{CachePolicy, DataSourceSettings};
//! use tether_query_sqlite::SqliteDataSource;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ds = SqliteDataSource::open("app.db", "app", DataSourceSettings::default())?;
//! let rows = ds
//!     .from_where("users", "age > ?", vec![json!(30)])
//!     .with_cache(CachePolicy::Indefinite)
//!     .to_rows()
//!     .await?;
//! # Ok(())
//! # }
//! ```

mod command;
mod connection;
mod error;
mod schema;
mod source;
mod value;

pub use command::SqliteCommand;
pub use connection::LockType;
pub use error::{Result, SqliteError};
pub use schema::TableColumns;
pub use source::SqliteDataSource;
pub use value::DataRow;
