//! # tether-query
//!
//! Core of the tether data-access layer: the execution, notification and
//! caching backbone shared by every concrete data source.
//!
//! ## Architecture
//!
//! - **ExecutionToken**: immutable identity of one in-flight operation
//! - **ExecutionEvent**: lifecycle transition (started, finished, canceled, errored)
//! - **EventBus**: instance-level and process-wide listener lists
//! - **ResultCache**: typed result cache keyed by operation fingerprint
//! - **ExtensionRegistry**: per-data-source, per-type singleton add-on state
//! - **DataSourceCore**: composes the above and exposes the reporting hooks
//! - **Materialization**: the pipeline materializers drive an operation through
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use tether_query::{DataSourceCore, EventBus, ExecutionToken, MemoryCache};
//!
//! # fn example() -> tether_query::Result<()> {
//! let core = DataSourceCore::builder("reporting")
//!     .cache(Arc::new(MemoryCache::new()))
//!     .global_events(Arc::new(EventBus::new()))
//!     .build()?;
//!
//! core.events().on_finished(|event| {
//!     println!("{} took {:?}", event.token(), event.duration());
//!     Ok(())
//! });
//!
//! let execution = core.begin(ExecutionToken::new("SELECT 1", vec![])?, None)?;
//! execution.finish(Some(1))?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Backend Implementation
//!
//! To implement a new backend:
//!
//! 1. Embed a `DataSourceCore` in a struct and implement `DataSource`
//! 2. Give it fluent entry points that build commands bound to the data source
//! 3. Execute each command through a `Materialization`, keyed with `fingerprint`
//!
//! Example backend crates:
//! - `tether-query-sqlite` - SQLite implementation

pub mod bus;
pub mod cache;
pub mod error;
pub mod event;
pub mod extensions;
pub mod fingerprint;
pub mod options;
pub mod pipeline;
pub mod settings;
pub mod source;
pub mod token;

// Re-export commonly used items
pub use bus::{EventBus, Listener, SubscriptionId};
pub use cache::{
    CachePolicy, CacheValue, Cached, MemoryCache, ResultCache, ResultCacheExt, TypedValue,
};
pub use error::{CommandTimeout, ExecutionFailure, QueryError, Result};
pub use event::{EventState, ExecutionEvent, ExecutionKind, ExecutionOutcome};
pub use extensions::ExtensionRegistry;
pub use fingerprint::fingerprint;
pub use options::{DeleteOptions, FilterOptions, NullHandling};
pub use pipeline::{Completed, Materialization};
pub use settings::DataSourceSettings;
pub use source::{DataSource, DataSourceCore, DataSourceCoreBuilder, Execution};
pub use token::ExecutionToken;

// Re-export external dependencies used in the public API
pub use tokio_util::sync::CancellationToken;
