//! Options handed to conditional and delete-style command builders.
//!
//! The core never interprets these; materializers must apply them the same
//! way for every backend.

use serde::{Deserialize, Serialize};

/// How a null member of a filter object is matched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullHandling {
    /// A null member adds no predicate
    #[default]
    IgnoreNulls,
    /// A null member becomes `column IS NULL`
    MatchNulls,
}

/// Options for filter-object queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub null_handling: NullHandling,
}

impl FilterOptions {
    pub fn match_nulls() -> Self {
        Self {
            null_handling: NullHandling::MatchNulls,
        }
    }
}

/// Options for delete commands
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    pub null_handling: NullHandling,
    /// Fail the execution when no row was deleted
    pub check_rows_affected: bool,
}

impl DeleteOptions {
    pub fn checked() -> Self {
        Self {
            check_rows_affected: true,
            ..Self::default()
        }
    }

    pub fn with_null_handling(mut self, null_handling: NullHandling) -> Self {
        self.null_handling = null_handling;
        self
    }
}

impl From<DeleteOptions> for FilterOptions {
    fn from(options: DeleteOptions) -> Self {
        Self {
            null_handling: options.null_handling,
        }
    }
}
