//! Data source configuration knobs

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings recognized by every data source.
/// All fields have sensible defaults so a bare `{}` deserializes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceSettings {
    /// Default command timeout in milliseconds; `None` waits indefinitely
    pub default_command_timeout_ms: Option<u64>,

    /// Treat object members that do not map to a column as errors
    pub strict_mode: bool,

    /// Skip process-wide listeners for this data source
    pub suppress_global_events: bool,
}

impl DataSourceSettings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_command_timeout(mut self, timeout: Duration) -> Self {
        self.default_command_timeout_ms = Some(timeout.as_millis().min(u64::MAX as u128) as u64);
        self
    }

    pub fn with_strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn with_suppress_global_events(mut self, suppress: bool) -> Self {
        self.suppress_global_events = suppress;
        self
    }

    pub fn default_command_timeout(&self) -> Option<Duration> {
        self.default_command_timeout_ms.map(Duration::from_millis)
    }
}
