use std::any::Any;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ExecutionFailure;
use crate::token::ExecutionToken;

/// Opaque caller-supplied state carried on every event, usually for logging correlation
pub type EventState = Arc<dyn Any + Send + Sync>;

/// Lifecycle transition kinds
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionKind {
    Started,
    Finished,
    Canceled,
    Errored,
}

impl ExecutionKind {
    pub const ALL: [ExecutionKind; 4] = [
        ExecutionKind::Started,
        ExecutionKind::Finished,
        ExecutionKind::Canceled,
        ExecutionKind::Errored,
    ];

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionKind::Started)
    }
}

impl fmt::Display for ExecutionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionKind::Started => write!(f, "started"),
            ExecutionKind::Finished => write!(f, "finished"),
            ExecutionKind::Canceled => write!(f, "canceled"),
            ExecutionKind::Errored => write!(f, "errored"),
        }
    }
}

/// What happened to the operation. The error lives only on `Errored`.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Started,
    Finished { rows_affected: Option<u64> },
    Canceled,
    Errored { error: ExecutionFailure },
}

impl ExecutionOutcome {
    pub fn kind(&self) -> ExecutionKind {
        match self {
            ExecutionOutcome::Started => ExecutionKind::Started,
            ExecutionOutcome::Finished { .. } => ExecutionKind::Finished,
            ExecutionOutcome::Canceled => ExecutionKind::Canceled,
            ExecutionOutcome::Errored { .. } => ExecutionKind::Errored,
        }
    }
}

/// Immutable record of one lifecycle transition, built inside a reporting hook
#[derive(Clone)]
pub struct ExecutionEvent {
    source: Arc<str>,
    token: Arc<ExecutionToken>,
    started_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    outcome: ExecutionOutcome,
    state: Option<EventState>,
}

impl ExecutionEvent {
    pub(crate) fn started(
        source: Arc<str>,
        token: Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        state: Option<EventState>,
    ) -> Self {
        Self {
            source,
            token,
            started_at,
            ended_at: None,
            outcome: ExecutionOutcome::Started,
            state,
        }
    }

    pub(crate) fn ended(
        source: Arc<str>,
        token: Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        outcome: ExecutionOutcome,
        state: Option<EventState>,
    ) -> Self {
        Self {
            source,
            token,
            started_at,
            ended_at: Some(ended_at),
            outcome,
            state,
        }
    }

    /// Name of the data source that reported the event
    pub fn source_name(&self) -> &str {
        &self.source
    }

    pub fn token(&self) -> &Arc<ExecutionToken> {
        &self.token
    }

    pub fn kind(&self) -> ExecutionKind {
        self.outcome.kind()
    }

    pub fn outcome(&self) -> &ExecutionOutcome {
        &self.outcome
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }

    pub fn rows_affected(&self) -> Option<u64> {
        match &self.outcome {
            ExecutionOutcome::Finished { rows_affected } => *rows_affected,
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExecutionFailure> {
        match &self.outcome {
            ExecutionOutcome::Errored { error } => Some(error),
            _ => None,
        }
    }

    pub fn state(&self) -> Option<&EventState> {
        self.state.as_ref()
    }

    /// Downcast the caller-supplied state
    pub fn state_as<T: Any>(&self) -> Option<&T> {
        self.state.as_ref().and_then(|state| state.downcast_ref::<T>())
    }
}

impl fmt::Debug for ExecutionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionEvent")
            .field("source", &self.source)
            .field("token", &self.token)
            .field("started_at", &self.started_at)
            .field("ended_at", &self.ended_at)
            .field("outcome", &self.outcome)
            .field("state", &self.state.as_ref().map(|_| "<state>"))
            .finish()
    }
}
