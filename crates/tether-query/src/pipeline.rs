//! The backbone every materializer runs through.
//!
//! A [`Materialization`] takes one prepared operation and drives it through
//! the cache and the lifecycle hooks:
//!
//! 1. cache-first read when a cache key is set (a hit skips execution and events)
//! 2. `started`
//! 3. the backend work, raced against the command timeout and the cancellation token
//! 4. on success: requested invalidations
//! 5. exactly one of `finished`, `errored` (including timeouts) or `canceled`
//! 6. cache write, once `finished` was delivered
//!
//! Work started with [`Materialization::run_interruptible`] is told to stop
//! when the timeout or the cancellation wins, and is awaited before anything
//! is reported. Work that completes anyway is reported as finished.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::CachePolicy;
use crate::error::{CommandTimeout, ExecutionFailure, QueryError, Result};
use crate::event::EventState;
use crate::source::DataSourceCore;
use crate::token::ExecutionToken;

/// Result of the backend work: the materialized value plus the row count to report
#[derive(Debug, Clone, PartialEq)]
pub struct Completed<T> {
    pub value: Option<T>,
    pub rows_affected: Option<u64>,
}

impl<T> Completed<T> {
    pub fn value(value: T) -> Self {
        Self {
            value: Some(value),
            rows_affected: None,
        }
    }

    pub fn absent() -> Self {
        Self {
            value: None,
            rows_affected: None,
        }
    }

    pub fn with_rows_affected(mut self, rows: u64) -> Self {
        self.rows_affected = Some(rows);
        self
    }
}

enum Race<T, E> {
    Done(std::result::Result<Completed<T>, E>),
    TimedOut(Duration),
    Canceled,
}

/// One pass of an operation through cache, execution and reporting
pub struct Materialization<'a> {
    source: &'a DataSourceCore,
    token: ExecutionToken,
    cache: Option<(String, CachePolicy)>,
    invalidates: Vec<String>,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
    state: Option<EventState>,
}

impl<'a> Materialization<'a> {
    /// The command timeout starts out as the data source default
    pub fn new(source: &'a DataSourceCore, token: ExecutionToken) -> Self {
        Self {
            source,
            token,
            cache: None,
            invalidates: Vec::new(),
            timeout: source.default_command_timeout(),
            cancellation: None,
            state: None,
        }
    }

    pub fn token(&self) -> &ExecutionToken {
        &self.token
    }

    pub fn with_cache(mut self, key: impl Into<String>, policy: CachePolicy) -> Self {
        self.cache = Some((key.into(), policy));
        self
    }

    /// Invalidate `key` once the operation succeeds
    pub fn invalidates(mut self, key: impl Into<String>) -> Self {
        self.invalidates.push(key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub fn with_state(mut self, state: Option<EventState>) -> Self {
        self.state = state;
        self
    }

    /// Run `work` and report its outcome.
    ///
    /// Backend errors reach listeners and the caller as the same
    /// [`ExecutionFailure`] inside [`QueryError::Execution`]. On timeout or
    /// cancellation `work` is dropped where it stands.
    pub async fn run<T, E, F>(self, work: F) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Future<Output = std::result::Result<Completed<T>, E>>,
    {
        self.drive(work, None).await
    }

    /// Like [`run`](Self::run), for work that can be stopped part way.
    ///
    /// `work` receives a token that fires when the timeout or the
    /// cancellation wins. The pipeline then waits for `work` to settle: an
    /// error is reported as the timeout or cancellation, a success as
    /// finished, since the backend did complete it.
    pub async fn run_interruptible<T, E, F, W>(self, work: W) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Future<Output = std::result::Result<Completed<T>, E>>,
        W: FnOnce(CancellationToken) -> F,
    {
        let interrupt = CancellationToken::new();
        let work = work(interrupt.clone());
        self.drive(work, Some(interrupt)).await
    }

    async fn drive<T, E, F>(
        self,
        work: F,
        interrupt: Option<CancellationToken>,
    ) -> Result<Option<T>>
    where
        T: Clone + Send + Sync + 'static,
        E: std::error::Error + Send + Sync + 'static,
        F: Future<Output = std::result::Result<Completed<T>, E>>,
    {
        let Materialization {
            source,
            token,
            cache,
            invalidates,
            timeout,
            cancellation,
            state,
        } = self;

        if let Some((key, _)) = &cache {
            if let Some(hit) = source.try_read_from_cache::<T>(key)? {
                debug!("Serving {} from cache key {}", token, key);
                return Ok(hit.into_option());
            }
        }

        let execution = source.begin(token, state)?;

        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };
        let canceled = async {
            match &cancellation {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::pin!(work);
        let mut race = tokio::select! {
            biased;
            _ = canceled => Race::Canceled,
            _ = deadline => Race::TimedOut(timeout.unwrap_or_default()),
            result = &mut work => Race::Done(result),
        };

        let stopped = matches!(race, Race::TimedOut(_) | Race::Canceled);
        if let Some(interrupt) = interrupt.filter(|_| stopped) {
            interrupt.cancel();
            if let Ok(completed) = work.await {
                debug!("{} completed before it could be interrupted", execution.token());
                race = Race::Done(Ok(completed));
            }
        }

        match race {
            Race::Done(Ok(completed)) => {
                // Before `finished`: a failing listener must not leave stale entries
                let invalidated = invalidates
                    .iter()
                    .try_for_each(|key| source.invalidate_cache(key));
                execution.finish(completed.rows_affected)?;
                invalidated?;

                if let Some((key, policy)) = cache {
                    source.write_to_cache(&key, completed.value.clone(), policy)?;
                }
                Ok(completed.value)
            }
            Race::Done(Err(e)) => {
                let failure = ExecutionFailure::new(e);
                execution.fail(failure.clone())?;
                Err(QueryError::Execution(failure))
            }
            Race::TimedOut(limit) => {
                execution.fail(ExecutionFailure::new(CommandTimeout(limit)))?;
                Err(QueryError::Timeout(limit))
            }
            Race::Canceled => {
                execution.cancel()?;
                Err(QueryError::Canceled)
            }
        }
    }
}
