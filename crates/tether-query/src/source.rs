use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::cache::{CachePolicy, Cached, MemoryCache, ResultCache, ResultCacheExt};
use crate::error::{ExecutionFailure, QueryError, Result};
use crate::event::{EventState, ExecutionEvent, ExecutionOutcome};
use crate::extensions::ExtensionRegistry;
use crate::settings::DataSourceSettings;
use crate::token::ExecutionToken;

/// Trait implemented by every concrete data source.
///
/// Backends embed a [`DataSourceCore`] and expose it here; everything else
/// is provided.
pub trait DataSource: Send + Sync {
    /// Backend identifier (sqlite, postgres, ...)
    fn backend(&self) -> &'static str;

    /// The shared execution, cache and extension backbone
    fn core(&self) -> &DataSourceCore;

    fn name(&self) -> &str {
        self.core().name()
    }

    /// Instance-level lifecycle events
    fn events(&self) -> &EventBus {
        self.core().events()
    }

    fn invalidate_cache(&self, key: &str) -> Result<()> {
        self.core().invalidate_cache(key)
    }

    /// Typed add-on state stored on this data source
    fn extension<T>(&self) -> Result<Arc<T>>
    where
        Self: Sized,
        T: Default + Send + Sync + 'static,
    {
        self.core().extension::<T>()
    }
}

/// Builder for [`DataSourceCore`]
pub struct DataSourceCoreBuilder {
    name: String,
    settings: DataSourceSettings,
    cache: Option<Arc<dyn ResultCache>>,
    global_events: Option<Arc<EventBus>>,
    extensions: Option<Arc<ExtensionRegistry>>,
}

impl DataSourceCoreBuilder {
    pub fn settings(mut self, settings: DataSourceSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Substitute the result cache (defaults to [`MemoryCache::shared`])
    pub fn cache(mut self, cache: Arc<dyn ResultCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Substitute the process-wide bus (defaults to [`EventBus::global`])
    pub fn global_events(mut self, bus: Arc<EventBus>) -> Self {
        self.global_events = Some(bus);
        self
    }

    /// Share another data source's extension registry, as derived data sources must
    pub fn shared_extensions(mut self, extensions: Arc<ExtensionRegistry>) -> Self {
        self.extensions = Some(extensions);
        self
    }

    pub fn build(self) -> Result<DataSourceCore> {
        if self.name.trim().is_empty() {
            return Err(QueryError::invalid_argument(
                "data source name is null or empty",
            ));
        }

        debug!(
            "Creating data source {} (timeout: {:?}, strict: {}, suppress global events: {})",
            self.name,
            self.settings.default_command_timeout(),
            self.settings.strict_mode,
            self.settings.suppress_global_events
        );

        Ok(DataSourceCore {
            name: Arc::from(self.name),
            default_command_timeout: self.settings.default_command_timeout(),
            strict_mode: AtomicBool::new(self.settings.strict_mode),
            suppress_global_events: AtomicBool::new(self.settings.suppress_global_events),
            events: EventBus::new(),
            global_events: self.global_events.unwrap_or_else(EventBus::global),
            cache: self
                .cache
                .unwrap_or_else(|| MemoryCache::shared() as Arc<dyn ResultCache>),
            extensions: self.extensions.unwrap_or_default(),
        })
    }
}

/// The execution, notification and caching backbone shared by every data source
pub struct DataSourceCore {
    name: Arc<str>,
    default_command_timeout: Option<Duration>,
    strict_mode: AtomicBool,
    suppress_global_events: AtomicBool,
    events: EventBus,
    global_events: Arc<EventBus>,
    cache: Arc<dyn ResultCache>,
    extensions: Arc<ExtensionRegistry>,
}

impl DataSourceCore {
    pub fn builder(name: impl Into<String>) -> DataSourceCoreBuilder {
        DataSourceCoreBuilder {
            name: name.into(),
            settings: DataSourceSettings::default(),
            cache: None,
            global_events: None,
            extensions: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn default_command_timeout(&self) -> Option<Duration> {
        self.default_command_timeout
    }

    pub fn strict_mode(&self) -> bool {
        self.strict_mode.load(Ordering::Relaxed)
    }

    pub fn set_strict_mode(&self, strict: bool) {
        self.strict_mode.store(strict, Ordering::Relaxed);
    }

    pub fn suppress_global_events(&self) -> bool {
        self.suppress_global_events.load(Ordering::Relaxed)
    }

    pub fn set_suppress_global_events(&self, suppress: bool) {
        self.suppress_global_events.store(suppress, Ordering::Relaxed);
    }

    /// Instance-level lifecycle events
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The process-wide bus this data source reports to
    pub fn global_events(&self) -> &Arc<EventBus> {
        &self.global_events
    }

    pub fn cache(&self) -> &Arc<dyn ResultCache> {
        &self.cache
    }

    pub fn extensions(&self) -> &Arc<ExtensionRegistry> {
        &self.extensions
    }

    /// Typed add-on state, created with `T::default()` on first access
    pub fn extension<T>(&self) -> Result<Arc<T>>
    where
        T: Default + Send + Sync + 'static,
    {
        self.extensions.get_or_create::<T>()
    }

    pub fn try_read_from_cache<T>(&self, key: &str) -> Result<Option<Cached<T>>>
    where
        T: Clone + Send + Sync + 'static,
    {
        self.cache.try_read::<T>(key)
    }

    pub fn write_to_cache<T>(&self, key: &str, value: Option<T>, policy: CachePolicy) -> Result<()>
    where
        T: Send + Sync + 'static,
    {
        self.cache.write(key, value, policy)
    }

    pub fn invalidate_cache(&self, key: &str) -> Result<()> {
        self.cache.invalidate(key)
    }

    fn dispatch(&self, event: ExecutionEvent) -> Result<()> {
        self.events.dispatch(&event)?;
        if !self.suppress_global_events() {
            self.global_events.dispatch(&event)?;
        }
        Ok(())
    }

    fn check_span(started_at: DateTime<Utc>, ended_at: DateTime<Utc>) -> Result<()> {
        if ended_at < started_at {
            return Err(QueryError::invalid_argument(format!(
                "end time {} is earlier than start time {}",
                ended_at, started_at
            )));
        }
        Ok(())
    }

    /// Report that an operation has begun
    pub fn report_started(
        &self,
        token: &Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        state: Option<EventState>,
    ) -> Result<()> {
        self.dispatch(ExecutionEvent::started(
            self.name.clone(),
            token.clone(),
            started_at,
            state,
        ))
    }

    /// Report that an operation completed successfully
    pub fn report_finished(
        &self,
        token: &Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        rows_affected: Option<u64>,
        state: Option<EventState>,
    ) -> Result<()> {
        Self::check_span(started_at, ended_at)?;
        self.dispatch(ExecutionEvent::ended(
            self.name.clone(),
            token.clone(),
            started_at,
            ended_at,
            ExecutionOutcome::Finished { rows_affected },
            state,
        ))
    }

    /// Report a caller-initiated abort. Timeouts are errors, not cancellations.
    pub fn report_canceled(
        &self,
        token: &Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        state: Option<EventState>,
    ) -> Result<()> {
        Self::check_span(started_at, ended_at)?;
        self.dispatch(ExecutionEvent::ended(
            self.name.clone(),
            token.clone(),
            started_at,
            ended_at,
            ExecutionOutcome::Canceled,
            state,
        ))
    }

    /// Report that an operation failed
    pub fn report_error(
        &self,
        token: &Arc<ExecutionToken>,
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        error: ExecutionFailure,
        state: Option<EventState>,
    ) -> Result<()> {
        Self::check_span(started_at, ended_at)?;
        self.dispatch(ExecutionEvent::ended(
            self.name.clone(),
            token.clone(),
            started_at,
            ended_at,
            ExecutionOutcome::Errored { error },
            state,
        ))
    }

    /// Report `started` now and return a guard that reports exactly one terminal event
    pub fn begin(&self, token: ExecutionToken, state: Option<EventState>) -> Result<Execution<'_>> {
        let token = Arc::new(token);
        let started_at = Utc::now();
        self.report_started(&token, started_at, state.clone())?;

        Ok(Execution {
            source: self,
            token,
            started_at,
            state,
            reported: false,
        })
    }
}

/// An operation between its `started` report and its terminal report.
///
/// The terminal methods consume the guard, so a second terminal report for the
/// same token cannot be expressed. A guard dropped without one (its future was
/// dropped, for example) reports `canceled`.
pub struct Execution<'a> {
    source: &'a DataSourceCore,
    token: Arc<ExecutionToken>,
    started_at: DateTime<Utc>,
    state: Option<EventState>,
    reported: bool,
}

impl<'a> Execution<'a> {
    pub fn token(&self) -> &Arc<ExecutionToken> {
        &self.token
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Clamp so a clock step backwards cannot violate `ended_at >= started_at`
    fn ended_at(&self) -> DateTime<Utc> {
        Utc::now().max(self.started_at)
    }

    pub fn finish(mut self, rows_affected: Option<u64>) -> Result<()> {
        self.reported = true;
        self.source.report_finished(
            &self.token,
            self.started_at,
            self.ended_at(),
            rows_affected,
            self.state.clone(),
        )
    }

    pub fn cancel(mut self) -> Result<()> {
        self.reported = true;
        self.source
            .report_canceled(&self.token, self.started_at, self.ended_at(), self.state.clone())
    }

    pub fn fail(mut self, error: ExecutionFailure) -> Result<()> {
        self.reported = true;
        self.source.report_error(
            &self.token,
            self.started_at,
            self.ended_at(),
            error,
            self.state.clone(),
        )
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        if self.reported {
            return;
        }

        warn!(
            "Execution {} on {} dropped before completion, reporting canceled",
            self.token,
            self.source.name()
        );
        if let Err(e) = self.source.report_canceled(
            &self.token,
            self.started_at,
            self.ended_at(),
            self.state.clone(),
        ) {
            warn!("Failed to report dropped execution {}: {}", self.token, e);
        }
    }
}
