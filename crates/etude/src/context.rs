// src/context.rs
//! Service context: the immutable bundle every worker and connection shares.

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::{EngineConfig, ServerLimits};
use crate::date::DateHeaderCache;
use crate::error::EngineResult;
use crate::filter::{ConnectionFilter, FilterChain};
use crate::frame::Application;
use crate::metrics::EngineMetrics;

/// Application lifetime hook.
///
/// The engine trips it at the start of `stop`; long-running application
/// callbacks can watch it to cut their work short.
#[derive(Clone, Debug)]
pub struct Lifetime {
    stopping: Arc<watch::Sender<bool>>,
}

impl Default for Lifetime {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifetime {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            stopping: Arc::new(tx),
        }
    }

    pub fn stop_application(&self) {
        self.stopping.send_replace(true);
    }

    pub fn is_stopping(&self) -> bool {
        *self.stopping.borrow()
    }

    /// Resolves once [`stop_application`](Self::stop_application) has been called.
    pub async fn stopping(&self) {
        let mut rx = self.stopping.subscribe();
        // The sender lives in `self`, so this only ends on a value change.
        let _ = rx.wait_for(|stopping| *stopping).await;
    }
}

pub struct ServiceContext {
    app: Arc<dyn Application>,
    lifetime: Lifetime,
    filters: FilterChain,
    date: DateHeaderCache,
    limits: ServerLimits,
    no_delay: bool,
    add_server_header: bool,
    pin_threads: bool,
    dispatch: tracing::Dispatch,
    metrics: Arc<EngineMetrics>,
}

impl ServiceContext {
    pub fn builder(app: impl Application) -> ServiceContextBuilder {
        ServiceContextBuilder::new(Arc::new(app))
    }

    pub fn application(&self) -> &Arc<dyn Application> {
        &self.app
    }

    pub fn lifetime(&self) -> &Lifetime {
        &self.lifetime
    }

    pub fn filters(&self) -> &FilterChain {
        &self.filters
    }

    pub fn date_cache(&self) -> &DateHeaderCache {
        &self.date
    }

    pub fn limits(&self) -> &ServerLimits {
        &self.limits
    }

    /// Disable Nagle's algorithm on accepted sockets.
    pub fn no_delay(&self) -> bool {
        self.no_delay
    }

    pub fn add_server_header(&self) -> bool {
        self.add_server_header
    }

    pub fn pin_threads(&self) -> bool {
        self.pin_threads
    }

    /// Trace sink installed on every worker thread.
    pub fn dispatch(&self) -> &tracing::Dispatch {
        &self.dispatch
    }

    pub fn metrics(&self) -> &Arc<EngineMetrics> {
        &self.metrics
    }
}

impl std::fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceContext")
            .field("filters", &self.filters)
            .field("date", &self.date)
            .field("limits", &self.limits)
            .field("no_delay", &self.no_delay)
            .field("add_server_header", &self.add_server_header)
            .field("pin_threads", &self.pin_threads)
            .finish_non_exhaustive()
    }
}

#[must_use]
pub struct ServiceContextBuilder {
    app: Arc<dyn Application>,
    lifetime: Lifetime,
    filters: FilterChain,
    date: Option<DateHeaderCache>,
    limits: ServerLimits,
    no_delay: bool,
    add_server_header: bool,
    pin_threads: bool,
    dispatch: Option<tracing::Dispatch>,
}

impl ServiceContextBuilder {
    fn new(app: Arc<dyn Application>) -> Self {
        Self {
            app,
            lifetime: Lifetime::new(),
            filters: FilterChain::new(),
            date: None,
            limits: ServerLimits::default(),
            no_delay: true,
            add_server_header: true,
            pin_threads: false,
            dispatch: None,
        }
    }

    /// Take limits and socket options from a loaded configuration.
    pub fn config(mut self, config: &EngineConfig) -> Self {
        self.limits = config.limits();
        self.no_delay = config.no_delay;
        self.add_server_header = config.add_server_header;
        self.pin_threads = config.pin_threads;
        self
    }

    pub fn lifetime(mut self, lifetime: Lifetime) -> Self {
        self.lifetime = lifetime;
        self
    }

    /// Append a connection filter; filters run in the order they are added.
    pub fn filter(mut self, filter: impl ConnectionFilter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn date_cache(mut self, date: DateHeaderCache) -> Self {
        self.date = Some(date);
        self
    }

    pub fn limits(mut self, limits: ServerLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn no_delay(mut self, enabled: bool) -> Self {
        self.no_delay = enabled;
        self
    }

    pub fn add_server_header(mut self, enabled: bool) -> Self {
        self.add_server_header = enabled;
        self
    }

    pub fn pin_threads(mut self, enabled: bool) -> Self {
        self.pin_threads = enabled;
        self
    }

    /// Route engine logs to `dispatch` instead of the caller's default subscriber.
    pub fn dispatch(mut self, dispatch: tracing::Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Freeze the context. Fails on unusable limits; starts a date ticker
    /// unless one was supplied.
    pub fn build(self) -> EngineResult<Arc<ServiceContext>> {
        self.limits.validate()?;
        let date = match self.date {
            Some(date) => date,
            None => DateHeaderCache::start()?,
        };
        let dispatch = self
            .dispatch
            .unwrap_or_else(|| tracing::dispatcher::get_default(|d| d.clone()));

        Ok(Arc::new(ServiceContext {
            app: self.app,
            lifetime: self.lifetime,
            filters: self.filters,
            date,
            limits: self.limits,
            no_delay: self.no_delay,
            add_server_header: self.add_server_header,
            pin_threads: self.pin_threads,
            dispatch,
            metrics: Arc::new(EngineMetrics::new()),
        }))
    }
}
