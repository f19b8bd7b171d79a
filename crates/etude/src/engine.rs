// src/engine.rs
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::address::ServerAddress;
use crate::config::{physical_cores, resolve_thread_count};
use crate::context::ServiceContext;
use crate::error::{EngineError, EngineResult};
use crate::listener::bind_all;
use crate::metrics::EngineMetrics;
use crate::worker::{WorkerHandle, WorkerThread, on_worker_thread};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Created,
    Running,
    Stopped,
}

/// Owns the worker threads and the servers bound on them.
///
/// ```rust,no_run
/// use std::time::Duration;
/// use etude::{Application, BoxError, Engine, Exchange, ServiceContext};
///
/// struct Hello;
///
/// #[etude::async_trait(?Send)]
/// impl Application for Hello {
///     async fn call(&self, exchange: &mut Exchange<'_>) -> Result<(), BoxError> {
///         exchange.write(b"hello").await?;
///         Ok(())
///     }
/// }
///
/// # fn main() -> Result<(), etude::EngineError> {
/// let mut engine = Engine::new(ServiceContext::builder(Hello).build()?);
/// engine.start(0)?;
/// let server = engine.create_server("http://127.0.0.1:8080")?;
/// println!("listening on {}", server.local_addr());
/// engine.stop(Duration::from_secs(5))?;
/// # Ok(())
/// # }
/// ```
pub struct Engine {
    ctx: Arc<ServiceContext>,
    workers: Vec<WorkerThread>,
    state: State,
    next_server_id: AtomicU64,
}

impl Engine {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self {
            ctx,
            workers: Vec::new(),
            state: State::Created,
            next_server_id: AtomicU64::new(1),
        }
    }

    /// Spawn the worker threads. `0` picks the default count; see
    /// [`resolve_thread_count`].
    pub fn start(&mut self, thread_count: i32) -> EngineResult<()> {
        if self.state != State::Created {
            return Err(EngineError::Usage("engine can only be started once"));
        }
        let count = resolve_thread_count(thread_count, physical_cores())?;

        let core_ids = if self.ctx.pin_threads() {
            core_affinity::get_core_ids().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let core = core_ids.get(i % core_ids.len().max(1)).copied();
            match WorkerThread::start(i, self.ctx.clone(), core) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    tracing::error!(worker = i, error = %e, "failed to start worker");
                    for worker in &mut workers {
                        worker.stop(Duration::ZERO);
                    }
                    self.state = State::Stopped;
                    return Err(e);
                }
            }
        }

        tracing::info!(threads = count, requested = thread_count, "engine started");
        self.workers = workers;
        self.state = State::Running;
        Ok(())
    }

    /// Bind `url` on every worker.
    ///
    /// Blocks until each worker is accepting. If any bind fails, listeners
    /// already registered are closed again and the first error is returned.
    /// Calling it from inside an [`Application`](crate::Application) is a
    /// usage error.
    pub fn create_server(&self, url: &str) -> EngineResult<ServerHandle> {
        if on_worker_thread() {
            return Err(EngineError::Usage("create_server called from a worker thread"));
        }
        match self.state {
            State::Created => return Err(EngineError::Usage("create_server called before start")),
            State::Stopped => return Err(EngineError::Usage("create_server called after stop")),
            State::Running => {}
        }

        let address = ServerAddress::parse(url)?;
        if !matches!(address.scheme.as_str(), "http" | "https") {
            return Err(EngineError::address(
                url,
                format!("unsupported scheme {:?}", address.scheme),
            ));
        }
        if address.is_https() && self.ctx.filters().is_empty() {
            tracing::warn!(%address, "https server has no connection filter, traffic is plaintext");
        }
        let socket_addr = address.socket_addr()?;

        let sockets = bind_all(socket_addr, self.workers.len()).map_err(|source| EngineError::Bind {
            address: url.to_string(),
            source,
        })?;

        let id = self.next_server_id.fetch_add(1, Ordering::Relaxed);
        let mut bound: Vec<WorkerHandle> = Vec::with_capacity(self.workers.len());
        let mut local_addr = None;

        for (worker, socket) in self.workers.iter().zip(sockets) {
            let handle = worker.handle();
            let result = match handle.listen(id, socket) {
                Ok(Ok(addr)) => Ok(addr),
                Ok(Err(source)) => Err(EngineError::Bind {
                    address: url.to_string(),
                    source,
                }),
                Err(e) => Err(e),
            };
            match result {
                Ok(addr) => {
                    local_addr.get_or_insert(addr);
                    bound.push(handle.clone());
                }
                Err(e) => {
                    for handle in &bound {
                        if let Err(e) = handle.unlisten(id) {
                            tracing::warn!(worker = handle.index(), error = %e, "failed to roll back listener");
                        }
                    }
                    return Err(e);
                }
            }
        }

        let local_addr = local_addr.ok_or(EngineError::Usage("engine has no workers"))?;
        tracing::info!(%address, %local_addr, workers = bound.len(), "server listening");

        Ok(ServerHandle {
            id,
            address,
            local_addr,
            workers: bound,
            disposed: false,
        })
    }

    /// Stop accepting, give open connections up to `timeout` to finish, then
    /// join every worker and stop the date ticker. Stopping twice is a no-op.
    pub fn stop(&mut self, timeout: Duration) -> EngineResult<()> {
        if on_worker_thread() {
            return Err(EngineError::Usage("engine cannot be stopped from a worker thread"));
        }
        if self.state != State::Running {
            self.state = State::Stopped;
            return Ok(());
        }
        tracing::info!(?timeout, "engine stopping");
        self.ctx.lifetime().stop_application();

        for worker in &self.workers {
            worker.begin_stop(timeout);
        }
        for worker in &mut self.workers {
            worker.join();
        }
        self.ctx.date_cache().stop();
        self.state = State::Stopped;

        let m = self.ctx.metrics().snapshot();
        tracing::info!(
            accepted = m.accepted_conns,
            requests = m.req_count,
            bytes_sent = m.bytes_sent,
            bad_requests = m.bad_requests,
            "engine stopped"
        );
        Ok(())
    }

    /// Number of running workers; 0 before start and after stop.
    pub fn thread_count(&self) -> usize {
        self.workers.iter().filter(|w| w.is_running()).count()
    }

    pub fn metrics(&self) -> &EngineMetrics {
        self.ctx.metrics()
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.state == State::Running {
            let _ = self.stop(Duration::ZERO);
        }
    }
}

/// A bound server. Dropping it closes its listeners on every worker.
#[derive(Debug)]
pub struct ServerHandle {
    id: u64,
    address: ServerAddress,
    local_addr: SocketAddr,
    workers: Vec<WorkerHandle>,
    disposed: bool,
}

impl ServerHandle {
    /// The address actually bound; resolves port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Stop accepting on this server. Open connections are left alone.
    ///
    /// Safe to call from inside an application: there the listeners close as
    /// soon as the worker gets back to its event loop.
    pub fn dispose(&mut self) -> EngineResult<()> {
        if std::mem::replace(&mut self.disposed, true) {
            return Ok(());
        }
        for worker in &self.workers {
            match worker.unlisten(self.id) {
                // Listeners die with their worker.
                Ok(()) | Err(EngineError::WorkerGone(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tracing::debug!(address = %self.address, "server disposed");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            tracing::warn!(address = %self.address, error = %e, "failed to dispose server");
        }
    }
}
