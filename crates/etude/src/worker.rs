// src/worker.rs
//! Worker threads: one OS thread, one current-thread tokio runtime and one
//! `LocalSet` each. Connections accepted on a worker live and die there.

use std::cell::Cell;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::LocalSet;

use crate::context::ServiceContext;
use crate::error::{EngineError, EngineResult};
use crate::listener::{ConnectionTracker, Listener, WorkerScope};
use crate::pool::MemoryPool;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// True on a worker thread, where blocking on a worker reply can deadlock.
pub(crate) fn on_worker_thread() -> bool {
    ON_WORKER.with(Cell::get)
}

pub(crate) enum Command {
    Listen {
        id: u64,
        socket: std::net::TcpListener,
        reply: std_mpsc::Sender<io::Result<SocketAddr>>,
    },
    Unlisten {
        id: u64,
        reply: std_mpsc::Sender<()>,
    },
    Stop {
        timeout: Duration,
    },
}

/// Cloneable control channel to a running worker.
#[derive(Clone, Debug)]
pub(crate) struct WorkerHandle {
    index: usize,
    commands: mpsc::UnboundedSender<Command>,
}

impl WorkerHandle {
    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Hand a bound socket to the worker and wait until it accepts on it.
    pub(crate) fn listen(&self, id: u64, socket: std::net::TcpListener) -> EngineResult<io::Result<SocketAddr>> {
        if on_worker_thread() {
            return Err(EngineError::Usage("servers cannot be created from a worker thread"));
        }
        let (reply, rx) = std_mpsc::channel();
        self.send(Command::Listen { id, socket, reply })?;
        rx.recv().map_err(|_| EngineError::WorkerGone(self.index))
    }

    /// Close the listener registered under `id`. Unknown ids are ignored.
    ///
    /// On a worker thread the command is only queued: the listener closes
    /// once the calling task yields.
    pub(crate) fn unlisten(&self, id: u64) -> EngineResult<()> {
        let (reply, rx) = std_mpsc::channel();
        self.send(Command::Unlisten { id, reply })?;
        if on_worker_thread() {
            return Ok(());
        }
        rx.recv().map_err(|_| EngineError::WorkerGone(self.index))
    }

    fn send(&self, command: Command) -> EngineResult<()> {
        self.commands
            .send(command)
            .map_err(|_| EngineError::WorkerGone(self.index))
    }
}

pub(crate) struct WorkerThread {
    handle: WorkerHandle,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerThread {
    /// Spawn the worker and wait for its event loop to come up.
    pub(crate) fn start(
        index: usize,
        ctx: Arc<ServiceContext>,
        core: Option<core_affinity::CoreId>,
    ) -> EngineResult<Self> {
        let (commands, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();

        let thread = thread::Builder::new()
            .name(format!("etude-worker-{index}"))
            .spawn(move || run(index, ctx, core, rx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                handle: WorkerHandle { index, commands },
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e.into())
            }
            Err(_) => {
                let _ = thread.join();
                Err(EngineError::WorkerGone(index))
            }
        }
    }

    pub(crate) fn handle(&self) -> &WorkerHandle {
        &self.handle
    }

    /// Ask the worker to stop: listeners close at once, open connections get
    /// up to `timeout` to finish. Does not wait; see [`join`](Self::join).
    pub(crate) fn begin_stop(&self, timeout: Duration) {
        if self.thread.is_some() {
            // A closed channel means the loop already exited.
            let _ = self.handle.send(Command::Stop { timeout });
        }
    }

    /// Wait for the OS thread to exit. Idempotent.
    pub(crate) fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!(worker = self.handle.index, "worker thread panicked");
            }
        }
    }

    pub(crate) fn stop(&mut self, timeout: Duration) {
        self.begin_stop(timeout);
        self.join();
    }

    pub(crate) fn is_running(&self) -> bool {
        self.thread.is_some()
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop(Duration::ZERO);
    }
}

fn run(
    index: usize,
    ctx: Arc<ServiceContext>,
    core: Option<core_affinity::CoreId>,
    commands: mpsc::UnboundedReceiver<Command>,
    ready: std_mpsc::Sender<io::Result<()>>,
) {
    let _dispatch = tracing::dispatcher::set_default(ctx.dispatch());
    ON_WORKER.with(|flag| flag.set(true));

    if let Some(id) = core {
        if core_affinity::set_for_current(id) {
            tracing::debug!(worker = index, core = id.id, "worker pinned");
        } else {
            tracing::warn!(worker = index, core = id.id, "failed to pin worker");
        }
    }

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    if ready.send(Ok(())).is_err() {
        return;
    }

    let local = LocalSet::new();
    local.block_on(&rt, event_loop(index, ctx, commands));
    // Dropping the LocalSet closes whatever connections outlived the deadline.
    drop(local);
    tracing::debug!(worker = index, "worker stopped");
}

async fn event_loop(index: usize, ctx: Arc<ServiceContext>, mut commands: mpsc::UnboundedReceiver<Command>) {
    let pool = Rc::new(MemoryPool::new(ctx.limits().block_size));
    let tracker = ConnectionTracker::default();
    let (drain_tx, drain_rx) = watch::channel(false);
    let scope = WorkerScope {
        index,
        ctx,
        pool: pool.clone(),
        tracker: tracker.clone(),
        drain: drain_rx,
    };
    let mut listeners: HashMap<u64, Listener> = HashMap::new();
    let mut timeout = Duration::ZERO;

    tracing::debug!(worker = index, "worker event loop started");

    while let Some(command) = commands.recv().await {
        match command {
            Command::Listen { id, socket, reply } => {
                let result = Listener::spawn(socket, scope.clone()).map(|listener| {
                    let addr = listener.local_addr();
                    listeners.insert(id, listener);
                    addr
                });
                let _ = reply.send(result);
            }
            Command::Unlisten { id, reply } => {
                if let Some(listener) = listeners.remove(&id) {
                    listener.stop().await;
                }
                let _ = reply.send(());
            }
            Command::Stop { timeout: t } => {
                timeout = t;
                break;
            }
        }
    }

    for (_, listener) in listeners.drain() {
        listener.stop().await;
    }

    drain_tx.send_replace(true);
    let open = tracker.open();
    if open > 0 {
        tracing::debug!(worker = index, open, ?timeout, "draining connections");
        if tokio::time::timeout(timeout, tracker.wait_idle()).await.is_err() {
            tracing::warn!(
                worker = index,
                open = tracker.open(),
                "shutdown timeout elapsed, closing remaining connections"
            );
        }
    }

    tracing::debug!(
        worker = index,
        blocks = pool.allocated(),
        high_water = pool.high_water(),
        "worker pool released"
    );
}
