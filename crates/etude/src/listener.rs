// src/listener.rs
use std::cell::Cell;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::conn::Connection;
use crate::context::ServiceContext;
use crate::pool::MemoryPool;

const BACKLOG: i32 = 16384;
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(
        if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 },
        Type::STREAM,
        Some(Protocol::TCP),
    )?;
    socket.set_reuse_address(true)?;
    #[cfg(not(windows))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    Ok(socket.into())
}

/// Bind `count` listening sockets to `addr`, one per worker.
///
/// With reuse-port the kernel spreads incoming connections across the
/// sockets. Port 0 is resolved by the first bind and reused for the rest, so
/// every worker ends up on the same port.
pub(crate) fn bind_all(addr: SocketAddr, count: usize) -> io::Result<Vec<std::net::TcpListener>> {
    let first = bind_socket(addr)?;
    let addr = first.local_addr()?;
    let mut listeners = Vec::with_capacity(count);
    listeners.push(first);

    for _ in 1..count {
        #[cfg(not(windows))]
        listeners.push(bind_socket(addr)?);
        #[cfg(windows)]
        listeners.push(listeners[0].try_clone()?);
    }
    Ok(listeners)
}

/// Counts the connection tasks alive on one worker.
#[derive(Clone, Default)]
pub(crate) struct ConnectionTracker {
    inner: Rc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    open: Cell<usize>,
    idle: Notify,
}

pub(crate) struct TrackedConnection(Rc<TrackerInner>);

impl ConnectionTracker {
    pub(crate) fn enter(&self) -> TrackedConnection {
        self.inner.open.set(self.inner.open.get() + 1);
        TrackedConnection(self.inner.clone())
    }

    pub(crate) fn open(&self) -> usize {
        self.inner.open.get()
    }

    /// Resolves once no tracked connection is left.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let idle = self.inner.idle.notified();
            if self.open() == 0 {
                return;
            }
            idle.await;
        }
    }
}

impl Drop for TrackedConnection {
    fn drop(&mut self) {
        let open = self.0.open.get() - 1;
        self.0.open.set(open);
        if open == 0 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Everything an accept loop needs from its worker.
#[derive(Clone)]
pub(crate) struct WorkerScope {
    pub(crate) index: usize,
    pub(crate) ctx: Arc<ServiceContext>,
    pub(crate) pool: Rc<MemoryPool>,
    pub(crate) tracker: ConnectionTracker,
    pub(crate) drain: watch::Receiver<bool>,
}

/// An accept loop running on the worker's `LocalSet`.
pub(crate) struct Listener {
    local_addr: SocketAddr,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Register `socket` with this thread's reactor and start accepting.
    /// Must be called inside the worker's `LocalSet`.
    pub(crate) fn spawn(socket: std::net::TcpListener, scope: WorkerScope) -> io::Result<Self> {
        let listener = TcpListener::from_std(socket)?;
        let local_addr = listener.local_addr()?;
        let (stop, stop_rx) = watch::channel(false);
        let task = tokio::task::spawn_local(accept_loop(listener, scope, stop_rx));
        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and close the socket. Accepted connections keep running.
    pub(crate) async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, addr = %self.local_addr, "accept loop failed");
        }
    }
}

async fn accept_loop(listener: TcpListener, scope: WorkerScope, mut stop: watch::Receiver<bool>) {
    let addr = listener.local_addr().ok();
    tracing::debug!(worker = scope.index, ?addr, "accept loop started");

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => break,
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let conn = match Connection::new(stream, peer, scope.index, &scope.ctx) {
                            Ok(conn) => conn,
                            Err(e) => {
                                tracing::debug!(error = %e, %peer, "failed to set up connection");
                                continue;
                            }
                        };
                        tracing::trace!(id = conn.info().id, %peer, "accepted");

                        let guard = scope.tracker.enter();
                        let ctx = scope.ctx.clone();
                        let pool = scope.pool.clone();
                        let drain = scope.drain.clone();
                        tokio::task::spawn_local(async move {
                            let _guard = guard;
                            conn.serve(ctx, pool, drain).await;
                        });
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "TCP accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                }
            }
        }
    }

    tracing::debug!(worker = scope.index, ?addr, "accept loop stopped");
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, TcpListener as StdListener};

    use super::*;

    #[test]
    fn test_bind_all_shares_one_port() {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, 0));
        let listeners = bind_all(addr, 3).unwrap();
        assert_eq!(listeners.len(), 3);
        let port = listeners[0].local_addr().unwrap().port();
        assert_ne!(port, 0);
        for l in &listeners {
            assert_eq!(l.local_addr().unwrap().port(), port);
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_bind_conflict_is_reported() {
        // A plain std listener does not set reuse-port, so binding next to it fails.
        let taken = StdListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let err = bind_all(taken.local_addr().unwrap(), 2).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn test_tracker_waits_for_last_connection() {
        let tracker = ConnectionTracker::default();
        tracker.wait_idle().await;

        let a = tracker.enter();
        let b = tracker.enter();
        assert_eq!(tracker.open(), 2);

        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                tokio::task::spawn_local(async move {
                    tokio::task::yield_now().await;
                    drop(a);
                    tokio::task::yield_now().await;
                    drop(b);
                });
                tokio::time::timeout(Duration::from_secs(5), tracker.wait_idle())
                    .await
                    .unwrap();
            })
            .await;
        assert_eq!(tracker.open(), 0);
    }
}
