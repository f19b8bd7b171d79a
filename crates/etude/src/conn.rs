// src/conn.rs
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::Instrument;

use crate::context::ServiceContext;
use crate::frame::Frame;
use crate::metrics::EngineMetrics;
use crate::pool::MemoryPool;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of one accepted connection, handed to filters and the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Process-unique, increasing connection id.
    pub id: u64,
    pub peer: SocketAddr,
    pub local: SocketAddr,
    /// Index of the worker thread that owns the socket.
    pub worker: usize,
}

impl ConnectionInfo {
    pub fn new(peer: SocketAddr, local: SocketAddr, worker: usize) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            peer,
            local,
            worker,
        }
    }

    /// Info for a stream that is not backed by a socket.
    pub fn detached() -> Self {
        let unspecified = SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0));
        Self::new(unspecified, unspecified, 0)
    }
}

/// Decrements the active-connection gauge however the task ends.
struct Active(Arc<EngineMetrics>);

impl Active {
    fn enter(metrics: &Arc<EngineMetrics>) -> Self {
        metrics.inc_conn();
        Self(metrics.clone())
    }
}

impl Drop for Active {
    fn drop(&mut self) {
        self.0.dec_conn();
    }
}

/// An accepted socket, not yet filtered.
pub(crate) struct Connection {
    stream: TcpStream,
    info: ConnectionInfo,
}

impl Connection {
    pub(crate) fn new(
        stream: TcpStream,
        peer: SocketAddr,
        worker: usize,
        ctx: &ServiceContext,
    ) -> io::Result<Self> {
        if ctx.no_delay() {
            stream.set_nodelay(true)?;
        }
        let local = stream.local_addr()?;
        Ok(Self {
            stream,
            info: ConnectionInfo::new(peer, local, worker),
        })
    }

    pub(crate) fn info(&self) -> &ConnectionInfo {
        &self.info
    }

    /// Apply the filter chain and drive the frame until the socket closes.
    pub(crate) async fn serve(
        self,
        ctx: Arc<ServiceContext>,
        pool: Rc<MemoryPool>,
        drain: watch::Receiver<bool>,
    ) {
        let Connection { stream, info } = self;
        let span = tracing::debug_span!("conn", id = info.id, peer = %info.peer, worker = info.worker);

        async move {
            let _active = Active::enter(ctx.metrics());
            tracing::debug!("connection accepted");

            let stream = match ctx.filters().apply(Box::new(stream), &info).await {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(error = %e, "connection filter failed");
                    return;
                }
            };

            Frame::new(ctx.clone(), pool, stream, info, drain).run().await;
            tracing::debug!("connection closed");
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique() {
        let a = ConnectionInfo::detached();
        let b = ConnectionInfo::detached();
        assert!(b.id > a.id);
        assert!(a.peer.ip().is_unspecified());
    }

    #[test]
    fn test_active_guard_tracks_gauge() {
        let metrics = Arc::new(EngineMetrics::new());
        {
            let _a = Active::enter(&metrics);
            let _b = Active::enter(&metrics);
            assert_eq!(metrics.snapshot().active_conns, 2);
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.active_conns, 0);
        assert_eq!(snap.accepted_conns, 2);
    }
}
