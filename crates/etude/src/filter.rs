// src/filter.rs
//! Connection filters: transforms applied to the raw transport stream before
//! any HTTP bytes are parsed (TLS termination, tracing taps, rate shaping).

use std::io;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::conn::ConnectionInfo;

/// Any bidirectional byte stream the engine can drive.
pub trait Duplex: AsyncRead + AsyncWrite + Unpin {}

impl<T: AsyncRead + AsyncWrite + Unpin + ?Sized> Duplex for T {}

pub type BoxedStream = Box<dyn Duplex>;

/// Filter backend trait for pluggable transport transforms.
///
/// Filters run on the worker thread that accepted the socket, so the stream
/// they return does not need to be `Send`.
#[async_trait::async_trait(?Send)]
pub trait ConnectionFilter: Send + Sync {
    /// Wrap `stream`, or return it unchanged.
    async fn apply(&self, stream: BoxedStream, info: &ConnectionInfo) -> io::Result<BoxedStream>;
}

/// Ordered list of filters; empty means pass-through.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn ConnectionFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, filter: Arc<dyn ConnectionFilter>) {
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Run every filter in insertion order; the first failure aborts the connection.
    pub async fn apply(&self, mut stream: BoxedStream, info: &ConnectionInfo) -> io::Result<BoxedStream> {
        for filter in &self.filters {
            stream = filter.apply(stream, info).await?;
        }
        Ok(stream)
    }
}

impl std::fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilterChain")
            .field("filters", &self.filters.len())
            .finish()
    }
}
