// src/upgrade.rs
//! The raw stream handed to the application after `101 Switching Protocols`.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::filter::BoxedStream;

/// An upgraded connection.
///
/// Reads first drain whatever the client sent after the request head before
/// the switch (the peer may pipeline its first frames); after that, reads and
/// writes go straight to the transport.
pub struct Upgraded {
    prefix: Bytes,
    io: BoxedStream,
}

impl Upgraded {
    pub(crate) fn new(prefix: Bytes, io: BoxedStream) -> Self {
        Self { prefix, io }
    }

    /// Bytes buffered before the switch that have not been read yet.
    pub fn buffered(&self) -> &[u8] {
        &self.prefix
    }

    pub fn into_parts(self) -> (Bytes, BoxedStream) {
        (self.prefix, self.io)
    }
}

impl AsyncRead for Upgraded {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            buf.put_slice(&self.prefix[..n]);
            self.prefix.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Upgraded {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

impl std::fmt::Debug for Upgraded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upgraded")
            .field("buffered", &self.prefix.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_prefix_is_read_first() {
        let (mut client, server) = tokio::io::duplex(64);
        let mut upgraded = Upgraded::new(Bytes::from_static(b"early"), Box::new(server));
        assert_eq!(upgraded.buffered(), b"early");

        client.write_all(b" late").await.unwrap();
        let mut buf = [0u8; 10];
        upgraded.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"early late");

        upgraded.write_all(b"pong").await.unwrap();
        let mut back = [0u8; 4];
        client.read_exact(&mut back).await.unwrap();
        assert_eq!(&back, b"pong");
    }
}
