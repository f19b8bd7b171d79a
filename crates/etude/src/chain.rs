// src/chain.rs
//! Logical byte buffer spanning a chain of fixed-size pool blocks.
//!
//! Reads land in the tail block; once it fills, another block is leased
//! instead of growing anything. Consumed blocks go straight back to the pool.

use std::collections::VecDeque;

use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::pool::{MemoryBlock, MemoryPool};

#[derive(Debug, Default)]
pub struct BlockChain {
    blocks: VecDeque<MemoryBlock>,
    len: usize,
}

impl BlockChain {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of blocks currently held.
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Free space at the tail, leasing a fresh block when the tail is full.
    pub fn reserve(&mut self, pool: &MemoryPool) -> &mut [u8] {
        let needs_block = self.blocks.back().is_none_or(|b| b.is_full());
        if needs_block {
            self.blocks.push_back(pool.lease());
        }
        match self.blocks.back_mut() {
            Some(block) => block.writable(),
            None => unreachable!("a block was just pushed"),
        }
    }

    /// Commit `n` bytes written into the slice returned by [`reserve`](Self::reserve).
    pub fn commit(&mut self, n: usize) {
        if let Some(block) = self.blocks.back_mut() {
            block.commit(n);
            self.len += n;
        }
    }

    /// Copy `data` onto the end of the chain.
    pub fn extend_from_slice(&mut self, pool: &MemoryPool, mut data: &[u8]) {
        while !data.is_empty() {
            let slot = self.reserve(pool);
            let n = slot.len().min(data.len());
            slot[..n].copy_from_slice(&data[..n]);
            self.commit(n);
            data = &data[n..];
        }
    }

    /// Offset of the first occurrence of `needle`.
    pub fn find(&self, needle: u8) -> Option<usize> {
        let mut offset = 0;
        for block in &self.blocks {
            let bytes = block.readable();
            if let Some(pos) = memchr::memchr(needle, bytes) {
                return Some(offset + pos);
            }
            offset += bytes.len();
        }
        None
    }

    /// Byte at logical offset `idx`.
    pub fn get(&self, mut idx: usize) -> Option<u8> {
        for block in &self.blocks {
            let bytes = block.readable();
            if idx < bytes.len() {
                return Some(bytes[idx]);
            }
            idx -= bytes.len();
        }
        None
    }

    /// Append the first `n` bytes to `out` without consuming them.
    pub fn copy_prefix(&self, n: usize, out: &mut Vec<u8>) {
        let mut remaining = n.min(self.len);
        for block in &self.blocks {
            if remaining == 0 {
                break;
            }
            let bytes = block.readable();
            let take = bytes.len().min(remaining);
            out.extend_from_slice(&bytes[..take]);
            remaining -= take;
        }
    }

    /// Drop `n` bytes from the front, returning emptied blocks to `pool`.
    pub fn consume(&mut self, pool: &MemoryPool, mut n: usize) {
        n = n.min(self.len);
        self.len -= n;
        while n > 0 {
            let Some(front) = self.blocks.front_mut() else {
                break;
            };
            let take = front.len().min(n);
            front.advance(take);
            n -= take;
            if front.is_empty() && (front.is_full() || self.blocks.len() > 1) {
                if let Some(block) = self.blocks.pop_front() {
                    pool.give_back(block);
                }
            }
        }
    }

    /// Move up to `buf.len()` bytes out of the chain.
    pub fn read_into(&mut self, pool: &MemoryPool, buf: &mut [u8]) -> usize {
        let mut copied = 0;
        for block in &self.blocks {
            if copied == buf.len() {
                break;
            }
            let bytes = block.readable();
            let take = bytes.len().min(buf.len() - copied);
            buf[copied..copied + take].copy_from_slice(&bytes[..take]);
            copied += take;
        }
        self.consume(pool, copied);
        copied
    }

    /// Readable bytes, block by block.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.blocks.iter().map(|b| b.readable()).filter(|b| !b.is_empty())
    }

    /// Write everything to `io`, returning each block once it is on the wire.
    pub async fn write_to<W>(&mut self, pool: &MemoryPool, io: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut written = 0;
        while let Some(block) = self.blocks.pop_front() {
            let res = io.write_all(block.readable()).await;
            let n = block.len();
            pool.give_back(block);
            self.len -= n;
            res?;
            written += n;
        }
        Ok(written)
    }

    /// Return every block to the pool.
    pub fn release(&mut self, pool: &MemoryPool) {
        for block in self.blocks.drain(..) {
            pool.give_back(block);
        }
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_spans_blocks() {
        let pool = MemoryPool::new(64);
        let mut chain = BlockChain::new();
        let data: Vec<u8> = (0..200u8).collect();
        chain.extend_from_slice(&pool, &data);

        assert_eq!(chain.len(), 200);
        assert_eq!(chain.block_count(), 4);
        assert_eq!(chain.get(130), Some(130));
        assert_eq!(chain.find(199), Some(199));

        let mut out = Vec::new();
        chain.copy_prefix(70, &mut out);
        assert_eq!(out, &data[..70]);

        chain.consume(&pool, 130);
        assert_eq!(chain.len(), 70);
        assert_eq!(chain.get(0), Some(130));
        // Two fully consumed blocks are back in the pool.
        assert_eq!(pool.available(), 2);

        chain.release(&pool);
        assert_eq!(pool.leased(), 0);
    }

    #[test]
    fn test_read_into_consumes() {
        let pool = MemoryPool::new(64);
        let mut chain = BlockChain::new();
        chain.extend_from_slice(&pool, b"hello world");

        let mut buf = [0u8; 5];
        assert_eq!(chain.read_into(&pool, &mut buf), 5);
        assert_eq!(&buf, b"hello");
        assert_eq!(chain.len(), 6);
        assert_eq!(chain.find(b'w'), Some(1));
        chain.release(&pool);
    }

    #[test]
    fn test_partial_tail_block_is_kept_for_reads() {
        let pool = MemoryPool::new(64);
        let mut chain = BlockChain::new();
        chain.extend_from_slice(&pool, b"abc");
        chain.consume(&pool, 3);
        assert!(chain.is_empty());
        // The tail block still has room, so it stays leased.
        assert_eq!(chain.block_count(), 1);
        let slot = chain.reserve(&pool);
        assert_eq!(slot.len(), 61);
        chain.release(&pool);
    }

    #[tokio::test]
    async fn test_write_to_returns_blocks() {
        let pool = MemoryPool::new(64);
        let mut chain = BlockChain::new();
        chain.extend_from_slice(&pool, &[7u8; 150]);

        let mut sink = Vec::new();
        let n = chain.write_to(&pool, &mut sink).await.unwrap();
        assert_eq!(n, 150);
        assert_eq!(sink.len(), 150);
        assert!(chain.is_empty());
        assert_eq!(pool.leased(), 0);
    }
}
