// src/pool.rs
use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};

/// Default block size for socket reads and response writes.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;
/// Smallest block a pool hands out.
pub const MIN_BLOCK_SIZE: usize = 64;

static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// A fixed-capacity byte buffer leased from a [`MemoryPool`].
///
/// The readable region is `start..end`; bytes past `end` are free space for
/// the next read. The capacity never changes while the block is leased.
pub struct MemoryBlock {
    data: Box<[u8]>,
    slot: u32,
    pool: u32,
    start: usize,
    end: usize,
}

impl MemoryBlock {
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written into the block and not yet consumed.
    #[inline(always)]
    pub fn readable(&self) -> &[u8] {
        &self.data[self.start..self.end]
    }

    /// Free tail of the block, ready to receive bytes.
    #[inline(always)]
    pub fn writable(&mut self) -> &mut [u8] {
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the writable tail as filled.
    #[inline(always)]
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.end + n <= self.data.len());
        self.end = (self.end + n).min(self.data.len());
    }

    /// Drop `n` bytes from the front of the readable region.
    #[inline(always)]
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.start + n <= self.end);
        self.start = (self.start + n).min(self.end);
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.end == self.data.len()
    }

    fn reset(&mut self) {
        self.start = 0;
        self.end = 0;
    }
}

impl std::fmt::Debug for MemoryBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBlock")
            .field("pool", &self.pool)
            .field("slot", &self.slot)
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .finish()
    }
}

enum Slot {
    /// Sitting in the pool. `next` links the free list.
    Free { buf: Box<[u8]>, next: Option<u32> },
    Leased,
}

struct Slab {
    entries: Vec<Slot>,
    head_free: Option<u32>,
    leased: usize,
    high_water: usize,
}

/// Slab of fixed-size blocks owned by one worker thread.
///
/// `lease` never blocks: when the free list is empty a new block is
/// allocated, so the pool grows to the high-water mark of concurrently
/// leased blocks and never shrinks. The pool is `!Sync`; each worker thread
/// owns its own instance.
pub struct MemoryPool {
    id: u32,
    block_size: usize,
    slab: RefCell<Slab>,
}

impl MemoryPool {
    pub fn new(block_size: usize) -> Self {
        Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            block_size: block_size.max(MIN_BLOCK_SIZE),
            slab: RefCell::new(Slab {
                entries: Vec::new(),
                head_free: None,
                leased: 0,
                high_water: 0,
            }),
        }
    }

    /// O(1) lease: pops the free list head or allocates a fresh block.
    pub fn lease(&self) -> MemoryBlock {
        let mut slab = self.slab.borrow_mut();

        let (slot, data) = match slab.head_free {
            Some(idx) => {
                let entry = std::mem::replace(&mut slab.entries[idx as usize], Slot::Leased);
                match entry {
                    Slot::Free { buf, next } => {
                        slab.head_free = next;
                        (idx, buf)
                    }
                    // The free list only ever links free slots.
                    Slot::Leased => unreachable!("free list points at a leased slot"),
                }
            }
            None => {
                let idx = slab.entries.len() as u32;
                slab.entries.push(Slot::Leased);
                (idx, vec![0u8; self.block_size].into_boxed_slice())
            }
        };

        slab.leased += 1;
        slab.high_water = slab.high_water.max(slab.leased);

        MemoryBlock {
            data,
            slot,
            pool: self.id,
            start: 0,
            end: 0,
        }
    }

    /// O(1) return: pushes the block onto the free list.
    ///
    /// A block from another pool, or one whose slot is already free, is a
    /// programming error: it panics in debug builds and is leaked in release
    /// builds so it can never alias another lease.
    pub fn give_back(&self, mut block: MemoryBlock) {
        if block.pool != self.id {
            fault("block returned to a foreign pool");
            return;
        }

        let mut slab = self.slab.borrow_mut();
        let idx = block.slot as usize;
        let is_leased = matches!(slab.entries.get(idx), Some(Slot::Leased));
        if !is_leased {
            drop(slab);
            fault("block returned twice");
            return;
        }

        block.reset();
        let next = slab.head_free;
        slab.entries[idx] = Slot::Free {
            buf: block.data,
            next,
        };
        slab.head_free = Some(block.slot);
        slab.leased -= 1;
    }

    #[inline(always)]
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Distinct blocks ever created by this pool.
    pub fn allocated(&self) -> usize {
        self.slab.borrow().entries.len()
    }

    /// Blocks currently sitting in the free list.
    pub fn available(&self) -> usize {
        let slab = self.slab.borrow();
        slab.entries.len() - slab.leased
    }

    pub fn leased(&self) -> usize {
        self.slab.borrow().leased
    }

    pub fn high_water(&self) -> usize {
        self.slab.borrow().high_water
    }
}

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

fn fault(msg: &'static str) {
    if cfg!(debug_assertions) {
        panic!("memory pool fault: {msg}");
    }
    tracing::error!("memory pool fault: {msg}; block leaked");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_reuses_returned_blocks() {
        let pool = MemoryPool::new(128);
        assert_eq!(pool.allocated(), 0);

        let a = pool.lease();
        let b = pool.lease();
        assert_eq!(a.capacity(), 128);
        assert_eq!(pool.allocated(), 2);
        assert_eq!(pool.leased(), 2);

        pool.give_back(a);
        assert_eq!(pool.available(), 1);

        // Reuses slot 0, which sits at the head of the free list.
        let c = pool.lease();
        assert_eq!(c.slot, 0);
        assert_eq!(pool.allocated(), 2);

        pool.give_back(b);
        pool.give_back(c);
        assert_eq!(pool.leased(), 0);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn test_returned_block_is_reset() {
        let pool = MemoryPool::new(64);
        let mut block = pool.lease();
        block.writable()[..3].copy_from_slice(b"abc");
        block.commit(3);
        block.advance(1);
        assert_eq!(block.readable(), b"bc");
        pool.give_back(block);

        let block = pool.lease();
        assert!(block.is_empty());
        assert_eq!(block.writable_len(), 64);
        pool.give_back(block);
    }

    #[test]
    fn test_allocation_never_exceeds_high_water() {
        let pool = MemoryPool::new(64);
        let mut held = Vec::new();
        // Deterministic LCG so the interleaving is reproducible.
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..2_000 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            if seed % 3 == 0 && !held.is_empty() {
                let idx = (seed as usize / 3) % held.len();
                pool.give_back(held.swap_remove(idx));
            } else {
                held.push(pool.lease());
            }
            assert!(pool.allocated() <= pool.high_water());
            assert_eq!(pool.leased(), held.len());
        }
        for block in held {
            pool.give_back(block);
        }
        assert_eq!(pool.allocated(), pool.high_water());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "foreign pool")]
    fn test_foreign_return_faults_in_debug() {
        let a = MemoryPool::new(64);
        let b = MemoryPool::new(64);
        let block = a.lease();
        b.give_back(block);
    }

    impl MemoryBlock {
        fn writable_len(&self) -> usize {
            self.data.len() - self.end
        }
    }
}
