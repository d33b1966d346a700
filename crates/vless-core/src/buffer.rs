//! Scratch-buffer allocation for handshake processing.
//!
//! Two-tier strategy: a shared bump region sized for the common case, with a
//! small recycle pool of independent buffers behind it. An acquire takes a
//! zero-copy slice off the front of the current region when it fits, falls
//! back to a pooled buffer of adequate capacity, and only then allocates
//! fresh. Reclamation is coarse: releasing an arena slice resets the region
//! cursor only once it has passed the high-water mark, starting a new epoch.
//! Slices issued before a reset keep their backing storage alive and stay
//! valid; they are simply no longer tracked.

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::defaults::{DEFAULT_ARENA_CAPACITY, DEFAULT_RECYCLE_POOL_SLOTS};

/// Where a scratch buffer was sourced from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufSource {
    /// Zero-copy slice of the shared arena region.
    Arena,
    /// Reused buffer from the recycle pool.
    Pool,
    /// Freshly allocated.
    Fresh,
}

/// An exclusively owned scratch buffer handed out by [`Arena::acquire`].
///
/// Must be returned through [`Arena::release`] once every write that reads
/// from it has been initiated with its own copy of the data.
pub struct ScratchBuffer {
    buf: BytesMut,
    source: BufSource,
}

impl ScratchBuffer {
    pub fn source(&self) -> BufSource {
        self.source
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Shorten the buffer to `len` bytes (used after an in-place decode that
    /// produced fewer bytes than the conservative estimate).
    pub fn truncate(&mut self, len: usize) {
        self.buf.truncate(len);
    }
}

impl std::ops::Deref for ScratchBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf
    }
}

impl std::ops::DerefMut for ScratchBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}

/// Snapshot of allocator state, for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaStats {
    /// Bytes issued from the current epoch region.
    pub cursor: usize,
    /// Buffers currently parked in the recycle pool.
    pub pooled: usize,
}

struct ArenaInner {
    /// Remaining bytes of the current epoch region. Issued slices are split
    /// off the front, so `capacity - region.len()` is the cursor.
    region: BytesMut,
    pool: Vec<BytesMut>,
}

/// Process-wide scratch allocator, constructed once and shared by reference
/// across all sessions.
pub struct Arena {
    capacity: usize,
    high_water: usize,
    pool_slots: usize,
    inner: Mutex<ArenaInner>,
}

impl Arena {
    pub fn new(capacity: usize, pool_slots: usize) -> Self {
        assert!(capacity > 0, "arena capacity must be non-zero");
        Self {
            capacity,
            // Reset threshold sits at 75% of capacity.
            high_water: capacity - capacity / 4,
            pool_slots,
            inner: Mutex::new(ArenaInner {
                region: BytesMut::zeroed(capacity),
                pool: Vec::with_capacity(pool_slots),
            }),
        }
    }

    /// Hand out a zeroed buffer of exactly `n` bytes.
    pub fn acquire(&self, n: usize) -> ScratchBuffer {
        let mut inner = self.inner.lock();
        if inner.region.len() >= n {
            return ScratchBuffer {
                buf: inner.region.split_to(n),
                source: BufSource::Arena,
            };
        }
        if let Some(idx) = inner.pool.iter().position(|b| b.capacity() >= n) {
            let mut buf = inner.pool.swap_remove(idx);
            buf.resize(n, 0);
            return ScratchBuffer {
                buf,
                source: BufSource::Pool,
            };
        }
        ScratchBuffer {
            buf: BytesMut::zeroed(n),
            source: BufSource::Fresh,
        }
    }

    /// Return a buffer to the allocator.
    ///
    /// Arena slices never rewind the cursor; the region is replaced wholesale
    /// once the cursor is past the high-water mark. Pool and fresh buffers
    /// are parked in the recycle pool while slots remain.
    pub fn release(&self, buf: ScratchBuffer) {
        let mut inner = self.inner.lock();
        match buf.source {
            BufSource::Arena => {
                let cursor = self.capacity - inner.region.len();
                if cursor > self.high_water {
                    inner.region = BytesMut::zeroed(self.capacity);
                }
            }
            BufSource::Pool | BufSource::Fresh => {
                if inner.pool.len() < self.pool_slots {
                    let mut b = buf.buf;
                    b.clear();
                    inner.pool.push(b);
                }
            }
        }
    }

    pub fn stats(&self) -> ArenaStats {
        let inner = self.inner.lock();
        ArenaStats {
            cursor: self.capacity - inner.region.len(),
            pooled: inner.pool.len(),
        }
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new(DEFAULT_ARENA_CAPACITY, DEFAULT_RECYCLE_POOL_SLOTS)
    }
}
