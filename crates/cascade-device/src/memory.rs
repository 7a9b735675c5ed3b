//! Device memory blocks and the per-device buffer pool.
//!
//! The pool hands out [`DeviceBuffer`]s backed by fixed-capacity blocks. When
//! the last handle to a buffer goes away its block goes back on the pool's
//! free list and can be handed to the next request of the same size class.
//!
//! Arrays whose producing command has not finished yet must not release their
//! memory on drop: a kernel still queued on the device may read or write it.
//! [`MultiArray`](crate::MultiArray) parks such memory in the pool's pending
//! list together with its completion event, and [`BufferPool::reclaim`] only
//! releases it once that event has fired. Queued commands hold their own
//! buffer handles, so a raw [`DeviceBuffer`] dropped by its owner stays off
//! the free list until every command using it has run.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use cascade_core::{CascadeError, Result};
use parking_lot::{Mutex, RwLock};

use crate::array::Dependency;
use crate::event::Event;

static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// One raw allocation of device memory.
pub(crate) struct Block {
    pub(crate) id: u64,
    pub(crate) bytes: RwLock<Vec<u8>>,
    capacity: usize,
}

impl Block {
    fn new(capacity: usize) -> Self {
        Self {
            id: NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed),
            bytes: RwLock::new(vec![0u8; capacity]),
            capacity,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// DeviceBuffer
// ============================================================================

struct BufferInner {
    block: Option<Arc<Block>>,
    len: usize,
    pool: Weak<PoolShared>,
    label: Mutex<Option<String>>,
}

impl Drop for BufferInner {
    fn drop(&mut self) {
        if let (Some(block), Some(pool)) = (self.block.take(), self.pool.upgrade()) {
            pool.release(block);
        }
    }
}

/// Reference-counted handle to a pool-owned block.
///
/// `len` is the size that was requested; the block behind it may be larger.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

impl DeviceBuffer {
    pub(crate) fn block(&self) -> &Arc<Block> {
        // Only taken in Drop, so always present while a handle exists.
        match &self.inner.block {
            Some(block) => block,
            None => unreachable!("device buffer used after release"),
        }
    }

    /// Requested size in bytes.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Size of the underlying block in bytes.
    pub fn capacity(&self) -> usize {
        self.block().capacity()
    }

    /// Identity of the underlying block. Two buffers with the same id share
    /// device memory.
    pub fn block_id(&self) -> u64 {
        self.block().id
    }

    pub fn set_label(&self, label: impl Into<String>) {
        *self.inner.label.lock() = Some(label.into());
    }

    pub fn label(&self) -> Option<String> {
        self.inner.label.lock().clone()
    }

    /// Number of live handles to this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub(crate) fn pool(&self) -> Option<Arc<PoolShared>> {
        self.inner.pool.upgrade()
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("block", &self.block_id())
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("label", &*self.inner.label.lock())
            .finish()
    }
}

// ============================================================================
// BufferPool
// ============================================================================

/// Memory held back from the free list until an event fires.
pub(crate) struct Deferred {
    pub(crate) buffer: Option<DeviceBuffer>,
    pub(crate) dependencies: Vec<Dependency>,
}

/// Snapshot of pool accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Bytes of device memory held by the pool (live plus free blocks).
    pub allocated_bytes: usize,
    /// Blocks currently handed out.
    pub live_blocks: usize,
    /// Blocks on the free list.
    pub free_blocks: usize,
    /// Deferred releases still waiting on their event.
    pub pending_blocks: usize,
    /// Requests served from the free list.
    pub reuse_count: u64,
    /// Requests that needed fresh device memory.
    pub fresh_count: u64,
}

pub(crate) struct PoolShared {
    label: String,
    min_block_size: usize,
    memory_limit: Option<usize>,
    state: Mutex<PoolState>,
}

#[derive(Default)]
struct PoolState {
    /// Free blocks keyed by size class.
    free: BTreeMap<usize, Vec<Arc<Block>>>,
    pending: Vec<(Event, Deferred)>,
    allocated_bytes: usize,
    live_blocks: usize,
    free_blocks: usize,
    reuse_count: u64,
    fresh_count: u64,
}

impl PoolState {
    fn drain_free(&mut self) -> Vec<Arc<Block>> {
        let blocks: Vec<_> = std::mem::take(&mut self.free).into_values().flatten().collect();
        for block in &blocks {
            self.allocated_bytes -= block.capacity();
        }
        self.free_blocks = 0;
        blocks
    }
}

impl PoolShared {
    fn size_class(&self, bytes: usize) -> usize {
        bytes.max(self.min_block_size).next_power_of_two()
    }

    fn release(&self, block: Arc<Block>) {
        let mut state = self.state.lock();
        state.live_blocks = state.live_blocks.saturating_sub(1);
        state.free_blocks += 1;
        tracing::trace!("{}: block {} back on the free list", self.label, block.id);
        state.free.entry(block.capacity()).or_default().push(block);
    }

    pub(crate) fn defer(&self, event: Event, deferred: Deferred) {
        self.state.lock().pending.push((event, deferred));
    }

    fn reclaim(&self) -> usize {
        let ready: Vec<Deferred> = {
            let mut state = self.state.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut state.pending)
                .into_iter()
                .partition(|(event, _)| event.is_complete());
            state.pending = waiting;
            ready.into_iter().map(|(_, deferred)| deferred).collect()
        };
        // Dropping the payload releases blocks, which takes the lock again.
        let count = ready.len();
        drop(ready);
        count
    }
}

/// Per-device allocator that reuses blocks by power-of-two size class.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(label: impl Into<String>, min_block_size: usize, memory_limit: Option<usize>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                label: label.into(),
                min_block_size: min_block_size.max(1),
                memory_limit,
                state: Mutex::new(PoolState::default()),
            }),
        }
    }

    /// Hand out a buffer of at least `bytes` bytes.
    ///
    /// A free block of the matching size class is reused when there is one.
    /// Otherwise fresh memory is allocated, reclaiming deferred releases and
    /// dropping free blocks of other classes first if the memory limit would
    /// be exceeded.
    pub fn allocate(&self, bytes: usize) -> Result<DeviceBuffer> {
        self.shared.reclaim();
        let class = self.shared.size_class(bytes);

        let block = {
            let mut state = self.shared.state.lock();
            let reused = state.free.get_mut(&class).and_then(Vec::pop);
            match reused {
                Some(block) => {
                    state.free_blocks -= 1;
                    state.live_blocks += 1;
                    state.reuse_count += 1;
                    tracing::trace!(
                        "{}: reusing block {} ({} bytes) for {} bytes",
                        self.shared.label,
                        block.id,
                        class,
                        bytes
                    );
                    block
                }
                None => {
                    let evicted = self.make_room(&mut state, class, bytes)?;
                    let block = Arc::new(Block::new(class));
                    state.allocated_bytes += class;
                    state.live_blocks += 1;
                    state.fresh_count += 1;
                    tracing::debug!(
                        "{}: allocated block {} ({} bytes), pool now holds {} bytes",
                        self.shared.label,
                        block.id,
                        class,
                        state.allocated_bytes
                    );
                    drop(evicted);
                    block
                }
            }
        };

        Ok(DeviceBuffer {
            inner: Arc::new(BufferInner {
                block: Some(block),
                len: bytes,
                pool: Arc::downgrade(&self.shared),
                label: Mutex::new(None),
            }),
        })
    }

    fn make_room(&self, state: &mut PoolState, class: usize, requested: usize) -> Result<Vec<Arc<Block>>> {
        let Some(limit) = self.shared.memory_limit else {
            return Ok(Vec::new());
        };
        if state.allocated_bytes + class <= limit {
            return Ok(Vec::new());
        }
        let evicted = state.drain_free();
        if state.allocated_bytes + class > limit {
            return Err(CascadeError::OutOfMemory {
                requested,
                available: limit.saturating_sub(state.allocated_bytes),
            });
        }
        Ok(evicted)
    }

    /// Release deferred memory whose event has fired. Returns how many
    /// deferred releases were completed.
    pub fn reclaim(&self) -> usize {
        self.shared.reclaim()
    }

    /// Drop every free block, returning the memory to the device.
    pub fn trim(&self) -> usize {
        let blocks = self.shared.state.lock().drain_free();
        let freed = blocks.iter().map(|b| b.capacity()).sum();
        tracing::debug!("{}: trimmed {} free bytes", self.shared.label, freed);
        freed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            allocated_bytes: state.allocated_bytes,
            live_blocks: state.live_blocks,
            free_blocks: state.free_blocks,
            pending_blocks: state.pending.len(),
            reuse_count: state.reuse_count,
            fresh_count: state.fresh_count,
        }
    }

    /// Size class a request of `bytes` bytes is served from.
    pub fn size_class(&self, bytes: usize) -> usize {
        self.shared.size_class(bytes)
    }

    pub fn memory_limit(&self) -> Option<usize> {
        self.shared.memory_limit
    }

    pub(crate) fn shared(&self) -> &Arc<PoolShared> {
        &self.shared
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("label", &self.shared.label)
            .field("stats", &self.stats())
            .finish()
    }
}
