//! Fixed pool of pre-pinned DMA buffers.
//!
//! Buffers are created once at startup (pinned and zeroed) and recycled
//! forever. The pool tracks two independent state bits per buffer:
//! `ALLOCATED` (taken from the free list) and `IN_FLIGHT` (owned by hardware
//! for an outstanding transfer). A buffer sits in the free list iff neither
//! bit is set, and is never handed to hardware unless it is allocated and
//! not already in flight.
//!
//! Pool exhaustion is a recoverable condition reported to the caller.
//! Violating the state machine (releasing an unallocated buffer, marking a
//! busy buffer used) is a programming error and panics.

use alloc::boxed::Box;
use alloc::vec;
use alloc::vec::Vec;
use bitflags::bitflags;

use crate::{NetError, NetResult};

bitflags! {
    /// Per-buffer lifecycle state.
    pub struct BufFlags: u8 {
        /// Taken from the free list.
        const ALLOCATED = 1 << 0;
        /// Owned by hardware for an in-flight transfer.
        const IN_FLIGHT = 1 << 1;
    }
}

/// Opaque handle to a pool buffer.
///
/// Handles replace raw buffer pointers: all access goes back through the
/// owning [`BufferPool`], so aliasing a recycled buffer is impossible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufHandle(u16);

impl BufHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Maps a virtual buffer address to the bus address hardware will DMA to.
///
/// On the embedded target this is backed by the platform's DMA manager; the
/// pool pins every buffer exactly once, at construction.
pub trait BusMapper {
    fn pin(&mut self, vaddr: *const u8, len: usize) -> Option<u64>;
}

/// Identity mapping for hosts where virtual and bus addresses coincide.
pub struct IdentityMapper;

impl BusMapper for IdentityMapper {
    fn pin(&mut self, vaddr: *const u8, _len: usize) -> Option<u64> {
        Some(vaddr as u64)
    }
}

/// One fixed-size DMA-capable region.
struct PoolBuffer {
    data: Box<[u8]>,
    bus_addr: u64,
    flags: BufFlags,
}

/// Buffer pool statistics
#[derive(Debug, Default, Clone)]
pub struct BufferPoolStats {
    pub allocations: u64,
    pub releases: u64,
    pub allocation_failures: u64,
    pub deferred_releases: u64,
}

/// Counts of buffers per lifecycle state at one observation point.
///
/// `free + allocated + in_flight` always equals the pool size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    pub free: usize,
    pub allocated: usize,
    pub in_flight: usize,
}

/// Fixed arena of DMA buffers with a free list of opaque handles.
pub struct BufferPool {
    buffers: Vec<PoolBuffer>,
    free_list: Vec<u16>,
    buf_size: usize,
    stats: BufferPoolStats,
}

impl BufferPool {
    /// Build a pool of `count` zeroed buffers of `buf_size` bytes each,
    /// pinning every buffer through `mapper`.
    ///
    /// This is the only point at which the pool allocates.
    pub fn new(count: usize, buf_size: usize, mapper: &mut dyn BusMapper) -> NetResult<Self> {
        if count == 0 || count > u16::MAX as usize || buf_size == 0 {
            return Err(NetError::InvalidArgument);
        }

        let mut buffers = Vec::with_capacity(count);
        let mut free_list = Vec::with_capacity(count);
        for i in 0..count {
            let data = vec![0u8; buf_size].into_boxed_slice();
            let bus_addr = mapper
                .pin(data.as_ptr(), buf_size)
                .ok_or(NetError::PoolExhausted)?;
            buffers.push(PoolBuffer {
                data,
                bus_addr,
                flags: BufFlags::empty(),
            });
            free_list.push(i as u16);
        }

        Ok(Self {
            buffers,
            free_list,
            buf_size,
            stats: BufferPoolStats::default(),
        })
    }

    /// Allocate a buffer with at least `min_size` bytes of capacity.
    ///
    /// Returns `None` when the pool is exhausted or `min_size` exceeds the
    /// buffer capacity; the free list is left untouched on failure. Never
    /// blocks.
    pub fn allocate(&mut self, min_size: usize) -> Option<BufHandle> {
        if min_size > self.buf_size || self.free_list.is_empty() {
            self.stats.allocation_failures += 1;
            return None;
        }

        let idx = self.free_list.pop().unwrap();
        let buf = &mut self.buffers[idx as usize];
        debug_assert!(buf.flags.is_empty(), "buffer on free list has state bits set");
        buf.flags.insert(BufFlags::ALLOCATED);
        self.stats.allocations += 1;
        Some(BufHandle(idx))
    }

    /// Return a buffer toward the free list.
    ///
    /// If the buffer is in flight with hardware, the return is deferred
    /// until [`mark_unused`](Self::mark_unused) fires for its completion.
    ///
    /// # Panics
    /// Panics if the buffer is not currently allocated. Callers own the
    /// discipline of releasing exactly once.
    pub fn release(&mut self, handle: BufHandle) {
        let buf = &mut self.buffers[handle.index()];
        assert!(
            buf.flags.contains(BufFlags::ALLOCATED),
            "release of unallocated buffer {}",
            handle.index()
        );
        buf.flags.remove(BufFlags::ALLOCATED);
        self.stats.releases += 1;
        if buf.flags.contains(BufFlags::IN_FLIGHT) {
            self.stats.deferred_releases += 1;
        } else {
            self.free_list.push(handle.0);
        }
    }

    /// Hand the buffer to hardware for an asynchronous transfer.
    ///
    /// # Panics
    /// Panics unless the buffer is allocated and not already in flight.
    pub fn mark_used(&mut self, handle: BufHandle) {
        let buf = &mut self.buffers[handle.index()];
        assert!(
            buf.flags.contains(BufFlags::ALLOCATED) && !buf.flags.contains(BufFlags::IN_FLIGHT),
            "mark_used on buffer {} in state {:?}",
            handle.index(),
            buf.flags
        );
        buf.flags.insert(BufFlags::IN_FLIGHT);
    }

    /// Record completion of the asynchronous transfer for this buffer.
    ///
    /// Folds a pending release: if the buffer was released while in flight,
    /// it goes straight back to the free list here.
    ///
    /// # Panics
    /// Panics if the buffer is not in flight.
    pub fn mark_unused(&mut self, handle: BufHandle) {
        let buf = &mut self.buffers[handle.index()];
        assert!(
            buf.flags.contains(BufFlags::IN_FLIGHT),
            "mark_unused on buffer {} not in flight",
            handle.index()
        );
        buf.flags.remove(BufFlags::IN_FLIGHT);
        if !buf.flags.contains(BufFlags::ALLOCATED) {
            self.free_list.push(handle.0);
        }
    }

    /// Buffer payload.
    ///
    /// Must not be called while the buffer is in flight; hardware owns the
    /// contents for that window.
    pub fn payload(&self, handle: BufHandle) -> &[u8] {
        let buf = &self.buffers[handle.index()];
        debug_assert!(
            !buf.flags.contains(BufFlags::IN_FLIGHT),
            "payload access to in-flight buffer {}",
            handle.index()
        );
        &buf.data
    }

    /// Mutable buffer payload. Same in-flight restriction as [`payload`](Self::payload).
    pub fn payload_mut(&mut self, handle: BufHandle) -> &mut [u8] {
        let buf = &mut self.buffers[handle.index()];
        debug_assert!(
            !buf.flags.contains(BufFlags::IN_FLIGHT),
            "payload access to in-flight buffer {}",
            handle.index()
        );
        &mut buf.data
    }

    /// Bus address hardware uses for this buffer.
    pub fn bus_addr(&self, handle: BufHandle) -> u64 {
        self.buffers[handle.index()].bus_addr
    }

    /// State flags for a buffer.
    pub fn flags(&self, handle: BufHandle) -> BufFlags {
        self.buffers[handle.index()].flags
    }

    /// Capacity of each buffer in the pool.
    pub fn buffer_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers currently on the free list.
    pub fn available(&self) -> usize {
        self.free_list.len()
    }

    /// Total buffers in the pool.
    pub fn total(&self) -> usize {
        self.buffers.len()
    }

    /// Per-state buffer counts for conservation checks.
    pub fn counts(&self) -> PoolCounts {
        let mut counts = PoolCounts {
            free: 0,
            allocated: 0,
            in_flight: 0,
        };
        for buf in &self.buffers {
            if buf.flags.contains(BufFlags::IN_FLIGHT) {
                counts.in_flight += 1;
            } else if buf.flags.contains(BufFlags::ALLOCATED) {
                counts.allocated += 1;
            } else {
                counts.free += 1;
            }
        }
        counts
    }

    /// Get pool statistics
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}
