//! Ethernet device adapter.
//!
//! Bridges the buffer pool to the raw driver's asynchronous callback
//! contract and to the protocol stack above:
//! - RX: the driver borrows pool buffers through [`EthAdapter::alloc_rx_buffer`],
//!   completes them into a bounded pending queue, and [`EthAdapter::poll`]
//!   delivers them upward as [`RxPacket`]s that release on drop
//! - TX: outgoing frames are copied fragment-by-fragment into a pool buffer
//!   (or handed off zero-copy when already pool-backed) and submitted with
//!   the buffer handle as the completion cookie
//!
//! Per-buffer state machine:
//! `Free -> Allocated -> InFlight -> (completion) -> Allocated -> Free`,
//! or `Allocated -> Free` directly when a frame never reaches hardware.

use alloc::sync::Arc;
use core::sync::atomic::{fence, Ordering};
use heapless::Deque;
use log::{debug, warn};
use spin::Mutex;

use crate::config::RX_BUFS;
use crate::pool::{BufHandle, BufferPool};
use crate::{with_net_stats, NetError, NetResult};

/// Outcome of a raw transmit submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxResult {
    /// Accepted; the driver integration will call
    /// [`EthAdapter::tx_complete`] with the cookie later.
    Enqueued,
    /// Transmitted synchronously; no completion callback follows.
    Complete,
    /// Rejected; the buffer is returned to the pool immediately.
    Failed,
}

/// Raw hardware driver contract consumed by the adapter.
pub trait RawNetDevice {
    /// Queue a frame for transmit. `bus_addrs`/`lens` describe the
    /// fragments; `cookie` identifies the backing buffer in completions.
    fn raw_tx(&mut self, bus_addrs: &[u64], lens: &[u32], cookie: BufHandle) -> TxResult;

    /// Let the driver run any deferred work.
    fn raw_poll(&mut self);

    /// Hardware MAC address.
    fn mac_address(&self) -> [u8; 6];
}

/// Protocol stack input entry point.
pub trait ProtocolStack {
    /// Consume a received frame. Ownership of the packet transfers here;
    /// rejecting it (or dropping it at any point) returns the backing
    /// buffer to the pool exactly once.
    fn input(&mut self, packet: RxPacket) -> NetResult<()>;
}

/// A received frame, owned by the protocol stack.
///
/// Holds a pool buffer plus the received length. Dropping the packet is the
/// release: the buffer transitions back toward the free list exactly once,
/// wherever in the stack the drop happens.
pub struct RxPacket {
    pool: Arc<Mutex<BufferPool>>,
    handle: BufHandle,
    len: usize,
}

impl RxPacket {
    fn new(pool: Arc<Mutex<BufferPool>>, handle: BufHandle, len: usize) -> Self {
        Self { pool, handle, len }
    }

    /// Received frame length.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Run `f` over the frame payload.
    ///
    /// Access goes through the pool lock, so the payload cannot outlive a
    /// recycling of the buffer.
    pub fn with_payload<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let pool = self.pool.lock();
        f(&pool.payload(self.handle)[..self.len])
    }
}

impl Drop for RxPacket {
    fn drop(&mut self) {
        self.pool.lock().release(self.handle);
    }
}

/// Ethernet adapter statistics
#[derive(Debug, Default, Clone)]
pub struct EthStats {
    pub rx_frames: u64,
    pub rx_dropped: u64,
    pub rx_rejected: u64,
    pub rx_nobuf: u64,
    pub tx_frames: u64,
    pub tx_errors: u64,
    pub tx_nobuf: u64,
    pub tx_completions: u64,
}

/// Ethernet device adapter over a raw driver.
///
/// `QUEUE` is the pending-receive queue depth; it matches the RX buffer
/// count so a full queue only happens when every RX buffer is already
/// waiting for the stack.
pub struct EthAdapter<D: RawNetDevice, const QUEUE: usize = RX_BUFS> {
    device: D,
    rx_pool: Arc<Mutex<BufferPool>>,
    tx_pool: Arc<Mutex<BufferPool>>,
    pending_rx: Deque<(BufHandle, u32), QUEUE>,
    stats: EthStats,
}

impl<D: RawNetDevice, const QUEUE: usize> EthAdapter<D, QUEUE> {
    /// Wrap a raw device with pre-built RX and TX pools.
    ///
    /// Polls the driver once so it can finish its own initialization.
    pub fn new(mut device: D, rx_pool: BufferPool, tx_pool: BufferPool) -> Self {
        device.raw_poll();
        Self {
            device,
            rx_pool: Arc::new(Mutex::new(rx_pool)),
            tx_pool: Arc::new(Mutex::new(tx_pool)),
            pending_rx: Deque::new(),
            stats: EthStats::default(),
        }
    }

    /// Driver callback: hand out an RX buffer of at least `size` bytes.
    ///
    /// The buffer is marked in-flight and its cache range invalidated
    /// before the device DMAs into it. `None` is the driver's documented
    /// "no buffer available" sentinel; the frame is dropped in hardware.
    pub fn alloc_rx_buffer(&mut self, size: usize) -> Option<(BufHandle, u64)> {
        let mut pool = self.rx_pool.lock();
        let handle = match pool.allocate(size) {
            Some(h) => h,
            None => {
                self.stats.rx_nobuf += 1;
                return None;
            }
        };
        cache_invalidate(pool.payload(handle));
        pool.mark_used(handle);
        Some((handle, pool.bus_addr(handle)))
    }

    /// Driver callback: one or more RX transfers completed.
    ///
    /// Buffers go onto the pending queue for [`poll`](Self::poll). A full
    /// queue is a defined failure: the frame is dropped and its buffer
    /// returned to the pool immediately.
    pub fn rx_complete(&mut self, cookies: &[BufHandle], lens: &[u32]) {
        if cookies.len() != lens.len() {
            warn!("rx_complete: {} cookies but {} lengths", cookies.len(), lens.len());
            let mut pool = self.rx_pool.lock();
            for &h in cookies {
                pool.mark_unused(h);
                pool.release(h);
                self.stats.rx_dropped += 1;
            }
            return;
        }

        for (&handle, &len) in cookies.iter().zip(lens.iter()) {
            self.rx_pool.lock().mark_unused(handle);
            if self.pending_rx.push_back((handle, len)).is_err() {
                self.rx_pool.lock().release(handle);
                self.stats.rx_dropped += 1;
                with_net_stats(|s| s.rx_dropped += 1);
            }
        }
    }

    /// Driver callback: a transmit previously reported as
    /// [`TxResult::Enqueued`] finished.
    ///
    /// Folds the deferred release, returning the buffer to the free list.
    pub fn tx_complete(&mut self, cookie: BufHandle) {
        self.tx_pool.lock().mark_unused(cookie);
        self.stats.tx_completions += 1;
    }

    /// Drain the pending-receive queue into the protocol stack.
    ///
    /// A rejected packet is dropped (its buffer released, never leaked) and
    /// the drain stops; the rest of the queue waits for the next poll.
    pub fn poll<S: ProtocolStack>(&mut self, stack: &mut S) {
        while let Some((handle, len)) = self.pending_rx.pop_front() {
            let packet = RxPacket::new(self.rx_pool.clone(), handle, len as usize);
            match stack.input(packet) {
                Ok(()) => {
                    self.stats.rx_frames += 1;
                    with_net_stats(|s| s.rx_frames += 1);
                }
                Err(e) => {
                    warn!("protocol stack rejected frame: {}", e);
                    self.stats.rx_rejected += 1;
                    break;
                }
            }
        }
    }

    /// Transmit a frame given as ordered fragments.
    ///
    /// Fragments are copied contiguously, in order, into one TX pool
    /// buffer. [`NetError::PoolExhausted`] is retryable: the stack should
    /// re-queue rather than drop user data.
    pub fn send(&mut self, frags: &[&[u8]]) -> NetResult<()> {
        let total: usize = frags.iter().map(|f| f.len()).sum();

        let handle = {
            let mut pool = self.tx_pool.lock();
            if total > pool.buffer_size() {
                return Err(NetError::FrameTooLarge);
            }
            let handle = match pool.allocate(total) {
                Some(h) => h,
                None => {
                    self.stats.tx_nobuf += 1;
                    with_net_stats(|s| s.tx_failed += 1);
                    return Err(NetError::PoolExhausted);
                }
            };
            let dst = pool.payload_mut(handle);
            let mut off = 0;
            for frag in frags {
                dst[off..off + frag.len()].copy_from_slice(frag);
                off += frag.len();
            }
            handle
        };

        self.submit(handle, total as u32)
    }

    /// Allocate a TX pool buffer for a zero-copy send.
    pub fn alloc_tx_buffer(&mut self, min_size: usize) -> Option<BufHandle> {
        self.tx_pool.lock().allocate(min_size)
    }

    /// Zero-copy transmit of a frame already built in a TX pool buffer
    /// (from [`alloc_tx_buffer`](Self::alloc_tx_buffer)).
    pub fn send_pooled(&mut self, handle: BufHandle, len: u32) -> NetResult<()> {
        if len as usize > self.tx_pool.lock().buffer_size() {
            return Err(NetError::FrameTooLarge);
        }
        self.submit(handle, len)
    }

    fn submit(&mut self, handle: BufHandle, len: u32) -> NetResult<()> {
        let bus = {
            let mut pool = self.tx_pool.lock();
            cache_flush(pool.payload(handle));
            pool.mark_used(handle);
            pool.bus_addr(handle)
        };

        match self.device.raw_tx(&[bus], &[len], handle) {
            TxResult::Failed => {
                let mut pool = self.tx_pool.lock();
                pool.mark_unused(handle);
                pool.release(handle);
                self.stats.tx_errors += 1;
                with_net_stats(|s| s.tx_failed += 1);
                Err(NetError::HardwareTxFailed)
            }
            TxResult::Complete => {
                debug!("tx short-circuit: frame of {} bytes completed inline", len);
                let mut pool = self.tx_pool.lock();
                pool.mark_unused(handle);
                pool.release(handle);
                self.stats.tx_frames += 1;
                with_net_stats(|s| s.tx_frames += 1);
                Ok(())
            }
            TxResult::Enqueued => {
                // Release now; the buffer is in flight so the return to the
                // free list is deferred until tx_complete folds it.
                self.tx_pool.lock().release(handle);
                self.stats.tx_frames += 1;
                with_net_stats(|s| s.tx_frames += 1);
                Ok(())
            }
        }
    }

    /// Shared handle to the RX pool.
    pub fn rx_pool(&self) -> Arc<Mutex<BufferPool>> {
        self.rx_pool.clone()
    }

    /// Shared handle to the TX pool.
    pub fn tx_pool(&self) -> Arc<Mutex<BufferPool>> {
        self.tx_pool.clone()
    }

    /// Hardware MAC address.
    pub fn mac_address(&self) -> [u8; 6] {
        self.device.mac_address()
    }

    /// The wrapped raw device.
    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Number of frames waiting for the protocol stack.
    pub fn pending(&self) -> usize {
        self.pending_rx.len()
    }

    /// Get adapter statistics
    pub fn stats(&self) -> &EthStats {
        &self.stats
    }
}

/// Ordering point before hardware reads a buffer the CPU wrote.
///
/// Stands in for architecture cache maintenance on targets where DMA is not
/// cache-coherent.
fn cache_flush(_buf: &[u8]) {
    fence(Ordering::SeqCst);
}

/// Ordering point before the CPU reads a buffer hardware wrote.
fn cache_invalidate(_buf: &[u8]) {
    fence(Ordering::SeqCst);
}
