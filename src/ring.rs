//! Virtqueue-style ring transport.
//!
//! Two parties exchange ownership of fixed-layout transport messages
//! through a pair of bounded descriptor rings, without shared-memory locks:
//! the driver side posts available buffers, the peer fills or drains them
//! and hands them back as completed. A message is owned by exactly one ring
//! at a time; ownership transfers on [`RingTransport::post_available`] /
//! [`RingTransport::poll_completed`].

use alloc::vec::Vec;
use heapless::Deque;

use crate::config::{BUF_SIZE, RING_DEPTH};
use crate::SocketId;

/// Transport message header size in bytes. Pinned by the layout assertions
/// below; the payload fills the record out to [`BUF_SIZE`].
pub const MSG_HDR_SIZE: usize = 24;

/// Payload capacity of one transport message.
pub const MSG_PAYLOAD_SIZE: usize = BUF_SIZE - MSG_HDR_SIZE;

/// Wire value for "no socket".
pub const NO_SOCKET: SocketId = -1;

/// `done_len` sentinel: the underlying operation failed.
pub const DONE_ERR: i32 = -1;

/// Fixed-layout record carried over the ring transport.
///
/// The layout is wire-exact and identical on 32- and 64-bit targets; the
/// explicit reserved word keeps `flow_tag` naturally aligned.
#[repr(C)]
pub struct TxMsg {
    /// Socket that owns this buffer (`NO_SOCKET` when unowned).
    pub socket_id: SocketId,
    _reserved: u32,
    /// Opaque cookie identifying the logical flow the buffer belongs to.
    pub flow_tag: u64,
    /// Requested length for the next operation.
    pub total_len: u32,
    /// Completed length; `DONE_ERR` signals an error, `0` an empty result.
    pub done_len: i32,
    /// Datagram payload.
    pub payload: [u8; MSG_PAYLOAD_SIZE],
}

const _: () = assert!(core::mem::size_of::<TxMsg>() == BUF_SIZE);
const _: () = assert!(core::mem::offset_of!(TxMsg, flow_tag) == 8);
const _: () = assert!(core::mem::offset_of!(TxMsg, payload) == MSG_HDR_SIZE);

impl TxMsg {
    pub const fn new() -> Self {
        Self {
            socket_id: NO_SOCKET,
            _reserved: 0,
            flow_tag: 0,
            total_len: 0,
            done_len: 0,
            payload: [0; MSG_PAYLOAD_SIZE],
        }
    }
}

impl Default for TxMsg {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque handle to a message in a [`MsgPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MsgRef(u16);

impl MsgRef {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Arena of transport messages, built at startup and addressed by handle.
pub struct MsgPool {
    msgs: Vec<TxMsg>,
}

impl MsgPool {
    pub fn new() -> Self {
        Self { msgs: Vec::new() }
    }

    /// Add a message to the arena. Startup only; the data path never grows
    /// the pool.
    pub fn add(&mut self, msg: TxMsg) -> MsgRef {
        assert!(self.msgs.len() < u16::MAX as usize, "message arena overflow");
        let idx = self.msgs.len() as u16;
        self.msgs.push(msg);
        MsgRef(idx)
    }

    pub fn get(&self, r: MsgRef) -> &TxMsg {
        &self.msgs[r.index()]
    }

    pub fn get_mut(&mut self, r: MsgRef) -> &mut TxMsg {
        &mut self.msgs[r.index()]
    }

    pub fn len(&self) -> usize {
        self.msgs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.msgs.is_empty()
    }
}

impl Default for MsgPool {
    fn default() -> Self {
        Self::new()
    }
}

/// One direction of the ring transport, as seen from the driver side.
pub trait RingTransport {
    /// Hand a message to the peer. Returns `false` when the ring has no
    /// free slot.
    fn post_available(&mut self, msg: MsgRef, len: u32) -> bool;

    /// Take the next message the peer has completed, with its completed
    /// transfer length.
    fn poll_completed(&mut self) -> Option<(MsgRef, u32)>;

    /// Signal the peer that new available buffers were posted.
    fn notify_peer(&mut self);
}

/// Ring statistics
#[derive(Debug, Default, Clone)]
pub struct RingStats {
    pub posted: u64,
    pub completed: u64,
    pub post_failures: u64,
    pub notifications: u64,
}

/// In-memory bounded descriptor ring.
///
/// Models one virtqueue: an available queue the driver side fills and a
/// used queue the peer side fills. The peer half (`peer_take` /
/// `peer_complete`) is what a device backend or a test harness drives.
pub struct MsgRing<const DEPTH: usize = RING_DEPTH> {
    avail: Deque<(MsgRef, u32), DEPTH>,
    used: Deque<(MsgRef, u32), DEPTH>,
    stats: RingStats,
}

impl<const DEPTH: usize> MsgRing<DEPTH> {
    pub fn new() -> Self {
        Self {
            avail: Deque::new(),
            used: Deque::new(),
            stats: RingStats::default(),
        }
    }

    /// Peer side: take the next available message.
    pub fn peer_take(&mut self) -> Option<(MsgRef, u32)> {
        self.avail.pop_front()
    }

    /// Peer side: return a message as completed with `len` bytes done.
    pub fn peer_complete(&mut self, msg: MsgRef, len: u32) -> bool {
        self.used.push_back((msg, len)).is_ok()
    }

    /// Notifications delivered to the peer so far.
    pub fn notifications(&self) -> u64 {
        self.stats.notifications
    }

    /// Messages currently posted as available.
    pub fn available(&self) -> usize {
        self.avail.len()
    }

    /// Messages completed and waiting to be polled.
    pub fn completed(&self) -> usize {
        self.used.len()
    }

    /// Get ring statistics
    pub fn stats(&self) -> &RingStats {
        &self.stats
    }
}

impl<const DEPTH: usize> Default for MsgRing<DEPTH> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const DEPTH: usize> RingTransport for MsgRing<DEPTH> {
    fn post_available(&mut self, msg: MsgRef, len: u32) -> bool {
        if self.avail.push_back((msg, len)).is_err() {
            self.stats.post_failures += 1;
            return false;
        }
        self.stats.posted += 1;
        true
    }

    fn poll_completed(&mut self) -> Option<(MsgRef, u32)> {
        let entry = self.used.pop_front();
        if entry.is_some() {
            self.stats.completed += 1;
        }
        entry
    }

    fn notify_peer(&mut self) {
        self.stats.notifications += 1;
    }
}
