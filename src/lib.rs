//! Zero-copy network buffer management and asynchronous echo dispatch
//!
//! This crate provides the I/O core that sits between a raw Ethernet device
//! driver and a TCP/IP protocol stack:
//! - Fixed pool of pre-pinned DMA buffers with in-flight tracking
//! - Ethernet device adapter (zero-copy RX delivery, pooled TX)
//! - Virtqueue-style ring transport with tag-based dispatch
//! - TCP/UDP echo flow handlers
//!
//! All pools and rings are built once at startup; the data path performs no
//! allocation. A single logical thread of control drives each component, so
//! the spin locks here exist only to let a delivered packet release its
//! buffer from wherever the protocol stack drops it.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod dispatch;
pub mod ethdev;
pub mod flow;
pub mod pool;
pub mod ring;

use core::fmt;
use lazy_static::lazy_static;
use spin::RwLock;

/// Socket identifier as carried in transport messages.
///
/// Matches the wire representation; `-1` marks an absent socket on the wire,
/// while in-memory flow state uses `Option<SocketId>`.
pub type SocketId = i32;

/// Network error types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Buffer pool exhausted (recoverable: drop RX frame / retry TX later)
    PoolExhausted,
    /// Descriptor ring has no free slot
    RingFull,
    /// Hardware reported a failed transfer
    HardwareTxFailed,
    /// Protocol stack rejected a delivered packet
    ProtocolRejected,
    /// Frame larger than a pool buffer
    FrameTooLarge,
    /// Completion arrived for a socket that no longer exists
    MisdirectedCompletion,
    /// Invalid argument
    InvalidArgument,
    /// Invalid state
    InvalidState,
    /// Operation on a closed socket
    SocketClosed,
    /// Configuration invariant violated (fatal at initialization)
    ConfigInvariant,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NetError::PoolExhausted => write!(f, "Buffer pool exhausted"),
            NetError::RingFull => write!(f, "Descriptor ring full"),
            NetError::HardwareTxFailed => write!(f, "Hardware transfer failed"),
            NetError::ProtocolRejected => write!(f, "Protocol stack rejected packet"),
            NetError::FrameTooLarge => write!(f, "Frame too large for pool buffer"),
            NetError::MisdirectedCompletion => write!(f, "Completion for stale socket"),
            NetError::InvalidArgument => write!(f, "Invalid argument"),
            NetError::InvalidState => write!(f, "Invalid state"),
            NetError::SocketClosed => write!(f, "Socket closed"),
            NetError::ConfigInvariant => write!(f, "Configuration invariant violated"),
        }
    }
}

/// Network result type
pub type NetResult<T> = Result<T, NetError>;

/// Crate-wide aggregated counters.
///
/// Components keep their own fine-grained stats; this snapshot is the
/// cheap global view for diagnostics.
#[derive(Debug, Default, Clone)]
pub struct NetStats {
    /// Frames delivered to the protocol stack
    pub rx_frames: u64,
    /// Frames handed to hardware for transmit
    pub tx_frames: u64,
    /// RX frames dropped (queue full or pool exhausted)
    pub rx_dropped: u64,
    /// TX attempts failed (pool exhausted or hardware error)
    pub tx_failed: u64,
    /// Dispatch passes over the ring transport
    pub dispatch_passes: u64,
    /// Datagrams echoed back over the ring transport
    pub echoed: u64,
}

lazy_static! {
    static ref NET_STATS: RwLock<NetStats> = RwLock::new(NetStats::default());
}

/// Get a snapshot of the global counters.
pub fn net_stats() -> NetStats {
    NET_STATS.read().clone()
}

/// Reset the global counters.
pub fn reset_net_stats() {
    *NET_STATS.write() = NetStats::default();
}

pub(crate) fn with_net_stats(f: impl FnOnce(&mut NetStats)) {
    f(&mut NET_STATS.write());
}
