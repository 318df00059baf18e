//! Compile-time tuning parameters.
//!
//! Everything here is fixed at build time; there is no runtime
//! reconfiguration. [`validate`] is called during initialization and a
//! violation aborts startup; configuration errors are never surfaced as
//! runtime conditions.

use crate::ring::MSG_HDR_SIZE;
use crate::{NetError, NetResult};

/// Number of pre-pinned receive buffers in the Ethernet pool.
pub const RX_BUFS: usize = 256;

/// Number of pre-pinned transmit buffers in the Ethernet pool.
pub const TX_BUFS: usize = 128;

/// Size of every pool buffer and transport message, in bytes.
pub const BUF_SIZE: usize = 2048;

/// Bytes requested per TCP receive posted to the ring transport.
pub const TCP_READ_SIZE: u32 = 1400;

/// Bytes requested per UDP receive posted to the ring transport.
pub const UDP_READ_SIZE: u32 = 1400;

/// Transport messages owned by the TCP echo flow.
pub const NUM_TCP_BUFS: usize = 510;

/// Transport messages owned by the UDP echo flow.
pub const NUM_UDP_BUFS: usize = 510;

/// Depth of each transport descriptor ring.
pub const RING_DEPTH: usize = 1024;

/// Heap reserved for startup allocation of pools and message arenas.
pub const HEAP_RESERVATION: usize = 0x80_0000;

// A transport message must fit its header plus a full read.
const _: () = assert!(BUF_SIZE >= MSG_HDR_SIZE + TCP_READ_SIZE as usize);
const _: () = assert!(BUF_SIZE >= MSG_HDR_SIZE + UDP_READ_SIZE as usize);

/// Validate the build-time configuration.
///
/// Call once at startup before constructing pools or rings.
pub fn validate() -> NetResult<()> {
    validate_params(Params {
        rx_bufs: RX_BUFS,
        tx_bufs: TX_BUFS,
        buf_size: BUF_SIZE,
        tcp_read_size: TCP_READ_SIZE,
        udp_read_size: UDP_READ_SIZE,
        num_tcp_bufs: NUM_TCP_BUFS,
        num_udp_bufs: NUM_UDP_BUFS,
        ring_depth: RING_DEPTH,
    })
}

/// Configuration values checked by [`validate_params`].
#[derive(Debug, Clone, Copy)]
pub struct Params {
    pub rx_bufs: usize,
    pub tx_bufs: usize,
    pub buf_size: usize,
    pub tcp_read_size: u32,
    pub udp_read_size: u32,
    pub num_tcp_bufs: usize,
    pub num_udp_bufs: usize,
    pub ring_depth: usize,
}

pub fn validate_params(p: Params) -> NetResult<()> {
    if p.rx_bufs == 0 || p.tx_bufs == 0 {
        return Err(NetError::ConfigInvariant);
    }
    if p.buf_size < MSG_HDR_SIZE + p.tcp_read_size as usize
        || p.buf_size < MSG_HDR_SIZE + p.udp_read_size as usize
    {
        return Err(NetError::ConfigInvariant);
    }
    // Both flows can have every message sitting in one ring at once, so the
    // rings must be at least as deep as the combined message count.
    if p.ring_depth < p.num_tcp_bufs + p.num_udp_bufs {
        return Err(NetError::ConfigInvariant);
    }
    Ok(())
}
