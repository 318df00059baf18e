//! Per-protocol echo flow handlers.
//!
//! Each flow owns a set of transport messages and applies the echo policy:
//! received data becomes the next transmit payload. The TCP flow tracks one
//! listening socket and at most one accepted peer; buffers completing for a
//! peer that has since closed are parked in an orphan pool and handed to
//! the next peer instead of leaking backlog capacity. UDP is connectionless
//! and has no accept/close machine.
//!
//! Misdirected completions (the socket changed between post and completion)
//! follow one policy in every path: re-target to the current peer when one
//! exists, park otherwise, and log at debug level. Recovery never crashes.

use log::debug;

use crate::config::NUM_TCP_BUFS;
use crate::ring::{MsgPool, MsgRef, RingTransport, DONE_ERR};
use crate::{with_net_stats, NetError, NetResult, SocketId};

/// Flow tag marking a transport message as TCP-owned.
pub const TCP_FLOW_TAG: u64 = 1;

/// Flow tag marking a transport message as UDP-owned.
pub const UDP_FLOW_TAG: u64 = 2;

/// Socket-control operations the TCP flow needs from the protocol stack.
pub trait SocketControl {
    /// Accept the pending peer on a listening socket.
    fn accept(&mut self, listen_sock: SocketId) -> NetResult<SocketId>;

    /// Close a socket.
    fn close(&mut self, sock: SocketId) -> NetResult<()>;

    /// Switch a socket to asynchronous completion delivery.
    fn set_async(&mut self, sock: SocketId, enabled: bool) -> NetResult<()>;
}

/// Connection events delivered for the TCP listening socket and its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    /// A peer is waiting to be accepted on the listening socket.
    PeerAvailable,
    /// The accepted peer closed the connection.
    PeerClosed { peer: SocketId },
}

/// Echo flow statistics
#[derive(Debug, Default, Clone)]
pub struct FlowStats {
    /// Datagrams moved to the transmit ring
    pub echoed: u64,
    /// Failed or empty receives re-posted unchanged
    pub retried: u64,
    /// Completions parked while no peer exists
    pub parked: u64,
    /// Orphaned buffers handed to a new peer
    pub reclaimed: u64,
    /// Completions re-targeted to the current peer
    pub retargeted: u64,
}

/// Post to a ring, treating overflow as fatal misconfiguration: rings are
/// sized to hold every transport message (checked at startup), so a full
/// ring means buffer accounting is already broken.
fn post<R: RingTransport>(ring: &mut R, msg: MsgRef, len: u32) {
    assert!(
        ring.post_available(msg, len),
        "descriptor ring full: ring depth does not cover the message count"
    );
}

/// TCP echo flow: one listener, at most one peer, an orphan pool.
pub struct TcpEchoFlow {
    listen_sock: SocketId,
    peer: Option<SocketId>,
    orphans: heapless::Vec<MsgRef, NUM_TCP_BUFS>,
    read_size: u32,
    post_len: u32,
    stats: FlowStats,
}

impl TcpEchoFlow {
    /// Create the flow for an already-listening socket. Messages are added
    /// with [`park`](Self::park) and stay orphaned until a peer accepts.
    pub fn new(listen_sock: SocketId, read_size: u32, post_len: u32) -> Self {
        Self {
            listen_sock,
            peer: None,
            orphans: heapless::Vec::new(),
            read_size,
            post_len,
            stats: FlowStats::default(),
        }
    }

    pub fn listen_sock(&self) -> SocketId {
        self.listen_sock
    }

    /// Currently accepted peer, if any.
    pub fn peer(&self) -> Option<SocketId> {
        self.peer
    }

    /// Buffers parked while no peer exists.
    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    /// Get flow statistics
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Park a message in the orphan pool. Startup provisioning; does not
    /// count toward [`FlowStats::parked`], which tracks only completions
    /// stranded by a peer close.
    pub fn park(&mut self, msg: MsgRef) {
        if self.orphans.push(msg).is_err() {
            // The pool is sized to the flow's full message count.
            panic!("orphan pool overflow");
        }
    }

    /// Apply the misdirection policy to a completion whose socket no longer
    /// matches the current peer. Returns `true` when the message was parked
    /// and must not be re-posted. `stale_data` marks completions carrying
    /// payload from the old peer, which must be retried rather than echoed.
    fn retarget_or_park(&mut self, msg: MsgRef, msgs: &mut MsgPool, stale_data: bool) -> bool {
        let msg_sock = msgs.get(msg).socket_id;
        match self.peer {
            Some(peer) if msg_sock == peer => false,
            Some(peer) => {
                debug!("re-targeting completion from socket {} to {}", msg_sock, peer);
                let m = msgs.get_mut(msg);
                m.socket_id = peer;
                if stale_data {
                    m.done_len = DONE_ERR;
                }
                self.stats.retargeted += 1;
                false
            }
            None => {
                debug!("peer closed; parking completion for socket {}", msg_sock);
                self.stats.parked += 1;
                self.park(msg);
                true
            }
        }
    }

    /// Transmit completion: the echoed data went out, so the buffer turns
    /// back into a receive for the next request.
    pub(crate) fn on_sent<R: RingTransport>(
        &mut self,
        msg: MsgRef,
        msgs: &mut MsgPool,
        rx_ring: &mut R,
    ) {
        {
            let m = msgs.get_mut(msg);
            m.total_len = self.read_size;
            m.done_len = 0;
        }
        if self.retarget_or_park(msg, msgs, false) {
            return;
        }
        post(rx_ring, msg, self.post_len);
    }

    /// Receive completion: echo the data back, or retry an empty/failed
    /// receive with the message reset to its nominal read size.
    pub(crate) fn on_received<R: RingTransport>(
        &mut self,
        msg: MsgRef,
        msgs: &mut MsgPool,
        rx_ring: &mut R,
        tx_ring: &mut R,
    ) {
        if self.retarget_or_park(msg, msgs, true) {
            return;
        }

        let m = msgs.get_mut(msg);
        if m.done_len == DONE_ERR || m.done_len == 0 {
            m.total_len = self.read_size;
            m.done_len = 0;
            self.stats.retried += 1;
            post(rx_ring, msg, self.post_len);
        } else {
            m.total_len = m.done_len as u32;
            m.done_len = 0;
            self.stats.echoed += 1;
            with_net_stats(|s| s.echoed += 1);
            post(tx_ring, msg, self.post_len);
        }
    }

    /// Handle a connection event on the listener or the peer.
    pub fn handle_event<C: SocketControl, R: RingTransport>(
        &mut self,
        event: TcpEvent,
        ctrl: &mut C,
        msgs: &mut MsgPool,
        rx_ring: &mut R,
    ) -> NetResult<()> {
        match event {
            TcpEvent::PeerClosed { peer } => {
                let current = self.peer.ok_or(NetError::InvalidState)?;
                debug_assert_eq!(peer, current, "close event for unknown peer");
                ctrl.close(current)?;
                self.peer = None;
                debug!("closed peer socket {}", current);
                Ok(())
            }
            TcpEvent::PeerAvailable => {
                let peer = ctrl.accept(self.listen_sock)?;
                ctrl.set_async(peer, true)?;
                self.peer = Some(peer);

                // Hand the whole orphan backlog to the new peer before any
                // new I/O is accepted for it.
                let reclaimed = self.orphans.len() as u64;
                while let Some(msg) = self.orphans.pop() {
                    let m = msgs.get_mut(msg);
                    m.total_len = self.read_size;
                    m.done_len = 0;
                    m.socket_id = peer;
                    post(rx_ring, msg, self.post_len);
                }
                if reclaimed > 0 {
                    debug!("re-posted {} parked buffers for peer {}", reclaimed, peer);
                }
                self.stats.reclaimed += reclaimed;
                Ok(())
            }
        }
    }
}

/// UDP echo flow: connectionless, every receive immediately becomes the
/// next transmit.
pub struct UdpEchoFlow {
    sock: SocketId,
    read_size: u32,
    post_len: u32,
    stats: FlowStats,
}

impl UdpEchoFlow {
    pub fn new(sock: SocketId, read_size: u32, post_len: u32) -> Self {
        Self {
            sock,
            read_size,
            post_len,
            stats: FlowStats::default(),
        }
    }

    pub fn sock(&self) -> SocketId {
        self.sock
    }

    /// Get flow statistics
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    pub(crate) fn on_sent<R: RingTransport>(
        &mut self,
        msg: MsgRef,
        msgs: &mut MsgPool,
        rx_ring: &mut R,
    ) {
        let m = msgs.get_mut(msg);
        m.total_len = self.read_size;
        m.done_len = 0;
        m.socket_id = self.sock;
        post(rx_ring, msg, self.post_len);
    }

    pub(crate) fn on_received<R: RingTransport>(
        &mut self,
        msg: MsgRef,
        msgs: &mut MsgPool,
        rx_ring: &mut R,
        tx_ring: &mut R,
    ) {
        let m = msgs.get_mut(msg);
        if m.done_len == DONE_ERR || m.done_len == 0 {
            m.total_len = self.read_size;
            m.done_len = 0;
            self.stats.retried += 1;
            post(rx_ring, msg, self.post_len);
        } else {
            m.total_len = m.done_len as u32;
            m.done_len = 0;
            self.stats.echoed += 1;
            with_net_stats(|s| s.echoed += 1);
            post(tx_ring, msg, self.post_len);
        }
    }
}
