//! Ring transport dispatcher.
//!
//! One dispatch pass runs on arrival of the peer's asynchronous
//! notification, never on a timer. It drains the transmit-completion ring,
//! then the receive-completion ring, routing every completed message to its
//! owning flow by the embedded flow tag, and signals the peer exactly once
//! for the whole pass so notification overhead is batched. Each ring is
//! drained to empty: a message left behind would be stranded until the next
//! unrelated notification.

use log::{debug, error};

use crate::config::{BUF_SIZE, NUM_TCP_BUFS, NUM_UDP_BUFS, TCP_READ_SIZE, UDP_READ_SIZE};
use crate::flow::{
    SocketControl, TcpEchoFlow, TcpEvent, UdpEchoFlow, TCP_FLOW_TAG, UDP_FLOW_TAG,
};
use crate::ring::{MsgPool, RingTransport, TxMsg, NO_SOCKET};
use crate::{with_net_stats, NetError, NetResult, SocketId};

/// The echo flows a dispatcher routes completions to.
pub struct EchoFlows {
    pub tcp: TcpEchoFlow,
    pub udp: UdpEchoFlow,
}

/// Dispatcher statistics
#[derive(Debug, Default, Clone)]
pub struct DispatchStats {
    pub passes: u64,
    pub tx_completions: u64,
    pub rx_completions: u64,
    pub bad_tags: u64,
}

/// Drains the two completion rings and routes messages by flow tag.
///
/// Owns the message arena and both rings; flows borrow them during a pass.
pub struct EchoDispatcher<R: RingTransport> {
    tx_ring: R,
    rx_ring: R,
    msgs: MsgPool,
    stats: DispatchStats,
}

impl<R: RingTransport> EchoDispatcher<R> {
    pub fn new(tx_ring: R, rx_ring: R) -> Self {
        Self {
            tx_ring,
            rx_ring,
            msgs: MsgPool::new(),
            stats: DispatchStats::default(),
        }
    }

    /// Build the TCP echo flow with `count` transport messages.
    ///
    /// The messages start parked: TCP buffers only reach the receive ring
    /// once a peer has been accepted, which also exercises the orphan
    /// reclamation path at startup.
    pub fn setup_tcp_flow(&mut self, listen_sock: SocketId, count: usize) -> TcpEchoFlow {
        let mut flow = TcpEchoFlow::new(listen_sock, TCP_READ_SIZE, BUF_SIZE as u32);
        for _ in 0..count {
            let mut msg = TxMsg::new();
            msg.socket_id = NO_SOCKET;
            msg.flow_tag = TCP_FLOW_TAG;
            flow.park(self.msgs.add(msg));
        }
        debug!("tcp flow ready: listener {}, {} buffers parked", listen_sock, count);
        flow
    }

    /// Build the TCP echo flow with the configured buffer count.
    pub fn setup_tcp_flow_default(&mut self, listen_sock: SocketId) -> TcpEchoFlow {
        self.setup_tcp_flow(listen_sock, NUM_TCP_BUFS)
    }

    /// Build the UDP echo flow with `count` transport messages, posting all
    /// of them to the receive ring and notifying the peer once.
    pub fn setup_udp_flow(&mut self, sock: SocketId, count: usize) -> NetResult<UdpEchoFlow> {
        let flow = UdpEchoFlow::new(sock, UDP_READ_SIZE, BUF_SIZE as u32);
        for _ in 0..count {
            let mut msg = TxMsg::new();
            msg.socket_id = sock;
            msg.flow_tag = UDP_FLOW_TAG;
            msg.total_len = UDP_READ_SIZE;
            let m = self.msgs.add(msg);
            if !self.rx_ring.post_available(m, BUF_SIZE as u32) {
                return Err(NetError::RingFull);
            }
        }
        self.tx_ring.notify_peer();
        debug!("udp flow ready: socket {}, {} receives posted", sock, count);
        Ok(flow)
    }

    /// Build the UDP echo flow with the configured buffer count.
    pub fn setup_udp_flow_default(&mut self, sock: SocketId) -> NetResult<UdpEchoFlow> {
        self.setup_udp_flow(sock, NUM_UDP_BUFS)
    }

    /// One dispatch pass, triggered by the peer's notification.
    pub fn dispatch(&mut self, flows: &mut EchoFlows) {
        // Transmit completions first: sent buffers become receives again.
        while let Some((msg, _len)) = self.tx_ring.poll_completed() {
            self.stats.tx_completions += 1;
            match self.msgs.get(msg).flow_tag {
                TCP_FLOW_TAG => flows.tcp.on_sent(msg, &mut self.msgs, &mut self.rx_ring),
                UDP_FLOW_TAG => flows.udp.on_sent(msg, &mut self.msgs, &mut self.rx_ring),
                tag => {
                    error!("tx completion with unknown flow tag {:#x}", tag);
                    self.stats.bad_tags += 1;
                }
            }
        }

        // Receive completions: echo the data or retry the receive.
        while let Some((msg, _len)) = self.rx_ring.poll_completed() {
            self.stats.rx_completions += 1;
            match self.msgs.get(msg).flow_tag {
                TCP_FLOW_TAG => {
                    flows
                        .tcp
                        .on_received(msg, &mut self.msgs, &mut self.rx_ring, &mut self.tx_ring)
                }
                UDP_FLOW_TAG => {
                    flows
                        .udp
                        .on_received(msg, &mut self.msgs, &mut self.rx_ring, &mut self.tx_ring)
                }
                tag => {
                    error!("rx completion with unknown flow tag {:#x}", tag);
                    self.stats.bad_tags += 1;
                }
            }
        }

        // One signal for the whole pass.
        self.tx_ring.notify_peer();
        self.stats.passes += 1;
        with_net_stats(|s| s.dispatch_passes += 1);
    }

    /// Route a TCP connection event to the flow, giving it access to the
    /// message arena and the receive ring for orphan reclamation.
    pub fn handle_tcp_event<C: SocketControl>(
        &mut self,
        flow: &mut TcpEchoFlow,
        ctrl: &mut C,
        event: TcpEvent,
    ) -> NetResult<()> {
        flow.handle_event(event, ctrl, &mut self.msgs, &mut self.rx_ring)
    }

    /// The message arena.
    pub fn msgs(&self) -> &MsgPool {
        &self.msgs
    }

    pub fn msgs_mut(&mut self) -> &mut MsgPool {
        &mut self.msgs
    }

    /// The transmit-completion ring.
    pub fn tx_ring(&mut self) -> &mut R {
        &mut self.tx_ring
    }

    /// The receive-completion ring.
    pub fn rx_ring(&mut self) -> &mut R {
        &mut self.rx_ring
    }

    /// Get dispatcher statistics
    pub fn stats(&self) -> &DispatchStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::{MsgRing, DONE_ERR};

    type TestRing = MsgRing<16>;

    fn dispatcher() -> EchoDispatcher<TestRing> {
        EchoDispatcher::new(TestRing::new(), TestRing::new())
    }

    #[test]
    fn udp_tx_completion_becomes_rx_post() {
        let mut d = dispatcher();
        let udp = d.setup_udp_flow(7, 4).unwrap();
        let mut flows = EchoFlows {
            tcp: d.setup_tcp_flow(1, 0),
            udp,
        };
        // Peer drains one receive and later reports the send finished.
        let (m, _) = d.rx_ring().peer_take().unwrap();
        d.msgs_mut().get_mut(m).total_len = 100;
        assert!(d.tx_ring().peer_complete(m, 100));

        d.dispatch(&mut flows);

        // Reset and back on the receive ring for the next datagram.
        assert_eq!(d.rx_ring().available(), 4);
        let msg = d.msgs().get(m);
        assert_eq!(msg.total_len, UDP_READ_SIZE);
        assert_eq!(msg.done_len, 0);
        assert_eq!(msg.socket_id, 7);
    }

    #[test]
    fn udp_echo_cycle_notifies_once_per_pass() {
        let mut d = dispatcher();
        let udp = d.setup_udp_flow(7, 4).unwrap();
        let mut flows = EchoFlows {
            tcp: d.setup_tcp_flow(1, 0),
            udp,
        };
        // setup_udp_flow signals once when the initial receives go up.
        assert_eq!(d.tx_ring().notifications(), 1);

        // One pass carrying both a TX completion and an RX completion.
        let (sent, _) = d.rx_ring().peer_take().unwrap();
        assert!(d.tx_ring().peer_complete(sent, 0));
        let (received, _) = d.rx_ring().peer_take().unwrap();
        d.msgs_mut().get_mut(received).done_len = 100;
        assert!(d.rx_ring().peer_complete(received, 100));

        d.dispatch(&mut flows);

        // Exactly one notify for the pass, not one per message.
        assert_eq!(d.tx_ring().notifications(), 2);
        assert_eq!(d.stats().passes, 1);

        // The received datagram moved to the transmit ring.
        assert_eq!(d.tx_ring().available(), 1);
        let msg = d.msgs().get(received);
        assert_eq!(msg.total_len, 100);
        assert_eq!(msg.done_len, 0);
        assert_eq!(flows.udp.stats().echoed, 1);
    }

    #[test]
    fn failed_receive_is_retried_unchanged() {
        let mut d = dispatcher();
        let udp = d.setup_udp_flow(7, 2).unwrap();
        let mut flows = EchoFlows {
            tcp: d.setup_tcp_flow(1, 0),
            udp,
        };
        let (m, _) = d.rx_ring().peer_take().unwrap();
        d.msgs_mut().get_mut(m).done_len = DONE_ERR;
        assert!(d.rx_ring().peer_complete(m, 0));

        d.dispatch(&mut flows);

        // Same message re-posted to the receive ring, lengths reset,
        // nothing echoed.
        assert_eq!(d.tx_ring().available(), 0);
        assert_eq!(d.rx_ring().available(), 2);
        let msg = d.msgs().get(m);
        assert_eq!(msg.total_len, UDP_READ_SIZE);
        assert_eq!(msg.done_len, 0);
        assert_eq!(flows.udp.stats().retried, 1);
        assert_eq!(flows.udp.stats().echoed, 0);
    }

    #[test]
    fn parked_counts_recovery_not_provisioning() {
        let mut d = dispatcher();
        let tcp = d.setup_tcp_flow(1, 3);
        // Startup provisioning fills the orphan pool without touching the
        // stranded-completion counter.
        assert_eq!(tcp.orphan_count(), 3);
        assert_eq!(tcp.stats().parked, 0);

        let mut flows = EchoFlows {
            tcp,
            udp: UdpEchoFlow::new(7, UDP_READ_SIZE, BUF_SIZE as u32),
        };
        // A receive completes after the peer went away: that one parks and
        // is counted.
        let mut msg = TxMsg::new();
        msg.flow_tag = TCP_FLOW_TAG;
        msg.socket_id = 100;
        msg.done_len = 20;
        let m = d.msgs_mut().add(msg);
        assert!(d.rx_ring().peer_complete(m, 20));
        d.dispatch(&mut flows);

        assert_eq!(flows.tcp.orphan_count(), 4);
        assert_eq!(flows.tcp.stats().parked, 1);
    }

    #[test]
    fn unknown_tag_is_counted_not_fatal() {
        let mut d = dispatcher();
        let mut flows = EchoFlows {
            tcp: d.setup_tcp_flow(1, 0),
            udp: UdpEchoFlow::new(7, UDP_READ_SIZE, BUF_SIZE as u32),
        };
        let mut msg = TxMsg::new();
        msg.flow_tag = 0xdead;
        let m = d.msgs_mut().add(msg);
        assert!(d.rx_ring().peer_complete(m, 0));

        d.dispatch(&mut flows);
        assert_eq!(d.stats().bad_tags, 1);
    }

    #[test]
    fn both_rings_drain_to_empty() {
        let mut d = dispatcher();
        let udp = d.setup_udp_flow(7, 8).unwrap();
        let mut flows = EchoFlows {
            tcp: d.setup_tcp_flow(1, 0),
            udp,
        };
        for _ in 0..4 {
            let (m, _) = d.rx_ring().peer_take().unwrap();
            d.msgs_mut().get_mut(m).done_len = 10;
            assert!(d.rx_ring().peer_complete(m, 10));
        }
        for _ in 0..4 {
            let (m, _) = d.rx_ring().peer_take().unwrap();
            assert!(d.tx_ring().peer_complete(m, 0));
        }

        d.dispatch(&mut flows);
        assert_eq!(d.stats().rx_completions, 4);
        assert_eq!(d.stats().tx_completions, 4);
        assert_eq!(d.rx_ring().completed(), 0);
        assert_eq!(d.tx_ring().completed(), 0);
        // 4 echoes on the TX ring, 4 resets back on the RX ring.
        assert_eq!(d.tx_ring().available(), 4);
        assert_eq!(d.rx_ring().available(), 4);
    }
}
