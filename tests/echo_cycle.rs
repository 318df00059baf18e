//! End-to-end exercises of the echo pipeline: Ethernet adapter over a mock
//! driver, and the ring-transport dispatcher driving the TCP and UDP flows
//! against a simulated peer.

use echonet::config::{BUF_SIZE, TCP_READ_SIZE, UDP_READ_SIZE};
use echonet::dispatch::{EchoDispatcher, EchoFlows};
use echonet::ethdev::{EthAdapter, ProtocolStack, RawNetDevice, RxPacket, TxResult};
use echonet::flow::{SocketControl, TcpEvent, UdpEchoFlow};
use echonet::pool::{BufHandle, BufferPool, IdentityMapper};
use echonet::ring::{MsgRing, DONE_ERR};
use echonet::{NetResult, SocketId};

type TestRing = MsgRing<32>;

struct LoopbackDevice {
    sent: Vec<(u32, BufHandle)>,
}

impl RawNetDevice for LoopbackDevice {
    fn raw_tx(&mut self, _bus_addrs: &[u64], lens: &[u32], cookie: BufHandle) -> TxResult {
        self.sent.push((lens[0], cookie));
        TxResult::Enqueued
    }

    fn raw_poll(&mut self) {}

    fn mac_address(&self) -> [u8; 6] {
        [0x02, 0, 0, 0, 0, 0x42]
    }
}

/// A stack that copies out each received frame for echoing.
struct CollectStack {
    frames: Vec<Vec<u8>>,
}

impl ProtocolStack for CollectStack {
    fn input(&mut self, packet: RxPacket) -> NetResult<()> {
        self.frames.push(packet.with_payload(|p| p.to_vec()));
        Ok(())
    }
}

fn eth_adapter() -> EthAdapter<LoopbackDevice, 8> {
    let rx = BufferPool::new(4, 512, &mut IdentityMapper).unwrap();
    let tx = BufferPool::new(4, 512, &mut IdentityMapper).unwrap();
    EthAdapter::new(LoopbackDevice { sent: Vec::new() }, rx, tx)
}

#[test]
fn frame_echo_round_trip_preserves_payload_and_buffers() {
    let mut eth = eth_adapter();

    // Driver borrows a buffer, hardware fills it, completion queues it.
    let (h, _bus) = eth.alloc_rx_buffer(64).unwrap();
    {
        let pool = eth.rx_pool();
        let mut pool = pool.lock();
        pool.mark_unused(h);
        pool.payload_mut(h)[..4].copy_from_slice(b"ping");
        pool.mark_used(h);
    }
    eth.rx_complete(&[h], &[4]);

    let mut stack = CollectStack { frames: Vec::new() };
    eth.poll(&mut stack);
    assert_eq!(stack.frames, vec![b"ping".to_vec()]);
    // Delivery released the RX buffer.
    assert_eq!(eth.rx_pool().lock().counts().free, 4);

    // Echo the frame back out and verify what reached the driver.
    let frame = stack.frames.pop().unwrap();
    eth.send(&[&frame]).unwrap();
    let (len, cookie) = eth.device().sent[0];
    assert_eq!(len, 4);
    assert_eq!(eth.stats().tx_frames, 1);

    // The TX buffer stays in flight until the driver reports completion.
    assert_eq!(eth.tx_pool().lock().counts().free, 3);
    eth.tx_complete(cookie);
    assert_eq!(eth.tx_pool().lock().counts().free, 4);
}

struct MockCtrl {
    next_peer: SocketId,
    accepted: Vec<SocketId>,
    closed: Vec<SocketId>,
    async_set: Vec<SocketId>,
}

impl MockCtrl {
    fn new(first_peer: SocketId) -> Self {
        Self {
            next_peer: first_peer,
            accepted: Vec::new(),
            closed: Vec::new(),
            async_set: Vec::new(),
        }
    }
}

impl SocketControl for MockCtrl {
    fn accept(&mut self, _listen_sock: SocketId) -> NetResult<SocketId> {
        let peer = self.next_peer;
        self.next_peer += 1;
        self.accepted.push(peer);
        Ok(peer)
    }

    fn close(&mut self, sock: SocketId) -> NetResult<()> {
        self.closed.push(sock);
        Ok(())
    }

    fn set_async(&mut self, sock: SocketId, enabled: bool) -> NetResult<()> {
        assert!(enabled);
        self.async_set.push(sock);
        Ok(())
    }
}

#[test]
fn tcp_connection_lifecycle_reclaims_orphans() {
    let mut d: EchoDispatcher<TestRing> = EchoDispatcher::new(TestRing::new(), TestRing::new());
    let mut ctrl = MockCtrl::new(100);

    let mut tcp = d.setup_tcp_flow(5, 6);
    assert_eq!(tcp.orphan_count(), 6);
    assert_eq!(d.rx_ring().available(), 0);

    // First peer connects: every parked buffer goes up as a receive.
    d.handle_tcp_event(&mut tcp, &mut ctrl, TcpEvent::PeerAvailable)
        .unwrap();
    assert_eq!(ctrl.accepted, vec![100]);
    assert_eq!(ctrl.async_set, vec![100]);
    assert_eq!(tcp.peer(), Some(100));
    assert_eq!(tcp.orphan_count(), 0);
    assert_eq!(d.rx_ring().available(), 6);

    let mut flows = EchoFlows {
        tcp,
        udp: UdpEchoFlow::new(9, UDP_READ_SIZE, BUF_SIZE as u32),
    };

    // One request/response over the connection.
    let (m, _) = d.rx_ring().peer_take().unwrap();
    assert_eq!(d.msgs().get(m).socket_id, 100);
    d.msgs_mut().get_mut(m).done_len = 42;
    assert!(d.rx_ring().peer_complete(m, 42));
    d.dispatch(&mut flows);
    assert_eq!(d.tx_ring().available(), 1);
    assert_eq!(d.msgs().get(m).total_len, 42);

    // Peer closes while its echo is still on the wire.
    let mut tcp = flows.tcp;
    d.handle_tcp_event(&mut tcp, &mut ctrl, TcpEvent::PeerClosed { peer: 100 })
        .unwrap();
    assert_eq!(ctrl.closed, vec![100]);
    assert_eq!(tcp.peer(), None);

    // The in-flight send now completes with no peer: it parks.
    let (sent, _) = d.tx_ring().peer_take().unwrap();
    assert!(d.tx_ring().peer_complete(sent, 42));
    let mut flows = EchoFlows {
        tcp,
        udp: UdpEchoFlow::new(9, UDP_READ_SIZE, BUF_SIZE as u32),
    };
    d.dispatch(&mut flows);
    assert_eq!(flows.tcp.orphan_count(), 1);
    assert_eq!(d.rx_ring().available(), 5);

    // Next peer inherits the parked buffer.
    let mut tcp = flows.tcp;
    d.handle_tcp_event(&mut tcp, &mut ctrl, TcpEvent::PeerAvailable)
        .unwrap();
    assert_eq!(tcp.peer(), Some(101));
    assert_eq!(tcp.orphan_count(), 0);
    assert_eq!(d.rx_ring().available(), 6);
    // 6 buffers flushed at the first accept plus the one parked at close.
    assert_eq!(tcp.stats().reclaimed, 7);
    assert_eq!(d.msgs().get(sent).socket_id, 101);
    assert_eq!(d.msgs().get(sent).total_len, TCP_READ_SIZE);
}

#[test]
fn stale_receive_is_retargeted_and_retried() {
    let mut d: EchoDispatcher<TestRing> = EchoDispatcher::new(TestRing::new(), TestRing::new());
    let mut ctrl = MockCtrl::new(200);

    let mut tcp = d.setup_tcp_flow(5, 2);
    d.handle_tcp_event(&mut tcp, &mut ctrl, TcpEvent::PeerAvailable)
        .unwrap();
    let mut flows = EchoFlows {
        tcp,
        udp: UdpEchoFlow::new(9, UDP_READ_SIZE, BUF_SIZE as u32),
    };

    // A receive completes carrying data that was read for a previous
    // connection. The current peer is 200 but the message still names 150.
    let (m, _) = d.rx_ring().peer_take().unwrap();
    {
        let msg = d.msgs_mut().get_mut(m);
        msg.socket_id = 150;
        msg.done_len = 30;
    }
    assert!(d.rx_ring().peer_complete(m, 30));
    d.dispatch(&mut flows);

    // Stale payload is never echoed: the message is re-pointed at the
    // current peer and flagged for retry.
    assert_eq!(d.tx_ring().available(), 0);
    let msg = d.msgs().get(m);
    assert_eq!(msg.socket_id, 200);
    assert_eq!(msg.total_len, TCP_READ_SIZE);
    assert_eq!(msg.done_len, 0);
    assert_eq!(flows.tcp.stats().retargeted, 1);
    assert_eq!(flows.tcp.stats().retried, 1);
    assert_eq!(flows.tcp.stats().echoed, 0);
}

#[test]
fn udp_echo_survives_transient_failures() {
    let mut d: EchoDispatcher<TestRing> = EchoDispatcher::new(TestRing::new(), TestRing::new());
    let udp = d.setup_udp_flow(9, 3).unwrap();
    let mut flows = EchoFlows {
        tcp: d.setup_tcp_flow(5, 0),
        udp,
    };

    // The same message fails twice before the datagram finally lands.
    let (m, _) = d.rx_ring().peer_take().unwrap();
    for _ in 0..2 {
        d.msgs_mut().get_mut(m).done_len = DONE_ERR;
        assert!(d.rx_ring().peer_complete(m, 0));
        d.dispatch(&mut flows);
        let (again, _) = d.rx_ring().peer_take().unwrap();
        assert_eq!(again, m);
        assert_eq!(d.msgs().get(m).total_len, UDP_READ_SIZE);
    }
    d.msgs_mut().get_mut(m).done_len = 64;
    assert!(d.rx_ring().peer_complete(m, 64));
    d.dispatch(&mut flows);

    assert_eq!(flows.udp.stats().retried, 2);
    assert_eq!(flows.udp.stats().echoed, 1);
    assert_eq!(d.tx_ring().available(), 1);
    assert_eq!(d.msgs().get(m).total_len, 64);

    // The send completes and the buffer goes straight back to receiving.
    let (sent, _) = d.tx_ring().peer_take().unwrap();
    assert!(d.tx_ring().peer_complete(sent, 64));
    d.dispatch(&mut flows);
    assert_eq!(d.rx_ring().available(), 3);
}
