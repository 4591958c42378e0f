//! End-to-end scenarios exercised against real loopback UDP sockets: a
//! started `RpcServer` talking to hand-rolled stub peers on the other end.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dht_rpc::{InMemoryRoutingTable, NullDhtLayer, RpcCall, RpcCallListener, RpcServer, RpcServerConfig};
use dht_wire::{AlwaysPing, ErrorCode, Message, Response};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn start_server(config: RpcServerConfig) -> (Arc<RpcServer>, SocketAddr) {
    let server = RpcServer::new(
        loopback(),
        config,
        Arc::new(InMemoryRoutingTable::new()),
        Arc::new(NullDhtLayer::new()),
    );
    server.start().unwrap();
    let addr = server.public_address().unwrap();
    (server, addr)
}

fn stub_peer() -> (StdUdpSocket, SocketAddr) {
    let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let addr = socket.local_addr().unwrap();
    (socket, addr)
}

fn wait_until(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::yield_now();
    }
    condition()
}

#[test]
fn happy_ping_round_trips_through_real_sockets() {
    let (server, server_addr) = start_server(RpcServerConfig::default());
    let (stub, stub_addr) = stub_peer();

    #[derive(Default)]
    struct Observed(Mutex<bool>);
    impl RpcCallListener for Observed {
        fn on_response(&self, _call: &RpcCall, _response: &Message) {
            *self.0.lock().unwrap() = true;
        }
    }
    let observed = Arc::new(Observed::default());

    let call = server.ping(stub_addr);
    call.add_listener(observed.clone());

    let mut buf = [0u8; 1500];
    let (len, from) = stub.recv_from(&mut buf).expect("stub never received the query");
    assert_eq!(from.ip(), server_addr.ip());

    let query = Message::decode(&buf[..len], &AlwaysPing).unwrap();
    assert!(query.is_query());
    assert_eq!(query.transaction_id.len(), 6);

    let reply = Message::response(query.transaction_id.clone(), Response { id: [9u8; 20], ..Default::default() });
    stub.send_to(&reply.encode(), server_addr).unwrap();

    assert!(wait_until(|| call.is_completed(), Duration::from_secs(2)));
    assert!(*observed.0.lock().unwrap());
    assert!(wait_until(|| server.num_active_rpc_calls() == 0, Duration::from_secs(2)));
    assert_eq!(server.num_sent(), 1);
    assert_eq!(server.num_received(), 1);

    server.stop();
}

/// A payload that passes the read-loop prefilter (length >= 10, starts with
/// `b'd'`, nonzero source port) but is not valid bencode: `decode_dict` hits
/// a key byte that isn't a digit and can't find a `:` to close out a length
/// prefix, so it fails with `Eof` rather than producing a `Dict`.
#[test]
fn malformed_but_prefilter_passing_input_gets_a_protocol_error_reply() {
    let (server, server_addr) = start_server(RpcServerConfig::default());
    let (stub, _stub_addr) = stub_peer();

    stub.send_to(b"dxxxxxxxxx", server_addr).unwrap();

    let mut buf = [0u8; 1500];
    let (len, _from) = stub.recv_from(&mut buf).expect("stub never received the error reply");
    let reply = Message::decode(&buf[..len], &AlwaysPing).unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.transaction_id, vec![0u8; 4]);
    match reply.body {
        dht_wire::Body::Error(e) => assert_eq!(e.code, ErrorCode::Protocol.code()),
        _ => unreachable!(),
    }

    assert!(wait_until(|| server.num_received() == 1, Duration::from_secs(2)));
    server.stop();
}

/// A response with no matching call, delivered before `stray_response_grace`
/// has elapsed, is dropped silently; once the grace period is behind it, the
/// same response draws a `ServerError` reply. The grace period is shrunk to
/// a few milliseconds here rather than waited out at its real 120s default.
#[test]
fn stray_response_is_silent_in_grace_then_errors_after_it() {
    let mut config = RpcServerConfig::default();
    config.stray_response_grace = Duration::from_millis(20);
    let (server, server_addr) = start_server(config);
    let (stub, _stub_addr) = stub_peer();

    let stray = Message::response(b"zzzzzz".to_vec(), Response { id: [1u8; 20], ..Default::default() });
    stub.send_to(&stray.encode(), server_addr).unwrap();

    // Within the grace window: dropped silently, nothing comes back.
    stub.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    assert!(stub.recv_from(&mut [0u8; 64]).is_err());

    std::thread::sleep(Duration::from_millis(40));

    stub.send_to(&stray.encode(), server_addr).unwrap();
    stub.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
    let mut buf = [0u8; 1500];
    let (len, _from) = stub.recv_from(&mut buf).expect("stray response past grace should draw a reply");
    let reply = Message::decode(&buf[..len], &AlwaysPing).unwrap();
    assert!(reply.is_error());
    assert_eq!(reply.transaction_id, b"zzzzzz");
    match reply.body {
        dht_wire::Body::Error(e) => assert_eq!(e.code, ErrorCode::Server.code()),
        _ => unreachable!(),
    }

    server.stop();
}

/// A response that matches a call's transaction id but arrives from a
/// different source than the call's destination stalls the call instead of
/// completing it.
#[test]
fn source_destination_mismatch_stalls_instead_of_completing() {
    let (server, server_addr) = start_server(RpcServerConfig::default());
    let (stub, stub_addr) = stub_peer();
    let (impostor, _impostor_addr) = stub_peer();

    let call = server.ping(stub_addr);

    let mut buf = [0u8; 1500];
    let (len, _from) = stub.recv_from(&mut buf).expect("stub never received the query");
    let query = Message::decode(&buf[..len], &AlwaysPing).unwrap();

    let reply = Message::response(query.transaction_id, Response { id: [2u8; 20], ..Default::default() });
    impostor.send_to(&reply.encode(), server_addr).unwrap();

    assert!(wait_until(|| call.is_stalled(), Duration::from_secs(2)));
    assert!(!call.is_completed());
    assert_eq!(server.num_active_rpc_calls(), 1);

    server.stop();
}

/// A call past the active-call ceiling queues without a transaction id;
/// once the in-flight call completes, the queued call is admitted, assigned
/// a fresh id, and actually sent over the wire.
#[test]
fn backpressure_queues_then_drains_onto_the_wire() {
    let mut config = RpcServerConfig::default();
    config.max_active_calls = 1;
    let (server, server_addr) = start_server(config);
    let (first_stub, first_addr) = stub_peer();
    let (second_stub, second_addr) = stub_peer();

    let first = server.ping(first_addr);
    assert!(wait_until(|| first.mtid().is_some(), Duration::from_secs(2)));

    let second = server.ping(second_addr);
    assert!(second.mtid().is_none());
    assert_eq!(server.num_active_rpc_calls(), 1);

    let mut buf = [0u8; 1500];
    let (len, _from) = first_stub.recv_from(&mut buf).expect("first stub never received the query");
    let first_query = Message::decode(&buf[..len], &AlwaysPing).unwrap();
    let reply = Message::response(first_query.transaction_id, Response { id: [3u8; 20], ..Default::default() });
    first_stub.send_to(&reply.encode(), server_addr).unwrap();

    assert!(wait_until(|| first.is_completed(), Duration::from_secs(2)));
    assert!(wait_until(|| second.mtid().is_some(), Duration::from_secs(2)));

    let (len, _from) = second_stub.recv_from(&mut buf).expect("second stub never received its query once drained");
    let second_query = Message::decode(&buf[..len], &AlwaysPing).unwrap();
    assert_eq!(second_query.transaction_id, second.mtid().unwrap());

    server.stop();
}

/// 21 distinct loopback source addresses vote on our external address (15
/// for one, 6 for another); once population exceeds the election threshold
/// the majority wins. Each response rides an actual matched `ping` call so
/// it reaches `handle_message` through the legitimate completion path.
#[test]
fn consensus_elects_the_majority_reported_address() {
    let mut config = RpcServerConfig::default();
    config.consensus_min_for_election = 20;
    let (server, server_addr) = start_server(config);

    let majority: SocketAddr = "203.0.113.5:6881".parse().unwrap();
    let minority: SocketAddr = "203.0.113.9:6881".parse().unwrap();

    let stubs: Vec<(StdUdpSocket, SocketAddr)> = (2..=22u8)
        .map(|i| {
            let socket = StdUdpSocket::bind(format!("127.0.0.{i}:0")).unwrap();
            socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
            let addr = socket.local_addr().unwrap();
            (socket, addr)
        })
        .collect();

    let calls: Vec<_> = stubs.iter().map(|(_, addr)| server.ping(*addr)).collect();

    for (i, (stub, _addr)) in stubs.iter().enumerate() {
        let mut buf = [0u8; 1500];
        let (len, _from) = stub.recv_from(&mut buf).expect("stub never received its query");
        let query = Message::decode(&buf[..len], &AlwaysPing).unwrap();
        let observed = if i < 15 { majority } else { minority };
        let response = Response { id: [4u8; 20], observed_addr: Some(observed), ..Default::default() };
        stub.send_to(&Message::response(query.transaction_id, response).encode(), server_addr).unwrap();
    }

    for call in &calls {
        assert!(wait_until(|| call.is_completed(), Duration::from_secs(2)));
    }
    assert!(wait_until(|| server.consensus_external_address() == Some(majority), Duration::from_secs(2)));

    server.stop();
}
