//! TCP loopback scenario
//!
//! Listener on 10.0.2.15:80, client connect, one request sent and
//! received intact, clean close on both sides. The loopback device
//! reflects frames synchronously, so the whole exchange runs to
//! completion without a scheduler.

use basalt_kernel::net::{
    self, device,
    socket::{self, SocketType},
    tcp, Endpoint, Ipv4Address,
};

fn setup() {
    device::register(Box::new(device::LoopbackDevice::new()));
    net::init();
}

#[test]
fn connect_send_recv_close() {
    setup();
    let server_ip = net::local_ip();
    assert_eq!(server_ip, Ipv4Address::new(10, 0, 2, 15));

    let listener = socket::create(SocketType::Stream).unwrap();
    socket::bind(listener, server_ip, 80).unwrap();
    socket::listen(listener, 4).unwrap();

    let client = socket::create(SocketType::Stream).unwrap();
    socket::connect(client, server_ip, 80).unwrap();

    // The handshake completed inside connect; accept returns the child.
    let (child, peer_ip, peer_port) = socket::accept(listener).unwrap();
    assert_eq!(peer_ip, server_ip);
    assert_eq!(peer_port, socket::local_endpoint(client).unwrap().port);

    let request = b"GET / HTTP/1.0\r\n\r\n";
    assert_eq!(request.len(), 18);
    assert_eq!(socket::send(client, request).unwrap(), 18);

    let mut buf = [0u8; 64];
    let n = socket::recv(child, &mut buf).unwrap();
    assert_eq!(n, 18, "exactly the bytes sent, in order");
    assert_eq!(&buf[..n], request);

    // Server closes; the client side runs the passive close to Closed
    // and its slot is released by the final ACK.
    socket::close(child).unwrap();
    assert!(
        socket::local_endpoint(client).is_err(),
        "passive close released the client slot"
    );
    socket::close(listener).unwrap();
}

#[test]
fn large_send_is_segmented_and_reassembled_in_order() {
    setup();
    let ip = net::local_ip();

    let listener = socket::create(SocketType::Stream).unwrap();
    socket::bind(listener, ip, 8081).unwrap();
    socket::listen(listener, 2).unwrap();

    let client = socket::create(SocketType::Stream).unwrap();
    socket::connect(client, ip, 8081).unwrap();
    let (child, _, _) = socket::accept(listener).unwrap();

    // Larger than one MSS: must arrive reassembled in order.
    let payload: Vec<u8> = (0..4000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(socket::send(client, &payload).unwrap(), payload.len());

    let mut received = Vec::new();
    while received.len() < payload.len() {
        let mut buf = [0u8; 1024];
        let n = socket::recv(child, &mut buf).unwrap();
        assert!(n > 0);
        received.extend_from_slice(&buf[..n]);
    }
    assert_eq!(received, payload);

    socket::close(child).unwrap();
    socket::close(listener).unwrap();
}

#[test]
fn full_accept_queue_drops_syn_silently() {
    setup();
    let ip = net::local_ip();

    let listener = socket::create(SocketType::Stream).unwrap();
    socket::bind(listener, ip, 8082).unwrap();
    socket::listen(listener, 1).unwrap();

    // One pending connection fills the backlog.
    let first = socket::create(SocketType::Stream).unwrap();
    socket::connect(first, ip, 8082).unwrap();

    // A raw SYN from a fake peer: with the queue full it must vanish
    // without creating a connection or disturbing the listener.
    let fake_remote = Endpoint::new(ip, 60123);
    let local = Endpoint::new(ip, 8082);
    let syn = tcp::build_segment(fake_remote, local, 5555, 0, tcp::FLAG_SYN, 2048, &[]);
    tcp::handle_segment(fake_remote.ip, local.ip, &syn);

    assert!(
        socket::find_stream(8082, fake_remote).is_none(),
        "dropped SYN must not materialize a connection"
    );

    // The listener still works: drain the queue and connect again.
    let (child, _, _) = socket::accept(listener).unwrap();
    let second = socket::create(SocketType::Stream).unwrap();
    socket::connect(second, ip, 8082).unwrap();
    let (child2, _, _) = socket::accept(listener).unwrap();

    socket::close(child).unwrap();
    socket::close(child2).unwrap();
    socket::close(listener).unwrap();
}

#[test]
fn snd_una_is_monotonic_under_duplicate_acks() {
    setup();
    let ip = net::local_ip();

    let listener = socket::create(SocketType::Stream).unwrap();
    socket::bind(listener, ip, 8083).unwrap();
    socket::listen(listener, 2).unwrap();

    let client = socket::create(SocketType::Stream).unwrap();
    socket::connect(client, ip, 8083).unwrap();
    let (child, _, _) = socket::accept(listener).unwrap();

    socket::send(client, b"abcd").unwrap();
    let (una, nxt, local, remote) = socket::with_socket(client, |s| {
        (s.snd_una, s.snd_nxt, s.local, s.remote)
    })
    .unwrap();
    assert_eq!(una, nxt, "everything sent has been acknowledged");

    // Replay the same ACK at the client: snd_una must not move.
    let dup_ack = tcp::build_segment(remote, local, 1, una, tcp::FLAG_ACK, 2048, &[]);
    tcp::handle_segment(remote.ip, local.ip, &dup_ack);
    let una_after = socket::with_socket(client, |s| s.snd_una).unwrap();
    assert_eq!(una_after, una);

    socket::close(child).unwrap();
    socket::close(listener).unwrap();
}
