//! UDP loopback round trip
//!
//! Two datagram sockets exchange packets over the loopback device; the
//! receiver learns the sender's endpoint and answers without an explicit
//! connect.

use basalt_kernel::net::{
    self, device,
    socket::{self, SocketType},
};

#[test]
fn datagram_round_trip_records_remote_endpoint() {
    device::register(Box::new(device::LoopbackDevice::new()));
    net::init();
    let ip = net::local_ip();

    let server = socket::create(SocketType::Datagram).unwrap();
    socket::bind(server, ip, 9001).unwrap();

    let client = socket::create(SocketType::Datagram).unwrap();
    socket::bind(client, ip, 9000).unwrap();
    socket::connect(client, ip, 9001).unwrap();

    assert_eq!(socket::send(client, b"ping").unwrap(), 4);

    let mut buf = [0u8; 16];
    let n = socket::recv(server, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"ping");

    // The server learned where the datagram came from.
    let peer = socket::remote_endpoint(server).unwrap();
    assert_eq!(peer.ip, ip);
    assert_eq!(peer.port, 9000);

    // ...and can answer using that recorded endpoint.
    assert_eq!(socket::send(server, b"pong!").unwrap(), 5);
    let n = socket::recv(client, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"pong!");

    socket::close(client).unwrap();
    socket::close(server).unwrap();
}

#[test]
fn datagram_boundaries_are_preserved() {
    device::register(Box::new(device::LoopbackDevice::new()));
    net::init();
    let ip = net::local_ip();

    let receiver = socket::create(SocketType::Datagram).unwrap();
    socket::bind(receiver, ip, 9003).unwrap();

    let sender = socket::create(SocketType::Datagram).unwrap();
    socket::bind(sender, ip, 9002).unwrap();
    socket::connect(sender, ip, 9003).unwrap();

    socket::send(sender, b"first").unwrap();
    socket::send(sender, b"second-longer").unwrap();

    let mut buf = [0u8; 64];
    let n = socket::recv(receiver, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"first", "one datagram per recv");
    let n = socket::recv(receiver, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"second-longer");

    socket::close(sender).unwrap();
    socket::close(receiver).unwrap();
}
