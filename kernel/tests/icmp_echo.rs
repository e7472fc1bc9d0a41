//! ICMP echo scenario
//!
//! A host pings 10.0.2.15 with identifier 0x1234, sequence 1 and a
//! 32-byte pattern payload; the reply must mirror all three and carry a
//! valid checksum. One test body: device registration is global, so the
//! scenarios run sequentially on one capture device.

use std::sync::{Arc, Mutex};

use basalt_kernel::net::{
    self, arp, checksum, device, ethernet, icmp, ip, Ipv4Address, MacAddress,
};

/// Test device capturing every transmitted frame.
struct CaptureDevice {
    mac: MacAddress,
    frames: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl device::EthernetDevice for CaptureDevice {
    fn name(&self) -> &str {
        "cap0"
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> basalt_kernel::KernelResult<()> {
        self.frames.lock().unwrap().push(frame.to_vec());
        Ok(())
    }
}

fn ipv4_frame(
    dst_mac: MacAddress,
    src_mac: MacAddress,
    src_ip: Ipv4Address,
    dst_ip: Ipv4Address,
    icmp_payload: &[u8],
) -> Vec<u8> {
    let ip_header = ip::build_header(src_ip, dst_ip, ip::PROTO_ICMP, icmp_payload.len());
    let mut packet = ip_header.to_vec();
    packet.extend_from_slice(icmp_payload);
    ethernet::build_frame(dst_mac, src_mac, ethernet::ETHERTYPE_IPV4, &packet)
}

#[test]
fn echo_request_gets_a_mirrored_reply() {
    let captured = Arc::new(Mutex::new(Vec::new()));
    let our_mac = MacAddress::new([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
    device::register(Box::new(CaptureDevice {
        mac: our_mac,
        frames: captured.clone(),
    }));
    net::init();

    let host_ip = Ipv4Address::new(10, 0, 2, 2);
    let host_mac = MacAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x11, 0x22]);
    // Pre-seed ARP so the reply does not wait on resolution.
    arp::insert(host_ip, host_mac);

    // Build the request: 32-byte pattern payload 0x00..0x1F.
    let payload: Vec<u8> = (0u8..0x20).collect();
    let echo = icmp::build_echo(icmp::TYPE_ECHO_REQUEST, 0x1234, 1, &payload);
    let frame = ipv4_frame(our_mac, host_mac, host_ip, net::local_ip(), &echo);

    device::process_frame(&frame);

    // Exactly one reply frame, addressed back to the host.
    {
        let frames = captured.lock().unwrap();
        assert_eq!(frames.len(), 1, "one echo reply expected");
        let reply = &frames[0];

        assert_eq!(&reply[0..6], &host_mac.0, "destination MAC");
        assert_eq!(
            u16::from_be_bytes([reply[12], reply[13]]),
            ethernet::ETHERTYPE_IPV4
        );

        let ip_part = &reply[ethernet::HEADER_LEN..];
        let header = ip::parse_header(ip_part).unwrap();
        assert_eq!(header.src, net::local_ip());
        assert_eq!(header.dst, host_ip);
        assert_eq!(header.protocol, ip::PROTO_ICMP);

        let icmp_part = &ip_part[header.header_len..header.total_len as usize];
        assert_eq!(icmp_part[0], icmp::TYPE_ECHO_REPLY);
        assert!(checksum::verify(icmp_part), "reply checksum must verify");
        assert_eq!(
            u16::from_be_bytes([icmp_part[4], icmp_part[5]]),
            0x1234,
            "identifier echoed"
        );
        assert_eq!(
            u16::from_be_bytes([icmp_part[6], icmp_part[7]]),
            1,
            "sequence echoed"
        );
        assert_eq!(&icmp_part[8..], &payload[..], "payload echoed");
    }

    // An echo *reply* arriving at us must not be answered.
    let stray = icmp::build_echo(icmp::TYPE_ECHO_REPLY, 7, 7, b"x");
    let frame = ipv4_frame(our_mac, host_mac, host_ip, net::local_ip(), &stray);
    device::process_frame(&frame);
    assert_eq!(captured.lock().unwrap().len(), 1, "no reply to a reply");

    // Traffic not addressed to us is dropped before ICMP sees it.
    let other_ip = Ipv4Address::new(10, 0, 2, 99);
    let echo = icmp::build_echo(icmp::TYPE_ECHO_REQUEST, 1, 1, b"y");
    let frame = ipv4_frame(our_mac, host_mac, host_ip, other_ip, &echo);
    device::process_frame(&frame);
    assert_eq!(captured.lock().unwrap().len(), 1, "not our packet");
}
