//! IPv4
//!
//! Emit builds a 20-byte header (IHL=5, TTL=64, DF clear), checksums it,
//! resolves the destination MAC and hands the frame to Ethernet. Ingress
//! validates, filters for us-or-broadcast, trims to `total_len` and
//! demuxes on the protocol field.

use alloc::vec::Vec;

use super::{checksum, ethernet, Ipv4Address};
use crate::error::{KernelResult, NetError};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// Header length with IHL=5 (no options).
pub const HEADER_LEN: usize = 20;

const DEFAULT_TTL: u8 = 64;

/// Parsed header fields the upper layers care about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Address,
    pub dst: Ipv4Address,
    pub protocol: u8,
    pub total_len: u16,
    pub header_len: usize,
}

/// Build the header for a payload of `payload_len` bytes.
pub fn build_header(
    src: Ipv4Address,
    dst: Ipv4Address,
    protocol: u8,
    payload_len: usize,
) -> [u8; HEADER_LEN] {
    let mut header = [0u8; HEADER_LEN];
    header[0] = 0x45; // version 4, IHL 5
    let total_len = (HEADER_LEN + payload_len) as u16;
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    // identification stays 0; DF=0, no fragmentation support
    header[8] = DEFAULT_TTL;
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.0);
    header[16..20].copy_from_slice(&dst.0);

    let sum = checksum::checksum(&header);
    header[10..12].copy_from_slice(&sum.to_be_bytes());
    header
}

/// Parse and validate a header, without trusting `data`'s length.
pub fn parse_header(data: &[u8]) -> KernelResult<Ipv4Header> {
    if data.len() < HEADER_LEN {
        return Err(NetError::Malformed { what: "ipv4 header" }.into());
    }
    if data[0] >> 4 != 4 {
        return Err(NetError::Malformed { what: "ip version" }.into());
    }
    let header_len = ((data[0] & 0xF) as usize) * 4;
    if header_len < HEADER_LEN || data.len() < header_len {
        return Err(NetError::Malformed { what: "ihl" }.into());
    }
    if !checksum::verify(&data[..header_len]) {
        return Err(NetError::Malformed {
            what: "ip checksum",
        }
        .into());
    }

    Ok(Ipv4Header {
        src: Ipv4Address([data[12], data[13], data[14], data[15]]),
        dst: Ipv4Address([data[16], data[17], data[18], data[19]]),
        protocol: data[9],
        total_len: u16::from_be_bytes([data[2], data[3]]),
        header_len,
    })
}

/// Emit `payload` to `dst` under `protocol`.
pub fn send(dst: Ipv4Address, protocol: u8, payload: &[u8]) -> KernelResult<()> {
    let src = super::local_ip();
    let dst_mac = super::arp::resolve(dst)?;
    let src_mac = super::device::mac_address()?;

    let header = build_header(src, dst, protocol, payload.len());
    let mut packet = Vec::with_capacity(HEADER_LEN + payload.len());
    packet.extend_from_slice(&header);
    packet.extend_from_slice(payload);

    let frame = ethernet::build_frame(dst_mac, src_mac, ethernet::ETHERTYPE_IPV4, &packet);
    super::device::transmit(&frame)
}

/// Ingress demux, called from the Ethernet RX path.
pub fn handle_packet(data: &[u8]) {
    let header = match parse_header(data) {
        Ok(header) => header,
        Err(_) => return,
    };

    // Only traffic addressed to us or broadcast.
    let our_ip = super::local_ip();
    if header.dst != our_ip && !header.dst.is_broadcast() {
        return;
    }

    // Trim Ethernet padding down to the IP total length.
    let total = header.total_len as usize;
    if total < header.header_len || total > data.len() {
        return;
    }
    let payload = &data[header.header_len..total];

    match header.protocol {
        PROTO_ICMP => super::icmp::handle_packet(header.src, payload),
        PROTO_UDP => super::udp::handle_packet(header.src, payload),
        PROTO_TCP => super::tcp::handle_segment(header.src, header.dst, payload),
        _ => {
            #[cfg(feature = "net_debug")]
            log::trace!("ip: dropping protocol {}", header.protocol);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn built_header_parses_back() {
        let src = Ipv4Address::new(10, 0, 2, 15);
        let dst = Ipv4Address::new(10, 0, 2, 2);
        let header = build_header(src, dst, PROTO_UDP, 100);

        let parsed = parse_header(&header).unwrap();
        assert_eq!(parsed.src, src);
        assert_eq!(parsed.dst, dst);
        assert_eq!(parsed.protocol, PROTO_UDP);
        assert_eq!(parsed.total_len as usize, HEADER_LEN + 100);
        assert_eq!(parsed.header_len, HEADER_LEN);
    }

    #[test]
    fn header_fields_match_the_wire_format() {
        let header = build_header(
            Ipv4Address::new(1, 2, 3, 4),
            Ipv4Address::new(5, 6, 7, 8),
            PROTO_TCP,
            0,
        );
        assert_eq!(header[0], 0x45);
        assert_eq!(header[8], 64, "TTL");
        assert_eq!(header[9], PROTO_TCP);
        assert_eq!(header[6] & 0x40, 0, "DF clear");
    }

    #[test]
    fn corrupted_checksum_is_rejected() {
        let mut header = build_header(
            Ipv4Address::new(1, 2, 3, 4),
            Ipv4Address::new(5, 6, 7, 8),
            PROTO_ICMP,
            8,
        );
        header[15] ^= 0xFF;
        assert!(parse_header(&header).is_err());
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(parse_header(&[0x45; 10]).is_err());
    }
}
