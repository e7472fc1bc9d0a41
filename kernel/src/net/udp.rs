//! UDP
//!
//! Datagram demux by destination port into the bound socket's RX ring.
//! Records carry a length prefix so datagram boundaries survive the ring;
//! the sender's endpoint is recorded on the socket for subsequent sends.
//! The checksum is optional on emit and left zero.

use alloc::vec::Vec;

use super::{ip, socket, Endpoint, Ipv4Address};
use crate::error::KernelResult;

/// Header: source port, destination port, length, checksum.
pub const HEADER_LEN: usize = 8;

/// Build a datagram. Checksum 0 means "not computed" in UDP.
pub fn build_datagram(src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(HEADER_LEN + payload.len());
    pkt.extend_from_slice(&src_port.to_be_bytes());
    pkt.extend_from_slice(&dst_port.to_be_bytes());
    pkt.extend_from_slice(&((HEADER_LEN + payload.len()) as u16).to_be_bytes());
    pkt.extend_from_slice(&[0, 0]);
    pkt.extend_from_slice(payload);
    pkt
}

/// Emit one datagram from `local` to `remote`.
pub fn send_to(local: Endpoint, remote: Endpoint, payload: &[u8]) -> KernelResult<()> {
    let datagram = build_datagram(local.port, remote.port, payload);
    ip::send(remote.ip, ip::PROTO_UDP, &datagram)
}

/// Ingress: push the payload into the bound socket's ring as one
/// length-prefixed record and remember the sender.
pub fn handle_packet(src: Ipv4Address, data: &[u8]) {
    if data.len() < HEADER_LEN {
        return;
    }
    let src_port = u16::from_be_bytes([data[0], data[1]]);
    let dst_port = u16::from_be_bytes([data[2], data[3]]);
    let length = u16::from_be_bytes([data[4], data[5]]) as usize;
    if length < HEADER_LEN || length > data.len() {
        return;
    }
    let payload = &data[HEADER_LEN..length];

    let Some(handle) = socket::find_datagram(dst_port) else {
        return;
    };

    let pushed = socket::with_socket(handle, |s| {
        // Record = length prefix + payload; skip if the ring cannot take
        // the whole record.
        if s.rx.free() < 2 + payload.len() {
            return false;
        }
        s.rx.push(&(payload.len() as u16).to_le_bytes());
        s.rx.push(payload);
        s.remote = Endpoint::new(src, src_port);
        true
    })
    .unwrap_or(false);

    if pushed {
        socket::RX_WAIT[handle].wake();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_layout() {
        let pkt = build_datagram(5353, 53, b"query");
        assert_eq!(pkt.len(), HEADER_LEN + 5);
        assert_eq!(u16::from_be_bytes([pkt[0], pkt[1]]), 5353);
        assert_eq!(u16::from_be_bytes([pkt[2], pkt[3]]), 53);
        assert_eq!(u16::from_be_bytes([pkt[4], pkt[5]]) as usize, pkt.len());
        assert_eq!(&pkt[6..8], &[0, 0], "checksum left zero on emit");
        assert_eq!(&pkt[8..], b"query");
    }

    #[test]
    fn truncated_length_field_is_rejected() {
        let mut pkt = build_datagram(1, 2, b"abc");
        // Claim more bytes than the buffer holds.
        pkt[4..6].copy_from_slice(&100u16.to_be_bytes());
        handle_packet(Ipv4Address::new(10, 0, 2, 9), &pkt);
        // Nothing to assert beyond "does not panic": no socket is bound.
    }
}
