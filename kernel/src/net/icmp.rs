//! ICMP
//!
//! Echo-request handling only: reply with the identifier, sequence and
//! payload mirrored back, as §4.3 of RFC 792 requires.

use alloc::vec::Vec;

use super::{checksum, ip, Ipv4Address};

pub const TYPE_ECHO_REPLY: u8 = 0;
pub const TYPE_ECHO_REQUEST: u8 = 8;

/// Echo header: type, code, checksum, identifier, sequence.
pub const ECHO_HEADER_LEN: usize = 8;

/// Build an echo message (request or reply).
pub fn build_echo(msg_type: u8, identifier: u16, sequence: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ECHO_HEADER_LEN + payload.len());
    pkt.push(msg_type);
    pkt.push(0); // code
    pkt.extend_from_slice(&[0, 0]); // checksum placeholder
    pkt.extend_from_slice(&identifier.to_be_bytes());
    pkt.extend_from_slice(&sequence.to_be_bytes());
    pkt.extend_from_slice(payload);

    let sum = checksum::checksum(&pkt);
    pkt[2..4].copy_from_slice(&sum.to_be_bytes());
    pkt
}

/// Ingress: answer echo requests, ignore everything else.
pub fn handle_packet(src: Ipv4Address, data: &[u8]) {
    if data.len() < ECHO_HEADER_LEN {
        return;
    }
    if !checksum::verify(data) {
        return;
    }

    let msg_type = data[0];
    if msg_type != TYPE_ECHO_REQUEST {
        return;
    }

    let identifier = u16::from_be_bytes([data[4], data[5]]);
    let sequence = u16::from_be_bytes([data[6], data[7]]);
    let payload = &data[ECHO_HEADER_LEN..];

    let reply = build_echo(TYPE_ECHO_REPLY, identifier, sequence, payload);
    let _ = ip::send(src, ip::PROTO_ICMP, &reply);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_layout_and_checksum() {
        let payload: Vec<u8> = (0u8..32).collect();
        let pkt = build_echo(TYPE_ECHO_REQUEST, 0x1234, 1, &payload);

        assert_eq!(pkt.len(), ECHO_HEADER_LEN + 32);
        assert_eq!(pkt[0], TYPE_ECHO_REQUEST);
        assert_eq!(u16::from_be_bytes([pkt[4], pkt[5]]), 0x1234);
        assert_eq!(u16::from_be_bytes([pkt[6], pkt[7]]), 1);
        assert!(checksum::verify(&pkt));
    }

    #[test]
    fn reply_mirrors_request_fields() {
        let payload = b"abcdefgh";
        let request = build_echo(TYPE_ECHO_REQUEST, 77, 9, payload);
        let reply = build_echo(TYPE_ECHO_REPLY, 77, 9, payload);
        // Same identifier, sequence and payload; only type and checksum
        // differ.
        assert_eq!(&request[4..], &reply[4..]);
        assert_eq!(reply[0], TYPE_ECHO_REPLY);
        assert!(checksum::verify(&reply));
    }
}
