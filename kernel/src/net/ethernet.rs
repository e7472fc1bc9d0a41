//! Ethernet II framing

use alloc::vec::Vec;

use super::MacAddress;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

/// Header length: two MACs plus the ethertype.
pub const HEADER_LEN: usize = 14;
/// Minimum frame length on the wire (without FCS).
const MIN_FRAME_LEN: usize = 60;

/// Build a frame around `payload`, padded up to the Ethernet minimum.
pub fn build_frame(dst: MacAddress, src: MacAddress, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len().max(MIN_FRAME_LEN - HEADER_LEN));
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    while frame.len() < MIN_FRAME_LEN {
        frame.push(0);
    }
    frame
}

/// Demux a received frame to ARP or IPv4.
///
/// ISR-context path: parses in place and hands the payload slice down.
pub fn handle_frame(data: &[u8]) {
    if data.len() < HEADER_LEN {
        return;
    }

    let mut dst = [0u8; 6];
    dst.copy_from_slice(&data[0..6]);
    let dst = MacAddress(dst);

    let ethertype = u16::from_be_bytes([data[12], data[13]]);
    let payload = &data[HEADER_LEN..];

    // Accept frames for us or broadcast; a loopback device reflects our
    // own MAC back at us.
    if let Ok(our_mac) = super::device::mac_address() {
        if dst != our_mac && dst != MacAddress::BROADCAST {
            return;
        }
    }

    match ethertype {
        ETHERTYPE_ARP => super::arp::handle_packet(payload),
        ETHERTYPE_IPV4 => super::ip::handle_packet(payload),
        _ => {
            #[cfg(feature = "net_debug")]
            log::trace!("eth: dropping ethertype {:#06x}", ethertype);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_are_padded_to_minimum() {
        let frame = build_frame(
            MacAddress::BROADCAST,
            MacAddress::new([2, 2, 2, 2, 2, 2]),
            ETHERTYPE_ARP,
            &[0xAA; 10],
        );
        assert_eq!(frame.len(), 60);
        assert_eq!(&frame[0..6], &[0xFF; 6]);
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETHERTYPE_ARP);
        assert_eq!(frame[14], 0xAA);
        assert_eq!(frame[24], 0, "padding is zeroed");
    }

    #[test]
    fn long_payload_is_not_padded() {
        let frame = build_frame(
            MacAddress::BROADCAST,
            MacAddress::ZERO,
            ETHERTYPE_IPV4,
            &[1u8; 100],
        );
        assert_eq!(frame.len(), HEADER_LEN + 100);
    }
}
