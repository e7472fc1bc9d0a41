//! ARP cache and resolution
//!
//! A fixed table of ip-to-MAC entries, learned from every ARP packet
//! seen. Resolution routes off-subnet destinations to the gateway,
//! broadcasts a request on a miss and parks the caller on a single
//! pending-waiter slot (one in-flight resolution at a time is a known
//! limitation).

use alloc::vec::Vec;

use super::{ethernet, Ipv4Address, MacAddress};
use crate::{
    error::{KernelResult, NetError},
    sync::{SpinLock, WaitSlot},
};

const ARP_HTYPE_ETHERNET: u16 = 1;
const ARP_PTYPE_IPV4: u16 = 0x0800;
const ARP_OP_REQUEST: u16 = 1;
const ARP_OP_REPLY: u16 = 2;
/// ARP body for Ethernet/IPv4: 28 bytes.
const ARP_PACKET_SIZE: usize = 28;

/// Fixed cache size.
const ARP_CACHE_SIZE: usize = 16;

/// Resolution wait bound, in timer ticks (~500 ms at 100 Hz).
const RESOLVE_TIMEOUT_TICKS: u64 = 50;
/// Upper bound on resolve retries, so the wait terminates even with a
/// stopped tick counter.
const RESOLVE_MAX_SPINS: usize = 64;

#[derive(Debug, Clone, Copy)]
struct ArpEntry {
    ip: Ipv4Address,
    mac: MacAddress,
    valid: bool,
}

/// The fixed-size translation table.
pub struct ArpCache {
    entries: [ArpEntry; ARP_CACHE_SIZE],
}

impl ArpCache {
    pub const fn new() -> Self {
        Self {
            entries: [ArpEntry {
                ip: Ipv4Address::ANY,
                mac: MacAddress::ZERO,
                valid: false,
            }; ARP_CACHE_SIZE],
        }
    }

    pub fn lookup(&self, ip: Ipv4Address) -> Option<MacAddress> {
        self.entries
            .iter()
            .find(|e| e.valid && e.ip == ip)
            .map(|e| e.mac)
    }

    /// Insert or refresh a mapping. Eviction is first-slot when full.
    pub fn insert(&mut self, ip: Ipv4Address, mac: MacAddress) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.valid && e.ip == ip) {
            entry.mac = mac;
            return;
        }
        if let Some(slot) = self.entries.iter_mut().find(|e| !e.valid) {
            *slot = ArpEntry {
                ip,
                mac,
                valid: true,
            };
            return;
        }
        self.entries[0] = ArpEntry {
            ip,
            mac,
            valid: true,
        };
    }

    pub fn flush(&mut self) {
        for entry in self.entries.iter_mut() {
            entry.valid = false;
        }
    }
}

impl Default for ArpCache {
    fn default() -> Self {
        Self::new()
    }
}

static CACHE: SpinLock<ArpCache> = SpinLock::new(ArpCache::new());

/// Parker for the single in-flight resolution.
static PENDING: WaitSlot = WaitSlot::new();

/// Look up a cached mapping.
pub fn lookup(ip: Ipv4Address) -> Option<MacAddress> {
    CACHE.lock().lookup(ip)
}

/// Insert or refresh a mapping in the global cache.
pub fn insert(ip: Ipv4Address, mac: MacAddress) {
    CACHE.lock().insert(ip, mac);
}

/// Drop every cached entry.
pub fn flush() {
    CACHE.lock().flush();
}

/// Resolve the MAC for `ip`, blocking while a request is outstanding.
///
/// Off-subnet destinations resolve to the gateway; our own address short-
/// circuits to the device MAC.
pub fn resolve(ip: Ipv4Address) -> KernelResult<MacAddress> {
    let config = super::config();

    if ip == config.ip {
        return super::device::mac_address();
    }
    if ip.is_broadcast() {
        return Ok(MacAddress::BROADCAST);
    }

    let target = if config.on_subnet(ip) {
        ip
    } else {
        config.gateway
    };

    if let Some(mac) = lookup(target) {
        return Ok(mac);
    }

    send_request(target)?;

    let deadline = crate::sched::ticks() + RESOLVE_TIMEOUT_TICKS;
    for _ in 0..RESOLVE_MAX_SPINS {
        if let Some(mac) = lookup(target) {
            return Ok(mac);
        }
        if crate::sched::ticks() > deadline {
            break;
        }
        crate::sched::yield_now();
    }

    Err(NetError::HostUnreachable.into())
}

/// Process a received ARP packet: learn the sender, answer requests for
/// our address, and wake a parked resolver on replies.
pub fn handle_packet(data: &[u8]) {
    if data.len() < ARP_PACKET_SIZE {
        return;
    }

    let htype = u16::from_be_bytes([data[0], data[1]]);
    let ptype = u16::from_be_bytes([data[2], data[3]]);
    if htype != ARP_HTYPE_ETHERNET || ptype != ARP_PTYPE_IPV4 || data[4] != 6 || data[5] != 4 {
        return;
    }
    let operation = u16::from_be_bytes([data[6], data[7]]);

    let mut sender_mac = [0u8; 6];
    sender_mac.copy_from_slice(&data[8..14]);
    let sender_mac = MacAddress(sender_mac);
    let sender_ip = Ipv4Address([data[14], data[15], data[16], data[17]]);
    let target_ip = Ipv4Address([data[24], data[25], data[26], data[27]]);

    // Learn the sender from every ARP packet.
    insert(sender_ip, sender_mac);

    match operation {
        ARP_OP_REQUEST => {
            let our_ip = super::local_ip();
            if target_ip == our_ip {
                if let Ok(our_mac) = super::device::mac_address() {
                    let reply =
                        build_packet(ARP_OP_REPLY, our_mac, our_ip, sender_mac, sender_ip);
                    let frame =
                        ethernet::build_frame(sender_mac, our_mac, ethernet::ETHERTYPE_ARP, &reply);
                    let _ = super::device::transmit(&frame);
                }
            }
        }
        ARP_OP_REPLY => {
            PENDING.wake();
        }
        _ => {}
    }
}

fn send_request(target_ip: Ipv4Address) -> KernelResult<()> {
    let our_mac = super::device::mac_address()?;
    let our_ip = super::local_ip();
    let request = build_packet(
        ARP_OP_REQUEST,
        our_mac,
        our_ip,
        MacAddress::ZERO,
        target_ip,
    );
    let frame = ethernet::build_frame(
        MacAddress::BROADCAST,
        our_mac,
        ethernet::ETHERTYPE_ARP,
        &request,
    );
    super::device::transmit(&frame)
}

fn build_packet(
    operation: u16,
    sender_mac: MacAddress,
    sender_ip: Ipv4Address,
    target_mac: MacAddress,
    target_ip: Ipv4Address,
) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(ARP_PACKET_SIZE);
    pkt.extend_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    pkt.extend_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    pkt.push(6);
    pkt.push(4);
    pkt.extend_from_slice(&operation.to_be_bytes());
    pkt.extend_from_slice(&sender_mac.0);
    pkt.extend_from_slice(&sender_ip.0);
    pkt.extend_from_slice(&target_mac.0);
    pkt.extend_from_slice(&target_ip.0);
    pkt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_lookup() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Address::new(10, 0, 2, 77);
        let mac = MacAddress::new([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(cache.lookup(ip), None);
        cache.insert(ip, mac);
        assert_eq!(cache.lookup(ip), Some(mac));
    }

    #[test]
    fn refresh_updates_in_place() {
        let mut cache = ArpCache::new();
        let ip = Ipv4Address::new(10, 0, 2, 78);
        cache.insert(ip, MacAddress::new([1, 1, 1, 1, 1, 1]));
        cache.insert(ip, MacAddress::new([2, 2, 2, 2, 2, 2]));
        assert_eq!(cache.lookup(ip), Some(MacAddress::new([2, 2, 2, 2, 2, 2])));
    }

    #[test]
    fn full_cache_evicts_first_slot() {
        let mut cache = ArpCache::new();
        for i in 0..ARP_CACHE_SIZE as u8 {
            cache.insert(
                Ipv4Address::new(10, 9, 0, i),
                MacAddress::new([i, 0, 0, 0, 0, 1]),
            );
        }
        cache.insert(
            Ipv4Address::new(10, 9, 1, 1),
            MacAddress::new([9, 9, 9, 9, 9, 9]),
        );
        assert_eq!(cache.lookup(Ipv4Address::new(10, 9, 0, 0)), None);
        assert!(cache.lookup(Ipv4Address::new(10, 9, 1, 1)).is_some());
    }

    #[test]
    fn request_packet_layout() {
        let pkt = build_packet(
            ARP_OP_REQUEST,
            MacAddress::new([0x52, 0x54, 0, 0x12, 0x34, 0x56]),
            Ipv4Address::new(10, 0, 2, 15),
            MacAddress::ZERO,
            Ipv4Address::new(10, 0, 2, 1),
        );
        assert_eq!(pkt.len(), ARP_PACKET_SIZE);
        assert_eq!(u16::from_be_bytes([pkt[6], pkt[7]]), ARP_OP_REQUEST);
        assert_eq!(&pkt[24..28], &[10, 0, 2, 1]);
    }

    #[test]
    fn learns_sender_from_any_arp_packet() {
        let pkt = build_packet(
            ARP_OP_REQUEST,
            MacAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]),
            Ipv4Address::new(10, 0, 2, 99),
            MacAddress::ZERO,
            Ipv4Address::new(10, 0, 2, 50), // not us: no reply attempted
        );
        handle_packet(&pkt);
        assert_eq!(
            lookup(Ipv4Address::new(10, 0, 2, 99)),
            Some(MacAddress::new([0xDE, 0xAD, 0xBE, 0xEF, 0x00, 0x01]))
        );
    }
}
