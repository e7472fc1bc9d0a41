//! Network stack
//!
//! Ethernet at the bottom, then ARP, IPv4, ICMP, UDP and a minimal TCP
//! state machine, with a BSD-like socket API on top. The RX path runs in
//! ISR context and touches only rings and waiter slots; everything else
//! holds per-socket spinlocks.

pub mod arp;
pub mod checksum;
pub mod device;
pub mod ethernet;
pub mod icmp;
pub mod ip;
pub mod socket;
pub mod tcp;
pub mod udp;

use crate::sync::SpinLock;

/// MAC address (6 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const BROADCAST: Self = Self([0xFF; 6]);
    pub const ZERO: Self = Self([0x00; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

impl core::fmt::Display for MacAddress {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

/// IPv4 address (4 bytes)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ipv4Address(pub [u8; 4]);

impl Ipv4Address {
    pub const BROADCAST: Self = Self([255, 255, 255, 255]);
    pub const ANY: Self = Self([0, 0, 0, 0]);

    pub const fn new(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self([a, b, c, d])
    }

    pub fn from_u32(addr: u32) -> Self {
        Self(addr.to_be_bytes())
    }

    pub fn to_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl core::fmt::Display for Ipv4Address {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// An (address, port) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub ip: Ipv4Address,
    pub port: u16,
}

impl Endpoint {
    pub const UNSPECIFIED: Self = Self {
        ip: Ipv4Address::ANY,
        port: 0,
    };

    pub const fn new(ip: Ipv4Address, port: u16) -> Self {
        Self { ip, port }
    }
}

/// Static interface configuration (QEMU user-networking defaults).
#[derive(Debug, Clone, Copy)]
pub struct InterfaceConfig {
    pub ip: Ipv4Address,
    pub netmask: Ipv4Address,
    pub gateway: Ipv4Address,
}

impl InterfaceConfig {
    pub const fn default_qemu() -> Self {
        Self {
            ip: Ipv4Address::new(10, 0, 2, 15),
            netmask: Ipv4Address::new(255, 255, 255, 0),
            gateway: Ipv4Address::new(10, 0, 2, 2),
        }
    }

    /// Whether `addr` is on the local subnet.
    pub fn on_subnet(&self, addr: Ipv4Address) -> bool {
        let mask = self.netmask.to_u32();
        (addr.to_u32() & mask) == (self.ip.to_u32() & mask)
    }
}

static CONFIG: SpinLock<InterfaceConfig> = SpinLock::new(InterfaceConfig::default_qemu());

/// Install the interface address configuration.
pub fn configure(config: InterfaceConfig) {
    *CONFIG.lock() = config;
    log::info!(
        "net: interface {} mask {} gw {}",
        config.ip,
        config.netmask,
        config.gateway
    );
}

/// Current interface configuration.
pub fn config() -> InterfaceConfig {
    *CONFIG.lock()
}

/// Our interface address.
pub fn local_ip() -> Ipv4Address {
    CONFIG.lock().ip
}

/// Bring the stack up. The Ethernet device is registered separately by
/// its driver via [`device::register`].
pub fn init() {
    socket::init();
    log::info!("net: stack initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subnet_membership() {
        let config = InterfaceConfig::default_qemu();
        assert!(config.on_subnet(Ipv4Address::new(10, 0, 2, 2)));
        assert!(config.on_subnet(Ipv4Address::new(10, 0, 2, 200)));
        assert!(!config.on_subnet(Ipv4Address::new(10, 0, 3, 1)));
        assert!(!config.on_subnet(Ipv4Address::new(8, 8, 8, 8)));
    }

    #[test]
    fn ipv4_u32_round_trip() {
        let addr = Ipv4Address::new(192, 168, 1, 7);
        assert_eq!(Ipv4Address::from_u32(addr.to_u32()), addr);
        assert_eq!(addr.to_u32(), 0xC0A8_0107);
    }
}
