//! Ethernet device boundary
//!
//! The driver contract is deliberately small: synchronous `transmit` (the
//! frame is copied or DMA-owned before return) plus a MAC address. The
//! stack owns a single registered device; registration replaces it
//! atomically. Received frames enter through [`receive_frame`], which
//! drivers call from ISR context.

use alloc::{boxed::Box, collections::VecDeque, vec::Vec};

use super::MacAddress;
use crate::{
    error::{KernelResult, NetError},
    sync::SpinLock,
};

/// Contract a NIC driver implements for the stack.
pub trait EthernetDevice: Send {
    /// Device name
    fn name(&self) -> &str;

    /// Hardware address
    fn mac_address(&self) -> MacAddress;

    /// Transmit one frame. The buffer is the caller's; the driver copies
    /// it (or hands it to DMA) before returning.
    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()>;
}

/// The single registered device.
static DEVICE: SpinLock<Option<Box<dyn EthernetDevice>>> = SpinLock::new(None);

/// Frames a software device reflected back at us; drained outside the
/// device lock so reflection cannot recurse into it.
static REFLECT_QUEUE: SpinLock<VecDeque<Vec<u8>>> = SpinLock::new(VecDeque::new());

/// Install `device` as the stack's transmit path, replacing any previous
/// one.
pub fn register(device: Box<dyn EthernetDevice>) {
    log::info!(
        "net: device {} registered ({})",
        device.name(),
        device.mac_address()
    );
    *DEVICE.lock() = Some(device);
}

/// MAC address of the registered device.
pub fn mac_address() -> KernelResult<MacAddress> {
    DEVICE
        .lock()
        .as_ref()
        .map(|d| d.mac_address())
        .ok_or(NetError::NoDevice.into())
}

/// Hand a frame to the device, then deliver anything a loopback-style
/// device reflected.
pub fn transmit(frame: &[u8]) -> KernelResult<()> {
    {
        let mut device = DEVICE.lock();
        let device = device.as_mut().ok_or(NetError::NoDevice)?;
        device.transmit(frame)?;
    }
    drain_reflected();
    Ok(())
}

/// Largest frame the RX path accepts (Ethernet II, no jumbo frames).
pub const MAX_FRAME_LEN: usize = 1600;

/// A raw frame staged between ISR context and the RX pump thread.
pub struct RawFrame {
    len: usize,
    data: [u8; MAX_FRAME_LEN],
}

/// Frames pending stack processing. The ISR side only copies into the
/// pre-allocated ring; the pump thread does the real work.
static RX_FRAMES: crate::sync::Mailbox<RawFrame, 16> = crate::sync::Mailbox::new();

/// RX entry point: drivers call this from their receive ISR with the raw
/// frame bytes.
///
/// ISR contract: no blocking, no allocation. The frame is copied into a
/// fixed mailbox slot and the pump thread is woken; when the mailbox is
/// full the frame is dropped.
pub fn receive_frame(data: &[u8]) {
    if data.len() > MAX_FRAME_LEN {
        return;
    }
    let mut frame = RawFrame {
        len: data.len(),
        data: [0; MAX_FRAME_LEN],
    };
    frame.data[..data.len()].copy_from_slice(data);
    if RX_FRAMES.try_post(frame).is_err() {
        log::warn!("net: rx mailbox full, frame dropped");
    }
}

/// Body of the `net_rx` kernel thread: drain staged frames through the
/// stack.
pub extern "C" fn rx_pump() {
    loop {
        let frame = RX_FRAMES.recv();
        process_frame(&frame.data[..frame.len]);
    }
}

/// Run a frame through the stack synchronously (pump thread and
/// software-device paths).
pub fn process_frame(data: &[u8]) {
    super::ethernet::handle_frame(data);
}

fn drain_reflected() {
    loop {
        let frame = REFLECT_QUEUE.lock().pop_front();
        match frame {
            Some(frame) => process_frame(&frame),
            None => break,
        }
    }
}

/// Loopback device: every transmitted frame comes straight back.
///
/// Serves 127-style local traffic and doubles as the end-to-end test
/// vehicle for the stack.
pub struct LoopbackDevice {
    mac: MacAddress,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        Self {
            mac: MacAddress::new([0x52, 0x54, 0x00, 0x4C, 0x4F, 0x30]),
        }
    }
}

impl Default for LoopbackDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl EthernetDevice for LoopbackDevice {
    fn name(&self) -> &str {
        "lo0"
    }

    fn mac_address(&self) -> MacAddress {
        self.mac
    }

    fn transmit(&mut self, frame: &[u8]) -> KernelResult<()> {
        // Queue rather than deliver inline: the caller still holds the
        // device lock.
        REFLECT_QUEUE.lock().push_back(frame.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_reports_its_mac() {
        let dev = LoopbackDevice::new();
        assert_eq!(dev.name(), "lo0");
        assert_ne!(dev.mac_address(), MacAddress::ZERO);
    }
}
