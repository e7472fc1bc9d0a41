//! BSD-like sockets
//!
//! A fixed slot table of stream and datagram sockets. Handles are slot
//! indices and are invalid after close. Each socket carries a fixed RX
//! ring, a bounded accept queue (listeners) and three waiter slots: rx,
//! connect and accept. The table lock covers allocation only; every other
//! mutation holds the socket's own lock.

use alloc::boxed::Box;

use super::{tcp::TcpState, udp, Endpoint, Ipv4Address};
use crate::{
    error::{KernelError, KernelResult, NetError},
    sync::{SpinLock, WaitSlot},
};

/// Socket table size.
pub const MAX_SOCKETS: usize = 32;
/// RX ring capacity per socket.
pub const RX_RING_SIZE: usize = 8192;
/// Hard cap on a listener's accept queue.
pub const MAX_BACKLOG: usize = 8;
/// Maximum segment size for stream sends.
pub const MSS: usize = 1460;

/// Bound on blocking retries, so a wait interrupted by teardown
/// terminates rather than spinning forever.
const BLOCK_MAX_SPINS: usize = 1 << 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketType {
    Stream,
    Datagram,
}

/// Fixed-capacity byte ring for received data.
pub struct RxRing {
    buf: [u8; RX_RING_SIZE],
    head: usize,
    tail: usize,
}

impl RxRing {
    pub const fn new() -> Self {
        Self {
            buf: [0; RX_RING_SIZE],
            head: 0,
            tail: 0,
        }
    }

    pub fn available(&self) -> usize {
        (self.tail + RX_RING_SIZE - self.head) % RX_RING_SIZE
    }

    pub fn free(&self) -> usize {
        RX_RING_SIZE - 1 - self.available()
    }

    /// Append bytes, returning how many fit.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        for &b in &data[..n] {
            self.buf[self.tail] = b;
            self.tail = (self.tail + 1) % RX_RING_SIZE;
        }
        n
    }

    /// Remove up to `buf.len()` bytes.
    pub fn pop(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.available());
        for slot in buf[..n].iter_mut() {
            *slot = self.buf[self.head];
            self.head = (self.head + 1) % RX_RING_SIZE;
        }
        n
    }
}

impl Default for RxRing {
    fn default() -> Self {
        Self::new()
    }
}

/// One socket.
pub struct Socket {
    pub ty: SocketType,
    pub local: Endpoint,
    pub remote: Endpoint,
    pub state: TcpState,
    /// Next sequence number to send.
    pub snd_nxt: u32,
    /// Oldest unacknowledged sequence number; monotonic.
    pub snd_una: u32,
    /// Next sequence number expected from the peer.
    pub rcv_nxt: u32,
    /// Advertised receive window (fixed).
    pub window: u16,
    pub rx: RxRing,
    /// Established-side EOF: the peer sent FIN.
    pub peer_closed: bool,
    /// Listener state: queued child handles awaiting accept.
    accept_queue: [Option<usize>; MAX_BACKLOG],
    accept_len: usize,
    backlog: usize,
}

impl Socket {
    fn new(ty: SocketType) -> Self {
        Self {
            ty,
            local: Endpoint::UNSPECIFIED,
            remote: Endpoint::UNSPECIFIED,
            state: TcpState::Closed,
            snd_nxt: 0,
            snd_una: 0,
            rcv_nxt: 0,
            window: RX_RING_SIZE as u16 / 2,
            rx: RxRing::new(),
            peer_closed: false,
            accept_queue: [None; MAX_BACKLOG],
            accept_len: 0,
            backlog: 0,
        }
    }

    /// Queue a child on the accept queue; false when full.
    pub fn accept_enqueue(&mut self, child: usize) -> bool {
        if self.accept_len >= self.backlog.min(MAX_BACKLOG) {
            return false;
        }
        self.accept_queue[self.accept_len] = Some(child);
        self.accept_len += 1;
        true
    }

    fn accept_dequeue(&mut self) -> Option<usize> {
        if self.accept_len == 0 {
            return None;
        }
        let child = self.accept_queue[0].take();
        for i in 1..self.accept_len {
            self.accept_queue[i - 1] = self.accept_queue[i].take();
        }
        self.accept_len -= 1;
        child
    }
}

static SOCKETS: [SpinLock<Option<Box<Socket>>>; MAX_SOCKETS] =
    [const { SpinLock::new(None) }; MAX_SOCKETS];

/// Allocation guard: slot scans hold this, nothing else.
static TABLE_LOCK: SpinLock<()> = SpinLock::new(());

pub static RX_WAIT: [WaitSlot; MAX_SOCKETS] = [const { WaitSlot::new() }; MAX_SOCKETS];
pub static CONNECT_WAIT: [WaitSlot; MAX_SOCKETS] = [const { WaitSlot::new() }; MAX_SOCKETS];
pub static ACCEPT_WAIT: [WaitSlot; MAX_SOCKETS] = [const { WaitSlot::new() }; MAX_SOCKETS];

static EPHEMERAL_PORT: core::sync::atomic::AtomicU16 = core::sync::atomic::AtomicU16::new(49152);

fn next_ephemeral_port() -> u16 {
    let port = EPHEMERAL_PORT.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    if port == 0 {
        49152
    } else {
        port
    }
}

pub fn init() {
    // The table is statically initialized; nothing to do beyond logging.
    log::debug!("socket table: {} slots", MAX_SOCKETS);
}

/// Run `f` on the socket in `handle`.
pub fn with_socket<R>(handle: usize, f: impl FnOnce(&mut Socket) -> R) -> KernelResult<R> {
    let slot = SOCKETS
        .get(handle)
        .ok_or(KernelError::NetError(NetError::NotConnected))?;
    let mut guard = slot.lock();
    match guard.as_mut() {
        Some(socket) => Ok(f(socket)),
        None => Err(NetError::NotConnected.into()),
    }
}

/// Allocate a socket slot.
pub fn create(ty: SocketType) -> KernelResult<usize> {
    let _table = TABLE_LOCK.lock();
    for (handle, slot) in SOCKETS.iter().enumerate() {
        let mut guard = slot.lock();
        if guard.is_none() {
            *guard = Some(Box::new(Socket::new(ty)));
            RX_WAIT[handle].clear();
            CONNECT_WAIT[handle].clear();
            ACCEPT_WAIT[handle].clear();
            return Ok(handle);
        }
    }
    Err(NetError::NoFreeSockets.into())
}

/// Release a slot. The handle is dead afterwards.
pub fn free(handle: usize) {
    if let Some(slot) = SOCKETS.get(handle) {
        *slot.lock() = None;
        RX_WAIT[handle].clear();
        CONNECT_WAIT[handle].clear();
        ACCEPT_WAIT[handle].clear();
    }
}

/// Whether any socket of `ty` is bound to `port`.
fn port_in_use(ty: SocketType, port: u16) -> bool {
    SOCKETS.iter().any(|slot| {
        slot.lock()
            .as_ref()
            .map(|s| s.ty == ty && s.local.port == port)
            .unwrap_or(false)
    })
}

/// Bind a local endpoint.
pub fn bind(handle: usize, ip: Ipv4Address, port: u16) -> KernelResult<()> {
    let ty = with_socket(handle, |s| s.ty)?;
    if port != 0 && port_in_use(ty, port) {
        return Err(NetError::AddressInUse.into());
    }
    with_socket(handle, |s| {
        s.local = Endpoint::new(ip, port);
    })
}

/// Move a stream socket to Listen.
pub fn listen(handle: usize, backlog: usize) -> KernelResult<()> {
    with_socket(handle, |s| {
        if s.ty != SocketType::Stream {
            return Err(KernelError::InvalidArgument {
                name: "socket",
                value: "not a stream socket",
            });
        }
        if s.local.port == 0 {
            return Err(NetError::NotBound.into());
        }
        s.state = TcpState::Listen;
        s.backlog = backlog.clamp(1, MAX_BACKLOG);
        Ok(())
    })?
}

/// Connect. Streams block until Established or refused; datagrams just
/// record the peer.
pub fn connect(handle: usize, ip: Ipv4Address, port: u16) -> KernelResult<()> {
    let ty = with_socket(handle, |s| s.ty)?;

    if ty == SocketType::Datagram {
        return with_socket(handle, |s| {
            if s.local.port == 0 {
                s.local = Endpoint::new(super::local_ip(), next_ephemeral_port());
            }
            s.remote = Endpoint::new(ip, port);
        });
    }

    // Active open: SYN goes out after the lock drops.
    let (local, remote, iss) = with_socket(handle, |s| {
        if s.local.port == 0 {
            s.local = Endpoint::new(super::local_ip(), next_ephemeral_port());
        }
        s.remote = Endpoint::new(ip, port);
        let iss = super::tcp::initial_seq(s.local.port, s.remote);
        s.snd_una = iss;
        s.snd_nxt = iss.wrapping_add(1); // SYN occupies one sequence number
        s.state = TcpState::SynSent;
        (s.local, s.remote, iss)
    })?;

    super::tcp::send_segment(local, remote, iss, 0, super::tcp::FLAG_SYN, &[])?;

    for _ in 0..BLOCK_MAX_SPINS {
        let state = with_socket(handle, |s| s.state)?;
        match state {
            TcpState::Established => return Ok(()),
            TcpState::Closed => return Err(NetError::ConnectionRefused.into()),
            _ => {}
        }
        if crate::process::signal::pending_deliverable() != 0 {
            return Err(KernelError::Interrupted);
        }
        CONNECT_WAIT[handle].wait();
    }
    Err(NetError::HostUnreachable.into())
}

/// Accept a queued child, blocking while the queue is empty.
/// Returns the child handle and the peer endpoint.
pub fn accept(handle: usize) -> KernelResult<(usize, Ipv4Address, u16)> {
    for _ in 0..BLOCK_MAX_SPINS {
        let child = with_socket(handle, |s| {
            if s.state != TcpState::Listen {
                return Err(KernelError::InvalidState {
                    expected: "Listen",
                    actual: "other",
                });
            }
            Ok(s.accept_dequeue())
        })??;

        if let Some(child) = child {
            let remote = with_socket(child, |s| s.remote)?;
            return Ok((child, remote.ip, remote.port));
        }

        if crate::process::signal::pending_deliverable() != 0 {
            return Err(KernelError::Interrupted);
        }
        ACCEPT_WAIT[handle].wait();
    }
    Err(KernelError::WouldBlock)
}

/// Send. Streams segment into ≤MSS chunks with PSH+ACK; datagrams emit
/// one UDP packet.
pub fn send(handle: usize, data: &[u8]) -> KernelResult<usize> {
    let ty = with_socket(handle, |s| s.ty)?;

    if ty == SocketType::Datagram {
        let (local, remote) = with_socket(handle, |s| (s.local, s.remote))?;
        if remote == Endpoint::UNSPECIFIED {
            return Err(NetError::NotConnected.into());
        }
        udp::send_to(local, remote, data)?;
        return Ok(data.len());
    }

    let mut sent = 0;
    for chunk in data.chunks(MSS) {
        // Claim sequence space under the lock, transmit outside it.
        let (local, remote, seq, ack) = with_socket(handle, |s| {
            if s.state != TcpState::Established {
                return Err(KernelError::NetError(NetError::NotConnected));
            }
            let seq = s.snd_nxt;
            s.snd_nxt = s.snd_nxt.wrapping_add(chunk.len() as u32);
            Ok((s.local, s.remote, seq, s.rcv_nxt))
        })??;

        super::tcp::send_segment(
            local,
            remote,
            seq,
            ack,
            super::tcp::FLAG_PSH | super::tcp::FLAG_ACK,
            chunk,
        )?;
        sent += chunk.len();
    }
    Ok(sent)
}

/// Receive, blocking until bytes arrive or the connection reaches EOF.
/// Returns 0 at EOF.
pub fn recv(handle: usize, buf: &mut [u8]) -> KernelResult<usize> {
    for _ in 0..BLOCK_MAX_SPINS {
        enum Outcome {
            Data(usize),
            Eof,
            Wait,
        }

        let outcome = with_socket(handle, |s| match s.ty {
            SocketType::Datagram => {
                if s.rx.available() >= 2 {
                    let mut len_bytes = [0u8; 2];
                    s.rx.pop(&mut len_bytes);
                    let record_len = u16::from_le_bytes(len_bytes) as usize;
                    let n = record_len.min(buf.len());
                    s.rx.pop(&mut buf[..n]);
                    // Datagram boundaries: excess bytes are discarded.
                    let mut scratch = [0u8; 64];
                    let mut remaining = record_len - n;
                    while remaining > 0 {
                        let take = remaining.min(scratch.len());
                        s.rx.pop(&mut scratch[..take]);
                        remaining -= take;
                    }
                    Outcome::Data(n)
                } else {
                    Outcome::Wait
                }
            }
            SocketType::Stream => {
                let avail = s.rx.available();
                if avail > 0 {
                    let n = s.rx.pop(buf);
                    Outcome::Data(n)
                } else if s.peer_closed || s.state != TcpState::Established {
                    Outcome::Eof
                } else {
                    Outcome::Wait
                }
            }
        })?;

        match outcome {
            Outcome::Data(n) => return Ok(n),
            Outcome::Eof => return Ok(0),
            Outcome::Wait => {
                if crate::process::signal::pending_deliverable() != 0 {
                    return Err(KernelError::Interrupted);
                }
                RX_WAIT[handle].wait();
            }
        }
    }
    Err(KernelError::WouldBlock)
}

/// Close. Streams run the FIN handshake and linger briefly through
/// TimeWait before the slot is reused; the handle is invalid regardless.
pub fn close(handle: usize) -> KernelResult<()> {
    enum Plan {
        SendFin {
            local: Endpoint,
            remote: Endpoint,
            seq: u32,
            ack: u32,
        },
        DrainChildren([Option<usize>; MAX_BACKLOG]),
        JustFree,
    }

    let plan = with_socket(handle, |s| match (s.ty, s.state) {
        (SocketType::Stream, TcpState::Established) => {
            let seq = s.snd_nxt;
            s.snd_nxt = s.snd_nxt.wrapping_add(1); // FIN takes a sequence number
            s.state = TcpState::FinWait1;
            Plan::SendFin {
                local: s.local,
                remote: s.remote,
                seq,
                ack: s.rcv_nxt,
            }
        }
        (SocketType::Stream, TcpState::Listen) => {
            let mut queued = [None; MAX_BACKLOG];
            queued[..s.accept_len].copy_from_slice(&s.accept_queue[..s.accept_len]);
            s.accept_len = 0;
            Plan::DrainChildren(queued)
        }
        _ => Plan::JustFree,
    })?;

    match plan {
        Plan::SendFin {
            local,
            remote,
            seq,
            ack,
        } => {
            super::tcp::send_segment(
                local,
                remote,
                seq,
                ack,
                super::tcp::FLAG_FIN | super::tcp::FLAG_ACK,
                &[],
            )?;
            // Bounded TimeWait drain: wait for the close handshake to
            // finish, then reuse the slot. No TimeWait timer wheel here.
            for _ in 0..32 {
                let state = with_socket(handle, |s| s.state).unwrap_or(TcpState::Closed);
                if state == TcpState::TimeWait || state == TcpState::Closed {
                    break;
                }
                crate::sched::yield_now();
            }
            free(handle);
        }
        Plan::DrainChildren(children) => {
            for child in children.into_iter().flatten() {
                free(child);
            }
            free(handle);
        }
        Plan::JustFree => free(handle),
    }
    Ok(())
}

/// Local endpoint getter.
pub fn local_endpoint(handle: usize) -> KernelResult<Endpoint> {
    with_socket(handle, |s| s.local)
}

/// Remote endpoint getter.
pub fn remote_endpoint(handle: usize) -> KernelResult<Endpoint> {
    with_socket(handle, |s| s.remote)
}

// -------------------------------------------------------------------------
// Demux helpers for the TCP/UDP ingress paths
// -------------------------------------------------------------------------

/// The connected stream socket matching the 4-tuple.
pub fn find_stream(local_port: u16, remote: Endpoint) -> Option<usize> {
    (0..MAX_SOCKETS).find(|&h| {
        SOCKETS[h]
            .lock()
            .as_ref()
            .map(|s| {
                s.ty == SocketType::Stream
                    && s.state != TcpState::Listen
                    && s.state != TcpState::Closed
                    && s.local.port == local_port
                    && s.remote == remote
            })
            .unwrap_or(false)
    })
}

/// The listener bound to `local_port`.
pub fn find_listener(local_port: u16) -> Option<usize> {
    (0..MAX_SOCKETS).find(|&h| {
        SOCKETS[h]
            .lock()
            .as_ref()
            .map(|s| {
                s.ty == SocketType::Stream
                    && s.state == TcpState::Listen
                    && s.local.port == local_port
            })
            .unwrap_or(false)
    })
}

/// The datagram socket bound to `local_port`.
pub fn find_datagram(local_port: u16) -> Option<usize> {
    (0..MAX_SOCKETS).find(|&h| {
        SOCKETS[h]
            .lock()
            .as_ref()
            .map(|s| s.ty == SocketType::Datagram && s.local.port == local_port)
            .unwrap_or(false)
    })
}

/// Allocate a connection child for a listener (SYN handling).
pub fn alloc_child(local: Endpoint, remote: Endpoint) -> KernelResult<usize> {
    let handle = create(SocketType::Stream)?;
    with_socket(handle, |s| {
        s.local = local;
        s.remote = remote;
        s.state = TcpState::SynRecv;
    })?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rx_ring_round_trip_with_wrap() {
        let mut ring = alloc::boxed::Box::new(RxRing::new());
        assert_eq!(ring.available(), 0);

        // Fill and drain repeatedly so head/tail wrap.
        for round in 0..5 {
            let data: alloc::vec::Vec<u8> =
                (0..3000).map(|i| ((i + round * 7) % 251) as u8).collect();
            assert_eq!(ring.push(&data), 3000);
            assert_eq!(ring.available(), 3000);

            let mut out = alloc::vec![0u8; 3000];
            assert_eq!(ring.pop(&mut out), 3000);
            assert_eq!(out, data);
        }
    }

    #[test]
    fn rx_ring_rejects_overflow_bytes() {
        let mut ring = alloc::boxed::Box::new(RxRing::new());
        let big = alloc::vec![0xEEu8; RX_RING_SIZE + 100];
        let pushed = ring.push(&big);
        assert_eq!(pushed, RX_RING_SIZE - 1, "ring keeps one slot open");
        assert_eq!(ring.free(), 0);
    }

    #[test]
    fn accept_queue_respects_backlog() {
        let mut socket = Socket::new(SocketType::Stream);
        socket.backlog = 2;
        assert!(socket.accept_enqueue(4));
        assert!(socket.accept_enqueue(5));
        assert!(!socket.accept_enqueue(6), "queue full: SYN dropped");
        assert_eq!(socket.accept_dequeue(), Some(4));
        assert_eq!(socket.accept_dequeue(), Some(5));
        assert_eq!(socket.accept_dequeue(), None);
    }

    #[test]
    fn ring_invariant_avail_below_capacity() {
        let mut ring = alloc::boxed::Box::new(RxRing::new());
        ring.push(&[1, 2, 3]);
        assert!(ring.available() < RX_RING_SIZE);
        let mut buf = [0u8; 3];
        ring.pop(&mut buf);
        assert_eq!(ring.available(), 0);
    }
}
