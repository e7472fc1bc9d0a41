//! TCP
//!
//! A minimal-functional state machine: passive and active open, in-order
//! data transfer with a fixed advertised window, and both close
//! directions. Out-of-window segments are dropped; retransmission,
//! reordering, congestion control and MSS negotiation are out of scope.

use alloc::vec::Vec;

use super::{checksum, ip, socket, Endpoint, Ipv4Address};
use crate::error::KernelResult;

pub const FLAG_FIN: u8 = 0x01;
pub const FLAG_SYN: u8 = 0x02;
pub const FLAG_RST: u8 = 0x04;
pub const FLAG_PSH: u8 = 0x08;
pub const FLAG_ACK: u8 = 0x10;

/// Header length without options.
pub const HEADER_LEN: usize = 20;

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpState {
    Closed,
    Listen,
    SynSent,
    SynRecv,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    LastAck,
    TimeWait,
}

/// Parsed segment.
#[derive(Debug, Clone, Copy)]
pub struct Segment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl<'a> Segment<'a> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }
}

/// Parse a segment, trusting nothing about `data` but its bytes.
pub fn parse_segment(data: &[u8]) -> Option<Segment<'_>> {
    if data.len() < HEADER_LEN {
        return None;
    }
    let data_offset = ((data[12] >> 4) as usize) * 4;
    if data_offset < HEADER_LEN || data_offset > data.len() {
        return None;
    }
    Some(Segment {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        seq: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        flags: data[13],
        window: u16::from_be_bytes([data[14], data[15]]),
        payload: &data[data_offset..],
    })
}

/// Build a segment with the pseudo-header checksum filled in.
pub fn build_segment(
    src: Endpoint,
    dst: Endpoint,
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut seg = Vec::with_capacity(HEADER_LEN + payload.len());
    seg.extend_from_slice(&src.port.to_be_bytes());
    seg.extend_from_slice(&dst.port.to_be_bytes());
    seg.extend_from_slice(&seq.to_be_bytes());
    seg.extend_from_slice(&ack.to_be_bytes());
    seg.push((HEADER_LEN as u8 / 4) << 4); // data offset, no options
    seg.push(flags);
    seg.extend_from_slice(&window.to_be_bytes());
    seg.extend_from_slice(&[0, 0]); // checksum placeholder
    seg.extend_from_slice(&[0, 0]); // urgent pointer
    seg.extend_from_slice(payload);

    let sum = checksum::pseudo_checksum(src.ip, dst.ip, ip::PROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

/// Initial sequence number from a clock-derived mixer.
pub fn initial_seq(local_port: u16, remote: Endpoint) -> u32 {
    let ticks = crate::sched::ticks() as u32;
    let salt = (local_port as u32) << 16 | remote.port as u32;
    ticks
        .wrapping_mul(0x9E37_79B9)
        .wrapping_add(salt)
        .wrapping_add(remote.ip.to_u32().rotate_left(7))
}

/// Advertised window for replies.
const ADVERTISED_WINDOW: u16 = (socket::RX_RING_SIZE / 2) as u16;

/// Emit one segment.
pub fn send_segment(
    src: Endpoint,
    dst: Endpoint,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> KernelResult<()> {
    let seg = build_segment(src, dst, seq, ack, flags, ADVERTISED_WINDOW, payload);
    ip::send(dst.ip, ip::PROTO_TCP, &seg)
}

/// A reply computed under a socket lock, sent after it drops.
struct Reply {
    src: Endpoint,
    dst: Endpoint,
    seq: u32,
    ack: u32,
    flags: u8,
}

/// Ingress: apply a received segment to the owning socket.
///
/// Replies are queued under the socket lock and transmitted after it is
/// released, so a reflecting device cannot re-enter a held lock.
pub fn handle_segment(src_ip: Ipv4Address, dst_ip: Ipv4Address, data: &[u8]) {
    let Some(seg) = parse_segment(data) else {
        return;
    };
    if checksum::pseudo_checksum(src_ip, dst_ip, ip::PROTO_TCP, data) != 0 {
        return;
    }

    let remote = Endpoint::new(src_ip, seg.src_port);
    let mut replies: Vec<Reply> = Vec::new();
    let mut wake_rx = None;
    let mut wake_connect = None;
    let mut wake_accept = None;
    let mut free_handle = None;

    if let Some(handle) = socket::find_stream(seg.dst_port, remote) {
        let _ = socket::with_socket(handle, |s| {
            apply_segment(
                s,
                handle,
                &seg,
                &mut replies,
                &mut wake_rx,
                &mut wake_connect,
                &mut free_handle,
            );
        });
    } else if let Some(listener) = socket::find_listener(seg.dst_port) {
        handle_listen_syn(
            listener,
            dst_ip,
            remote,
            &seg,
            &mut replies,
            &mut wake_accept,
        );
    }
    // No match: segments to dead connections are dropped without RST
    // (minimal implementation).

    for reply in replies {
        let _ = send_segment(
            reply.src,
            reply.dst,
            reply.seq,
            reply.ack,
            reply.flags,
            &[],
        );
    }
    if let Some(handle) = wake_rx {
        socket::RX_WAIT[handle].wake();
    }
    if let Some(handle) = wake_connect {
        socket::CONNECT_WAIT[handle].wake();
    }
    if let Some(handle) = wake_accept {
        socket::ACCEPT_WAIT[handle].wake();
    }
    if let Some(handle) = free_handle {
        socket::free(handle);
    }
}

/// Passive open: Listen + SYN allocates a child in SynRecv, answers
/// SYN+ACK and queues the child for accept. A full queue drops the SYN
/// silently, leaving the listener untouched.
fn handle_listen_syn(
    listener: usize,
    dst_ip: Ipv4Address,
    remote: Endpoint,
    seg: &Segment,
    replies: &mut Vec<Reply>,
    wake_accept: &mut Option<usize>,
) {
    if !seg.has(FLAG_SYN) || seg.has(FLAG_ACK) {
        return;
    }

    let local = Endpoint::new(dst_ip, seg.dst_port);
    let Ok(child) = socket::alloc_child(local, remote) else {
        return;
    };

    let iss = initial_seq(local.port, remote);
    let rcv_nxt = seg.seq.wrapping_add(1);
    let _ = socket::with_socket(child, |s| {
        s.rcv_nxt = rcv_nxt;
        s.snd_una = iss;
        s.snd_nxt = iss.wrapping_add(1);
    });

    let queued = socket::with_socket(listener, |l| l.accept_enqueue(child)).unwrap_or(false);
    if !queued {
        socket::free(child);
        return;
    }

    replies.push(Reply {
        src: local,
        dst: remote,
        seq: iss,
        ack: rcv_nxt,
        flags: FLAG_SYN | FLAG_ACK,
    });
    *wake_accept = Some(listener);
}

/// Transitions for a segment landing on a connected socket.
fn apply_segment(
    s: &mut socket::Socket,
    handle: usize,
    seg: &Segment,
    replies: &mut Vec<Reply>,
    wake_rx: &mut Option<usize>,
    wake_connect: &mut Option<usize>,
    free_handle: &mut Option<usize>,
) {
    // ACK processing: snd_una is monotonic; duplicate ACKs do not move it.
    if seg.has(FLAG_ACK) && seq_after(seg.ack, s.snd_una) && !seq_after(seg.ack, s.snd_nxt) {
        s.snd_una = seg.ack;
    }

    match s.state {
        TcpState::SynSent => {
            if seg.has(FLAG_RST) {
                s.state = TcpState::Closed;
                *wake_connect = Some(handle);
                return;
            }
            if seg.has(FLAG_SYN) && seg.has(FLAG_ACK) {
                s.rcv_nxt = seg.seq.wrapping_add(1);
                s.state = TcpState::Established;
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_ACK,
                });
                *wake_connect = Some(handle);
            }
        }
        TcpState::SynRecv => {
            if seg.has(FLAG_ACK) && !seg.has(FLAG_SYN) {
                s.state = TcpState::Established;
            }
        }
        TcpState::Established => {
            if seg.has(FLAG_RST) {
                s.state = TcpState::Closed;
                s.peer_closed = true;
                *wake_rx = Some(handle);
                return;
            }

            // In-order payload only; anything else is out of window.
            if !seg.payload.is_empty() {
                if seg.seq != s.rcv_nxt {
                    return;
                }
                s.rcv_nxt = s.rcv_nxt.wrapping_add(seg.payload.len() as u32);
                s.rx.push(seg.payload);
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_ACK,
                });
                *wake_rx = Some(handle);
            }

            if seg.has(FLAG_FIN) {
                let fin_seq = seg.seq.wrapping_add(seg.payload.len() as u32);
                if fin_seq != s.rcv_nxt {
                    return;
                }
                // Passive close, collapsed: ACK the FIN, send our own
                // FIN+ACK and go straight to LastAck.
                s.rcv_nxt = s.rcv_nxt.wrapping_add(1);
                s.peer_closed = true;
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_ACK,
                });
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_FIN | FLAG_ACK,
                });
                s.snd_nxt = s.snd_nxt.wrapping_add(1);
                s.state = TcpState::LastAck;
                *wake_rx = Some(handle);
            }
        }
        TcpState::FinWait1 => {
            if seg.has(FLAG_FIN) {
                s.rcv_nxt = seg.seq.wrapping_add(1);
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_ACK,
                });
                s.state = TcpState::TimeWait;
                *wake_rx = Some(handle);
            } else if seg.has(FLAG_ACK) && seg.ack == s.snd_nxt {
                s.state = TcpState::FinWait2;
            }
        }
        TcpState::FinWait2 => {
            if seg.has(FLAG_FIN) {
                s.rcv_nxt = s.rcv_nxt.wrapping_add(1);
                replies.push(Reply {
                    src: s.local,
                    dst: s.remote,
                    seq: s.snd_nxt,
                    ack: s.rcv_nxt,
                    flags: FLAG_ACK,
                });
                s.state = TcpState::TimeWait;
                *wake_rx = Some(handle);
            }
        }
        TcpState::LastAck => {
            if seg.has(FLAG_ACK) && seg.ack == s.snd_nxt {
                // Final ACK of the passive close: the slot is released
                // (source behavior; a production rewrite would hold
                // TimeWait here).
                s.state = TcpState::Closed;
                *free_handle = Some(handle);
            }
        }
        TcpState::CloseWait | TcpState::TimeWait | TcpState::Closed | TcpState::Listen => {
            // TimeWait absorbs stray segments; the rest drop them.
        }
    }
}

/// Sequence comparison: is `a` strictly after `b` (mod 2^32)?
fn seq_after(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> (Endpoint, Endpoint) {
        (
            Endpoint::new(Ipv4Address::new(10, 0, 2, 15), 80),
            Endpoint::new(Ipv4Address::new(10, 0, 2, 2), 51000),
        )
    }

    #[test]
    fn segment_round_trip() {
        let (src, dst) = endpoints();
        let built = build_segment(src, dst, 1000, 2000, FLAG_PSH | FLAG_ACK, 4096, b"hello");
        let seg = parse_segment(&built).unwrap();

        assert_eq!(seg.src_port, 80);
        assert_eq!(seg.dst_port, 51000);
        assert_eq!(seg.seq, 1000);
        assert_eq!(seg.ack, 2000);
        assert!(seg.has(FLAG_PSH));
        assert!(seg.has(FLAG_ACK));
        assert!(!seg.has(FLAG_SYN));
        assert_eq!(seg.window, 4096);
        assert_eq!(seg.payload, b"hello");
    }

    #[test]
    fn built_segment_checksums_to_zero() {
        let (src, dst) = endpoints();
        let built = build_segment(src, dst, 7, 9, FLAG_ACK, 512, b"data");
        assert_eq!(
            checksum::pseudo_checksum(src.ip, dst.ip, ip::PROTO_TCP, &built),
            0
        );
    }

    #[test]
    fn sequence_comparison_wraps() {
        assert!(seq_after(5, 1));
        assert!(!seq_after(1, 5));
        assert!(!seq_after(7, 7));
        // Across the wrap point
        assert!(seq_after(2, u32::MAX - 2));
    }

    #[test]
    fn isn_varies_with_connection_identity() {
        let remote_a = Endpoint::new(Ipv4Address::new(10, 0, 2, 2), 80);
        let remote_b = Endpoint::new(Ipv4Address::new(10, 0, 2, 2), 81);
        assert_ne!(initial_seq(5000, remote_a), initial_seq(5000, remote_b));
        assert_ne!(initial_seq(5000, remote_a), initial_seq(5001, remote_a));
    }

    #[test]
    fn short_or_bad_offset_segments_fail_parse() {
        assert!(parse_segment(&[0u8; 10]).is_none());
        let mut seg = [0u8; 20];
        seg[12] = 0x30; // data offset 12 bytes, below the minimum header
        assert!(parse_segment(&seg).is_none());
    }
}
