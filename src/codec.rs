//! # Pseudo-TCP Packet Codec
//!
//! Builds and parses the IPv4/IPv6 + TCP framing used by the pseudo-TCP
//! carrier. The headers are real enough for middleboxes: correct version
//! fields, TTL/hop-limit 64, Don't-Fragment on IPv4, valid one's-complement
//! checksums including the TCP pseudo-header, and a window-scale option on
//! SYN segments. They are deliberately *not* a conforming TCP — the window
//! is pinned at 0xFFFF, IPv6 options are never emitted, and the only
//! interop target is the same codec on the far side of the tunnel.

use std::net::{IpAddr, SocketAddr};

/// IPv4 header length (no options).
pub const IPV4_HEADER_LEN: usize = 20;
/// IPv6 header length (no extension headers).
pub const IPV6_HEADER_LEN: usize = 40;
/// TCP header length before options.
pub const TCP_HEADER_LEN: usize = 20;
/// Largest packet the tunnel reader hands to the codec.
pub const MAX_PACKET_LEN: usize = 1500;

/// IP protocol number for TCP.
const PROTO_TCP: u8 = 6;

// TCP flag bits.
pub const FIN: u8 = 1 << 0;
pub const SYN: u8 = 1 << 1;
pub const RST: u8 = 1 << 2;
pub const PSH: u8 = 1 << 3;
pub const ACK: u8 = 1 << 4;
pub const URG: u8 = 1 << 5;

/// A parsed pseudo-TCP packet. Borrows the payload from the receive buffer.
#[derive(Debug)]
pub struct TcpPacket<'a> {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
    pub is_ipv6: bool,
}

impl TcpPacket<'_> {
    /// Source of the packet as a socket address.
    pub fn src_addr(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    /// Destination of the packet as a socket address.
    pub fn dst_addr(&self) -> SocketAddr {
        SocketAddr::new(self.dst_ip, self.dst_port)
    }
}

/// Build a complete IP + TCP packet ready to write to the tunnel device.
///
/// The address family is taken from `local`; `local` and `remote` must be
/// the same family. SYN segments grow a 4-byte window-scale option
/// (`NOP, kind 3, len 3, shift 14`).
pub fn build_tcp_packet(
    local: SocketAddr,
    remote: SocketAddr,
    seq: u32,
    ack: u32,
    flags: u8,
    payload: &[u8],
) -> Vec<u8> {
    let is_ipv6 = local.is_ipv6();
    let ip_header_len = if is_ipv6 { IPV6_HEADER_LEN } else { IPV4_HEADER_LEN };

    let wscale = flags & SYN != 0;
    let tcp_header_len = if wscale { TCP_HEADER_LEN + 4 } else { TCP_HEADER_LEN };

    let tcp_total_len = tcp_header_len + payload.len();
    let total_len = ip_header_len + tcp_total_len;
    let mut buf = vec![0u8; total_len];

    if is_ipv6 {
        build_ipv6_header(&mut buf[..ip_header_len], local.ip(), remote.ip(), tcp_total_len);
    } else {
        build_ipv4_header(&mut buf[..ip_header_len], local.ip(), remote.ip(), total_len);
    }

    let tcp = &mut buf[ip_header_len..];
    tcp[0..2].copy_from_slice(&local.port().to_be_bytes());
    tcp[2..4].copy_from_slice(&remote.port().to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = ((tcp_header_len / 4) as u8) << 4;
    tcp[13] = flags;
    tcp[14..16].copy_from_slice(&0xFFFFu16.to_be_bytes()); // fixed window, no flow control
    // checksum at [16..18] stays zero until computed below
    // urgent pointer at [18..20] stays zero

    if wscale {
        tcp[20] = 1; // NOP
        tcp[21] = 3; // window scale kind
        tcp[22] = 3; // option length
        tcp[23] = 14; // shift count
    }

    tcp[tcp_header_len..].copy_from_slice(payload);

    let pseudo = build_pseudo_header(local.ip(), remote.ip(), tcp_total_len);
    let checksum = tcp_checksum(&pseudo, tcp);
    buf[ip_header_len + 16..ip_header_len + 18].copy_from_slice(&checksum.to_be_bytes());

    buf
}

/// Parse one IP packet read from the tunnel device.
///
/// Returns `None` for anything that is not a well-formed TCP segment:
/// unknown IP version, non-TCP payload, or truncated headers.
pub fn parse_tcp_packet(buf: &[u8]) -> Option<TcpPacket<'_>> {
    if buf.len() < IPV4_HEADER_LEN {
        return None;
    }

    let version = buf[0] >> 4;
    let (src_ip, dst_ip, proto, tcp_start, is_ipv6) = match version {
        4 => {
            let src: [u8; 4] = buf[12..16].try_into().ok()?;
            let dst: [u8; 4] = buf[16..20].try_into().ok()?;
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                buf[9],
                IPV4_HEADER_LEN,
                false,
            )
        }
        6 => {
            if buf.len() < IPV6_HEADER_LEN {
                return None;
            }
            let src: [u8; 16] = buf[8..24].try_into().ok()?;
            let dst: [u8; 16] = buf[24..40].try_into().ok()?;
            (
                IpAddr::from(src),
                IpAddr::from(dst),
                buf[6],
                IPV6_HEADER_LEN,
                true,
            )
        }
        _ => return None,
    };

    if proto != PROTO_TCP {
        return None;
    }
    if buf.len() < tcp_start + TCP_HEADER_LEN {
        return None;
    }

    let tcp = &buf[tcp_start..];
    let data_offset = ((tcp[12] >> 4) as usize) * 4;
    if data_offset < TCP_HEADER_LEN || data_offset > tcp.len() {
        return None;
    }

    Some(TcpPacket {
        src_ip,
        dst_ip,
        src_port: u16::from_be_bytes([tcp[0], tcp[1]]),
        dst_port: u16::from_be_bytes([tcp[2], tcp[3]]),
        seq: u32::from_be_bytes([tcp[4], tcp[5], tcp[6], tcp[7]]),
        ack: u32::from_be_bytes([tcp[8], tcp[9], tcp[10], tcp[11]]),
        flags: tcp[13],
        window: u16::from_be_bytes([tcp[14], tcp[15]]),
        payload: &tcp[data_offset..],
        is_ipv6,
    })
}

fn build_ipv4_header(buf: &mut [u8], src: IpAddr, dst: IpAddr, total_len: usize) {
    let (IpAddr::V4(src), IpAddr::V4(dst)) = (src, dst) else {
        unreachable!("family checked by caller");
    };

    buf[0] = 0x45; // version 4, IHL 5
    buf[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    buf[6..8].copy_from_slice(&0x4000u16.to_be_bytes()); // Don't Fragment
    buf[8] = 64; // TTL
    buf[9] = PROTO_TCP;
    buf[12..16].copy_from_slice(&src.octets());
    buf[16..20].copy_from_slice(&dst.octets());

    let checksum = internet_checksum(&buf[..IPV4_HEADER_LEN]);
    buf[10..12].copy_from_slice(&checksum.to_be_bytes());
}

fn build_ipv6_header(buf: &mut [u8], src: IpAddr, dst: IpAddr, payload_len: usize) {
    let (IpAddr::V6(src), IpAddr::V6(dst)) = (src, dst) else {
        unreachable!("family checked by caller");
    };

    buf[0] = 0x60; // version 6
    buf[4..6].copy_from_slice(&(payload_len as u16).to_be_bytes());
    buf[6] = PROTO_TCP; // next header
    buf[7] = 64; // hop limit
    buf[8..24].copy_from_slice(&src.octets());
    buf[24..40].copy_from_slice(&dst.octets());
}

fn build_pseudo_header(src: IpAddr, dst: IpAddr, tcp_len: usize) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut pseudo = vec![0u8; 12];
            pseudo[0..4].copy_from_slice(&src.octets());
            pseudo[4..8].copy_from_slice(&dst.octets());
            pseudo[9] = PROTO_TCP;
            pseudo[10..12].copy_from_slice(&(tcp_len as u16).to_be_bytes());
            pseudo
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut pseudo = vec![0u8; 40];
            pseudo[0..16].copy_from_slice(&src.octets());
            pseudo[16..32].copy_from_slice(&dst.octets());
            pseudo[32..36].copy_from_slice(&(tcp_len as u32).to_be_bytes());
            pseudo[39] = PROTO_TCP;
            pseudo
        }
        _ => unreachable!("family checked by caller"),
    }
}

/// One's-complement sum over `data` with a 32-bit accumulator and explicit
/// wraparound fold. Odd trailing bytes are padded high, per RFC 1071.
fn accumulate(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum over a single buffer (IPv4 header).
fn internet_checksum(data: &[u8]) -> u16 {
    fold(accumulate(0, data))
}

/// TCP checksum over pseudo-header plus segment.
fn tcp_checksum(pseudo: &[u8], segment: &[u8]) -> u16 {
    fold(accumulate(accumulate(0, pseudo), segment))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4(ip: [u8; 4], port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::from(ip), port)
    }

    fn v6(last: u16, port: u16) -> SocketAddr {
        SocketAddr::new(
            IpAddr::from([0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, last as u8]),
            port,
        )
    }

    /// Verifying a one's-complement checksum: summing the data including the
    /// stored checksum must fold to zero.
    fn verify(pseudo: &[u8], segment: &[u8]) -> bool {
        fold(accumulate(accumulate(0, pseudo), segment)) == 0
    }

    #[test]
    fn ipv4_round_trip() {
        let local = v4([192, 0, 2, 1], 12000);
        let remote = v4([192, 0, 2, 2], 443);
        let payload = b"hello pseudo tcp";

        let buf = build_tcp_packet(local, remote, 1000, 2000, ACK, payload);
        let pkt = parse_tcp_packet(&buf).expect("parse");

        assert_eq!(pkt.src_addr(), local);
        assert_eq!(pkt.dst_addr(), remote);
        assert_eq!(pkt.seq, 1000);
        assert_eq!(pkt.ack, 2000);
        assert_eq!(pkt.flags, ACK);
        assert_eq!(pkt.window, 0xFFFF);
        assert_eq!(pkt.payload, payload);
        assert!(!pkt.is_ipv6);
    }

    #[test]
    fn ipv6_round_trip() {
        let local = v6(1, 12000);
        let remote = v6(2, 443);
        let payload = b"v6";

        let buf = build_tcp_packet(local, remote, 7, 9, SYN | ACK, payload);
        let pkt = parse_tcp_packet(&buf).expect("parse");

        assert_eq!(pkt.src_addr(), local);
        assert_eq!(pkt.dst_addr(), remote);
        assert_eq!(pkt.flags, SYN | ACK);
        assert_eq!(pkt.payload, payload);
        assert!(pkt.is_ipv6);
    }

    #[test]
    fn syn_carries_window_scale_option() {
        let buf = build_tcp_packet(v4([10, 0, 0, 1], 1), v4([10, 0, 0, 2], 2), 0, 0, SYN, &[]);
        assert_eq!(buf.len(), IPV4_HEADER_LEN + TCP_HEADER_LEN + 4);
        let opts = &buf[IPV4_HEADER_LEN + TCP_HEADER_LEN..];
        assert_eq!(opts, &[1, 3, 3, 14]);

        // data offset covers the option
        let pkt = parse_tcp_packet(&buf).unwrap();
        assert!(pkt.payload.is_empty());
    }

    #[test]
    fn non_syn_has_bare_header() {
        let buf = build_tcp_packet(v4([10, 0, 0, 1], 1), v4([10, 0, 0, 2], 2), 0, 0, ACK, &[]);
        assert_eq!(buf.len(), IPV4_HEADER_LEN + TCP_HEADER_LEN);
    }

    #[test]
    fn tcp_checksum_validates_including_odd_lengths() {
        for payload_len in [0usize, 1, 2, 3, 15, 16, 17] {
            let payload: Vec<u8> = (0..payload_len as u8).collect();
            let local = v4([198, 51, 100, 7], 3000);
            let remote = v4([198, 51, 100, 8], 3001);
            let buf = build_tcp_packet(local, remote, 42, 43, ACK | PSH, &payload);

            let tcp = &buf[IPV4_HEADER_LEN..];
            let pseudo = build_pseudo_header(local.ip(), remote.ip(), tcp.len());
            assert!(verify(&pseudo, tcp), "payload len {payload_len}");
        }
    }

    #[test]
    fn ipv4_header_checksum_validates() {
        let buf = build_tcp_packet(v4([203, 0, 113, 1], 5), v4([203, 0, 113, 2], 6), 0, 0, SYN, &[]);
        assert_eq!(fold(accumulate(0, &buf[..IPV4_HEADER_LEN])), 0);
    }

    #[test]
    fn rejects_non_tcp_and_truncated() {
        // UDP protocol number inside an otherwise fine IPv4 header
        let mut buf = build_tcp_packet(v4([10, 0, 0, 1], 1), v4([10, 0, 0, 2], 2), 0, 0, ACK, &[]);
        buf[9] = 17;
        assert!(parse_tcp_packet(&buf).is_none());

        let buf = build_tcp_packet(v4([10, 0, 0, 1], 1), v4([10, 0, 0, 2], 2), 0, 0, ACK, &[]);
        assert!(parse_tcp_packet(&buf[..IPV4_HEADER_LEN + 4]).is_none());
        assert!(parse_tcp_packet(&[]).is_none());
        assert!(parse_tcp_packet(&[0xF0; 40]).is_none()); // bogus version
    }

    #[test]
    fn dont_fragment_and_ttl_are_set() {
        let buf = build_tcp_packet(v4([10, 0, 0, 1], 1), v4([10, 0, 0, 2], 2), 0, 0, ACK, &[]);
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 0x4000);
        assert_eq!(buf[8], 64);
    }
}
