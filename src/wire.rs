//! Raw IP/TCP/UDP/ICMP header views and serializers.
//!
//! Ingress parsing borrows from the frame in place; nothing here copies
//! payload. Egress serializers always fill checksums. Ingress checksum
//! verification is the caller's decision (see `MemoryProfile`).

use crate::error::Error;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

// TCP flag bits.
pub const TCP_FIN: u8 = 0x01;
pub const TCP_SYN: u8 = 0x02;
pub const TCP_RST: u8 = 0x04;
pub const TCP_PSH: u8 = 0x08;
pub const TCP_ACK: u8 = 0x10;

/// Parsed network-layer view of a raw IP datagram (v4 or v6).
#[derive(Debug)]
pub struct IpView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub proto: u8,
    pub payload: &'a [u8],
    /// IPv4 fragmentation fields; `None` for IPv6 (extension-header
    /// fragments are not reassembled, matching the profile).
    pub frag: Option<FragInfo>,
}

/// IPv4 fragment header fields.
#[derive(Debug, Clone, Copy)]
pub struct FragInfo {
    pub ident: u16,
    /// Byte offset of this fragment within the original datagram.
    pub offset: usize,
    pub more_fragments: bool,
}

impl FragInfo {
    pub fn is_fragment(&self) -> bool {
        self.more_fragments || self.offset != 0
    }
}

impl<'a> IpView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.is_empty() {
            return Err(Error::Malformed("empty frame"));
        }
        match buf[0] >> 4 {
            4 => Self::parse_v4(buf),
            6 => Self::parse_v6(buf),
            _ => Err(Error::Malformed("not an IP datagram")),
        }
    }

    fn parse_v4(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < 20 {
            return Err(Error::Malformed("short ipv4 header"));
        }
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if ihl < 20 || total_len < ihl || total_len > buf.len() {
            return Err(Error::Malformed("bad ipv4 lengths"));
        }
        let flags_frag = u16::from_be_bytes([buf[6], buf[7]]);
        let frag = FragInfo {
            ident: u16::from_be_bytes([buf[4], buf[5]]),
            offset: ((flags_frag & 0x1FFF) as usize) * 8,
            more_fragments: flags_frag & 0x2000 != 0,
        };
        Ok(Self {
            src: IpAddr::V4(Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15])),
            dst: IpAddr::V4(Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19])),
            proto: buf[9],
            payload: &buf[ihl..total_len],
            frag: Some(frag),
        })
    }

    fn parse_v6(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < 40 {
            return Err(Error::Malformed("short ipv6 header"));
        }
        let payload_len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if 40 + payload_len > buf.len() {
            return Err(Error::Malformed("bad ipv6 payload length"));
        }
        let (proto, offset) = skip_ipv6_ext_headers(buf)?;
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&buf[8..24]);
        dst.copy_from_slice(&buf[24..40]);
        Ok(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            proto,
            payload: &buf[offset..40 + payload_len],
            frag: None,
        })
    }

    /// Verifies the IPv4 header checksum. Always true for IPv6 (no header
    /// checksum exists).
    pub fn verify_header_checksum(buf: &[u8]) -> bool {
        if buf.is_empty() || buf[0] >> 4 != 4 || buf.len() < 20 {
            return true;
        }
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        if ihl < 20 || ihl > buf.len() {
            return false;
        }
        internet_checksum(&[&buf[..ihl]]) == 0
    }
}

/// Skips IPv6 extension headers, returning the upper-layer protocol and its
/// byte offset. Bounded hop count so a crafted header loop cannot spin.
fn skip_ipv6_ext_headers(buf: &[u8]) -> Result<(u8, usize), Error> {
    let mut next_header = buf[6];
    let mut offset = 40;
    for _ in 0..10 {
        match next_header {
            // Hop-by-hop, routing, fragment, destination options.
            0 | 43 | 44 | 60 => {
                if offset + 2 > buf.len() {
                    return Err(Error::Malformed("truncated ipv6 extension header"));
                }
                let hdr_len = if next_header == 44 {
                    8
                } else {
                    (buf[offset + 1] as usize + 1) * 8
                };
                next_header = buf[offset];
                offset += hdr_len;
                if offset > buf.len() {
                    return Err(Error::Malformed("ipv6 extension header overrun"));
                }
            }
            _ => return Ok((next_header, offset)),
        }
    }
    Err(Error::Malformed("too many ipv6 extension headers"))
}

/// TCP options we understand on ingress.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpOptions {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamps: Option<(u32, u32)>,
}

/// Borrowed view of one TCP segment.
#[derive(Debug)]
pub struct TcpView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: TcpOptions,
    pub payload: &'a [u8],
}

impl<'a> TcpView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < 20 {
            return Err(Error::Malformed("short tcp header"));
        }
        let data_offset = ((buf[12] >> 4) as usize) * 4;
        if data_offset < 20 || data_offset > buf.len() {
            return Err(Error::Malformed("bad tcp data offset"));
        }
        let mut options = TcpOptions::default();
        let opts = &buf[20..data_offset];
        let mut i = 0;
        while i < opts.len() {
            match opts[i] {
                0 => break,
                1 => {
                    i += 1;
                    continue;
                }
                kind => {
                    if i + 1 >= opts.len() {
                        break;
                    }
                    let len = opts[i + 1] as usize;
                    if len < 2 || i + len > opts.len() {
                        break;
                    }
                    match (kind, len) {
                        (2, 4) => {
                            options.mss = Some(u16::from_be_bytes([opts[i + 2], opts[i + 3]]))
                        }
                        (3, 3) => options.window_scale = Some(opts[i + 2]),
                        (4, 2) => options.sack_permitted = true,
                        (8, 10) => {
                            let val = u32::from_be_bytes([
                                opts[i + 2],
                                opts[i + 3],
                                opts[i + 4],
                                opts[i + 5],
                            ]);
                            let ecr = u32::from_be_bytes([
                                opts[i + 6],
                                opts[i + 7],
                                opts[i + 8],
                                opts[i + 9],
                            ]);
                            options.timestamps = Some((val, ecr));
                        }
                        _ => {}
                    }
                    i += len;
                }
            }
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            seq: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
            ack: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: buf[13],
            window: u16::from_be_bytes([buf[14], buf[15]]),
            options,
            payload: &buf[data_offset..],
        })
    }
}

/// Borrowed view of one UDP datagram.
#[derive(Debug)]
pub struct UdpView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < 8 {
            return Err(Error::Malformed("short udp header"));
        }
        let len = u16::from_be_bytes([buf[4], buf[5]]) as usize;
        if len < 8 || len > buf.len() {
            return Err(Error::Malformed("bad udp length"));
        }
        Ok(Self {
            src_port: u16::from_be_bytes([buf[0], buf[1]]),
            dst_port: u16::from_be_bytes([buf[2], buf[3]]),
            payload: &buf[8..len],
        })
    }
}

/// Borrowed view of an ICMPv4 echo message.
#[derive(Debug)]
pub struct IcmpEchoView<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: &'a [u8],
}

impl<'a> IcmpEchoView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self, Error> {
        if buf.len() < 8 {
            return Err(Error::Malformed("short icmp header"));
        }
        Ok(Self {
            icmp_type: buf[0],
            code: buf[1],
            identifier: u16::from_be_bytes([buf[4], buf[5]]),
            sequence: u16::from_be_bytes([buf[6], buf[7]]),
            payload: &buf[8..],
        })
    }
}

/// Option set attached to an egress TCP segment.
#[derive(Debug, Clone, Default)]
pub struct TcpOptionsOut {
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub sack_permitted: bool,
    pub timestamps: Option<(u32, u32)>,
    /// SACK ranges as (start, end) sequence numbers, already bounded by the
    /// profile's range cap.
    pub sack_blocks: Vec<(u32, u32)>,
}

/// Egress TCP segment description; serialized by [`build_tcp_datagram`].
#[derive(Debug)]
pub struct TcpSegmentOut<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub options: TcpOptionsOut,
    pub payload: &'a [u8],
}

fn tcp_options_bytes(options: &TcpOptionsOut) -> Vec<u8> {
    let mut opts = Vec::new();
    if let Some(mss) = options.mss {
        opts.push(2);
        opts.push(4);
        opts.extend_from_slice(&mss.to_be_bytes());
    }
    if let Some(ws) = options.window_scale {
        opts.extend_from_slice(&[1, 3, 3, ws]);
    }
    if options.sack_permitted {
        opts.extend_from_slice(&[1, 1, 4, 2]);
    }
    if let Some((val, ecr)) = options.timestamps {
        opts.extend_from_slice(&[1, 1, 8, 10]);
        opts.extend_from_slice(&val.to_be_bytes());
        opts.extend_from_slice(&ecr.to_be_bytes());
    }
    if !options.sack_blocks.is_empty() {
        // The data offset field is 4 bits, so the option area caps at 40
        // bytes. Blocks that do not fit are dropped.
        let room = 40usize.saturating_sub(opts.len() + 4) / 8;
        let take = options.sack_blocks.len().min(room);
        if take > 0 {
            opts.extend_from_slice(&[1, 1, 5, (2 + 8 * take) as u8]);
            for (start, end) in &options.sack_blocks[..take] {
                opts.extend_from_slice(&start.to_be_bytes());
                opts.extend_from_slice(&end.to_be_bytes());
            }
        }
    }
    while opts.len() % 4 != 0 {
        opts.push(1);
    }
    opts
}

/// Serializes a full IP datagram carrying one TCP segment, checksummed.
pub fn build_tcp_datagram(src: IpAddr, dst: IpAddr, ident: u16, seg: &TcpSegmentOut<'_>) -> Vec<u8> {
    let opts = tcp_options_bytes(&seg.options);
    let hdr_len = 20 + opts.len();
    let mut tcp = Vec::with_capacity(hdr_len + seg.payload.len());
    tcp.extend_from_slice(&seg.src_port.to_be_bytes());
    tcp.extend_from_slice(&seg.dst_port.to_be_bytes());
    tcp.extend_from_slice(&seg.seq.to_be_bytes());
    tcp.extend_from_slice(&seg.ack.to_be_bytes());
    tcp.push(((hdr_len / 4) as u8) << 4);
    tcp.push(seg.flags);
    tcp.extend_from_slice(&seg.window.to_be_bytes());
    tcp.extend_from_slice(&[0, 0]); // checksum, filled below
    tcp.extend_from_slice(&[0, 0]); // urgent pointer
    tcp.extend_from_slice(&opts);
    tcp.extend_from_slice(seg.payload);

    let csum = transport_checksum(src, dst, PROTO_TCP, &tcp);
    tcp[16..18].copy_from_slice(&csum.to_be_bytes());

    build_ip_datagram(src, dst, PROTO_TCP, ident, &tcp)
}

/// Serializes a full IP datagram carrying one UDP datagram, checksummed.
pub fn build_udp_datagram(
    src: IpAddr,
    dst: IpAddr,
    ident: u16,
    src_port: u16,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let len = 8 + payload.len();
    let mut udp = Vec::with_capacity(len);
    udp.extend_from_slice(&src_port.to_be_bytes());
    udp.extend_from_slice(&dst_port.to_be_bytes());
    udp.extend_from_slice(&(len as u16).to_be_bytes());
    udp.extend_from_slice(&[0, 0]);
    udp.extend_from_slice(payload);
    let csum = transport_checksum(src, dst, PROTO_UDP, &udp);
    // UDP transmits an all-ones checksum where the sum comes out zero.
    let csum = if csum == 0 { 0xFFFF } else { csum };
    udp[6..8].copy_from_slice(&csum.to_be_bytes());
    build_ip_datagram(src, dst, PROTO_UDP, ident, &udp)
}

/// Serializes an ICMPv4 echo reply datagram.
pub fn build_icmp_echo_reply(
    src: IpAddr,
    dst: IpAddr,
    ident: u16,
    echo_id: u16,
    echo_seq: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut icmp = Vec::with_capacity(8 + payload.len());
    icmp.extend_from_slice(&[0, 0, 0, 0]); // type 0 (reply), code 0, checksum
    icmp.extend_from_slice(&echo_id.to_be_bytes());
    icmp.extend_from_slice(&echo_seq.to_be_bytes());
    icmp.extend_from_slice(payload);
    let csum = internet_checksum(&[&icmp]);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());
    build_ip_datagram(src, dst, PROTO_ICMP, ident, &icmp)
}

/// Wraps a transport payload in an IP header matching the address family.
pub fn build_ip_datagram(src: IpAddr, dst: IpAddr, proto: u8, ident: u16, payload: &[u8]) -> Vec<u8> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = 20 + payload.len();
            let mut pkt = Vec::with_capacity(total);
            pkt.push(0x45);
            pkt.push(0);
            pkt.extend_from_slice(&(total as u16).to_be_bytes());
            pkt.extend_from_slice(&ident.to_be_bytes());
            pkt.extend_from_slice(&[0, 0]); // flags + fragment offset
            pkt.push(crate::constants::IP_TTL);
            pkt.push(proto);
            pkt.extend_from_slice(&[0, 0]); // header checksum
            pkt.extend_from_slice(&s.octets());
            pkt.extend_from_slice(&d.octets());
            let csum = internet_checksum(&[&pkt[..20]]);
            pkt[10..12].copy_from_slice(&csum.to_be_bytes());
            pkt.extend_from_slice(payload);
            pkt
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let mut pkt = Vec::with_capacity(40 + payload.len());
            pkt.push(0x60);
            pkt.extend_from_slice(&[0, 0, 0]);
            pkt.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            pkt.push(proto);
            pkt.push(crate::constants::IP_TTL);
            pkt.extend_from_slice(&s.octets());
            pkt.extend_from_slice(&d.octets());
            pkt.extend_from_slice(payload);
            pkt
        }
        _ => unreachable!("mixed address families on one connection"),
    }
}

/// One's-complement sum over concatenated byte slices.
pub fn internet_checksum(parts: &[&[u8]]) -> u16 {
    let mut sum: u32 = 0;
    let mut carry_byte: Option<u8> = None;
    for part in parts {
        for &b in part.iter() {
            match carry_byte.take() {
                Some(hi) => sum += u32::from_be_bytes([0, 0, hi, b]),
                None => carry_byte = Some(b),
            }
        }
    }
    if let Some(hi) = carry_byte {
        sum += (hi as u32) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Transport checksum with the v4 or v6 pseudo-header.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, proto: u8, segment: &[u8]) -> u16 {
    let len = segment.len() as u32;
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let pseudo = [
                s.octets().as_slice(),
                d.octets().as_slice(),
                &[0, proto],
                &(len as u16).to_be_bytes(),
            ]
            .concat();
            internet_checksum(&[&pseudo, segment])
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            let pseudo = [
                s.octets().as_slice(),
                d.octets().as_slice(),
                &len.to_be_bytes(),
                &[0, 0, 0, proto],
            ]
            .concat();
            internet_checksum(&[&pseudo, segment])
        }
        _ => unreachable!("mixed address families on one connection"),
    }
}

/// Verifies a transport checksum over a parsed datagram. A zero UDP
/// checksum means "not computed" and passes.
pub fn verify_transport_checksum(ip: &IpView<'_>) -> bool {
    if ip.proto == PROTO_UDP && ip.payload.len() >= 8 && ip.payload[6] == 0 && ip.payload[7] == 0 {
        return true;
    }
    if ip.proto == PROTO_ICMP {
        return internet_checksum(&[ip.payload]) == 0;
    }
    transport_checksum(ip.src, ip.dst, ip.proto, ip.payload) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal IPv4 TCP segment for parser tests.
    fn build_syn(mss: u16) -> Vec<u8> {
        let seg = TcpSegmentOut {
            src_port: 12345,
            dst_port: 80,
            seq: 1000,
            ack: 0,
            flags: TCP_SYN,
            window: 65535,
            options: TcpOptionsOut {
                mss: Some(mss),
                window_scale: Some(2),
                sack_permitted: true,
                timestamps: Some((7, 0)),
                sack_blocks: Vec::new(),
            },
            payload: &[],
        };
        build_tcp_datagram(
            IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            1,
            &seg,
        )
    }

    #[test]
    fn test_ipv4_roundtrip() {
        let pkt = build_syn(1460);
        let ip = IpView::parse(&pkt).unwrap();
        assert_eq!(ip.proto, PROTO_TCP);
        assert_eq!(ip.src, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(IpView::verify_header_checksum(&pkt));
        assert!(verify_transport_checksum(&ip));

        let tcp = TcpView::parse(ip.payload).unwrap();
        assert_eq!(tcp.src_port, 12345);
        assert_eq!(tcp.dst_port, 80);
        assert_eq!(tcp.seq, 1000);
        assert_eq!(tcp.flags & TCP_SYN, TCP_SYN);
        assert_eq!(tcp.options.mss, Some(1460));
        assert_eq!(tcp.options.window_scale, Some(2));
        assert!(tcp.options.sack_permitted);
        assert_eq!(tcp.options.timestamps, Some((7, 0)));
    }

    #[test]
    fn test_ipv6_roundtrip() {
        let src = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2));
        let dst = IpAddr::V6(Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1));
        let seg = TcpSegmentOut {
            src_port: 1,
            dst_port: 443,
            seq: 5,
            ack: 6,
            flags: TCP_ACK,
            window: 1024,
            options: TcpOptionsOut::default(),
            payload: b"hi",
        };
        let pkt = build_tcp_datagram(src, dst, 0, &seg);
        let ip = IpView::parse(&pkt).unwrap();
        assert_eq!(ip.proto, PROTO_TCP);
        assert_eq!(ip.src, src);
        assert!(verify_transport_checksum(&ip));
        let tcp = TcpView::parse(ip.payload).unwrap();
        assert_eq!(tcp.payload, b"hi");
    }

    #[test]
    fn test_udp_roundtrip() {
        let src = IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4));
        let dst = IpAddr::V4(Ipv4Addr::new(5, 6, 7, 8));
        let pkt = build_udp_datagram(src, dst, 9, 1111, 53, b"query");
        let ip = IpView::parse(&pkt).unwrap();
        assert_eq!(ip.proto, PROTO_UDP);
        assert!(verify_transport_checksum(&ip));
        let udp = UdpView::parse(ip.payload).unwrap();
        assert_eq!(udp.src_port, 1111);
        assert_eq!(udp.dst_port, 53);
        assert_eq!(udp.payload, b"query");
    }

    #[test]
    fn test_icmp_echo_reply_checksums() {
        let src = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
        let dst = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));
        let pkt = build_icmp_echo_reply(src, dst, 3, 0xBEEF, 7, b"ping");
        let ip = IpView::parse(&pkt).unwrap();
        assert_eq!(ip.proto, PROTO_ICMP);
        assert!(verify_transport_checksum(&ip));
        let echo = IcmpEchoView::parse(ip.payload).unwrap();
        assert_eq!(echo.icmp_type, 0);
        assert_eq!(echo.identifier, 0xBEEF);
        assert_eq!(echo.sequence, 7);
        assert_eq!(echo.payload, b"ping");
    }

    #[test]
    fn test_truncated_headers_rejected() {
        assert!(IpView::parse(&[]).is_err());
        assert!(IpView::parse(&[0x45, 0, 0]).is_err());
        assert!(TcpView::parse(&[0; 10]).is_err());
        assert!(UdpView::parse(&[0; 4]).is_err());
    }

    #[test]
    fn test_corrupted_checksum_detected() {
        let mut pkt = build_syn(1460);
        let n = pkt.len();
        pkt[n - 1] ^= 0xFF; // flip a bit in the options
        let ip = IpView::parse(&pkt).unwrap();
        assert!(!verify_transport_checksum(&ip));
    }

    #[test]
    fn test_sack_blocks_serialized() {
        let seg = TcpSegmentOut {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 100,
            flags: TCP_ACK,
            window: 512,
            options: TcpOptionsOut {
                sack_blocks: vec![(200, 300), (400, 500)],
                ..Default::default()
            },
            payload: &[],
        };
        let pkt = build_tcp_datagram(
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            0,
            &seg,
        );
        let ip = IpView::parse(&pkt).unwrap();
        let tcp_bytes = ip.payload;
        // NOP NOP kind=5 len=18 follows the fixed header.
        assert_eq!(&tcp_bytes[20..24], &[1, 1, 5, 18]);
        assert_eq!(&tcp_bytes[24..28], &200u32.to_be_bytes());
    }

    #[test]
    fn test_sack_blocks_capped_to_option_space() {
        let blocks: Vec<(u32, u32)> = (0..8u32).map(|i| (1000 + i * 100, 1050 + i * 100)).collect();
        let seg = TcpSegmentOut {
            src_port: 1,
            dst_port: 2,
            seq: 0,
            ack: 100,
            flags: TCP_ACK,
            window: 512,
            options: TcpOptionsOut {
                timestamps: Some((1, 2)),
                sack_blocks: blocks,
                ..Default::default()
            },
            payload: &[],
        };
        let pkt = build_tcp_datagram(
            IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)),
            IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2)),
            0,
            &seg,
        );
        let ip = IpView::parse(&pkt).unwrap();
        let tcp = TcpView::parse(ip.payload).unwrap();
        assert_eq!(tcp.options.timestamps, Some((1, 2)));
        // Timestamps (12) plus three blocks (28) fill the option space.
        assert_eq!(ip.payload.len(), 60);
    }

    #[test]
    fn test_ipv6_extension_header_skipping() {
        // IPv6 header with one hop-by-hop extension before TCP.
        let mut pkt = vec![0u8; 40 + 8 + 20];
        pkt[0] = 0x60;
        let payload_len = (8 + 20) as u16;
        pkt[4..6].copy_from_slice(&payload_len.to_be_bytes());
        pkt[6] = 0; // hop-by-hop
        pkt[40] = PROTO_TCP; // next header
        pkt[41] = 0; // hdr ext len -> 8 bytes
        pkt[48 + 12] = 5 << 4; // data offset in the TCP header at 48
        let ip = IpView::parse(&pkt).unwrap();
        assert_eq!(ip.proto, PROTO_TCP);
        assert_eq!(ip.payload.len(), 20);
    }
}
