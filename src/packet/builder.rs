//! IP packet construction for the tun write path
//!
//! Builds the IPv4/TCP and IPv4/UDP datagrams written back to the tun
//! device. Headers always carry computed checksums; nothing here relies on
//! kernel checksum offload.

use std::net::Ipv4Addr;

use super::checksum::{internet_checksum, transport_checksum};
use super::codec::{ParsedPacket, Transport, IPPROTO_TCP, IPPROTO_UDP};

const IP_HEADER_LEN: usize = 20;
const TCP_HEADER_LEN: usize = 20;
const UDP_HEADER_LEN: usize = 8;
const TTL: u8 = 64;

fn push_ipv4_header(
    buf: &mut Vec<u8>,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    total_len: usize,
) {
    buf.push(0x45); // version 4, header length 5 words
    buf.push(0); // type of service
    buf.extend_from_slice(&(total_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // identification
    buf.extend_from_slice(&[0, 0]); // flags and fragment offset
    buf.push(TTL);
    buf.push(protocol);
    buf.extend_from_slice(&[0, 0]); // checksum, computed below
    buf.extend_from_slice(&src.octets());
    buf.extend_from_slice(&dst.octets());

    let sum = internet_checksum(&buf[..IP_HEADER_LEN]);
    buf[10..12].copy_from_slice(&sum.to_be_bytes());
}

/// Build a complete IPv4/TCP packet.
///
/// `seq`, `ack`, `flags`, and `window` are the tracker's responsibility;
/// this function only lays out bytes and computes both checksums.
pub fn build_tcp_packet(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    seq: u32,
    ack: u32,
    flags: u8,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IP_HEADER_LEN + TCP_HEADER_LEN + payload.len();
    let mut buf = Vec::with_capacity(total_len);

    push_ipv4_header(&mut buf, src.0, dst.0, IPPROTO_TCP, total_len);

    let tcp_start = buf.len();
    buf.extend_from_slice(&src.1.to_be_bytes());
    buf.extend_from_slice(&dst.1.to_be_bytes());
    buf.extend_from_slice(&seq.to_be_bytes());
    buf.extend_from_slice(&ack.to_be_bytes());
    buf.push((TCP_HEADER_LEN as u8 / 4) << 4); // data offset, no options
    buf.push(flags);
    buf.extend_from_slice(&window.to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum, computed below
    buf.extend_from_slice(&[0, 0]); // urgent pointer
    buf.extend_from_slice(payload);

    let sum = transport_checksum(src.0, dst.0, IPPROTO_TCP, &buf[tcp_start..]);
    buf[tcp_start + 16..tcp_start + 18].copy_from_slice(&sum.to_be_bytes());

    buf
}

/// Build a complete IPv4/UDP packet.
pub fn build_udp_packet(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let total_len = IP_HEADER_LEN + udp_len;
    let mut buf = Vec::with_capacity(total_len);

    push_ipv4_header(&mut buf, src.0, dst.0, IPPROTO_UDP, total_len);

    let udp_start = buf.len();
    buf.extend_from_slice(&src.1.to_be_bytes());
    buf.extend_from_slice(&dst.1.to_be_bytes());
    buf.extend_from_slice(&(udp_len as u16).to_be_bytes());
    buf.extend_from_slice(&[0, 0]); // checksum, computed below
    buf.extend_from_slice(payload);

    let mut sum = transport_checksum(src.0, dst.0, IPPROTO_UDP, &buf[udp_start..]);
    if sum == 0 {
        // RFC 768: a computed checksum of zero is transmitted as all ones
        sum = 0xFFFF;
    }
    buf[udp_start + 6..udp_start + 8].copy_from_slice(&sum.to_be_bytes());

    buf
}

/// Build the response to `original` with source and destination swapped.
///
/// For UDP flows this is the whole write path; TCP responses go through
/// `build_tcp_packet` because the tracker owns the sequence state.
pub fn build_udp_response(original: &ParsedPacket<'_>, payload: &[u8]) -> Option<Vec<u8>> {
    match original.transport {
        Transport::Udp(udp) => Some(build_udp_packet(
            (original.dst_ip, udp.dst_port),
            (original.src_ip, udp.src_port),
            payload,
        )),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::codec::{parse, tcp_flags};

    #[test]
    fn test_ip_header_checksum_verifies() {
        let bytes = build_udp_packet(
            (Ipv4Addr::new(10, 0, 0, 2), 1234),
            (Ipv4Addr::new(1, 1, 1, 1), 53),
            b"x",
        );
        // A header containing its own valid checksum sums to zero
        assert_eq!(internet_checksum(&bytes[..IP_HEADER_LEN]), 0);
    }

    #[test]
    fn test_tcp_checksum_verifies() {
        let src = (Ipv4Addr::new(10, 0, 0, 2), 50000);
        let dst = (Ipv4Addr::new(1, 2, 3, 4), 443);
        let bytes =
            build_tcp_packet(src, dst, 7, 9, tcp_flags::ACK, 65535, b"payload");

        let segment = &bytes[IP_HEADER_LEN..];
        assert_eq!(transport_checksum(src.0, dst.0, IPPROTO_TCP, segment), 0);
    }

    #[test]
    fn test_udp_response_swaps_endpoints() {
        let request = build_udp_packet(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(8, 8, 4, 4), 53),
            b"question",
        );
        let parsed = parse(&request).unwrap();

        let response = build_udp_response(&parsed, b"answer").unwrap();
        let parsed_response = parse(&response).unwrap();

        assert_eq!(parsed_response.src_ip, parsed.dst_ip);
        assert_eq!(parsed_response.dst_ip, parsed.src_ip);
        assert_eq!(parsed_response.src_port(), parsed.dst_port());
        assert_eq!(parsed_response.dst_port(), parsed.src_port());
        match parsed_response.transport {
            Transport::Udp(udp) => assert_eq!(udp.payload, b"answer"),
            _ => panic!("expected UDP"),
        }
    }

    #[test]
    fn test_udp_response_rejects_tcp_original() {
        let request = build_tcp_packet(
            (Ipv4Addr::new(10, 0, 0, 2), 40000),
            (Ipv4Addr::new(8, 8, 4, 4), 443),
            1,
            0,
            tcp_flags::SYN,
            65535,
            &[],
        );
        let parsed = parse(&request).unwrap();
        assert!(build_udp_response(&parsed, b"x").is_none());
    }
}
