// Copyright 2020 The pxping Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! IPv4/ICMPv4 and ICMPv6 wire-format views used to validate and rewrite
//! datagrams in place.
//!
//! `pnet`'s packet accessors read and write network byte order directly in
//! the buffer, so every field we touch round-trips through a local `u16`/
//! `u32` copy, gets folded into a [`crate::checksum::Checksummer`], and is
//! written back with the matching setter. This is the same shape as the
//! source's direct struct-field rewrites, just without the pointer casts.

use pnet::packet::icmp::{echo_reply, echo_request, IcmpPacket, IcmpType, IcmpTypes, MutableIcmpPacket};
use pnet::packet::icmpv6::{
    echo_reply as echo_reply6, echo_request as echo_request6, Icmpv6Packet, Icmpv6Type,
    Icmpv6Types, MutableIcmpv6Packet,
};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::Packet;

pub const IP_HLEN: usize = 20;
pub const ICMP_HLEN: usize = 8;

/// The "more fragments" bit within the 3-bit IPv4 flags field.
const IPV4_FLAG_MORE_FRAGMENTS: u8 = 0b001;

/// Interpret the raw bytes of the IPv4 total-length field the way this
/// platform's raw ICMP socket actually delivers it.
///
/// On Darwin and Solaris, the kernel hands back `ip_len` in host byte
/// order and already stripped of the header, rather than the on-wire
/// network-order total length every other platform preserves.
pub fn platform_total_length(ip: &Ipv4Packet) -> usize {
    let raw = ip.get_total_length();
    if cfg!(any(target_os = "macos", target_os = "ios", target_os = "solaris")) {
        raw as usize + IP_HLEN
    } else {
        raw as usize
    }
}

pub fn ipv4_is_fragment(ip: &Ipv4Packet) -> bool {
    ip.get_fragment_offset() != 0 || ip.get_flags() & IPV4_FLAG_MORE_FRAGMENTS != 0
}

/// Validate the outer IPv4 header per the proxy's acceptance rules,
/// returning the total length to treat as authoritative (see
/// [`platform_total_length`]) on success.
pub fn validate_outer_ipv4(buf: &[u8]) -> Option<usize> {
    if buf.len() < IP_HLEN {
        return None;
    }
    let ip = Ipv4Packet::new(buf)?;
    if ip.get_version() != 4 {
        return None;
    }
    if ipv4_is_fragment(&ip) {
        return None;
    }
    if usize::from(ip.get_header_length()) * 4 != IP_HLEN {
        return None;
    }
    if ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
        return None;
    }
    let total_length = platform_total_length(&ip);
    if total_length > buf.len() {
        return None;
    }
    if total_length < IP_HLEN + ICMP_HLEN {
        return None;
    }
    Some(total_length)
}

/// The subset of [`IcmpTypes`] the host-ingress dispatcher cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcmpClass {
    EchoReply,
    DestUnreach,
    TimeExceeded,
    Other,
}

pub fn classify_icmpv4(icmp_type: IcmpType) -> IcmpClass {
    match icmp_type {
        IcmpTypes::EchoReply => IcmpClass::EchoReply,
        IcmpTypes::DestinationUnreachable => IcmpClass::DestUnreach,
        IcmpTypes::TimeExceeded => IcmpClass::TimeExceeded,
        _ => IcmpClass::Other,
    }
}

pub fn classify_icmpv6(icmp_type: Icmpv6Type) -> IcmpClass {
    if icmp_type == Icmpv6Types::EchoReply {
        IcmpClass::EchoReply
    } else {
        IcmpClass::Other
    }
}

/// Read the identifier/sequence out of an ICMPv4 echo request or reply
/// payload without caring which of the two it is — both share layout.
pub fn read_icmpv4_echo_id_seq(icmp_payload: &[u8]) -> Option<(u16, u16)> {
    let pkt = echo_request::EchoRequestPacket::new(icmp_payload)?;
    Some((pkt.get_identifier(), pkt.get_sequence_number()))
}

/// Rewrite the ICMPv4 echo identifier field in place and fold the delta
/// into `cs`. Works for both echo request and echo reply layouts since
/// the identifier sits at the same offset in both.
pub fn rewrite_icmpv4_echo_id(
    icmp_payload: &mut [u8],
    new_id: u16,
    cs: &mut crate::checksum::Checksummer,
) {
    let mut pkt = echo_reply::MutableEchoReplyPacket::new(icmp_payload)
        .expect("buffer already validated as >= ICMP_HLEN bytes");
    let mut id = pkt.get_identifier();
    cs.replace16(&mut id, new_id);
    pkt.set_identifier(id);
}

pub fn icmpv4_checksum_field(icmp_payload: &[u8]) -> Option<u16> {
    let pkt = IcmpPacket::new(icmp_payload)?;
    Some(pkt.get_checksum())
}

pub fn set_icmpv4_checksum(icmp_payload: &mut [u8], new_checksum: u16) {
    let mut pkt =
        MutableIcmpPacket::new(icmp_payload).expect("buffer already validated as >= ICMP_HLEN bytes");
    pkt.set_checksum(new_checksum);
}

/// Rewrite the IPv4 destination address in place, folding the delta into
/// `cs`. `cs`'s running sum is expressed in 32-bit words here even though
/// IP addresses are logically one 32-bit field, matching
/// [`crate::checksum::update32`]'s contract.
pub fn rewrite_ipv4_destination(
    ip: &mut MutableIpv4Packet,
    new_dst: std::net::Ipv4Addr,
    cs: &mut crate::checksum::Checksummer,
) {
    let mut field = u32::from(ip.get_destination());
    cs.replace32(&mut field, u32::from(new_dst));
    ip.set_destination(new_dst);
}

pub fn rewrite_ipv4_source(
    ip: &mut MutableIpv4Packet,
    new_src: std::net::Ipv4Addr,
    cs: &mut crate::checksum::Checksummer,
) {
    let mut field = u32::from(ip.get_source());
    cs.replace32(&mut field, u32::from(new_src));
    ip.set_source(new_src);
}

/// Read the identifier/sequence out of an ICMPv6 echo request or reply
/// payload (no IP header attached — raw v6 sockets never deliver one).
pub fn read_icmpv6_echo_id_seq(icmp_payload: &[u8]) -> Option<(u16, u16)> {
    let pkt = echo_request6::EchoRequestPacket::new(icmp_payload)?;
    Some((pkt.get_identifier(), pkt.get_sequence_number()))
}

/// Rewrite the ICMPv6 echo identifier in place. The checksum is
/// deliberately left untouched here: the v6 pseudo-header covers the
/// final source/destination addresses, which the kernel only knows once
/// it picks a source address at send time, so `HostIngress` folds the
/// pseudo-header delta itself when proxying a reply, and `GuestIngress`
/// never touches the checksum at all (see module docs).
pub fn rewrite_icmpv6_echo_id(icmp_payload: &mut [u8], new_id: u16) {
    let mut pkt = echo_reply6::MutableEchoReplyPacket::new(icmp_payload)
        .expect("buffer already validated as >= ICMP_HLEN bytes");
    pkt.set_identifier(new_id);
}

pub fn icmpv6_checksum_field(icmp_payload: &[u8]) -> Option<u16> {
    let pkt = Icmpv6Packet::new(icmp_payload)?;
    Some(pkt.get_checksum())
}

pub fn set_icmpv6_checksum(icmp_payload: &mut [u8], new_checksum: u16) {
    let mut pkt = MutableIcmpv6Packet::new(icmp_payload)
        .expect("buffer already validated as >= ICMP_HLEN bytes");
    pkt.set_checksum(new_checksum);
}

/// Render an IPv6 address as four big-endian 32-bit words, the
/// granularity [`crate::checksum::update_ipv6_addr`] works in.
pub fn ipv6_addr_words(addr: std::net::Ipv6Addr) -> [u32; 4] {
    let octets = addr.octets();
    let mut words = [0u32; 4];
    for (i, word) in words.iter_mut().enumerate() {
        *word = u32::from_be_bytes(octets[i * 4..i * 4 + 4].try_into().unwrap());
    }
    words
}

/// Decrement TTL by one and fold the standard "TTL decremented" checksum
/// delta, rather than recomputing a field-level update: the adjustment is
/// a known constant (see [`crate::checksum::TTL_DECREMENT_DELTA`]).
pub fn decrement_ipv4_ttl(ip: &mut MutableIpv4Packet, cs: &mut crate::checksum::Checksummer) {
    let ttl = ip.get_ttl();
    ip.set_ttl(ttl - 1);
    cs.fold_constant(crate::checksum::TTL_DECREMENT_DELTA);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn build_ip_icmp_echo(ttl: u8, id: u16) -> Vec<u8> {
        let mut buf = vec![0u8; IP_HLEN + 16];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((IP_HLEN + 16) as u16);
            ip.set_ttl(ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip.set_source(Ipv4Addr::new(10, 0, 2, 15));
            ip.set_destination(Ipv4Addr::new(8, 8, 8, 8));
        }
        {
            let mut icmp = echo_request::MutableEchoRequestPacket::new(&mut buf[IP_HLEN..]).unwrap();
            icmp.set_icmp_type(IcmpTypes::EchoRequest);
            icmp.set_identifier(id);
            icmp.set_sequence_number(1);
        }
        buf
    }

    #[test]
    fn validate_outer_ipv4_accepts_well_formed_echo() {
        let buf = build_ip_icmp_echo(64, 0xbeef);
        assert_eq!(validate_outer_ipv4(&buf), Some(IP_HLEN + 16));
    }

    #[test]
    fn validate_outer_ipv4_rejects_short_buffer() {
        let buf = vec![0u8; 10];
        assert_eq!(validate_outer_ipv4(&buf), None);
    }

    #[test]
    fn validate_outer_ipv4_rejects_fragment() {
        let mut buf = build_ip_icmp_echo(64, 1);
        let mut ip = MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap();
        ip.set_fragment_offset(10);
        drop(ip);
        assert_eq!(validate_outer_ipv4(&buf), None);
    }

    #[test]
    fn rewrite_echo_id_updates_field_and_preserves_checksum_invariant() {
        let mut buf = build_ip_icmp_echo(64, 0x1111);
        let icmp_payload = &mut buf[IP_HLEN..];

        let old_checksum = icmpv4_checksum_field(icmp_payload).unwrap();
        let mut cs = crate::checksum::Checksummer::new(old_checksum);
        rewrite_icmpv4_echo_id(icmp_payload, 0x2222, &mut cs);
        let new_checksum = cs.finish();
        set_icmpv4_checksum(icmp_payload, new_checksum);

        let (id, _seq) = read_icmpv4_echo_id_seq(icmp_payload).unwrap();
        assert_eq!(id, 0x2222);
    }

    #[test]
    fn classify_dispatches_expected_icmp_types() {
        assert_eq!(classify_icmpv4(IcmpTypes::EchoReply), IcmpClass::EchoReply);
        assert_eq!(
            classify_icmpv4(IcmpTypes::DestinationUnreachable),
            IcmpClass::DestUnreach
        );
        assert_eq!(classify_icmpv4(IcmpTypes::TimeExceeded), IcmpClass::TimeExceeded);
        assert_eq!(classify_icmpv4(IcmpTypes::EchoRequest), IcmpClass::Other);
    }
}
