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

//! Host → guest direction: ICMP traffic arriving on the host's raw
//! sockets is matched against the PCB table and, on a hit, rewritten and
//! forwarded to the guest. Runs on the poll-manager thread: the PCB table
//! lock is held only long enough to snapshot what's needed, per the
//! module's concurrency design.

use std::net::Ipv6Addr;
use std::sync::Mutex;

use log::{debug, trace, warn};
use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::icmpv6::Icmpv6Types;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};
use pnet::packet::Packet;

use crate::addr::{Family, PxAddr};
use crate::checksum::Checksummer;
use crate::pcb::PcbTable;
use crate::post::CrossThreadPost;
use crate::remap::{RemapOutcome, Remapper};
use crate::socket::Icmpv6Ancillary;
use crate::wire::{self, IcmpClass, ICMP_HLEN, IP_HLEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostOutcome {
    Forwarded,
    Ignored,
    DroppedMalformed,
    DroppedRemapFailed,
    DroppedNoPcb,
}

pub struct HostIngress<'a> {
    remapper: &'a dyn Remapper,
}

impl<'a> HostIngress<'a> {
    pub fn new(remapper: &'a dyn Remapper) -> Self {
        HostIngress { remapper }
    }

    /// `datagram` holds exactly what the raw IPv4 socket delivered;
    /// `read_len` is the number of valid bytes (the buffer itself may be
    /// larger, reused across calls).
    pub fn handle_v4(
        &self,
        pcbs: &Mutex<PcbTable>,
        post: &CrossThreadPost,
        datagram: &mut [u8],
        read_len: usize,
    ) -> HostOutcome {
        let buf = &mut datagram[..read_len];

        let ip_ttl = match Ipv4Packet::new(buf) {
            Some(ip) => ip.get_ttl(),
            None => return HostOutcome::DroppedMalformed,
        };
        if ip_ttl == 1 {
            // The host stack's own "ttl expired" chatter; not useful to us.
            return HostOutcome::Ignored;
        }

        let total_length = match wire::validate_outer_ipv4(buf) {
            Some(len) => len,
            None => return HostOutcome::DroppedMalformed,
        };
        let buf = &mut buf[..total_length];

        let icmp_type = match IcmpPacket::new(&buf[IP_HLEN..]) {
            Some(pkt) => pkt.get_icmp_type(),
            None => return HostOutcome::DroppedMalformed,
        };

        match wire::classify_icmpv4(icmp_type) {
            IcmpClass::EchoReply => self.handle_echo4(pcbs, post, buf),
            IcmpClass::DestUnreach | IcmpClass::TimeExceeded => self.handle_error4(pcbs, post, buf),
            _ => HostOutcome::Ignored,
        }
    }

    fn handle_echo4(&self, pcbs: &Mutex<PcbTable>, post: &CrossThreadPost, buf: &mut [u8]) -> HostOutcome {
        let target_ip = match Ipv4Packet::new(buf) {
            Some(ip) => ip.get_source(),
            None => return HostOutcome::DroppedMalformed,
        };

        let (unmapped_target_ip, is_mapped) = match self.remapper.inbound_v4(target_ip) {
            RemapOutcome::Mapped(addr) => (addr.as_v4().unwrap_or(target_ip), true),
            RemapOutcome::AsIs(addr) => (addr.as_v4().unwrap_or(target_ip), false),
            RemapOutcome::Failed => {
                debug!("inbound_v4({target_ip}): remap failed");
                return HostOutcome::DroppedRemapFailed;
            }
        };

        let (id, _seq) = match wire::read_icmpv4_echo_id_seq(&buf[IP_HLEN..]) {
            Some(v) => v,
            None => return HostOutcome::DroppedMalformed,
        };

        let (guest_ip, guest_id) = {
            let table = pcbs.lock().unwrap();
            match table.lookup_for_reply(Family::V4, PxAddr::V4(unmapped_target_ip), id) {
                Some(h) => {
                    let pcb = table.pcb(h);
                    (pcb.src.as_v4(), pcb.guest_id)
                }
                None => {
                    trace!("icmp4 echo reply from {target_ip} id={id:#x}: no pcb");
                    return HostOutcome::DroppedNoPcb;
                }
            }
        };
        let guest_ip = match guest_ip {
            Some(addr) => addr,
            None => return HostOutcome::DroppedMalformed,
        };

        let (ip_part, icmp_part) = buf.split_at_mut(IP_HLEN);

        let old_icmp_checksum = wire::icmpv4_checksum_field(icmp_part).unwrap();
        let mut icmp_cs = Checksummer::new(old_icmp_checksum);
        wire::rewrite_icmpv4_echo_id(icmp_part, guest_id, &mut icmp_cs);
        wire::set_icmpv4_checksum(icmp_part, icmp_cs.finish());

        let mut ip = MutableIpv4Packet::new(ip_part).expect("already validated");
        let old_ip_checksum = ip.get_checksum();
        let mut ip_cs = Checksummer::new(old_ip_checksum);
        wire::rewrite_ipv4_destination(&mut ip, guest_ip, &mut ip_cs);
        if is_mapped {
            wire::rewrite_ipv4_source(&mut ip, unmapped_target_ip, &mut ip_cs);
        } else {
            wire::decrement_ipv4_ttl(&mut ip, &mut ip_cs);
        }
        ip.set_checksum(ip_cs.finish());

        post.forward_inbound_v4(buf.to_vec());
        HostOutcome::Forwarded
    }

    /// Preserves two known limitations of the original implementation
    /// rather than silently fixing them: when the flow is mapped, the
    /// outer IP source is left as the (mapped) replying address instead
    /// of being rewritten to the unmapped target, and the inner embedded
    /// datagram's destination is never rewritten either way.
    fn handle_error4(&self, pcbs: &Mutex<PcbTable>, post: &CrossThreadPost, buf: &mut [u8]) -> HostOutcome {
        let outer_read_len = buf.len();
        let inner_off = IP_HLEN + ICMP_HLEN;
        if outer_read_len < inner_off + IP_HLEN {
            return HostOutcome::DroppedMalformed;
        }
        let inner_len = outer_read_len - inner_off;

        let (inner_dest, inner_header_len) = match Ipv4Packet::new(&buf[inner_off..]) {
            Some(inner_ip) => {
                if inner_ip.get_version() != 4 {
                    return HostOutcome::DroppedMalformed;
                }
                if wire::ipv4_is_fragment(&inner_ip) {
                    return HostOutcome::DroppedMalformed;
                }
                if inner_ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp {
                    return HostOutcome::Ignored;
                }
                (inner_ip.get_destination(), usize::from(inner_ip.get_header_length()) * 4)
            }
            None => return HostOutcome::DroppedMalformed,
        };
        if inner_len < inner_header_len + ICMP_HLEN {
            return HostOutcome::DroppedMalformed;
        }

        let inner_icmp_off = inner_off + inner_header_len;
        let inner_icmp_type = match IcmpPacket::new(&buf[inner_icmp_off..]) {
            Some(pkt) => pkt.get_icmp_type(),
            None => return HostOutcome::DroppedMalformed,
        };
        if inner_icmp_type != IcmpTypes::EchoRequest {
            return HostOutcome::Ignored;
        }

        let (id, _seq) = match wire::read_icmpv4_echo_id_seq(&buf[inner_icmp_off..]) {
            Some(v) => v,
            None => return HostOutcome::DroppedMalformed,
        };

        let (is_mapped, pcb_src, guest_id) = {
            let table = pcbs.lock().unwrap();
            match table.lookup_for_reply(Family::V4, PxAddr::V4(inner_dest), id) {
                Some(h) => {
                    let pcb = table.pcb(h);
                    (pcb.is_mapped, pcb.src.as_v4(), pcb.guest_id)
                }
                None => return HostOutcome::DroppedNoPcb,
            }
        };
        let pcb_src = match pcb_src {
            Some(addr) => addr,
            None => return HostOutcome::DroppedMalformed,
        };

        // Outer ICMP error checksum is left untouched: it covers the
        // error header and the embedded payload, and every inner/outer
        // rewrite below is folded into the header-local checksum it
        // actually belongs to, never into this one.

        {
            let inner_icmp = &mut buf[inner_icmp_off..];
            let old = wire::icmpv4_checksum_field(inner_icmp).unwrap();
            let mut cs = Checksummer::new(old);
            wire::rewrite_icmpv4_echo_id(inner_icmp, guest_id, &mut cs);
            wire::set_icmpv4_checksum(inner_icmp, cs.finish());
        }

        {
            let mut inner_ip = MutableIpv4Packet::new(&mut buf[inner_off..inner_off + inner_header_len])
                .expect("already validated");
            let old = inner_ip.get_checksum();
            let mut cs = Checksummer::new(old);
            wire::rewrite_ipv4_source(&mut inner_ip, pcb_src, &mut cs);
            inner_ip.set_checksum(cs.finish());
        }

        {
            let mut outer_ip = MutableIpv4Packet::new(&mut buf[..IP_HLEN]).expect("already validated");
            let old = outer_ip.get_checksum();
            let mut cs = Checksummer::new(old);
            wire::rewrite_ipv4_destination(&mut outer_ip, pcb_src, &mut cs);
            if !is_mapped {
                wire::decrement_ipv4_ttl(&mut outer_ip, &mut cs);
            }
            outer_ip.set_checksum(cs.finish());
        }

        post.forward_inbound_v4(buf.to_vec());
        HostOutcome::Forwarded
    }

    /// `reported_src` is the peer address the kernel reported via
    /// `recvfrom`/`recvmsg`; `default_hop_limit` is used when the socket
    /// didn't report one via ancillary data.
    pub fn handle_echo6(
        &self,
        pcbs: &Mutex<PcbTable>,
        post: &CrossThreadPost,
        icmp_payload: &mut [u8],
        reported_src: Ipv6Addr,
        ancillary: Icmpv6Ancillary,
        default_hop_limit: u8,
    ) -> HostOutcome {
        let pktinfo_dst = match ancillary.dst {
            Some(dst) => dst,
            None => {
                debug!("icmpv6 echo reply from {reported_src}: no pktinfo, can't recompute checksum");
                return HostOutcome::DroppedMalformed;
            }
        };

        let icmp_type = match pnet::packet::icmpv6::Icmpv6Packet::new(icmp_payload) {
            Some(pkt) => pkt.get_icmpv6_type(),
            None => return HostOutcome::DroppedMalformed,
        };
        if wire::classify_icmpv6(icmp_type) != IcmpClass::EchoReply {
            if icmp_type != Icmpv6Types::EchoRequest {
                debug!("icmpv6 type {:?} from {reported_src}: error proxying not implemented", icmp_type);
            }
            return HostOutcome::Ignored;
        }

        let (unmapped_target, is_mapped) = match self.remapper.inbound_v6(reported_src) {
            RemapOutcome::Mapped(addr) => (addr.as_v6().unwrap_or(reported_src), true),
            RemapOutcome::AsIs(addr) => (addr.as_v6().unwrap_or(reported_src), false),
            RemapOutcome::Failed => return HostOutcome::DroppedRemapFailed,
        };

        let (id, _seq) = match wire::read_icmpv6_echo_id_seq(icmp_payload) {
            Some(v) => v,
            None => return HostOutcome::DroppedMalformed,
        };

        let (guest_ip, guest_id) = {
            let table = pcbs.lock().unwrap();
            match table.lookup_for_reply(Family::V6, PxAddr::V6(unmapped_target), id) {
                Some(h) => {
                    let pcb = table.pcb(h);
                    (pcb.src.as_v6(), pcb.guest_id)
                }
                None => return HostOutcome::DroppedNoPcb,
            }
        };
        let guest_ip = match guest_ip {
            Some(addr) => addr,
            None => return HostOutcome::DroppedMalformed,
        };

        let old_checksum = wire::icmpv6_checksum_field(icmp_payload).unwrap();
        let mut cs = Checksummer::new(old_checksum);

        let mut id_field = id;
        cs.replace16(&mut id_field, guest_id);

        let mut dst_words = wire::ipv6_addr_words(pktinfo_dst);
        let delta = crate::checksum::update_ipv6_addr(&mut dst_words, &wire::ipv6_addr_words(guest_ip));
        cs.fold_constant(delta);

        if is_mapped {
            let mut src_words = wire::ipv6_addr_words(reported_src);
            let delta = crate::checksum::update_ipv6_addr(&mut src_words, &wire::ipv6_addr_words(unmapped_target));
            cs.fold_constant(delta);
        }

        wire::rewrite_icmpv6_echo_id(icmp_payload, guest_id);
        wire::set_icmpv6_checksum(icmp_payload, cs.finish());

        let hop_limit = match ancillary.hop_limit {
            None => default_hop_limit,
            Some(1) if !is_mapped => {
                debug!("icmpv6 echo reply from {reported_src}: hop limit exhausted");
                return HostOutcome::Ignored;
            }
            Some(h) if !is_mapped => h - 1,
            Some(h) => h,
        };

        post.forward_inbound_v6(
            icmp_payload.to_vec(),
            unmapped_target,
            guest_ip,
            hop_limit,
            0,
        );
        HostOutcome::Forwarded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    use pnet::packet::icmp::echo_reply::MutableEchoReplyPacket;
    use pnet::packet::icmp::echo_request::MutableEchoRequestPacket;
    use pnet::packet::icmp::{self as icmp_mod, MutableIcmpPacket};
    use pnet::packet::icmpv6::{self as icmpv6_mod, echo_reply::MutableEchoReplyPacket as MutableEchoReplyPacket6};
    use pnet::packet::icmpv6::MutableIcmpv6Packet as MutableIcmpv6Packet6;

    use crate::addr::Family;
    use crate::netif::RecordingNetif;
    use crate::post;
    use crate::remap::NullRemapper;

    /// Remaps one specific host-visible address to a virtual guest-visible
    /// one inbound; everything else passes through, matching the shape of
    /// a real `pxremap` table entry for a single mapped target.
    struct OneShotRemapper {
        from: Ipv4Addr,
        to: Ipv4Addr,
    }

    impl Remapper for OneShotRemapper {
        fn inbound_v4(&self, external_src: Ipv4Addr) -> RemapOutcome {
            if external_src == self.from {
                RemapOutcome::Mapped(PxAddr::V4(self.to))
            } else {
                RemapOutcome::AsIs(PxAddr::V4(external_src))
            }
        }
        fn inbound_v6(&self, external_src: Ipv6Addr) -> RemapOutcome {
            RemapOutcome::AsIs(PxAddr::V6(external_src))
        }
        fn outbound_v4(&self, guest_dst: Ipv4Addr) -> RemapOutcome {
            RemapOutcome::AsIs(PxAddr::V4(guest_dst))
        }
        fn outbound_v6(&self, guest_dst: Ipv6Addr) -> RemapOutcome {
            RemapOutcome::AsIs(PxAddr::V6(guest_dst))
        }
    }

    fn build_echo_reply_v4(ttl: u8, src: Ipv4Addr, dst: Ipv4Addr, id: u16, seq: u16) -> Vec<u8> {
        let total_len = IP_HLEN + ICMP_HLEN;
        let mut buf = vec![0u8; total_len];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(total_len as u16);
            ip.set_ttl(ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        {
            let mut icmp = MutableEchoReplyPacket::new(&mut buf[IP_HLEN..]).unwrap();
            icmp.set_icmp_type(IcmpTypes::EchoReply);
            icmp.set_identifier(id);
            icmp.set_sequence_number(seq);
        }
        fixup_checksums(&mut buf);
        buf
    }

    fn fixup_checksums(buf: &mut [u8]) {
        let icmp_cs = icmp_mod::checksum(&icmp_mod::IcmpPacket::new(&buf[IP_HLEN..]).unwrap());
        MutableIcmpPacket::new(&mut buf[IP_HLEN..]).unwrap().set_checksum(icmp_cs);
        let ip_cs = pnet::packet::ipv4::checksum(&Ipv4Packet::new(&buf[..IP_HLEN]).unwrap());
        MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap().set_checksum(ip_cs);
    }

    fn ip_checksum_is_valid(buf: &[u8]) -> bool {
        let ip = Ipv4Packet::new(&buf[..IP_HLEN]).unwrap();
        pnet::packet::ipv4::checksum(&ip) == ip.get_checksum()
    }

    fn icmp_checksum_is_valid(buf: &[u8]) -> bool {
        let icmp = icmp_mod::IcmpPacket::new(&buf[IP_HLEN..]).unwrap();
        icmp_mod::checksum(&icmp) == icmp.get_checksum()
    }

    #[test]
    fn echo_reply_forwards_with_rewritten_identity_and_valid_checksums() {
        let guest_src = Ipv4Addr::new(10, 0, 2, 15);
        let target = Ipv4Addr::new(8, 8, 8, 8);

        let pcbs = Mutex::new(PcbTable::new());
        let host_id = {
            let mut table = pcbs.lock().unwrap();
            let remapper = NullRemapper;
            let h = table
                .lookup_or_create_for_request(
                    &remapper,
                    0,
                    Family::V4,
                    PxAddr::V4(guest_src),
                    PxAddr::V4(target),
                    0xbeef,
                )
                .unwrap();
            table.pcb(h).host_id
        };

        let mut datagram = build_echo_reply_v4(50, target, Ipv4Addr::new(10, 0, 2, 2), host_id, 1);

        let remapper = NullRemapper;
        let ingress = HostIngress::new(&remapper);
        let (post, mailbox) = post::channel();
        let read_len = datagram.len();
        let outcome = ingress.handle_v4(&pcbs, &post, &mut datagram, read_len);
        assert_eq!(outcome, HostOutcome::Forwarded);

        assert!(ip_checksum_is_valid(&datagram));
        assert!(icmp_checksum_is_valid(&datagram));

        let ip = Ipv4Packet::new(&datagram[..IP_HLEN]).unwrap();
        assert_eq!(ip.get_destination(), guest_src);
        assert_eq!(ip.get_source(), target);
        assert_eq!(ip.get_ttl(), 49, "unmapped flow decrements TTL by one");

        let (id, seq) = wire::read_icmpv4_echo_id_seq(&datagram[IP_HLEN..]).unwrap();
        assert_eq!(id, 0xbeef);
        assert_eq!(seq, 1);

        let netif = RecordingNetif::default();
        mailbox.drain_inbound(&netif);
        assert_eq!(netif.v4_raw.lock().unwrap().len(), 1);
    }

    #[test]
    fn mapped_echo_reply_rewrites_source_instead_of_decrementing_ttl() {
        let guest_src = Ipv4Addr::new(10, 0, 2, 15);
        let virtual_dst = Ipv4Addr::new(192, 168, 1, 1);
        let physical_target = Ipv4Addr::new(203, 0, 113, 9);

        let pcbs = Mutex::new(PcbTable::new());
        let create_remapper = NullRemapper;
        let host_id = {
            let mut table = pcbs.lock().unwrap();
            let h = table
                .lookup_or_create_for_request(
                    &create_remapper,
                    0,
                    Family::V4,
                    PxAddr::V4(guest_src),
                    PxAddr::V4(virtual_dst),
                    0xcafe,
                )
                .unwrap();
            table.pcb(h).host_id
        };

        let mut datagram = build_echo_reply_v4(60, physical_target, Ipv4Addr::new(10, 0, 2, 2), host_id, 7);

        let inbound_remapper = OneShotRemapper {
            from: physical_target,
            to: virtual_dst,
        };
        let ingress = HostIngress::new(&inbound_remapper);
        let (post, mailbox) = post::channel();
        let read_len = datagram.len();
        let outcome = ingress.handle_v4(&pcbs, &post, &mut datagram, read_len);
        assert_eq!(outcome, HostOutcome::Forwarded);

        assert!(ip_checksum_is_valid(&datagram));
        let ip = Ipv4Packet::new(&datagram[..IP_HLEN]).unwrap();
        assert_eq!(ip.get_destination(), guest_src);
        assert_eq!(ip.get_source(), virtual_dst, "mapped flow rewrites source back to the virtual address");
        assert_eq!(ip.get_ttl(), 60, "mapped flow does not decrement TTL");

        let netif = RecordingNetif::default();
        mailbox.drain_inbound(&netif);
        assert_eq!(netif.v4_raw.lock().unwrap().len(), 1);
    }

    #[test]
    fn echo_reply_with_no_matching_pcb_is_dropped() {
        let pcbs = Mutex::new(PcbTable::new());
        let remapper = NullRemapper;
        let ingress = HostIngress::new(&remapper);
        let (post, _mailbox) = post::channel();

        let mut datagram = build_echo_reply_v4(
            50,
            Ipv4Addr::new(8, 8, 8, 8),
            Ipv4Addr::new(10, 0, 2, 2),
            0x1234,
            1,
        );
        let read_len = datagram.len();
        let outcome = ingress.handle_v4(&pcbs, &post, &mut datagram, read_len);
        assert_eq!(outcome, HostOutcome::DroppedNoPcb);
    }

    fn build_time_exceeded_v4(outer_ttl: u8, inner_src: Ipv4Addr, inner_dst: Ipv4Addr, id: u16) -> Vec<u8> {
        let inner_total = IP_HLEN + ICMP_HLEN;
        let total_len = IP_HLEN + ICMP_HLEN + inner_total;
        let mut buf = vec![0u8; total_len];
        {
            let mut ip = MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap();
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length(total_len as u16);
            ip.set_ttl(outer_ttl);
            ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            ip.set_source(Ipv4Addr::new(203, 0, 113, 1));
            ip.set_destination(Ipv4Addr::new(10, 0, 2, 2));
        }
        {
            let mut icmp = MutableIcmpPacket::new(&mut buf[IP_HLEN..IP_HLEN + ICMP_HLEN]).unwrap();
            icmp.set_icmp_type(IcmpTypes::TimeExceeded);
        }
        let inner_off = IP_HLEN + ICMP_HLEN;
        {
            let mut inner_ip = MutableIpv4Packet::new(&mut buf[inner_off..inner_off + IP_HLEN]).unwrap();
            inner_ip.set_version(4);
            inner_ip.set_header_length(5);
            inner_ip.set_total_length(inner_total as u16);
            inner_ip.set_ttl(1);
            inner_ip.set_next_level_protocol(IpNextHeaderProtocols::Icmp);
            inner_ip.set_source(inner_src);
            inner_ip.set_destination(inner_dst);
        }
        let inner_icmp_off = inner_off + IP_HLEN;
        {
            let mut inner_icmp = MutableEchoRequestPacket::new(&mut buf[inner_icmp_off..]).unwrap();
            inner_icmp.set_icmp_type(IcmpTypes::EchoRequest);
            inner_icmp.set_identifier(id);
            inner_icmp.set_sequence_number(3);
        }
        {
            let icmp_cs =
                icmp_mod::checksum(&icmp_mod::IcmpPacket::new(&buf[inner_icmp_off..]).unwrap());
            MutableIcmpPacket::new(&mut buf[inner_icmp_off..]).unwrap().set_checksum(icmp_cs);
        }
        {
            let ip_cs =
                pnet::packet::ipv4::checksum(&Ipv4Packet::new(&buf[inner_off..inner_off + IP_HLEN]).unwrap());
            MutableIpv4Packet::new(&mut buf[inner_off..inner_off + IP_HLEN])
                .unwrap()
                .set_checksum(ip_cs);
        }
        {
            let ip_cs = pnet::packet::ipv4::checksum(&Ipv4Packet::new(&buf[..IP_HLEN]).unwrap());
            MutableIpv4Packet::new(&mut buf[..IP_HLEN]).unwrap().set_checksum(ip_cs);
        }
        buf
    }

    #[test]
    fn time_exceeded_rewrites_inner_and_outer_for_unmapped_flow() {
        let guest_src = Ipv4Addr::new(10, 0, 2, 15);
        let target = Ipv4Addr::new(203, 0, 113, 5);

        let pcbs = Mutex::new(PcbTable::new());
        let remapper = NullRemapper;
        let host_id = {
            let mut table = pcbs.lock().unwrap();
            let h = table
                .lookup_or_create_for_request(
                    &remapper,
                    0,
                    Family::V4,
                    PxAddr::V4(guest_src),
                    PxAddr::V4(target),
                    0x9999,
                )
                .unwrap();
            table.pcb(h).host_id
        };

        // Inner datagram is the one the host sent on the guest's behalf:
        // source is whatever the host socket used, destination is the
        // target the router couldn't reach.
        let mut datagram =
            build_time_exceeded_v4(100, Ipv4Addr::new(192, 0, 2, 1), target, host_id);

        let ingress = HostIngress::new(&remapper);
        let (post, mailbox) = post::channel();
        let read_len = datagram.len();
        let outcome = ingress.handle_v4(&pcbs, &post, &mut datagram, read_len);
        assert_eq!(outcome, HostOutcome::Forwarded);

        let outer_ip = Ipv4Packet::new(&datagram[..IP_HLEN]).unwrap();
        assert_eq!(outer_ip.get_destination(), guest_src);
        assert_eq!(outer_ip.get_ttl(), 99, "unmapped flow decrements the outer TTL too");
        assert!(ip_checksum_is_valid(&datagram[..IP_HLEN]));

        let inner_off = IP_HLEN + ICMP_HLEN;
        let inner_ip = Ipv4Packet::new(&datagram[inner_off..inner_off + IP_HLEN]).unwrap();
        assert_eq!(
            inner_ip.get_source(),
            guest_src,
            "inner datagram's source is rewritten to the guest's own address"
        );
        assert!(ip_checksum_is_valid(&datagram[inner_off..inner_off + IP_HLEN]));

        let inner_icmp_off = inner_off + IP_HLEN;
        let (id, _seq) = wire::read_icmpv4_echo_id_seq(&datagram[inner_icmp_off..]).unwrap();
        assert_eq!(id, 0x9999, "inner echo id rewritten back to the guest's own id");
        assert!(icmp_checksum_is_valid(&datagram[inner_off..]));

        let netif = RecordingNetif::default();
        mailbox.drain_inbound(&netif);
        assert_eq!(netif.v4_raw.lock().unwrap().len(), 1);
    }

    fn build_echo_reply_v6_payload(id: u16, seq: u16, src: Ipv6Addr, dst: Ipv6Addr) -> Vec<u8> {
        let mut buf = vec![0u8; ICMP_HLEN];
        {
            let mut icmp = MutableEchoReplyPacket6::new(&mut buf).unwrap();
            icmp.set_icmpv6_type(Icmpv6Types::EchoReply);
            icmp.set_identifier(id);
            icmp.set_sequence_number(seq);
        }
        let cs = icmpv6_mod::checksum(&icmpv6_mod::Icmpv6Packet::new(&buf).unwrap(), &src, &dst);
        MutableIcmpv6Packet6::new(&mut buf).unwrap().set_checksum(cs);
        buf
    }

    #[test]
    fn echo_reply_v6_forwards_with_rewritten_identity() {
        let guest_src = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 2);
        let target = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1);
        let pktinfo_dst = Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, 0, 1);

        let pcbs = Mutex::new(PcbTable::new());
        let remapper = NullRemapper;
        let host_id = {
            let mut table = pcbs.lock().unwrap();
            let h = table
                .lookup_or_create_for_request(
                    &remapper,
                    0,
                    Family::V6,
                    PxAddr::V6(guest_src),
                    PxAddr::V6(target),
                    0x4242,
                )
                .unwrap();
            table.pcb(h).host_id
        };

        let mut payload = build_echo_reply_v6_payload(host_id, 5, target, pktinfo_dst);

        let ingress = HostIngress::new(&remapper);
        let (post, mailbox) = post::channel();
        let ancillary = Icmpv6Ancillary {
            dst: Some(pktinfo_dst),
            hop_limit: Some(58),
        };
        let outcome = ingress.handle_echo6(&pcbs, &post, &mut payload, target, ancillary, 64);
        assert_eq!(outcome, HostOutcome::Forwarded);

        let (id, seq) = wire::read_icmpv6_echo_id_seq(&payload).unwrap();
        assert_eq!(id, 0x4242);
        assert_eq!(seq, 5);

        let netif = RecordingNetif::default();
        mailbox.drain_inbound(&netif);
        let forwarded = netif.v6.lock().unwrap();
        assert_eq!(forwarded.len(), 1);
        let (_payload, src, dst, hop_limit, _tclass) = &forwarded[0];
        assert_eq!(*src, target);
        assert_eq!(*dst, guest_src);
        assert_eq!(*hop_limit, 57, "unmapped flow decrements the reported hop limit by one");
    }

    #[test]
    fn echo6_ignores_anything_but_echo_reply() {
        let pcbs = Mutex::new(PcbTable::new());
        let remapper = NullRemapper;
        let ingress = HostIngress::new(&remapper);
        let (post, _mailbox) = post::channel();

        let mut payload = vec![0u8; ICMP_HLEN];
        {
            let mut icmp = MutableIcmpv6Packet6::new(&mut payload).unwrap();
            icmp.set_icmpv6_type(Icmpv6Types::DestinationUnreachable);
        }
        let ancillary = Icmpv6Ancillary {
            dst: Some(Ipv6Addr::UNSPECIFIED),
            hop_limit: Some(64),
        };
        let outcome = ingress.handle_echo6(&pcbs, &post, &mut payload, Ipv6Addr::UNSPECIFIED, ancillary, 64);
        assert_eq!(
            outcome,
            HostOutcome::Ignored,
            "icmpv6 error proxying is not implemented, matching the source's empty icmp6_error"
        );
    }
}
