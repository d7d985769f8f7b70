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

//! Guest → host direction: an ICMP echo request leaving the guest gets
//! its identifier swapped for a host-chosen one and is handed to the raw
//! socket. Runs entirely on the TCP/IP task, so `PcbTable` is taken by
//! plain `&mut` reference here rather than through the shared mutex.

use std::net::Ipv6Addr;

use log::{debug, trace, warn};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::{Ipv4Packet, MutableIpv4Packet};

use crate::addr::{Family, PxAddr};
use crate::checksum::Checksummer;
use crate::netif::Netif;
use crate::pcb::PcbTable;
use crate::remap::Remapper;
use crate::socket::{RawIcmpV4Socket, RawIcmpV6Socket};
use crate::wire;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestOutcome {
    Forwarded,
    TimeExceededSent,
    DroppedMalformed,
    DroppedNoPcb,
    DroppedSendError,
}

pub struct GuestIngress<'a> {
    remapper: &'a dyn Remapper,
    netif: &'a dyn Netif,
}

impl<'a> GuestIngress<'a> {
    pub fn new(remapper: &'a dyn Remapper, netif: &'a dyn Netif) -> Self {
        GuestIngress { remapper, netif }
    }

    /// `datagram` is a complete IPv4 datagram (header included) that the
    /// guest's stack is routing out; it is mutated in place and then
    /// handed to `sock` unless this returns early.
    pub fn handle_request_v4(
        &self,
        table: &mut PcbTable,
        sock: &mut RawIcmpV4Socket,
        datagram: &mut [u8],
    ) -> GuestOutcome {
        let (src, dst, ttl, tos, header_len) = match Ipv4Packet::new(datagram) {
            Some(ip) => {
                let tos = (ip.get_dscp() << 2) | ip.get_ecn();
                (
                    ip.get_source(),
                    ip.get_destination(),
                    ip.get_ttl(),
                    tos,
                    usize::from(ip.get_header_length()) * 4,
                )
            }
            None => return GuestOutcome::DroppedMalformed,
        };

        let guest_id = match wire::read_icmpv4_echo_id_seq(&datagram[header_len..]) {
            Some((id, _seq)) => id,
            None => return GuestOutcome::DroppedMalformed,
        };

        let current_slot = table.current_slot();
        let handle = match table.lookup_or_create_for_request(
            self.remapper,
            current_slot,
            Family::V4,
            PxAddr::V4(src),
            PxAddr::V4(dst),
            guest_id,
        ) {
            Some(h) => h,
            None => {
                debug!("guest v4 echo {src} -> {dst} id={guest_id:#x}: no pcb (table full or remap failed)");
                return GuestOutcome::DroppedNoPcb;
            }
        };
        let pcb = table.pcb(handle).clone();

        if !pcb.is_mapped && ttl <= 1 {
            if let Err(err) = self.netif.send_icmp_time_exceeded_v4(datagram) {
                warn!("send_icmp_time_exceeded_v4: {err}");
            }
            return GuestOutcome::TimeExceededSent;
        }

        let outgoing_ttl = if pcb.is_mapped { ttl } else { ttl.saturating_sub(1) };

        let (ip_part, icmp_part) = datagram.split_at_mut(header_len);
        if !pcb.is_mapped {
            let mut ipm = MutableIpv4Packet::new(ip_part).expect("already validated");
            ipm.set_ttl(outgoing_ttl);
        }

        match wire::icmpv4_checksum_field(icmp_part) {
            Some(old_checksum) => {
                let mut cs = Checksummer::new(old_checksum);
                wire::rewrite_icmpv4_echo_id(icmp_part, pcb.host_id, &mut cs);
                wire::set_icmpv4_checksum(icmp_part, cs.finish());
            }
            None => return GuestOutcome::DroppedMalformed,
        }

        if let Err(err) = sock.set_ttl_if_changed(outgoing_ttl) {
            warn!("{err}");
        }
        if let Err(err) = sock.set_tos_if_changed(tos) {
            warn!("{err}");
        }

        match sock.send_to(icmp_part, pcb.peer) {
            Ok(()) => {
                trace!("guest v4 echo id={guest_id:#x} -> host_id={:#x} peer={}", pcb.host_id, pcb.peer);
                GuestOutcome::Forwarded
            }
            Err(err) => {
                warn!("{err}");
                GuestOutcome::DroppedSendError
            }
        }
    }

    /// `icmp_payload` is the bare ICMPv6 echo request (no IP header); the
    /// guest stack supplies `src`/`dst`/`hop_limit` out of band since v6
    /// datagrams aren't handed around as raw bytes the way v4 ones are.
    pub fn handle_request_v6(
        &self,
        table: &mut PcbTable,
        sock: &mut RawIcmpV6Socket,
        icmp_payload: &mut [u8],
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
    ) -> GuestOutcome {
        let guest_id = match wire::read_icmpv6_echo_id_seq(icmp_payload) {
            Some((id, _seq)) => id,
            None => return GuestOutcome::DroppedMalformed,
        };

        let current_slot = table.current_slot();
        let handle = match table.lookup_or_create_for_request(
            self.remapper,
            current_slot,
            Family::V6,
            PxAddr::V6(src),
            PxAddr::V6(dst),
            guest_id,
        ) {
            Some(h) => h,
            None => return GuestOutcome::DroppedNoPcb,
        };
        let pcb = table.pcb(handle).clone();

        if !pcb.is_mapped && hop_limit <= 1 {
            if let Err(err) = self.netif.send_icmpv6_time_exceeded(icmp_payload) {
                warn!("send_icmpv6_time_exceeded: {err}");
            }
            return GuestOutcome::TimeExceededSent;
        }

        let outgoing_hops = if pcb.is_mapped { hop_limit } else { hop_limit.saturating_sub(1) };

        // No checksum fixup here: the pseudo-header covers the final
        // source address, which only the kernel knows at send time.
        wire::rewrite_icmpv6_echo_id(icmp_payload, pcb.host_id);

        if let Err(err) = sock.set_hops_if_changed(outgoing_hops) {
            warn!("{err}");
        }

        let peer_v6 = match pcb.peer {
            std::net::SocketAddr::V6(v6) => *v6.ip(),
            std::net::SocketAddr::V4(_) => {
                warn!("v6 pcb carries a v4 peer, dropping");
                return GuestOutcome::DroppedMalformed;
            }
        };

        match sock.send_to(icmp_payload, peer_v6) {
            Ok(()) => GuestOutcome::Forwarded,
            Err(err) => {
                warn!("{err}");
                GuestOutcome::DroppedSendError
            }
        }
    }
}
