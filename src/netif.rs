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

//! The guest-side TCP/IP stack collaborator.
//!
//! pxping never links against a specific user-space stack; embedders
//! implement `Netif` against whatever stack actually owns the guest
//! virtual interface.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr};

pub trait Netif: Send + Sync {
    /// Inject a complete IPv4 datagram (header included) into the guest
    /// interface, as if it had arrived from the wire. The stack is
    /// expected to route it purely from the embedded header, the way
    /// `ip_output_if(p, dest=NULL, ...)` does in the original.
    fn output_v4_raw(&self, datagram: &[u8]) -> io::Result<()>;

    /// Inject an ICMPv6 payload (no IP header) into the guest interface;
    /// the stack builds the IPv6 header itself from the given fields.
    fn output_v6(
        &self,
        icmp_payload: &[u8],
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
    ) -> io::Result<()>;

    /// Generate and deliver an ICMP Time Exceeded back to the guest for
    /// the given original (still-IP-headered) datagram it sent.
    fn send_icmp_time_exceeded_v4(&self, original: &[u8]) -> io::Result<()>;

    /// ICMPv6 analogue of `send_icmp_time_exceeded_v4`.
    fn send_icmpv6_time_exceeded(&self, original: &[u8]) -> io::Result<()>;
}

/// Test/embedding-free `Netif` that just records what was sent, for unit
/// tests exercising `GuestIngress`/`HostIngress` without a real stack.
#[derive(Default)]
pub struct RecordingNetif {
    pub v4_raw: std::sync::Mutex<Vec<Vec<u8>>>,
    pub v6: std::sync::Mutex<Vec<(Vec<u8>, Ipv6Addr, Ipv6Addr, u8, u8)>>,
    pub time_exceeded_v4: std::sync::Mutex<Vec<Vec<u8>>>,
    pub time_exceeded_v6: std::sync::Mutex<Vec<Vec<u8>>>,
}

impl Netif for RecordingNetif {
    fn output_v4_raw(&self, datagram: &[u8]) -> io::Result<()> {
        self.v4_raw.lock().unwrap().push(datagram.to_vec());
        Ok(())
    }

    fn output_v6(
        &self,
        icmp_payload: &[u8],
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
    ) -> io::Result<()> {
        self.v6
            .lock()
            .unwrap()
            .push((icmp_payload.to_vec(), src, dst, hop_limit, traffic_class));
        Ok(())
    }

    fn send_icmp_time_exceeded_v4(&self, original: &[u8]) -> io::Result<()> {
        self.time_exceeded_v4.lock().unwrap().push(original.to_vec());
        Ok(())
    }

    fn send_icmpv6_time_exceeded(&self, original: &[u8]) -> io::Result<()> {
        self.time_exceeded_v6.lock().unwrap().push(original.to_vec());
        Ok(())
    }
}
