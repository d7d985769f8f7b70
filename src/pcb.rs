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

//! The quasi-PCB table: maps guest-chosen identifiers to host-chosen ones
//! for in-flight ICMP echo flows, capped at a small fixed size.

use std::net::SocketAddr;

use rand::Rng;

use crate::addr::{Family, PxAddr};
use crate::remap::{RemapOutcome, Remapper};
use crate::wheel::TimeoutWheel;

/// Hard cap on the number of simultaneously tracked flows. Deliberately
/// small: this proxy is not meant for industrial-throughput pinging.
pub const MAX_PCBS: usize = 8;

/// Stable handle into the PCB arena. Cheap to copy, safe to stash in a
/// wheel bucket without worrying about pointer lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcbHandle(usize);

/// A quasi protocol-control-block: bookkeeping for one ICMP echo
/// conversation, not a real transport PCB.
#[derive(Debug, Clone)]
pub struct Pcb {
    pub family: Family,
    pub src: PxAddr,
    pub dst: PxAddr,
    pub guest_id: u16,
    pub host_id: u16,
    pub peer: SocketAddr,
    pub is_mapped: bool,
    pub timeout_slot: usize,

    next_in_list: Option<PcbHandle>,
    next_in_bucket: Option<PcbHandle>,
    prev_in_bucket: Option<PcbHandle>,
}

enum Slot {
    Occupied(Pcb),
    Free,
}

/// Owns every live Pcb in a flat arena, plus the intrusive chains used for
/// the global list (`lookup_for_request`/`lookup_for_reply` linear scans)
/// and the timeout wheel (see [`TimeoutWheel`]).
pub struct PcbTable {
    slots: Vec<Slot>,
    free_list: Vec<usize>,
    head: Option<PcbHandle>,
    npcbs: usize,
    wheel: TimeoutWheel,
}

impl Default for PcbTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PcbTable {
    pub fn new() -> Self {
        PcbTable {
            slots: Vec::new(),
            free_list: Vec::new(),
            head: None,
            npcbs: 0,
            wheel: TimeoutWheel::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.npcbs
    }

    pub fn is_empty(&self) -> bool {
        self.npcbs == 0
    }

    fn get(&self, h: PcbHandle) -> &Pcb {
        match &self.slots[h.0] {
            Slot::Occupied(pcb) => pcb,
            Slot::Free => panic!("dangling PcbHandle"),
        }
    }

    fn get_mut(&mut self, h: PcbHandle) -> &mut Pcb {
        match &mut self.slots[h.0] {
            Slot::Occupied(pcb) => pcb,
            Slot::Free => panic!("dangling PcbHandle"),
        }
    }

    pub fn pcb(&self, h: PcbHandle) -> &Pcb {
        self.get(h)
    }

    /// Guest → TCP/IP task direction: find the Pcb for this flow, or
    /// create one if this is a new flow. Returns `None` if the table is
    /// full or the remapper refuses to produce a host-side peer.
    pub fn lookup_or_create_for_request(
        &mut self,
        remapper: &dyn Remapper,
        current_slot: usize,
        family: Family,
        src: PxAddr,
        dst: PxAddr,
        guest_id: u16,
    ) -> Option<PcbHandle> {
        if let Some(h) = self.find_by_request(family, src, dst, guest_id) {
            // Bump expiry lazily; the wheel relinks on its next visit.
            self.get_mut(h).timeout_slot = current_slot;
            return Some(h);
        }

        if self.npcbs >= MAX_PCBS {
            return None;
        }

        let outcome = match (family, dst) {
            (Family::V4, PxAddr::V4(d)) => remapper.outbound_v4(d),
            (Family::V6, PxAddr::V6(d)) => remapper.outbound_v6(d),
            _ => return None,
        };

        let (peer_addr, is_mapped) = match outcome {
            RemapOutcome::Mapped(addr) => (addr, true),
            RemapOutcome::AsIs(addr) => (addr, false),
            RemapOutcome::Failed => return None,
        };

        let host_id: u16 = rand::thread_rng().gen();
        let peer = match peer_addr {
            PxAddr::V4(a) => SocketAddr::new(a.into(), 0),
            PxAddr::V6(a) => SocketAddr::new(a.into(), 0),
        };

        let pcb = Pcb {
            family,
            src,
            dst,
            guest_id,
            host_id,
            peer,
            is_mapped,
            timeout_slot: current_slot,
            next_in_list: None,
            next_in_bucket: None,
            prev_in_bucket: None,
        };

        let handle = self.alloc(pcb);
        self.register(handle);
        Some(handle)
    }

    fn find_by_request(
        &self,
        family: Family,
        src: PxAddr,
        dst: PxAddr,
        guest_id: u16,
    ) -> Option<PcbHandle> {
        let mut cur = self.head;
        while let Some(h) = cur {
            let pcb = self.get(h);
            if pcb.family == family
                && pcb.guest_id == guest_id
                && addr_eq(pcb.dst, dst)
                && addr_eq(pcb.src, src)
            {
                return Some(h);
            }
            cur = pcb.next_in_list;
        }
        None
    }

    /// Host → guest direction: match on (family, dst, host_id). Multicast
    /// and broadcast replies are not matched here since `dst` must
    /// resolve to a concrete stored guest address.
    pub fn lookup_for_reply(
        &self,
        family: Family,
        dst: PxAddr,
        host_id: u16,
    ) -> Option<PcbHandle> {
        let mut cur = self.head;
        while let Some(h) = cur {
            let pcb = self.get(h);
            if pcb.family == family && pcb.host_id == host_id && addr_eq(pcb.dst, dst) {
                return Some(h);
            }
            cur = pcb.next_in_list;
        }
        None
    }

    fn alloc(&mut self, pcb: Pcb) -> PcbHandle {
        if let Some(idx) = self.free_list.pop() {
            self.slots[idx] = Slot::Occupied(pcb);
            self.npcbs += 1;
            PcbHandle(idx)
        } else {
            let idx = self.slots.len();
            self.slots.push(Slot::Occupied(pcb));
            self.npcbs += 1;
            PcbHandle(idx)
        }
    }

    fn register(&mut self, handle: PcbHandle) {
        self.get_mut(handle).next_in_list = self.head;
        self.head = Some(handle);
        self.wheel.add(self, handle);
    }

    fn deregister(&mut self, handle: PcbHandle) {
        let mut cur = self.head;
        let mut prev: Option<PcbHandle> = None;
        while let Some(h) = cur {
            if h == handle {
                let next = self.get(h).next_in_list;
                match prev {
                    Some(p) => self.get_mut(p).next_in_list = next,
                    None => self.head = next,
                }
                break;
            }
            prev = Some(h);
            cur = self.get(h).next_in_list;
        }
        self.wheel.remove(self, handle);
    }

    fn delete(&mut self, handle: PcbHandle) {
        self.slots[handle.0] = Slot::Free;
        self.free_list.push(handle.0);
        self.npcbs -= 1;
    }

    /// Advance the timeout wheel by one tick, expiring any Pcb whose
    /// `timeout_slot` still points at the bucket it's physically in, and
    /// relinking the rest into the bucket they actually want.
    pub fn tick(&mut self) {
        let current = self.wheel.advance();
        let bucket_head = self.wheel.bucket_head(current);

        let mut cur = bucket_head;
        while let Some(h) = cur {
            let next = self.get(h).next_in_bucket;
            let wants_slot = self.get(h).timeout_slot;
            if wants_slot == current {
                self.deregister(h);
                self.delete(h);
            } else {
                self.wheel.unlink_from_bucket(self, h, current);
                self.wheel.link_into_bucket(self, h, wants_slot);
            }
            cur = next;
        }
    }

    pub fn timer_needed(&self) -> bool {
        !self.is_empty()
    }

    pub fn current_slot(&self) -> usize {
        self.wheel.current_slot()
    }

    // Internal accessors used by `TimeoutWheel` to manipulate bucket
    // chain pointers without duplicating the arena lookup logic.
    pub(crate) fn next_in_bucket(&self, h: PcbHandle) -> Option<PcbHandle> {
        self.get(h).next_in_bucket
    }

    pub(crate) fn prev_in_bucket(&self, h: PcbHandle) -> Option<PcbHandle> {
        self.get(h).prev_in_bucket
    }

    pub(crate) fn set_next_in_bucket(&mut self, h: PcbHandle, v: Option<PcbHandle>) {
        self.get_mut(h).next_in_bucket = v;
    }

    pub(crate) fn set_prev_in_bucket(&mut self, h: PcbHandle, v: Option<PcbHandle>) {
        self.get_mut(h).prev_in_bucket = v;
    }
}

fn addr_eq(a: PxAddr, b: PxAddr) -> bool {
    a == b
}
