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

//! Fixed-size timing wheel used to expire idle Pcbs.
//!
//! One tick advances the wheel by one bucket. A Pcb doesn't get unlinked
//! and relinked on every refresh; instead `pcb.timeout_slot` records where
//! it *wants* to live, and the actual chain pointers only get fixed up the
//! next time the wheel visits the bucket the Pcb is still physically in.

use crate::pcb::{PcbHandle, PcbTable};

/// Number of buckets; one tick == one second, so this is also the idle
/// timeout in seconds.
pub const WHEEL_SLOTS: usize = 5;

pub struct TimeoutWheel {
    buckets: [Option<PcbHandle>; WHEEL_SLOTS],
    current_slot: usize,
}

impl TimeoutWheel {
    pub fn new() -> Self {
        TimeoutWheel {
            buckets: [None; WHEEL_SLOTS],
            current_slot: 0,
        }
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    pub fn bucket_head(&self, slot: usize) -> Option<PcbHandle> {
        self.buckets[slot]
    }

    /// Advance to the next slot and return it; callers then walk
    /// `bucket_head(returned_slot)` to expire/relink.
    pub fn advance(&mut self) -> usize {
        self.current_slot = (self.current_slot + 1) % WHEEL_SLOTS;
        self.current_slot
    }

    /// Link a freshly created Pcb into the bucket matching its
    /// `timeout_slot`.
    pub fn add(&mut self, table: &mut PcbTable, handle: PcbHandle) {
        let slot = table.pcb(handle).timeout_slot;
        self.link_into_bucket(table, handle, slot);
    }

    /// Unlink a Pcb from whichever bucket it is physically in. Used when
    /// a Pcb is deregistered outright (expiry or teardown).
    pub fn remove(&mut self, table: &mut PcbTable, handle: PcbHandle) {
        // The Pcb's physical bucket isn't tracked separately from
        // `timeout_slot` outside of `tick()`'s relinking pass, but by the
        // time `remove` is called from `deregister` within `tick`, the
        // Pcb is always being removed from `current_slot` (the bucket
        // `tick` is currently walking). Outside of `tick`, Pcbs are only
        // ever ejected via expiry, so this is the only caller.
        self.unlink_from_bucket(table, handle, self.current_slot);
    }

    pub fn link_into_bucket(&mut self, table: &mut PcbTable, handle: PcbHandle, slot: usize) {
        let old_head = self.buckets[slot];
        if let Some(h) = old_head {
            table.set_prev_in_bucket(h, Some(handle));
        }
        table.set_next_in_bucket(handle, old_head);
        table.set_prev_in_bucket(handle, None);
        self.buckets[slot] = Some(handle);
    }

    pub fn unlink_from_bucket(&mut self, table: &mut PcbTable, handle: PcbHandle, slot: usize) {
        let next = table.next_in_bucket(handle);
        let prev = table.prev_in_bucket(handle);

        match prev {
            Some(p) => table.set_next_in_bucket(p, next),
            None => self.buckets[slot] = next,
        }
        if let Some(n) = next {
            table.set_prev_in_bucket(n, prev);
        }
        table.set_next_in_bucket(handle, None);
        table.set_prev_in_bucket(handle, None);
    }
}

impl Default for TimeoutWheel {
    fn default() -> Self {
        Self::new()
    }
}
