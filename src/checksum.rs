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

//! Incremental one's-complement checksum updates, RFC 1624.
//!
//! Rewriting a single field of an already-checksummed header doesn't
//! require rescanning the whole packet: each replaced field contributes
//! `~old + new` to a running sum, and folding that sum into the existing
//! checksum yields the checksum of the modified header. `Checksummer`
//! collects these deltas; `finish` folds carries and complements once.

/// Fold the carries of a 32-bit accumulator down into 16 bits.
pub fn fold32(mut sum: u32) -> u16 {
    while (sum >> 16) != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

/// Running one's-complement delta accumulator seeded from an existing
/// checksum field. Each `replace*` call both mutates the field in place
/// and folds its contribution into the running sum.
pub struct Checksummer {
    sum: u32,
}

impl Checksummer {
    /// Start a new accumulation from the current value of the checksum
    /// field being maintained.
    pub fn new(old_checksum: u16) -> Self {
        Checksummer {
            sum: u32::from(!old_checksum),
        }
    }

    /// Continue accumulating into an existing running sum (used when a
    /// caller wants to fold several independent deltas computed by
    /// `update16`/`update32` without seeding from a checksum field, e.g.
    /// when starting from zero).
    pub fn from_sum(sum: u32) -> Self {
        Checksummer { sum }
    }

    /// Overwrite a 16-bit field with `new`, returning the delta folded
    /// into this accumulator.
    pub fn replace16(&mut self, field: &mut u16, new: u16) {
        self.sum += u32::from(update16(field, new));
    }

    /// Overwrite a 32-bit field with `new`.
    pub fn replace32(&mut self, field: &mut u32, new: u32) {
        self.sum += u32::from(update32(field, new));
    }

    /// Overwrite all four 32-bit words of an IPv6 address.
    pub fn replace_addr6(&mut self, field: &mut [u32; 4], new: &[u32; 4]) {
        for i in 0..4 {
            self.replace32(&mut field[i], new[i]);
        }
    }

    /// Fold carries and complement, producing the new checksum value to
    /// store in the header's checksum field.
    pub fn finish(self) -> u16 {
        !fold32(self.sum)
    }

    /// Fold in a precomputed delta directly, for adjustments (like
    /// [`TTL_DECREMENT_DELTA`]) that don't go through a `replace*` call
    /// because the field was already rewritten by other means.
    pub fn fold_constant(&mut self, delta: u16) {
        self.sum += u32::from(delta);
    }
}

/// Update a single 16-bit field in place; return the one's-complement
/// delta (`~old + new`, not yet folded) this change contributes to a
/// wider running sum.
pub fn update16(field: &mut u16, new: u16) -> u16 {
    let sum = u32::from(!*field) + u32::from(new);
    *field = new;
    fold32(sum)
}

/// Update a single 32-bit field in place (e.g. an IPv4 address); return
/// the folded one's-complement delta.
pub fn update32(field: &mut u32, new: u32) -> u16 {
    let old_folded = fold32(!*field);
    let new_folded = fold32(new);
    *field = new;
    fold32(u32::from(old_folded) + u32::from(new_folded))
}

/// Update all four words of an IPv6 address in place; return the folded
/// delta of all four updates combined.
pub fn update_ipv6_addr(field: &mut [u32; 4], new: &[u32; 4]) -> u16 {
    let mut sum = 0u32;
    for i in 0..4 {
        sum += u32::from(update32(&mut field[i], new[i]));
    }
    fold32(sum)
}

/// The standard "TTL/hop-limit decremented by one, nothing else changed"
/// checksum adjustment: subtracting 1 from a byte at an even offset
/// within a 16-bit word is equivalent to adding `~0x0100` in network
/// order to the running sum.
pub const TTL_DECREMENT_DELTA: u16 = !0x0100u16;
