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

//! The address remapper collaborator.
//!
//! pxping doesn't know which guest-visible addresses are "virtual" (e.g.
//! a gateway alias) versus directly routable; that knowledge lives in the
//! embedding application's remapper, consulted in both directions.

use std::net::{Ipv4Addr, Ipv6Addr};

use crate::addr::PxAddr;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapOutcome {
    /// The address was substituted; `is_mapped` should be `true` and
    /// TTL/hop-limit handling treats the target as topologically local.
    Mapped(PxAddr),
    /// The address passes through unchanged.
    AsIs(PxAddr),
    /// The remapper refuses to produce a translation; the caller must
    /// drop the packet.
    Failed,
}

pub trait Remapper: Send + Sync {
    /// Translate a host-visible source address back to how the guest
    /// should see it (used when proxying a reply inbound).
    fn inbound_v4(&self, external_src: Ipv4Addr) -> RemapOutcome;
    fn inbound_v6(&self, external_src: Ipv6Addr) -> RemapOutcome;

    /// Translate a guest-chosen destination into the physical host-side
    /// peer to actually send to (used when proxying a request outbound).
    fn outbound_v4(&self, guest_dst: Ipv4Addr) -> RemapOutcome;
    fn outbound_v6(&self, guest_dst: Ipv6Addr) -> RemapOutcome;
}

/// Identity remapper: every address passes through unchanged. Suitable
/// for tests and for embedders with no virtual-address concept.
pub struct NullRemapper;

impl Remapper for NullRemapper {
    fn inbound_v4(&self, external_src: Ipv4Addr) -> RemapOutcome {
        RemapOutcome::AsIs(PxAddr::V4(external_src))
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
