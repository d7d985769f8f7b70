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

//! Address-family-tagged addresses.
//!
//! The source keeps addresses in a `ipX_addr_t` union with a side `family`
//! flag threaded through every comparison. We fold the tag into the value
//! itself so a v4 Pcb can never be compared against a v6 query by mistake.

use std::net::{Ipv4Addr, Ipv6Addr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PxAddr {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl PxAddr {
    pub fn family(&self) -> Family {
        match self {
            PxAddr::V4(_) => Family::V4,
            PxAddr::V6(_) => Family::V6,
        }
    }

    pub fn as_v4(&self) -> Option<Ipv4Addr> {
        match self {
            PxAddr::V4(a) => Some(*a),
            PxAddr::V6(_) => None,
        }
    }

    pub fn as_v6(&self) -> Option<Ipv6Addr> {
        match self {
            PxAddr::V6(a) => Some(*a),
            PxAddr::V4(_) => None,
        }
    }
}

impl From<Ipv4Addr> for PxAddr {
    fn from(a: Ipv4Addr) -> Self {
        PxAddr::V4(a)
    }
}

impl From<Ipv6Addr> for PxAddr {
    fn from(a: Ipv6Addr) -> Self {
        PxAddr::V6(a)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_tag_distinguishes_v4_mapped_looking_bytes() {
        let v4 = PxAddr::V4(Ipv4Addr::new(127, 0, 0, 1));
        let v6 = PxAddr::V6(Ipv6Addr::new(0, 0, 0, 0, 0, 0xffff, 0x7f00, 0x0001));
        assert_ne!(v4, v6);
        assert_eq!(v4.family(), Family::V4);
        assert_eq!(v6.family(), Family::V6);
    }

    #[test]
    fn as_v4_as_v6_round_trip() {
        let a = Ipv4Addr::new(10, 0, 2, 15);
        let addr = PxAddr::from(a);
        assert_eq!(addr.as_v4(), Some(a));
        assert_eq!(addr.as_v6(), None);
    }
}
