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

//! A user-space ICMP echo proxy: bridges ICMP echo requests originating
//! on a guest-side virtual network interface to host raw ICMP sockets,
//! and routes matching replies back, without the guest ever seeing the
//! host's real identifiers.
//!
//! The crate is agnostic to which TCP/IP stack owns the guest interface:
//! embedders implement [`Netif`] and (optionally) [`Remapper`] against
//! their own stack and hand them to [`ProxyState::new`]. Everything else
//! — the flow table, the timing wheel, checksum maintenance, and the
//! host-side socket plumbing — lives here.

pub mod addr;
pub mod checksum;
pub mod config;
pub mod error;
pub mod guest;
pub mod host;
pub mod netif;
pub mod pcb;
pub mod pollmgr;
pub mod post;
pub mod remap;
pub mod socket;
pub mod state;
pub mod wheel;
pub mod wire;

pub use addr::{Family, PxAddr};
pub use config::PxPingConfig;
pub use error::{PxPingError, Result};
pub use guest::{GuestIngress, GuestOutcome};
pub use host::{HostIngress, HostOutcome};
pub use netif::Netif;
pub use pcb::{Pcb, PcbHandle, PcbTable, MAX_PCBS};
pub use remap::{NullRemapper, RemapOutcome, Remapper};
pub use state::ProxyState;
