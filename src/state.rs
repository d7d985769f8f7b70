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

//! Wires the two scheduling domains together: one `ProxyState` owns the
//! shared `PcbTable` mutex, the raw sockets, and the channel between
//! them. Constructing one binds sockets and spawns the poll-manager
//! thread; the caller drives the TCP/IP-task side (guest ingress calls
//! and periodic [`ProxyState::tick`]) from wherever its event loop lives.

use std::net::Ipv6Addr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::config::PxPingConfig;
use crate::error::Result;
use crate::guest::{GuestIngress, GuestOutcome};
use crate::netif::Netif;
use crate::pcb::PcbTable;
use crate::pollmgr::{PollManager, ThreadPollManager};
use crate::post::{self, TcpIpTaskMailbox};
use crate::remap::Remapper;
use crate::socket::{RawIcmpV4Socket, RawIcmpV6Socket};

/// Default hop limit used for v6 output when the kernel didn't report
/// one via ancillary data on the reply that prompted it — matches the
/// common platform default for locally-originated traffic.
const DEFAULT_HOP_LIMIT: u8 = 64;

pub struct ProxyState {
    pcbs: Arc<Mutex<PcbTable>>,
    remapper: Arc<dyn Remapper>,
    netif: Arc<dyn Netif>,
    sock_v4_tx: Option<Mutex<RawIcmpV4Socket>>,
    sock_v6_tx: Option<Mutex<RawIcmpV6Socket>>,
    mailbox: TcpIpTaskMailbox,
    poll_thread: Option<JoinHandle<()>>,
    poll_stop: Arc<std::sync::atomic::AtomicBool>,
}

impl ProxyState {
    pub fn new(
        config: &PxPingConfig,
        remapper: Arc<dyn Remapper>,
        netif: Arc<dyn Netif>,
    ) -> Result<Self> {
        config.validate()?;

        let pcbs = Arc::new(Mutex::new(PcbTable::new()));
        let (post, mailbox) = post::channel();

        let sock_v4_tx = if config.enable_v4 {
            Some(RawIcmpV4Socket::new()?)
        } else {
            None
        };
        let sock_v4_rx = match &sock_v4_tx {
            Some(s) => Some(s.try_clone()?),
            None => None,
        };

        let sock_v6_tx = if config.enable_v6 {
            Some(RawIcmpV6Socket::new()?)
        } else {
            None
        };
        let sock_v6_rx = match &sock_v6_tx {
            Some(s) => Some(s.try_clone()?),
            None => None,
        };

        let poll_manager = Box::new(ThreadPollManager::new(
            Arc::clone(&pcbs),
            Arc::clone(&remapper),
            post,
            sock_v4_rx,
            sock_v6_rx,
            DEFAULT_HOP_LIMIT,
        ));
        let poll_stop = poll_manager.stop_handle();
        let poll_thread = poll_manager.spawn();

        Ok(ProxyState {
            pcbs,
            remapper,
            netif,
            sock_v4_tx: sock_v4_tx.map(Mutex::new),
            sock_v6_tx: sock_v6_tx.map(Mutex::new),
            mailbox,
            poll_thread: Some(poll_thread),
            poll_stop,
        })
    }

    /// Advance the timeout wheel by one tick. The caller is expected to
    /// call this roughly once per second from the TCP/IP task's own
    /// event loop.
    pub fn tick(&self) {
        self.pcbs.lock().unwrap().tick();
    }

    pub fn timer_needed(&self) -> bool {
        self.pcbs.lock().unwrap().timer_needed()
    }

    /// Drain anything the poll-manager thread has forwarded and inject
    /// it into `netif`. Call from the same place as [`Self::tick`].
    pub fn drain_inbound(&self) {
        self.mailbox.drain_inbound(self.netif.as_ref());
    }

    /// Proxy an IPv4 echo request leaving the guest. `datagram` is
    /// mutated in place (identifier rewrite, TTL, checksums) before being
    /// handed to the host raw socket.
    pub fn handle_guest_request_v4(&self, datagram: &mut [u8]) -> GuestOutcome {
        let Some(sock) = &self.sock_v4_tx else {
            return GuestOutcome::DroppedMalformed;
        };
        let guest = GuestIngress::new(self.remapper.as_ref(), self.netif.as_ref());
        let mut table = self.pcbs.lock().unwrap();
        let mut sock = sock.lock().unwrap();
        guest.handle_request_v4(&mut table, &mut sock, datagram)
    }

    pub fn handle_guest_request_v6(
        &self,
        icmp_payload: &mut [u8],
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
    ) -> GuestOutcome {
        let Some(sock) = &self.sock_v6_tx else {
            return GuestOutcome::DroppedMalformed;
        };
        let guest = GuestIngress::new(self.remapper.as_ref(), self.netif.as_ref());
        let mut table = self.pcbs.lock().unwrap();
        let mut sock = sock.lock().unwrap();
        guest.handle_request_v6(&mut table, &mut sock, icmp_payload, src, dst, hop_limit)
    }

    pub fn shutdown(mut self) {
        self.poll_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
    }
}
