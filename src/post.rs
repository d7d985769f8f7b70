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

//! Cross-thread handoff from the poll-manager thread to the TCP/IP task.
//!
//! The poll-manager thread never touches the guest netif directly; it
//! packages a rewritten datagram as an [`InboundMessage`] and posts it
//! through an `mpsc` channel. Ownership of the bytes transfers with the
//! message — the poll-manager thread must not keep using the buffer once
//! it's been posted.

use std::net::Ipv6Addr;
use std::sync::mpsc;

use log::warn;

use crate::netif::Netif;

pub enum InboundMessage {
    V4 {
        datagram: Vec<u8>,
    },
    V6 {
        payload: Vec<u8>,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
    },
}

/// The poll-manager thread's handle for posting inbound packets. Cheap to
/// clone (it's just an `mpsc::Sender`), so each raw-socket handler can own
/// its own copy.
#[derive(Clone)]
pub struct CrossThreadPost {
    tx: mpsc::Sender<InboundMessage>,
}

impl CrossThreadPost {
    pub fn forward_inbound_v4(&self, datagram: Vec<u8>) {
        if self.tx.send(InboundMessage::V4 { datagram }).is_err() {
            warn!("forward_inbound_v4: TCP/IP task mailbox is gone, dropping datagram");
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn forward_inbound_v6(
        &self,
        payload: Vec<u8>,
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
    ) {
        let msg = InboundMessage::V6 {
            payload,
            src,
            dst,
            hop_limit,
            traffic_class,
        };
        if self.tx.send(msg).is_err() {
            warn!("forward_inbound_v6: TCP/IP task mailbox is gone, dropping payload");
        }
    }
}

/// The TCP/IP task's end of the mailbox: owns the `Receiver` and drives
/// posted messages into the netif. Not `Clone` — only one task may own
/// the mailbox and thus the guest netif's injection path.
pub struct TcpIpTaskMailbox {
    rx: mpsc::Receiver<InboundMessage>,
}

pub fn channel() -> (CrossThreadPost, TcpIpTaskMailbox) {
    let (tx, rx) = mpsc::channel();
    (CrossThreadPost { tx }, TcpIpTaskMailbox { rx })
}

impl TcpIpTaskMailbox {
    /// Drain every message currently queued, handing each to `netif`.
    /// Never blocks: this is the cooperative, run-to-completion side of
    /// the design, so the caller decides when to drain.
    pub fn drain_inbound(&self, netif: &dyn Netif) {
        while let Ok(msg) = self.rx.try_recv() {
            let result = match msg {
                InboundMessage::V4 { datagram } => netif.output_v4_raw(&datagram),
                InboundMessage::V6 {
                    payload,
                    src,
                    dst,
                    hop_limit,
                    traffic_class,
                } => netif.output_v6(&payload, src, dst, hop_limit, traffic_class),
            };
            if let Err(err) = result {
                warn!("netif output failed: {err}");
            }
        }
    }
}
