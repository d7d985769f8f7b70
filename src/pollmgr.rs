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

//! The poll-manager thread: waits on whichever raw sockets are enabled
//! and feeds readable datagrams to [`HostIngress`]. A thin `libc::poll`
//! wrapper stands in for the source's generic `pollmgr` registration
//! table, since this crate only ever has the two fixed raw sockets to
//! watch.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use log::warn;

use crate::host::HostIngress;
use crate::pcb::PcbTable;
use crate::post::CrossThreadPost;
use crate::remap::Remapper;
use crate::socket::{RawIcmpV4Socket, RawIcmpV6Socket, RECV_BUF_SIZE};

/// Poll timeout: bounds how long `run` can take to notice `stop()` was
/// called, the same role the source's `poll()` timeout plays in letting
/// the timer fire on schedule.
const POLL_TIMEOUT_MS: i32 = 1000;

/// A background collaborator that watches the host's raw sockets. The
/// bundled [`ThreadPollManager`] is the only implementation shipped;
/// the trait exists so an embedder could swap in an io-uring or epoll
/// based one without touching `HostIngress`.
pub trait PollManager: Send {
    fn spawn(self: Box<Self>) -> JoinHandle<()>;
}

pub struct ThreadPollManager {
    pcbs: Arc<Mutex<PcbTable>>,
    remapper: Arc<dyn Remapper>,
    post: CrossThreadPost,
    sock_v4: Option<RawIcmpV4Socket>,
    sock_v6: Option<RawIcmpV6Socket>,
    default_hop_limit: u8,
    stop: Arc<AtomicBool>,
}

impl ThreadPollManager {
    pub fn new(
        pcbs: Arc<Mutex<PcbTable>>,
        remapper: Arc<dyn Remapper>,
        post: CrossThreadPost,
        sock_v4: Option<RawIcmpV4Socket>,
        sock_v6: Option<RawIcmpV6Socket>,
        default_hop_limit: u8,
    ) -> Self {
        ThreadPollManager {
            pcbs,
            remapper,
            post,
            sock_v4,
            sock_v6,
            default_hop_limit,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A handle the owner can use to ask `run` to return; `run` notices
    /// within one `POLL_TIMEOUT_MS` window.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    fn run_loop(&mut self) {
        let host = HostIngress::new(self.remapper.as_ref());
        let mut buf_v4 = vec![0u8; RECV_BUF_SIZE];
        let mut buf_v6 = vec![0u8; RECV_BUF_SIZE];

        while !self.stop.load(Ordering::Relaxed) {
            let mut pollfds = Vec::with_capacity(2);
            if let Some(s) = &self.sock_v4 {
                pollfds.push(libc::pollfd {
                    fd: s.as_raw_fd() as RawFd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            if let Some(s) = &self.sock_v6 {
                pollfds.push(libc::pollfd {
                    fd: s.as_raw_fd() as RawFd,
                    events: libc::POLLIN,
                    revents: 0,
                });
            }
            if pollfds.is_empty() {
                return;
            }

            let rc = unsafe {
                libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, POLL_TIMEOUT_MS)
            };
            if rc < 0 {
                warn!("poll: {}", std::io::Error::last_os_error());
                continue;
            }
            if rc == 0 {
                continue;
            }

            let mut idx = 0;
            if let Some(sock4) = &self.sock_v4 {
                if pollfds[idx].revents & libc::POLLIN != 0 {
                    match sock4.recv(&mut buf_v4) {
                        Ok(n) => {
                            host.handle_v4(&self.pcbs, &self.post, &mut buf_v4, n);
                        }
                        Err(err) => warn!("{err}"),
                    }
                }
                idx += 1;
            }
            if let Some(sock6) = &self.sock_v6 {
                if pollfds[idx].revents & libc::POLLIN != 0 {
                    match sock6.recv_with_ancillary(&mut buf_v6) {
                        Ok((n, src, ancillary)) => {
                            host.handle_echo6(
                                &self.pcbs,
                                &self.post,
                                &mut buf_v6[..n],
                                src,
                                ancillary,
                                self.default_hop_limit,
                            );
                        }
                        Err(err) => warn!("{err}"),
                    }
                }
            }
        }
    }
}

impl PollManager for ThreadPollManager {
    fn spawn(mut self: Box<Self>) -> JoinHandle<()> {
        std::thread::spawn(move || self.run_loop())
    }
}
