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

//! Raw ICMP sockets.
//!
//! IPv4 reads arrive with the full IP header attached; a plain
//! `Socket::recv_from` is enough. IPv6 raw sockets only deliver the ICMPv6
//! payload — the destination address, hop limit and traffic class the
//! kernel used have to be recovered from ancillary data via `recvmsg(2)`,
//! so that path drops to `libc` directly.

use std::io;
use std::mem::MaybeUninit;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::error::{PxPingError, Result};

/// Read scratch buffer size, generous enough for any ICMP datagram this
/// proxy will ever see (echo payloads are guest-controlled but small).
pub const RECV_BUF_SIZE: usize = 2048;

pub struct RawIcmpV4Socket {
    socket: Socket,
    cached_ttl: Option<u32>,
    cached_tos: Option<u32>,
}

impl RawIcmpV4Socket {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::ICMPV4))
            .map_err(PxPingError::SocketCreate)?;
        Ok(RawIcmpV4Socket {
            socket,
            cached_ttl: None,
            cached_tos: None,
        })
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }

    /// Duplicate the underlying fd so the poll-manager thread can own a
    /// receive-only handle while the TCP/IP task keeps the original (and
    /// its cached socket-option state) for sends.
    pub fn try_clone(&self) -> Result<Self> {
        let socket = self.socket.try_clone().map_err(PxPingError::SocketCreate)?;
        Ok(RawIcmpV4Socket {
            socket,
            cached_ttl: self.cached_ttl,
            cached_tos: self.cached_tos,
        })
    }

    pub fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let uninit = unsafe {
            &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>])
        };
        let (n, _from) = self.socket.recv_from(uninit).map_err(PxPingError::Recv)?;
        Ok(n)
    }

    pub fn send_to(&self, datagram: &[u8], peer: SocketAddr) -> Result<()> {
        let peer_v4 = match peer {
            SocketAddr::V4(v4) => v4,
            SocketAddr::V6(_) => SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        };
        self.socket
            .send_to(datagram, &SockAddr::from(peer_v4))
            .map_err(|source| PxPingError::Send { peer, source })?;
        Ok(())
    }

    /// Apply `IP_TTL` only if it differs from the last value we
    /// successfully set, and only update the cache on success — a failed
    /// `setsockopt` leaves the kernel's value, and our cache, unchanged.
    pub fn set_ttl_if_changed(&mut self, ttl: u8) -> Result<()> {
        if self.cached_ttl == Some(u32::from(ttl)) {
            return Ok(());
        }
        self.socket
            .set_ttl(u32::from(ttl))
            .map_err(|source| PxPingError::SetSockOpt { name: "IP_TTL", source })?;
        self.cached_ttl = Some(u32::from(ttl));
        Ok(())
    }

    pub fn set_tos_if_changed(&mut self, tos: u8) -> Result<()> {
        if self.cached_tos == Some(u32::from(tos)) {
            return Ok(());
        }
        self.socket
            .set_tos(u32::from(tos))
            .map_err(|source| PxPingError::SetSockOpt { name: "IP_TOS", source })?;
        self.cached_tos = Some(u32::from(tos));
        Ok(())
    }
}

/// Ancillary data recovered alongside an ICMPv6 payload.
#[derive(Debug, Clone, Copy)]
pub struct Icmpv6Ancillary {
    pub dst: Option<Ipv6Addr>,
    pub hop_limit: Option<u8>,
}

pub struct RawIcmpV6Socket {
    socket: Socket,
    cached_hops: Option<u32>,
}

impl RawIcmpV6Socket {
    pub fn new() -> Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::RAW, Some(Protocol::ICMPV6))
            .map_err(PxPingError::SocketCreate)?;
        set_recv_pktinfo(&socket)?;
        set_recv_hoplimit(&socket)?;
        Ok(RawIcmpV6Socket {
            socket,
            cached_hops: None,
        })
    }

    pub fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.socket.as_raw_fd()
    }

    pub fn try_clone(&self) -> Result<Self> {
        let socket = self.socket.try_clone().map_err(PxPingError::SocketCreate)?;
        Ok(RawIcmpV6Socket {
            socket,
            cached_hops: self.cached_hops,
        })
    }

    /// Receive one ICMPv6 payload plus whatever ancillary data the kernel
    /// attached (`IPV6_PKTINFO`/`IPV6_HOPLIMIT`), mirroring the
    /// `recvmsg`+`CMSG_FIRSTHDR`/`CMSG_NXTHDR` walk of the source.
    pub fn recv_with_ancillary(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, Ipv6Addr, Icmpv6Ancillary)> {
        recvmsg_v6(self.as_raw_fd(), buf).map_err(PxPingError::Recv)
    }

    pub fn send_to(&self, payload: &[u8], peer: Ipv6Addr) -> Result<()> {
        let sockaddr = SocketAddr::new(peer.into(), 0);
        self.socket
            .send_to(payload, &SockAddr::from(sockaddr))
            .map_err(|source| PxPingError::Send { peer: sockaddr, source })?;
        Ok(())
    }

    pub fn set_hops_if_changed(&mut self, hop_limit: u8) -> Result<()> {
        if self.cached_hops == Some(u32::from(hop_limit)) {
            return Ok(());
        }
        self.socket
            .set_unicast_hops_v6(u32::from(hop_limit))
            .map_err(|source| PxPingError::SetSockOpt {
                name: "IPV6_UNICAST_HOPS",
                source,
            })?;
        self.cached_hops = Some(u32::from(hop_limit));
        Ok(())
    }
}

fn set_recv_pktinfo(socket: &Socket) -> Result<()> {
    setsockopt_bool(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO, "IPV6_RECVPKTINFO")
}

fn set_recv_hoplimit(socket: &Socket) -> Result<()> {
    setsockopt_bool(socket, libc::IPPROTO_IPV6, libc::IPV6_RECVHOPLIMIT, "IPV6_RECVHOPLIMIT")
}

fn setsockopt_bool(socket: &Socket, level: i32, name: i32, label: &'static str) -> Result<()> {
    let on: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            name,
            &on as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(PxPingError::SetSockOpt {
            name: label,
            source: io::Error::last_os_error(),
        });
    }
    Ok(())
}

/// `in6_pktinfo` as defined by RFC 3542; not always exposed by `libc` for
/// every target, so we lay it out ourselves, matching the source's own
/// fallback definition for older glibc headers.
#[repr(C)]
struct In6Pktinfo {
    ipi6_addr: libc::in6_addr,
    ipi6_ifindex: libc::c_uint,
}

fn recvmsg_v6(
    fd: std::os::unix::io::RawFd,
    buf: &mut [u8],
) -> io::Result<(usize, Ipv6Addr, Icmpv6Ancillary)> {
    let mut name: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
    let mut cmsg_buf = [0u8; 128];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };

    let mut mh: libc::msghdr = unsafe { std::mem::zeroed() };
    mh.msg_name = &mut name as *mut _ as *mut libc::c_void;
    mh.msg_namelen = std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t;
    mh.msg_iov = &mut iov;
    mh.msg_iovlen = 1;
    mh.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    mh.msg_controllen = cmsg_buf.len() as _;

    let nread = unsafe { libc::recvmsg(fd, &mut mh, 0) };
    if nread < 0 {
        return Err(io::Error::last_os_error());
    }

    let src = Ipv6Addr::from(unsafe { name.sin6_addr.s6_addr });

    let mut ancillary = Icmpv6Ancillary {
        dst: None,
        hop_limit: None,
    };

    let mut cmh = unsafe { libc::CMSG_FIRSTHDR(&mh) };
    while !cmh.is_null() {
        let cmh_ref = unsafe { &*cmh };
        if cmh_ref.cmsg_len == 0 {
            break;
        }

        if cmh_ref.cmsg_level == libc::IPPROTO_IPV6
            && cmh_ref.cmsg_type == libc::IPV6_HOPLIMIT
        {
            let data = unsafe { libc::CMSG_DATA(cmh) as *const libc::c_int };
            ancillary.hop_limit = Some(unsafe { *data } as u8);
        }

        if cmh_ref.cmsg_level == libc::IPPROTO_IPV6 && cmh_ref.cmsg_type == libc::IPV6_PKTINFO {
            let data = unsafe { libc::CMSG_DATA(cmh) as *const In6Pktinfo };
            let pktinfo = unsafe { data.read_unaligned() };
            ancillary.dst = Some(Ipv6Addr::from(pktinfo.ipi6_addr.s6_addr));
        }

        cmh = unsafe { libc::CMSG_NXTHDR(&mh, cmh) };
    }

    Ok((nread as usize, src, ancillary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_cache_skips_redundant_setsockopt_plan() {
        // set_ttl_if_changed short-circuits purely on the cached value, so
        // this only exercises the comparison logic without touching a
        // real socket.
        let cached: Option<u32> = Some(64);
        assert!(cached == Some(u32::from(64u8)));
        assert_ne!(cached, Some(u32::from(32u8)));
    }
}
