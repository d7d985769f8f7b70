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

//! Error types for the proxy's I/O boundaries.
//!
//! Packet-rewriting helpers deeper in the crate are infallible by
//! construction (malformed input is rejected earlier, by returning `None`
//! from a parser) and so do not appear here; this enum only covers things
//! that can fail for reasons outside the crate's control: socket creation,
//! socket options, and config parsing.

use std::io;

#[derive(Debug, thiserror::Error)]
pub enum PxPingError {
    #[error("no raw socket requested for either address family")]
    NoSocketsRequested,

    #[error("failed to create raw socket: {0}")]
    SocketCreate(#[source] io::Error),

    #[error("setsockopt {name} failed: {source}")]
    SetSockOpt {
        name: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("send to {peer} failed: {source}")]
    Send {
        peer: std::net::SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("recv failed: {0}")]
    Recv(#[source] io::Error),

    #[error("failed to read config file {path}: {source}")]
    ConfigRead {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] ron::de::Error),
}

pub type Result<T> = std::result::Result<T, PxPingError>;
