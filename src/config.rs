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

//! On-disk configuration for the example daemon binary. The core proxy
//! (`PcbTable`, `GuestIngress`, `HostIngress`) takes no config at all —
//! this only covers which address families to bind and how chatty to be.

use std::fs;

use serde::{Deserialize, Serialize};

use crate::error::{PxPingError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PxPingConfig {
    /// Bind a raw ICMPv4 socket and proxy v4 echoes.
    #[serde(default = "default_true")]
    pub enable_v4: bool,
    /// Bind a raw ICMPv6 socket and proxy v6 echoes.
    #[serde(default = "default_true")]
    pub enable_v6: bool,
    /// `RUST_LOG`-style default if the environment variable isn't set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_true() -> bool {
    true
}

fn default_log_filter() -> String {
    "pxping=info".to_string()
}

impl Default for PxPingConfig {
    fn default() -> Self {
        PxPingConfig {
            enable_v4: true,
            enable_v6: true,
            log_filter: default_log_filter(),
        }
    }
}

impl PxPingConfig {
    pub fn from_filepath(filepath: &str) -> Result<Self> {
        let contents = fs::read_to_string(filepath).map_err(|source| PxPingError::ConfigRead {
            path: filepath.to_string(),
            source,
        })?;
        Self::from_str(&contents)
    }

    pub fn from_str(contents: &str) -> Result<Self> {
        Ok(ron::de::from_str(contents)?)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.enable_v4 && !self.enable_v6 {
            return Err(PxPingError::NoSocketsRequested);
        }
        Ok(())
    }
}
