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

//! Standalone daemon wiring `pxping` to nothing in particular: there is
//! no bundled guest-side TCP/IP stack, so this binary exists to exercise
//! the host-facing half end to end (bind the raw sockets, run the poll
//! manager, tick the wheel) and to show embedders the shape of a real
//! integration. `LoggingNetif` stands in for whatever stack would
//! otherwise receive the rewritten replies.

use std::net::Ipv6Addr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::info;
use pxping::{NullRemapper, PxPingConfig, ProxyState};

#[derive(Parser)]
#[command(version, author, about = "User-space ICMP echo proxy")]
struct Opts {
    #[arg(short, long, default_value = "pxping.ron")]
    config: String,
}

struct LoggingNetif;

impl pxping::Netif for LoggingNetif {
    fn output_v4_raw(&self, datagram: &[u8]) -> std::io::Result<()> {
        info!("would inject {} bytes into guest (v4)", datagram.len());
        Ok(())
    }

    fn output_v6(
        &self,
        icmp_payload: &[u8],
        src: Ipv6Addr,
        dst: Ipv6Addr,
        hop_limit: u8,
        traffic_class: u8,
    ) -> std::io::Result<()> {
        info!(
            "would inject {} bytes into guest (v6 {src} -> {dst}, hop_limit={hop_limit}, tclass={traffic_class})",
            icmp_payload.len()
        );
        Ok(())
    }

    fn send_icmp_time_exceeded_v4(&self, original: &[u8]) -> std::io::Result<()> {
        info!("would send ICMPv4 time exceeded for {} bytes", original.len());
        Ok(())
    }

    fn send_icmpv6_time_exceeded(&self, original: &[u8]) -> std::io::Result<()> {
        info!("would send ICMPv6 time exceeded for {} bytes", original.len());
        Ok(())
    }
}

fn read_config(filepath: &str) -> PxPingConfig {
    match PxPingConfig::from_filepath(filepath) {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("warning: {filepath}: {err}, falling back to defaults");
            PxPingConfig::default()
        }
    }
}

fn main() {
    let opts = Opts::parse();
    let cfg = read_config(&opts.config);

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log_filter.clone()))
        .init();

    let remapper: Arc<dyn pxping::Remapper> = Arc::new(NullRemapper);
    let netif: Arc<dyn pxping::Netif> = Arc::new(LoggingNetif);

    let state = match ProxyState::new(&cfg, remapper, netif) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("failed to start pxping: {err}");
            std::process::exit(1);
        }
    };

    info!("pxping running (v4={}, v6={})", cfg.enable_v4, cfg.enable_v6);

    loop {
        std::thread::sleep(Duration::from_secs(1));
        state.drain_inbound();
        if state.timer_needed() {
            state.tick();
        }
    }
}
