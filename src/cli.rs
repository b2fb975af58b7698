// Copyright 2026. The Signal Relay Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Command-line entry point (spec §4.1). Options here take priority over the config
//! file and environment, per [`crate::config::RelayConfig::load`].

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[clap(short, long, env = "RELAY_CONFIG_FILE")]
    pub config: Option<PathBuf>,

    /// Bind port for HTTP/WS. Overrides the config file and environment.
    #[clap(short, long, env = "RELAY_LISTEN_PORT")]
    pub listen_port: Option<u16>,

    /// `tracing` severity filter, e.g. "info", "debug". Overrides the config file.
    #[clap(long, env = "RELAY_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Run with production safety checks enabled (requires a non-empty origin allowlist).
    #[clap(long)]
    pub production: bool,
}

impl Cli {
    /// Command-line overrides to apply on top of the config file and environment,
    /// highest priority first. Only flags explicitly passed on the command line are
    /// present here; `RelayConfig::load` leaves anything absent at its prior value.
    pub fn overrides(&self) -> Vec<(String, String)> {
        let mut overrides = Vec::new();
        if let Some(port) = self.listen_port {
            overrides.push(("listen_port".to_string(), port.to_string()));
        }
        if let Some(level) = &self.log_level {
            overrides.push(("log_level".to_string(), level.clone()));
        }
        if self.production {
            overrides.push(("production".to_string(), "true".to_string()));
        }
        overrides
    }
}
