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

//! Shared, injected services (spec §9 "Global mutable state"): every component takes
//! these by reference rather than reaching for an ambient singleton, so tests can
//! construct a fresh relay instance per case.

use std::sync::Arc;

use crate::bus::SignalBus;
use crate::config::RelayConfig;
use crate::http::HttpRateLimiter;
use crate::ip_quota::IpQuota;
use crate::metrics::Metrics;
use crate::pairing::PairingTable;
use crate::registry::PeerRegistry;

pub struct RelayState {
    pub config: Arc<RelayConfig>,
    pub registry: PeerRegistry,
    pub pairing: PairingTable,
    pub metrics: Arc<Metrics>,
    pub bus: Arc<dyn SignalBus>,
    pub ip_quota: IpQuota,
    pub http_rate_limiter: HttpRateLimiter,
}

impl RelayState {
    pub fn new(config: RelayConfig, bus: Arc<dyn SignalBus>) -> Arc<Self> {
        let metrics = Arc::new(Metrics::new());
        Arc::new(Self {
            config: Arc::new(config),
            registry: PeerRegistry::new(),
            pairing: PairingTable::new(metrics.clone()),
            metrics,
            bus,
            ip_quota: IpQuota::new(),
            http_rate_limiter: HttpRateLimiter::new(),
        })
    }
}
