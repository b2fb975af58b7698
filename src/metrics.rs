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

//! Observability (spec §4.8): counters/gauges for clients, pairs, relayed signals by
//! kind, and errors. Built on `prometheus`, the same crate the teacher's `tari_metrics`
//! crate wraps for its `pull` feature.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub registry: Registry,
    pub ws_clients: IntGauge,
    pub ws_pairs: IntGauge,
    pub ws_signals_total: IntCounterVec,
    pub ws_errors_total: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let ws_clients = IntGauge::new("ws_clients", "Live connection supervisors").unwrap();
        let ws_pairs = IntGauge::new("ws_pairs", "Number of mutual pairings").unwrap();
        let ws_signals_total = IntCounterVec::new(
            Opts::new("ws_signals_total", "Successfully forwarded signals"),
            &["kind"],
        )
        .unwrap();
        let ws_errors_total =
            prometheus::IntCounter::new("ws_errors_total", "Parse/validation/rate-limit failures").unwrap();

        registry.register(Box::new(ws_clients.clone())).unwrap();
        registry.register(Box::new(ws_pairs.clone())).unwrap();
        registry.register(Box::new(ws_signals_total.clone())).unwrap();
        registry.register(Box::new(ws_errors_total.clone())).unwrap();

        Self {
            registry,
            ws_clients,
            ws_pairs,
            ws_signals_total,
            ws_errors_total,
        }
    }

    pub fn record_forward(&self, kind: &str) {
        self.ws_signals_total.with_label_values(&[kind]).inc();
    }

    pub fn record_error(&self) {
        self.ws_errors_total.inc();
    }

    pub fn encode(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let families = self.registry.gather();
        let mut buf = Vec::new();
        encoder.encode(&families, &mut buf).expect("prometheus encoding cannot fail");
        String::from_utf8(buf).expect("prometheus text encoding is always utf8")
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exposition_contains_registered_metrics() {
        let metrics = Metrics::new();
        metrics.ws_clients.set(3);
        metrics.record_forward("offer");
        metrics.record_error();
        let text = metrics.encode();
        assert!(text.contains("ws_clients 3"));
        assert!(text.contains("ws_signals_total"));
        assert!(text.contains("ws_errors_total 1"));
    }
}
