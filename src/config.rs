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

//! Configuration Loader (spec §4.1): produces an immutable [`RelayConfig`] record.
//! Every other component receives this record at construction time; nothing reads
//! `std::env` directly after startup.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

fn default_listen_port() -> u16 {
    8080
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_conns_per_ip() -> u32 {
    10
}

fn default_ws_rate() -> f64 {
    10.0
}

fn default_ws_burst() -> u32 {
    20
}

fn default_http_window_secs() -> u64 {
    60
}

fn default_static_max() -> u32 {
    300
}

fn default_config_max() -> u32 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

/// Frozen configuration record. See spec.md §6 for the option table this mirrors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RelayConfig {
    /// Bind port for HTTP/WS.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// URL path accepting WebSocket upgrades.
    #[serde(default = "default_ws_path")]
    pub ws_path: String,

    /// Comma-separated exact-origin allowlist. Mandatory (non-empty) when `production`
    /// is true.
    #[serde(default)]
    pub allowed_origins: Vec<String>,

    /// Whether this process is running in production mode (gates the allowlist
    /// requirement below).
    #[serde(default)]
    pub production: bool,

    /// ICE server list, passed verbatim to clients via `/config`.
    #[serde(default)]
    pub ice_servers: Vec<serde_json::Value>,

    /// Maximum concurrent WebSocket connections accepted from a single source IP.
    #[serde(default = "default_max_conns_per_ip")]
    pub max_conns_per_ip: u32,

    /// Whether `/metrics` is served at all.
    #[serde(default)]
    pub metrics_enabled: bool,

    /// Bearer token required on `/metrics` when set. `None` means no auth gate (still
    /// requires `metrics_enabled`).
    #[serde(default)]
    pub metrics_token: Option<String>,

    /// Token bucket refill rate, in tokens/sec, for inbound WS messages.
    #[serde(default = "default_ws_rate")]
    pub ws_message_rate: f64,

    /// Token bucket capacity (burst) for inbound WS messages.
    #[serde(default = "default_ws_burst")]
    pub ws_message_burst: u32,

    /// Sliding window, in seconds, for the HTTP rate limiters below.
    #[serde(default = "default_http_window_secs")]
    pub http_window_secs: u64,

    /// Max static-asset requests per `http_window_secs` per IP.
    #[serde(default = "default_static_max")]
    pub static_max_requests: u32,

    /// Max `/config` requests per `http_window_secs` per IP.
    #[serde(default = "default_config_max")]
    pub config_max_requests: u32,

    /// Directory from which static assets are served. `None` disables `GET /` and
    /// static asset serving (health/config/metrics remain available).
    #[serde(default)]
    pub static_root: Option<PathBuf>,

    /// Cross-instance bus connection URL (e.g. a redis URL). `None` disables the bus.
    #[serde(default)]
    pub bus_url: Option<String>,

    /// Namespace prefix for the bus's shared directory key and channel name.
    #[serde(default)]
    pub bus_prefix: String,

    /// This instance's identity, recorded in the bus's peer directory and in
    /// `CrossInstanceMessage::origin_instance`.
    #[serde(default)]
    pub node_id: String,

    /// `tracing` / `log` severity filter, e.g. `"info"`, `"debug"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit `Strict-Transport-Security` on HTTP responses.
    #[serde(default)]
    pub hsts_enabled: bool,

    /// `max-age` value for the HSTS header, in seconds.
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        // Round-trip through serde so every `#[serde(default = ..)]` above stays the
        // single source of truth for default values.
        serde_json::from_value(serde_json::json!({})).expect("defaults must deserialize")
    }
}

impl RelayConfig {
    /// Load configuration from (in ascending priority) a TOML file, the process
    /// environment (`RELAY_` prefixed, double-underscore nesting), and explicit
    /// overrides (typically CLI flags), then validate it.
    pub fn load(file: Option<&PathBuf>, overrides: &[(String, String)]) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::from(path.as_path()).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );
        for (key, value) in overrides {
            builder = builder
                .set_override(key.as_str(), value.as_str())
                .map_err(|e| ConfigError::Malformed(e.to_string()))?;
        }
        let raw = builder.build().map_err(|e| ConfigError::Malformed(e.to_string()))?;

        // Start from our own defaults, then merge whatever the sources provided on top,
        // since `config` has no notion of per-field serde defaults of its own.
        let defaults = serde_json::to_value(RelayConfig::default()).expect("defaults serialize");
        let mut merged: serde_json::Value = raw
            .try_deserialize::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Object(Default::default()));
        json_merge(&mut merged, defaults);

        let parsed: RelayConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        parsed.validate()?;
        Ok(parsed)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.ws_path.is_empty() || !self.ws_path.starts_with('/') {
            return Err(ConfigError::Malformed(format!(
                "signaling path must start with '/': {:?}",
                self.ws_path
            )));
        }
        if self.production && self.allowed_origins.is_empty() {
            return Err(ConfigError::ProductionRequiresOriginAllowlist);
        }
        if self.max_conns_per_ip == 0 {
            return Err(ConfigError::NonPositiveLimit("max_conns_per_ip"));
        }
        if self.ws_message_burst == 0 {
            return Err(ConfigError::NonPositiveLimit("ws_message_burst"));
        }
        if self.ws_message_rate < 0.0 {
            return Err(ConfigError::NonPositiveLimit("ws_message_rate"));
        }
        if self.http_window_secs == 0 {
            return Err(ConfigError::NonPositiveLimit("http_window_secs"));
        }
        if self.static_max_requests == 0 {
            return Err(ConfigError::NonPositiveLimit("static_max_requests"));
        }
        if self.config_max_requests == 0 {
            return Err(ConfigError::NonPositiveLimit("config_max_requests"));
        }
        if self.bus_url.is_some() && self.node_id.is_empty() {
            return Err(ConfigError::Malformed(
                "node_id must be set when a cross-instance bus URL is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether the origin of an upgrade request is acceptable, per spec.md §4.5 step 2:
    /// exact allowlist match if configured, else scheme-agnostic host match against
    /// `request_host`.
    pub fn origin_allowed(&self, origin: Option<&str>, request_host: &str) -> bool {
        match origin {
            None => !self.production, // browsers always send Origin on cross-origin WS
            Some(origin) => {
                if !self.allowed_origins.is_empty() {
                    self.allowed_origins.iter().any(|o| o == origin)
                } else {
                    origin_host(origin).as_deref() == Some(request_host)
                }
            }
        }
    }
}

fn origin_host(origin: &str) -> Option<String> {
    url::Url::parse(origin).ok().and_then(|u| {
        u.host_str().map(|h| match u.port() {
            Some(p) => format!("{h}:{p}"),
            None => h.to_string(),
        })
    })
}

fn json_merge(into: &mut serde_json::Value, defaults: serde_json::Value) {
    if let (serde_json::Value::Object(into), serde_json::Value::Object(defaults)) = (into, defaults) {
        for (key, value) in defaults {
            into.entry(key).or_insert(value);
        }
    }
}

/// Client-facing view returned by `GET /config`.
#[derive(Clone, Debug, Serialize)]
pub struct ClientConfig {
    #[serde(rename = "wsPath")]
    pub ws_path: String,
    #[serde(rename = "iceServers")]
    pub ice_servers: Vec<serde_json::Value>,
}

impl From<&RelayConfig> for ClientConfig {
    fn from(config: &RelayConfig) -> Self {
        Self {
            ws_path: config.ws_path.clone(),
            ice_servers: config.ice_servers.clone(),
        }
    }
}

/// Also used for the `/metrics` bearer gate (spec.md §6).
pub fn extract_bearer_token(header: Option<&str>) -> Option<&str> {
    header.and_then(|value| value.strip_prefix("Bearer "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_permissive_non_production() {
        let config = RelayConfig::default();
        assert!(!config.production);
        assert_eq!(config.ws_path, "/ws");
        assert!(config.ws_message_burst > 0);
    }

    #[test]
    fn production_without_allowlist_is_rejected() {
        let mut config = RelayConfig::default();
        config.production = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ProductionRequiresOriginAllowlist)
        ));
    }

    #[test]
    fn zero_burst_is_rejected() {
        let mut config = RelayConfig::default();
        config.ws_message_burst = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn origin_allowlist_exact_match_only() {
        let mut config = RelayConfig::default();
        config.allowed_origins = vec!["https://example.com".to_string()];
        assert!(config.origin_allowed(Some("https://example.com"), "relay.example.com"));
        assert!(!config.origin_allowed(Some("https://evil.example.com"), "relay.example.com"));
    }

    #[test]
    fn origin_falls_back_to_host_match_scheme_agnostic() {
        let config = RelayConfig::default();
        assert!(config.origin_allowed(Some("https://relay.example.com"), "relay.example.com"));
        assert!(config.origin_allowed(Some("http://relay.example.com"), "relay.example.com"));
        assert!(!config.origin_allowed(Some("https://other.example.com"), "relay.example.com"));
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(extract_bearer_token(Some("Bearer abc123")), Some("abc123"));
        assert_eq!(extract_bearer_token(Some("Basic xyz")), None);
        assert_eq!(extract_bearer_token(None), None);
    }
}
