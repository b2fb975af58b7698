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

//! HTTP Surface (spec §4.7): `/`, static assets, `/healthz`, `/config`, `/metrics`.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use dashmap::DashMap;
use hyper::header::{
    CACHE_CONTROL, CONTENT_TYPE, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, STRICT_TRANSPORT_SECURITY,
};
use hyper::{Body, Method, Request, Response, StatusCode};
use tracing::warn;

use crate::config::extract_bearer_token;
use crate::state::RelayState;

/// Per-IP fixed-window counters for the two unauthenticated HTTP surfaces that are
/// worth throttling (spec.md §6 `static_max_requests` / `config_max_requests`).
pub struct HttpRateLimiter {
    static_windows: DashMap<IpAddr, Window>,
    config_windows: DashMap<IpAddr, Window>,
}

struct Window {
    started_at: std::time::Instant,
    count: u32,
}

impl HttpRateLimiter {
    pub fn new() -> Self {
        Self {
            static_windows: DashMap::new(),
            config_windows: DashMap::new(),
        }
    }

    fn check(windows: &DashMap<IpAddr, Window>, ip: IpAddr, max: u32, window: std::time::Duration) -> bool {
        let mut entry = windows.entry(ip).or_insert_with(|| Window {
            started_at: std::time::Instant::now(),
            count: 0,
        });
        if entry.started_at.elapsed() >= window {
            entry.started_at = std::time::Instant::now();
            entry.count = 0;
        }
        if entry.count >= max {
            false
        } else {
            entry.count += 1;
            true
        }
    }
}

impl Default for HttpRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub async fn handle(req: Request<Body>, state: &RelayState, client_ip: IpAddr) -> Response<Body> {
    let response = route(&req, state, client_ip).await;
    with_hsts(response, state)
}

async fn route(req: &Request<Body>, state: &RelayState, client_ip: IpAddr) -> Response<Body> {
    if req.method() != Method::GET && req.method() != Method::HEAD {
        return simple(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
    }

    match req.uri().path() {
        "/healthz" => simple(StatusCode::OK, "ok"),
        "/config" => {
            let window = std::time::Duration::from_secs(state.config.http_window_secs);
            if !HttpRateLimiter::check(
                &state.http_rate_limiter.config_windows,
                client_ip,
                state.config.config_max_requests,
                window,
            ) {
                return simple(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            }
            config_response(state)
        }
        "/metrics" => metrics_response(req, state),
        path => {
            let window = std::time::Duration::from_secs(state.config.http_window_secs);
            if !HttpRateLimiter::check(
                &state.http_rate_limiter.static_windows,
                client_ip,
                state.config.static_max_requests,
                window,
            ) {
                return simple(StatusCode::TOO_MANY_REQUESTS, "rate limit exceeded");
            }
            static_asset_response(req, state, path).await
        }
    }
}

fn config_response(state: &RelayState) -> Response<Body> {
    let body = serde_json::to_vec(&crate::config::ClientConfig::from(state.config.as_ref()))
        .expect("client config always serializes");
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"))
}

fn metrics_response(req: &Request<Body>, state: &RelayState) -> Response<Body> {
    if !state.config.metrics_enabled {
        return simple(StatusCode::NOT_FOUND, "not found");
    }
    if let Some(expected) = &state.config.metrics_token {
        let provided = req
            .headers()
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok());
        if extract_bearer_token(provided) != Some(expected.as_str()) {
            let mut response = simple(StatusCode::UNAUTHORIZED, "missing or invalid bearer token");
            response
                .headers_mut()
                .insert(hyper::header::WWW_AUTHENTICATE, hyper::header::HeaderValue::from_static("Bearer"));
            return response;
        }
    }
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain; version=0.0.4")
        .body(Body::from(state.metrics.encode()))
        .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"))
}

/// Serves files under `static_root`. `None` disables `GET /` and every other path
/// (health/config/metrics stay up regardless, per spec.md §4.7).
async fn static_asset_response(req: &Request<Body>, state: &RelayState, path: &str) -> Response<Body> {
    let root = match &state.config.static_root {
        Some(root) => root,
        None => return simple(StatusCode::NOT_FOUND, "not found"),
    };

    let is_root = path == "/";
    let relative = if is_root { "index.html" } else { path.trim_start_matches('/') };
    let candidate = match resolve_within(root, relative) {
        Some(p) => p,
        None => return simple(StatusCode::FORBIDDEN, "forbidden"),
    };

    let metadata = match tokio::fs::metadata(&candidate).await {
        Ok(m) if m.is_file() => m,
        _ => return simple(StatusCode::NOT_FOUND, "not found"),
    };

    let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
    let etag = format!("\"{:x}-{:x}\"", metadata.len(), to_unix_secs(modified));
    let last_modified = httpdate::fmt_http_date(modified);

    // `/` itself is never cached (spec.md §6); only the other static assets get
    // ETag/Last-Modified conditional handling and a day-long cache lifetime.
    if !is_root && request_is_cached(req, &etag, modified) {
        return Response::builder()
            .status(StatusCode::NOT_MODIFIED)
            .header(ETAG, etag)
            .body(Body::empty())
            .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"));
    }

    let bytes = match tokio::fs::read(&candidate).await {
        Ok(b) => b,
        Err(error) => {
            warn!(event = "static_read_failed", path = %candidate.display(), %error);
            return simple(StatusCode::INTERNAL_SERVER_ERROR, "failed to read asset");
        }
    };

    let mut builder = Response::builder().status(StatusCode::OK).header(CONTENT_TYPE, content_type_for(&candidate));
    builder = if is_root {
        builder.header(CACHE_CONTROL, "no-store")
    } else {
        builder
            .header(ETAG, etag)
            .header(LAST_MODIFIED, last_modified)
            .header(CACHE_CONTROL, "public, max-age=86400")
    };
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| simple(StatusCode::INTERNAL_SERVER_ERROR, "failed to build response"))
}

fn request_is_cached(req: &Request<Body>, etag: &str, modified: SystemTime) -> bool {
    if let Some(candidate) = req.headers().get(IF_NONE_MATCH).and_then(|v| v.to_str().ok()) {
        if candidate == etag {
            return true;
        }
    }
    if let Some(since) = req.headers().get(IF_MODIFIED_SINCE).and_then(|v| v.to_str().ok()) {
        if let Ok(since) = httpdate::parse_http_date(since) {
            if modified <= since {
                return true;
            }
        }
    }
    false
}

/// Rejects `..` traversal and any path that resolves outside `root` (spec.md §4.7).
fn resolve_within(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.split('/').any(|segment| segment == ".." || segment == ".") {
        return None;
    }
    Some(root.join(relative))
}

fn to_unix_secs(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") => "application/javascript; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

fn simple(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain")
        .body(Body::from(message))
        .unwrap_or_else(|_| Response::new(Body::from(message)))
}

fn with_hsts(mut response: Response<Body>, state: &RelayState) -> Response<Body> {
    if state.config.hsts_enabled {
        if let Ok(value) = hyper::header::HeaderValue::from_str(&format!("max-age={}", state.config.hsts_max_age)) {
            response.headers_mut().insert(STRICT_TRANSPORT_SECURITY, value);
        }
    }
    response
}
