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

//! Relay Gateway (spec §4.5): hyper dispatch between the HTTP surface and WebSocket
//! upgrades, plus the heartbeat scheduler that sweeps every live connection.

use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use hyper::header::{HeaderValue, CONNECTION, UPGRADE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use sha1::{Digest, Sha1};
use tokio_tungstenite::tungstenite::protocol::{Role, WebSocketConfig};
use tokio_tungstenite::WebSocketStream;
use tracing::{error, info, warn};

use crate::connection::HeartbeatOutcome;
use crate::error::RelayError;
use crate::http;
use crate::shutdown::ShutdownSignal;
use crate::state::RelayState;
use crate::supervisor;

const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Interval between heartbeat sweeps of every live connection (spec.md §4.5).
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Hard protocol-level frame limit (spec.md §6, §8 boundary behavior). Independent of
/// the per-payload `offer`/`answer`/`candidate` limits enforced in
/// [`crate::supervisor`], which are smaller and checked after JSON decoding.
const MAX_INBOUND_FRAME_BYTES: usize = 256 * 1024;

/// Half-open guard (spec.md §4.5 step 4): a client that completes the HTTP 101 but never
/// actually drives the WebSocket upgrade must not hold its per-IP quota slot forever.
const HALF_OPEN_GUARD: Duration = Duration::from_secs(10);

/// Bind, serve HTTP + WebSocket upgrades, and run the heartbeat scheduler until
/// `shutdown` is triggered.
pub async fn run(state: Arc<RelayState>, shutdown: ShutdownSignal) -> Result<(), RelayError> {
    let addr: SocketAddr = ([0, 0, 0, 0], state.config.listen_port).into();

    let heartbeat_state = state.clone();
    let heartbeat_shutdown = shutdown.clone();
    tokio::spawn(heartbeat_sweep_loop(heartbeat_state, heartbeat_shutdown));

    let make_svc = make_service_fn(move |conn: &hyper::server::conn::AddrStream| {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let remote = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                dispatch(req, state.clone(), shutdown.clone(), remote)
            }))
        }
    });

    info!(event = "listening", %addr);
    let mut shutdown_wait = shutdown_signal_for_server(&shutdown);
    let server = Server::try_bind(&addr)?.serve(make_svc);
    server
        .with_graceful_shutdown(async move { shutdown_wait.wait().await })
        .await?;
    Ok(())
}

fn shutdown_signal_for_server(shutdown: &ShutdownSignal) -> ShutdownSignal {
    shutdown.clone()
}

async fn dispatch(
    req: Request<Body>,
    state: Arc<RelayState>,
    shutdown: ShutdownSignal,
    remote: SocketAddr,
) -> Result<Response<Body>, Infallible> {
    if req.uri().path() == state.config.ws_path {
        return Ok(handle_upgrade(req, state, shutdown, remote.ip()));
    }
    Ok(http::handle(req, &state, remote.ip()).await)
}

fn handle_upgrade(
    mut req: Request<Body>,
    state: Arc<RelayState>,
    shutdown: ShutdownSignal,
    client_ip: IpAddr,
) -> Response<Body> {
    let accept_key = match validate_upgrade(&req, &state, client_ip) {
        Ok(key) => key,
        Err(response) => return response,
    };

    if !state.ip_quota.try_acquire(client_ip, state.config.max_conns_per_ip) {
        return simple_response(StatusCode::TOO_MANY_REQUESTS, "too many connections from this address");
    }

    let on_upgrade = hyper::upgrade::on(&mut req);
    tokio::spawn(async move {
        match tokio::time::timeout(HALF_OPEN_GUARD, on_upgrade).await {
            Ok(Ok(upgraded)) => {
                let ws_config = WebSocketConfig {
                    max_message_size: Some(MAX_INBOUND_FRAME_BYTES),
                    max_frame_size: Some(MAX_INBOUND_FRAME_BYTES),
                    ..Default::default()
                };
                let ws = WebSocketStream::from_raw_socket(upgraded, Role::Server, Some(ws_config)).await;
                supervisor::run(ws, client_ip, state, shutdown).await;
            }
            Ok(Err(error)) => {
                state.ip_quota.release(client_ip);
                warn!(event = "upgrade_failed", %error);
            }
            Err(_elapsed) => {
                state.ip_quota.release(client_ip);
                warn!(event = "upgrade_half_open_timeout", ip = %client_ip);
            }
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(CONNECTION, "Upgrade")
        .header(UPGRADE, "websocket")
        .header("Sec-WebSocket-Accept", accept_key)
        .body(Body::empty())
        .unwrap_or_else(|_| simple_response(StatusCode::INTERNAL_SERVER_ERROR, "upgrade response build failed"))
}

/// Validate headers, origin, and path per spec.md §4.5 step 2. On success, returns the
/// computed `Sec-WebSocket-Accept` value.
fn validate_upgrade(req: &Request<Body>, state: &RelayState, client_ip: IpAddr) -> Result<String, Response<Body>> {
    if req.method() != hyper::Method::GET {
        return Err(simple_response(StatusCode::METHOD_NOT_ALLOWED, "expected GET"));
    }

    let has_upgrade_token = header_contains_token(req, CONNECTION.as_str(), "upgrade");
    let upgrade_is_websocket = req
        .headers()
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !has_upgrade_token || !upgrade_is_websocket {
        return Err(simple_response(StatusCode::BAD_REQUEST, "expected a WebSocket upgrade"));
    }

    let version_ok = req
        .headers()
        .get("Sec-WebSocket-Version")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == "13");
    if !version_ok {
        return Err(simple_response(StatusCode::BAD_REQUEST, "unsupported WebSocket version"));
    }

    let key = req
        .headers()
        .get("Sec-WebSocket-Key")
        .and_then(|v| v.to_str().ok());
    let key = match key {
        Some(k) => k,
        None => return Err(simple_response(StatusCode::BAD_REQUEST, "missing Sec-WebSocket-Key")),
    };

    let request_host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let origin = req
        .headers()
        .get(hyper::header::ORIGIN)
        .and_then(|v| v.to_str().ok());
    if !state.config.origin_allowed(origin, request_host) {
        warn!(event = "origin_rejected", origin, client_ip = %client_ip);
        return Err(simple_response(StatusCode::FORBIDDEN, "origin not allowed"));
    }

    Ok(accept_key_for(key))
}

fn header_contains_token(req: &Request<Body>, header: &str, token: &str) -> bool {
    req.headers()
        .get(header)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|part| part.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

fn accept_key_for(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn simple_response(status: StatusCode, message: &'static str) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, HeaderValue::from_static("text/plain"))
        .body(Body::from(message))
        .unwrap_or_else(|_| Response::new(Body::from(message)))
}

/// Sweep every live connection every [`HEARTBEAT_INTERVAL`], pinging those that
/// answered last round and terminating those that missed twice in a row
/// (spec.md §4.5, [`crate::connection::ConnectionHandle::sweep`]).
async fn heartbeat_sweep_loop(state: Arc<RelayState>, mut shutdown: ShutdownSignal) {
    let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            _ = interval.tick() => {
                for handle in state.registry.snapshot() {
                    match handle.sweep() {
                        HeartbeatOutcome::Ping => {
                            if !handle.request_ping() {
                                error!(event = "heartbeat_ping_dropped");
                            }
                        }
                        HeartbeatOutcome::Terminate => {
                            if !handle.request_close_for_heartbeat() {
                                error!(event = "heartbeat_close_dropped");
                            }
                        }
                    }
                }
            }
        }
    }
}
