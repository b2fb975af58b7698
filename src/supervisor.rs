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

//! Connection Supervisor (spec §4.4): owns one connection's read loop, token bucket,
//! idle timer, heartbeat interaction, and teardown.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionHandle, Mailbox, OutboundMessage, OUTBOUND_QUEUE_DEPTH};
use crate::pairing::Decision;
use crate::protocol::{
    close_code, CrossInstanceMessage, InboundFrame, Payload, PeerCode, RelayedEnvelope, SignalKind,
};
use crate::shutdown::ShutdownSignal;
use crate::state::RelayState;
use crate::token_bucket::TokenBucket;

/// No signaling message for this long closes the connection with reason "idle"
/// (spec.md §3, §8). Never rearmed once cancelled.
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_SESSION_DESCRIPTION_BYTES: usize = 200_000;
const MAX_CANDIDATE_BYTES: usize = 50_000;

enum Outcome {
    Idle,
    Rate,
    HeartbeatMissed,
    GoingAway,
    ClientClosed,
    ReadError,
}

/// Drive one connection end to end: welcome, register, read loop, teardown. Returns
/// once the socket is closed for any reason.
pub async fn run<S>(ws: WebSocketStream<S>, client_ip: IpAddr, state: Arc<RelayState>, mut shutdown: ShutdownSignal)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let code = PeerCode::generate();
    let (mailbox_tx, mut mailbox_rx) = mpsc::channel::<Mailbox>(OUTBOUND_QUEUE_DEPTH);
    let handle = ConnectionHandle::new(mailbox_tx);
    let connection = Connection::new(code.clone(), client_ip, state.config.node_id.clone(), handle.clone());
    let mut rate_limiter = TokenBucket::new(state.config.ws_message_burst, state.config.ws_message_rate);

    let (mut sink, mut stream) = ws.split();

    // Step 1: welcome, before anything else is written (spec.md §5 ordering guarantee).
    if sink
        .send(to_ws_message(&OutboundMessage::Welcome { id: code.clone() }))
        .await
        .is_err()
    {
        return;
    }

    // Step 2: register, then announce to the bus if configured.
    if state.registry.insert(code.clone(), handle.clone()).is_err() {
        warn!(event = "duplicate_peer_code", peer = %code);
        return;
    }
    state.bus.register(&code).await;
    state.metrics.ws_clients.set(state.registry.size() as i64);
    info!(event = "connected", peer = %code, ip = %client_ip);

    // Step 3: idle-cancel, one-shot, never rearmed.
    let mut idle_deadline: Option<Instant> = Some(Instant::now() + IDLE_TIMEOUT);

    let outcome = loop {
        let idle_sleep = async {
            match idle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;

            _ = shutdown.wait() => break Outcome::GoingAway,

            _ = idle_sleep => break Outcome::Idle,

            mailbox = mailbox_rx.recv() => {
                match mailbox {
                    Some(Mailbox::Outbound(message)) => {
                        if sink.send(to_ws_message(&message)).await.is_err() {
                            break Outcome::ReadError;
                        }
                    }
                    Some(Mailbox::SendPing) => {
                        if sink.send(Message::Ping(Vec::new())).await.is_err() {
                            break Outcome::ReadError;
                        }
                    }
                    Some(Mailbox::CloseDueToHeartbeat) => break Outcome::HeartbeatMissed,
                    None => break Outcome::ReadError,
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        match handle_text_frame(&text, &code, &state, &handle, &mut rate_limiter).await {
                            FrameOutcome::Continue => {}
                            FrameOutcome::ResetIdle => idle_deadline = None,
                            FrameOutcome::RateExceeded => break Outcome::Rate,
                        }
                    }
                    Some(Ok(Message::Pong(_))) => handle.mark_alive(),
                    Some(Ok(Message::Ping(_))) => {
                        // tokio-tungstenite auto-queues the matching Pong frame.
                    }
                    Some(Ok(Message::Close(_))) => break Outcome::ClientClosed,
                    Some(Ok(Message::Binary(_) | Message::Frame(_))) => {
                        state.metrics.record_error();
                    }
                    Some(Err(_)) => break Outcome::ReadError,
                    None => break Outcome::ClientClosed,
                }
            }
        }
    };

    close_with(&mut sink, &outcome).await;
    teardown(&connection, &state, &outcome).await;
}

async fn close_with<S>(sink: &mut futures::stream::SplitSink<WebSocketStream<S>, Message>, outcome: &Outcome)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = match outcome {
        Outcome::Idle => Some((close_code::NORMAL_IDLE, "idle")),
        Outcome::Rate => Some((close_code::PROTOCOL_RATE, "rate")),
        Outcome::GoingAway => Some((close_code::GOING_AWAY, "going-away")),
        Outcome::HeartbeatMissed | Outcome::ClientClosed | Outcome::ReadError => None,
    };
    if let Some((code, reason)) = frame {
        let _ = sink
            .send(Message::Close(Some(tokio_tungstenite::tungstenite::protocol::CloseFrame {
                code: code.into(),
                reason: reason.into(),
            })))
            .await;
    }
    let _ = sink.close().await;
}

async fn teardown(connection: &Connection, state: &Arc<RelayState>, outcome: &Outcome) {
    let code = &connection.code;
    state.registry.remove(code);
    state.pairing.on_close(code);
    state.ip_quota.release(connection.client_ip);
    state.bus.unregister(code).await;
    state.metrics.ws_clients.set(state.registry.size() as i64);
    let reason = match outcome {
        Outcome::Idle => "idle",
        Outcome::Rate => "rate",
        Outcome::HeartbeatMissed => "heartbeat",
        Outcome::GoingAway => "going-away",
        Outcome::ClientClosed => "client-closed",
        Outcome::ReadError => "read-error",
    };
    let session_secs = connection.created_at.elapsed().as_secs_f64();
    info!(event = "disconnected", peer = %code, reason, session_secs);
}

enum FrameOutcome {
    Continue,
    ResetIdle,
    RateExceeded,
}

async fn handle_text_frame(
    text: &str,
    own_code: &PeerCode,
    state: &Arc<RelayState>,
    own_handle: &ConnectionHandle,
    rate_limiter: &mut TokenBucket,
) -> FrameOutcome {
    // Decode inbound frame as JSON; malformed -> count error, ignore frame entirely
    // (spec.md §4.4 step 4: this does not reach the token bucket).
    let frame: InboundFrame = match serde_json::from_str(text) {
        Ok(f) => f,
        Err(_) => {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
    };

    // One token per syntactically valid frame, including `list`, consumed before any
    // dispatch (spec.md §4.4 step 2). Exhaustion closes the connection with code 1008.
    if !rate_limiter.try_consume() {
        state.metrics.record_error();
        return FrameOutcome::RateExceeded;
    }

    if frame.request.as_deref() == Some("list") {
        own_handle.try_send(OutboundMessage::Peers { peers: Vec::new() });
        return FrameOutcome::Continue;
    }

    validate_and_dispatch(frame, own_code, state, own_handle).await
}

async fn validate_and_dispatch(
    frame: InboundFrame,
    own_code: &PeerCode,
    state: &Arc<RelayState>,
    own_handle: &ConnectionHandle,
) -> FrameOutcome {
    let to = match frame.to.map(PeerCode::from) {
        Some(to) if &to != own_code => to,
        Some(_) => {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
        None => {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
    };

    let raw_payload = match frame.payload {
        Some(p) => p,
        None => {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
    };

    let payload: Payload = match serde_json::from_value(raw_payload.clone()) {
        Ok(p) => p,
        Err(_) => {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
    };

    if payload.kind == SignalKind::Busy {
        // Clients may never originate a `busy`; the relay only ever synthesizes it.
        state.metrics.record_error();
        return FrameOutcome::Continue;
    }

    let limit = match payload.kind {
        SignalKind::Offer | SignalKind::Answer => Some(MAX_SESSION_DESCRIPTION_BYTES),
        SignalKind::Candidate => Some(MAX_CANDIDATE_BYTES),
        SignalKind::Bye | SignalKind::Busy => None,
    };
    if let Some(limit) = limit {
        let size = serde_json::to_vec(&raw_payload).map(|v| v.len()).unwrap_or(usize::MAX);
        if size > limit {
            state.metrics.record_error();
            return FrameOutcome::Continue;
        }
    }

    let decision = state.pairing.on_signal(payload.kind, own_code, &to);
    match decision {
        Decision::Forward => {
            deliver(own_code, &to, raw_payload, payload.kind, state).await;
        }
        Decision::ReplyBusy => {
            own_handle.try_send(OutboundMessage::Relayed(RelayedEnvelope::busy(to.clone())));
        }
        Decision::Drop => {}
    }

    FrameOutcome::ResetIdle
}

async fn deliver(
    from: &PeerCode,
    to: &PeerCode,
    payload: serde_json::Value,
    kind: SignalKind,
    state: &Arc<RelayState>,
) {
    if let Some(destination) = state.registry.lookup(to) {
        let envelope = RelayedEnvelope::new(from.clone(), payload);
        if destination.try_send(OutboundMessage::Relayed(envelope)) {
            state.metrics.record_forward(kind.as_str());
        } else {
            state.metrics.record_error();
        }
        return;
    }

    // Local miss: fan out over the cross-instance bus only if one is actually wired up.
    // `NullBus::is_configured` is `false`, so an instance with no bus counts this as a
    // plain forward miss rather than a phantom "forwarded" signal.
    if state.bus.is_configured() {
        let message = CrossInstanceMessage::new(to.clone(), from.clone(), payload, state.config.node_id.clone());
        state.bus.publish(message).await;
        state.metrics.record_forward(kind.as_str());
        return;
    }
    // Destination unknown anywhere reachable from this instance. Per spec.md §7
    // ("Peer not found") this is not an error and is not counted.
    debug!(event = "forward_miss", from = %from, to = %to, kind = kind.as_str());
}

fn to_ws_message(message: &OutboundMessage) -> Message {
    Message::Text(serde_json::to_string(message).expect("outbound messages always serialize"))
}
