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

//! Connection record (spec §3 "Connection") and the handle other tasks use to write to
//! it.
//!
//! A [`Connection`] is owned exclusively by its [`crate::supervisor::ConnectionSupervisor`]
//! task. Everything else — the peer registry, a forwarding supervisor, the heartbeat
//! sweep — only ever touches the cheaply-cloneable [`ConnectionHandle`], never the
//! socket itself, per the ownership model in spec.md §5.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;

pub use crate::protocol::OutboundMessage;

/// Outbound mailbox depth per connection (spec.md §9: "bounded per-connection outbound
/// queue with drop-newest-and-count on saturation").
pub const OUTBOUND_QUEUE_DEPTH: usize = 32;

/// Two consecutive missed heartbeat acknowledgements terminate a connection
/// (spec.md §4.4 step 5).
pub const MAX_MISSED_HEARTBEATS: u8 = 2;

/// Everything that can land in a connection's mailbox: relayed signals destined for it,
/// and control instructions from the gateway's heartbeat scheduler. One channel carries
/// both so the supervisor's read loop only has to drain a single source for
/// cross-task input, matching the "outbound writes are best-effort, single mailbox"
/// shape spec.md §9 describes.
#[derive(Debug)]
pub enum Mailbox {
    Outbound(OutboundMessage),
    SendPing,
    CloseDueToHeartbeat,
}

/// A cheap, `Clone`-able reference to a connection's outbound mailbox and liveness
/// bookkeeping. Safe to hold from any task; never blocks the holder's own read loop.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<Mailbox>,
    alive: Arc<AtomicBool>,
    missed_heartbeats: Arc<AtomicU8>,
}

/// What the gateway's heartbeat sweep should do with a connection this tick.
#[derive(Debug, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    Ping,
    Terminate,
}

impl ConnectionHandle {
    pub fn new(sender: mpsc::Sender<Mailbox>) -> Self {
        Self {
            sender,
            alive: Arc::new(AtomicBool::new(true)),
            missed_heartbeats: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Best-effort write: if the mailbox is saturated, the message is dropped rather
    /// than blocking the caller. Returns `false` on drop so the caller can count an
    /// error, per spec.md §4.4's "Write policy."
    pub fn try_send(&self, message: OutboundMessage) -> bool {
        self.sender.try_send(Mailbox::Outbound(message)).is_ok()
    }

    /// Called by the supervisor itself on receipt of a pong.
    pub fn mark_alive(&self) {
        self.alive.store(true, Ordering::Relaxed);
        self.missed_heartbeats.store(0, Ordering::Relaxed);
    }

    /// Called once per heartbeat sweep tick (spec.md §4.5): mark not-alive, then ping,
    /// or terminate if this is the second consecutive miss.
    pub fn sweep(&self) -> HeartbeatOutcome {
        let was_alive = self.alive.swap(false, Ordering::Relaxed);
        if was_alive {
            HeartbeatOutcome::Ping
        } else {
            let missed = self.missed_heartbeats.fetch_add(1, Ordering::Relaxed) + 1;
            if missed >= MAX_MISSED_HEARTBEATS {
                HeartbeatOutcome::Terminate
            } else {
                HeartbeatOutcome::Ping
            }
        }
    }

    pub fn request_ping(&self) -> bool {
        self.sender.try_send(Mailbox::SendPing).is_ok()
    }

    pub fn request_close_for_heartbeat(&self) -> bool {
        self.sender.try_send(Mailbox::CloseDueToHeartbeat).is_ok()
    }
}

/// Metadata tracked for one attached endpoint, per spec.md §3. The socket and the idle
/// timer are not stored here: they are task-local to the owning supervisor (spec.md §9
/// — "no implicit lifetime tied to the socket's read loop").
pub struct Connection {
    pub code: crate::protocol::PeerCode,
    pub created_at: Instant,
    pub client_ip: IpAddr,
    pub instance: String,
    pub handle: ConnectionHandle,
}

impl Connection {
    pub fn new(
        code: crate::protocol::PeerCode,
        client_ip: IpAddr,
        instance: String,
        handle: ConnectionHandle,
    ) -> Self {
        Self {
            code,
            created_at: Instant::now(),
            client_ip,
            instance,
            handle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_requires_two_consecutive_misses_to_terminate() {
        let (tx, _rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx);
        // Freshly created: alive=true, so first sweep just pings and resets.
        assert_eq!(handle.sweep(), HeartbeatOutcome::Ping);
        // No mark_alive in between -> first genuine miss.
        assert_eq!(handle.sweep(), HeartbeatOutcome::Ping);
        // Second consecutive miss -> terminate.
        assert_eq!(handle.sweep(), HeartbeatOutcome::Terminate);
    }

    #[test]
    fn mark_alive_resets_miss_counter() {
        let (tx, _rx) = mpsc::channel(8);
        let handle = ConnectionHandle::new(tx);
        handle.sweep(); // consumes initial alive=true
        handle.mark_alive();
        assert_eq!(handle.sweep(), HeartbeatOutcome::Ping);
    }
}
