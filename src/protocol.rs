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

//! Wire types exchanged with browser clients and, optionally, other relay instances.
//!
//! The relay never interprets payload contents beyond the discriminating `type` field
//! and the serialized size of the whole frame (see [`crate::config::RelayConfig`] for the
//! size limits). Everything else is passed through as an opaque [`serde_json::Value`].

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Opaque identifier minted by the relay at connect time. Unique within the process for
/// the lifetime of the connection; never reused within a run.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerCode(String);

impl PeerCode {
    const LEN: usize = 8;

    /// Mint a fresh, process-unique-enough code. Collisions are not checked here; the
    /// caller (the peer registry) is the source of truth and `insert` fails on collision.
    pub fn generate() -> Self {
        let code: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(Self::LEN)
            .map(char::from)
            .collect();
        Self(code)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for PeerCode {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// The discriminator carried in `payload.type`. Unknown tags are rejected at validation
/// and never reach the pairing state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalKind {
    Offer,
    Answer,
    Candidate,
    Bye,
    Busy,
}

impl SignalKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalKind::Offer => "offer",
            SignalKind::Answer => "answer",
            SignalKind::Candidate => "candidate",
            SignalKind::Bye => "bye",
            SignalKind::Busy => "busy",
        }
    }
}

/// An inbound opaque payload. Only `type` is read by the relay; every other field is
/// carried through unparsed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Payload {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(flatten)]
    pub rest: serde_json::Map<String, serde_json::Value>,
}

/// `{ "to": "<PeerCode>", "type"?: "list", "payload": {...} }`
#[derive(Clone, Debug, Deserialize)]
pub struct InboundFrame {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(rename = "type", default)]
    pub request: Option<String>,
    #[serde(default)]
    pub payload: Option<serde_json::Value>,
}

/// `{ "from": "<PeerCode>", "type": "signal", "payload": {...} }`
#[derive(Clone, Debug, Serialize)]
pub struct RelayedEnvelope {
    pub from: PeerCode,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub payload: serde_json::Value,
}

impl RelayedEnvelope {
    pub fn new(from: PeerCode, payload: serde_json::Value) -> Self {
        Self {
            from,
            kind: "signal",
            payload,
        }
    }

    pub fn busy(from: PeerCode) -> Self {
        Self::new(from, serde_json::json!({ "type": "busy" }))
    }
}

/// Every shape the server ever writes to a client socket. Each variant has a distinct
/// wire shape (`welcome`/`peers` are tagged by `type`; a relayed envelope is tagged by
/// `type` too but carries `from` instead of `id`), so this implements `Serialize` by
/// hand rather than forcing one `#[serde(tag = ..)]` shape on all of them.
#[derive(Clone, Debug)]
pub enum OutboundMessage {
    Welcome { id: PeerCode },
    Peers { peers: Vec<PeerCode> },
    Relayed(RelayedEnvelope),
}

impl Serialize for OutboundMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            OutboundMessage::Welcome { id } => {
                #[derive(Serialize)]
                struct Wire<'a> {
                    #[serde(rename = "type")]
                    kind: &'static str,
                    id: &'a PeerCode,
                }
                Wire { kind: "welcome", id }.serialize(serializer)
            }
            OutboundMessage::Peers { peers } => {
                #[derive(Serialize)]
                struct Wire<'a> {
                    #[serde(rename = "type")]
                    kind: &'static str,
                    peers: &'a [PeerCode],
                }
                Wire {
                    kind: "peers",
                    peers,
                }
                .serialize(serializer)
            }
            OutboundMessage::Relayed(envelope) => envelope.serialize(serializer),
        }
    }
}

/// Message carried over the cross-instance bus. Pairing gating already happened on the
/// originating instance; the recipient instance is a dumb delivery endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CrossInstanceMessage {
    pub to: PeerCode,
    pub from: PeerCode,
    pub payload: serde_json::Value,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub origin_instance: String,
}

impl CrossInstanceMessage {
    pub fn new(to: PeerCode, from: PeerCode, payload: serde_json::Value, origin_instance: String) -> Self {
        Self {
            to,
            from,
            payload,
            kind: "signal",
            origin_instance,
        }
    }
}

/// Close codes used when the relay initiates a WebSocket close.
pub mod close_code {
    pub const NORMAL_IDLE: u16 = 1000;
    pub const PROTOCOL_RATE: u16 = 1008;
    pub const GOING_AWAY: u16 = 1001;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_codes_are_distinct_with_overwhelming_probability() {
        let a = PeerCode::generate();
        let b = PeerCode::generate();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), PeerCode::LEN);
    }

    #[test]
    fn payload_round_trips_unknown_fields() {
        let raw = serde_json::json!({
            "type": "offer",
            "sdp": {"type": "offer", "sdp": "v=0..."},
            "extra": 42
        });
        let payload: Payload = serde_json::from_value(raw).unwrap();
        assert_eq!(payload.kind, SignalKind::Offer);
        assert_eq!(payload.rest.get("extra").unwrap(), 42);
    }
}
