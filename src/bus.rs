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

//! Cross-Instance Bus (spec §4.6, optional). Pure fan-out: pairing state is never
//! replicated, only forwarded signals and directory entries cross the bus.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::{CrossInstanceMessage, PeerCode};

#[async_trait]
pub trait SignalBus: Send + Sync {
    /// Record `{code -> this instance}` in the shared directory.
    async fn register(&self, code: &PeerCode);

    /// Remove this instance's directory entry for `code`.
    async fn unregister(&self, code: &PeerCode);

    /// Publish a signal for a peer not hosted locally. Best-effort, at-most-once.
    async fn publish(&self, message: CrossInstanceMessage);

    /// Subscribe to inbound cross-instance signals. Returns a channel fed by a
    /// background task for as long as the bus is alive.
    fn subscribe(&self) -> mpsc::Receiver<CrossInstanceMessage>;

    /// `false` for [`NullBus`]. Distinguishes "no cross-instance fan-out is possible"
    /// from "fan-out was attempted" so the caller knows whether a local registry miss
    /// followed by a publish actually had anywhere to go.
    fn is_configured(&self) -> bool;
}

/// No-op bus used when no cross-instance URL is configured. `subscribe` returns a
/// receiver that never yields.
pub struct NullBus;

#[async_trait]
impl SignalBus for NullBus {
    async fn register(&self, _code: &PeerCode) {}
    async fn unregister(&self, _code: &PeerCode) {}
    async fn publish(&self, _message: CrossInstanceMessage) {}
    fn subscribe(&self) -> mpsc::Receiver<CrossInstanceMessage> {
        let (_tx, rx) = mpsc::channel(1);
        rx
    }
    fn is_configured(&self) -> bool {
        false
    }
}

/// Redis-backed bus: a shared directory hash `{prefix}peers` and a pub/sub channel
/// `{prefix}signals`, per spec.md §6's persisted-state layout.
pub struct RedisBus {
    prefix: String,
    node_id: String,
    client: redis::Client,
}

impl RedisBus {
    pub fn new(url: &str, prefix: String, node_id: String) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        Ok(Self { prefix, node_id, client })
    }

    fn directory_key(&self) -> String {
        format!("{}peers", self.prefix)
    }

    fn channel_name(&self) -> String {
        format!("{}signals", self.prefix)
    }
}

#[async_trait]
impl SignalBus for RedisBus {
    async fn register(&self, code: &PeerCode) {
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("HSET")
                .arg(self.directory_key())
                .arg(code.as_str())
                .arg(&self.node_id)
                .query_async(&mut conn)
                .await
        }
        .await;
        if let Err(error) = result {
            warn!(event = "bus_register_failed", peer = %code, %error);
        }
    }

    async fn unregister(&self, code: &PeerCode) {
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("HDEL")
                .arg(self.directory_key())
                .arg(code.as_str())
                .query_async(&mut conn)
                .await
        }
        .await;
        if let Err(error) = result {
            warn!(event = "bus_unregister_failed", peer = %code, %error);
        }
    }

    async fn publish(&self, message: CrossInstanceMessage) {
        let payload = match serde_json::to_string(&message) {
            Ok(p) => p,
            Err(error) => {
                warn!(event = "bus_publish_encode_failed", %error);
                return;
            }
        };
        let result: redis::RedisResult<()> = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            redis::cmd("PUBLISH")
                .arg(self.channel_name())
                .arg(payload)
                .query_async(&mut conn)
                .await
        }
        .await;
        if let Err(error) = result {
            warn!(event = "bus_publish_failed", to = %message.to, %error);
        }
    }

    fn subscribe(&self) -> mpsc::Receiver<CrossInstanceMessage> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let channel = self.channel_name();
        tokio::spawn(async move {
            loop {
                match client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(error) = pubsub.subscribe(&channel).await {
                            warn!(event = "bus_subscribe_failed", %error);
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        use tokio_stream::StreamExt;
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(error) => {
                                    warn!(event = "bus_payload_decode_failed", %error);
                                    continue;
                                }
                            };
                            match serde_json::from_str::<CrossInstanceMessage>(&payload) {
                                Ok(message) => {
                                    debug!(event = "bus_message_received", to = %message.to);
                                    if tx.send(message).await.is_err() {
                                        return;
                                    }
                                }
                                Err(error) => warn!(event = "bus_message_decode_failed", %error),
                            }
                        }
                    }
                    Err(error) => {
                        warn!(event = "bus_connect_failed", %error);
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });
        rx
    }

    fn is_configured(&self) -> bool {
        true
    }
}
