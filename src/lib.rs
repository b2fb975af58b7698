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

//! Browser-to-browser WebRTC signaling rendezvous relay.
//!
//! [`run`] is the Lifecycle Controller (spec §4.9): load config, init observability,
//! open the HTTP surface, start the heartbeat scheduler, optionally connect the
//! cross-instance bus, then listen until a termination signal arrives.

pub mod bus;
pub mod cli;
pub mod config;
pub mod connection;
pub mod error;
pub mod gateway;
pub mod http;
pub mod ip_quota;
pub mod logging;
pub mod metrics;
pub mod pairing;
pub mod protocol;
pub mod registry;
pub mod shutdown;
pub mod state;
pub mod supervisor;
pub mod token_bucket;

use std::sync::Arc;

use tracing::{error, info};

pub use cli::Cli;
pub use config::RelayConfig;
pub use error::RelayError;
pub use state::RelayState;

use bus::{NullBus, RedisBus, SignalBus};
use shutdown::Shutdown;

/// Run the relay to completion: blocks until a termination signal is received and the
/// bounded drain window (spec §4.9, ≈5s) elapses or every task exits cleanly first.
pub async fn run(config: RelayConfig) -> Result<(), RelayError> {
    logging::init(&config.log_level);
    info!(event = "startup", listen_port = config.listen_port, ws_path = %config.ws_path);

    let bus: Arc<dyn SignalBus> = match &config.bus_url {
        Some(url) => Arc::new(
            RedisBus::new(url, config.bus_prefix.clone(), config.node_id.clone())
                .map_err(|e| RelayError::Bus(e.to_string()))?,
        ),
        None => Arc::new(NullBus),
    };

    let state = RelayState::new(config, bus);
    let shutdown = Shutdown::new();

    let bus_listener = tokio::spawn(run_bus_listener(state.clone(), shutdown.to_signal()));
    let gateway = tokio::spawn(gateway::run(state.clone(), shutdown.to_signal()));

    tokio::select! {
        _ = wait_for_termination_signal() => {
            info!(event = "shutdown_signal_received");
        }
        result = gateway_result(&mut { gateway }) => {
            if let Err(error) = &result {
                error!(event = "gateway_task_failed", %error);
            }
            shutdown.trigger();
            return result;
        }
    }

    shutdown.trigger();

    let drain = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        let _ = bus_listener.await;
    });
    if drain.await.is_err() {
        error!(event = "shutdown_drain_timed_out");
        return Err(RelayError::ShutdownTimedOut);
    }

    info!(event = "shutdown_complete");
    Ok(())
}

async fn gateway_result(
    handle: &mut tokio::task::JoinHandle<Result<(), RelayError>>,
) -> Result<(), RelayError> {
    match handle.await {
        Ok(result) => result,
        Err(join_error) => Err(RelayError::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            join_error.to_string(),
        ))),
    }
}

/// Background task that feeds bus-delivered cross-instance signals back into local
/// connections, per spec.md §4.6's "subscribes ... and, on receipt, looks up `to`
/// locally and delivers as a RelayedEnvelope."
async fn run_bus_listener(state: Arc<RelayState>, mut shutdown: shutdown::ShutdownSignal) {
    let mut inbound = state.bus.subscribe();
    loop {
        tokio::select! {
            _ = shutdown.wait() => return,
            message = inbound.recv() => {
                match message {
                    Some(message) => deliver_cross_instance(&state, message).await,
                    None => return,
                }
            }
        }
    }
}

async fn deliver_cross_instance(state: &Arc<RelayState>, message: protocol::CrossInstanceMessage) {
    if let Some(destination) = state.registry.lookup(&message.to) {
        let envelope = protocol::RelayedEnvelope::new(message.from.clone(), message.payload);
        if !destination.try_send(connection::OutboundMessage::Relayed(envelope)) {
            state.metrics.record_error();
        }
    }
    // Not found locally either: this instance has nothing more to do with it. The
    // directory check at the origin means this should be rare, not an error.
}

#[cfg(unix)]
async fn wait_for_termination_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
