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

//! Lifecycle Controller's shutdown signal (spec §4.9), modeled on the teacher's
//! `tari_shutdown` crate: a cloneable, awaitable signal triggered exactly once.
//!
//! `tari_shutdown` builds this on a `futures::future::Shared` oneshot; this relay is
//! already built entirely on `tokio`, so the tokio-native equivalent is a
//! `tokio::sync::watch` channel carrying a single `bool`.

use tokio::sync::watch;

#[derive(Debug)]
pub struct Shutdown {
    sender: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (sender, _receiver) = watch::channel(false);
        Self { sender }
    }

    pub fn to_signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            receiver: self.sender.subscribe(),
        }
    }

    /// Trigger shutdown. Idempotent: triggering twice is a no-op the second time.
    pub fn trigger(&self) {
        let _ = self.sender.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.sender.borrow()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A clone of the shutdown signal, handed to every long-lived task. Awaiting it
/// resolves once `Shutdown::trigger` is called; it is cheap to clone and poll from a
/// `select!` alongside other work.
#[derive(Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn is_triggered(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolves once shutdown has been triggered. Safe to call repeatedly / from a
    /// `select!` loop.
    pub async fn wait(&mut self) {
        if self.is_triggered() {
            return;
        }
        // `changed` only errors if the sender was dropped, which only happens if the
        // owning `Shutdown` itself is dropped — treat that the same as triggered.
        let _ = self.receiver.changed().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_after_trigger() {
        let shutdown = Shutdown::new();
        let mut signal = shutdown.to_signal();
        assert!(!signal.is_triggered());
        shutdown.trigger();
        signal.wait().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn multiple_signals_all_observe_trigger() {
        let shutdown = Shutdown::new();
        let mut a = shutdown.to_signal();
        let mut b = shutdown.to_signal();
        shutdown.trigger();
        a.wait().await;
        b.wait().await;
    }
}
