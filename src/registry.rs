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

//! Peer Registry (spec §4.2): process-local mapping of peer code to live connection
//! handle, plus the invariant that a `Connection` is present iff it is open and has
//! been welcomed.

use dashmap::DashMap;

use crate::connection::ConnectionHandle;
use crate::protocol::PeerCode;

#[derive(Default)]
pub struct PeerRegistry {
    connections: DashMap<PeerCode, ConnectionHandle>,
}

#[derive(Debug, thiserror::Error)]
#[error("peer code {0} already registered")]
pub struct AlreadyRegistered(pub PeerCode);

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if `code` is already present. Per spec.md §4.2 this should not occur in
    /// practice since codes are unique per process run.
    pub fn insert(&self, code: PeerCode, handle: ConnectionHandle) -> Result<(), AlreadyRegistered> {
        match self.connections.entry(code.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(AlreadyRegistered(code)),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(handle);
                Ok(())
            }
        }
    }

    pub fn lookup(&self, code: &PeerCode) -> Option<ConnectionHandle> {
        self.connections.get(code).map(|entry| entry.value().clone())
    }

    /// Idempotent: removing an absent code is a no-op.
    pub fn remove(&self, code: &PeerCode) {
        self.connections.remove(code);
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of every currently registered handle, for the heartbeat sweep
    /// (spec.md §4.5). Cheap clones; does not hold the map locked while sweeping.
    pub fn snapshot(&self) -> Vec<ConnectionHandle> {
        self.connections.iter().map(|entry| entry.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::Mailbox;
    use tokio::sync::mpsc;

    fn handle() -> ConnectionHandle {
        let (tx, _rx) = mpsc::channel::<Mailbox>(8);
        ConnectionHandle::new(tx)
    }

    #[test]
    fn insert_lookup_remove_round_trip() {
        let registry = PeerRegistry::new();
        let code = PeerCode::from("AAAAAAAA".to_string());
        assert!(registry.lookup(&code).is_none());
        registry.insert(code.clone(), handle()).unwrap();
        assert!(registry.lookup(&code).is_some());
        assert_eq!(registry.size(), 1);
        registry.remove(&code);
        assert!(registry.lookup(&code).is_none());
        assert_eq!(registry.size(), 0);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = PeerRegistry::new();
        let code = PeerCode::from("AAAAAAAA".to_string());
        registry.remove(&code);
        registry.remove(&code);
    }

    #[test]
    fn duplicate_insert_fails() {
        let registry = PeerRegistry::new();
        let code = PeerCode::from("AAAAAAAA".to_string());
        registry.insert(code.clone(), handle()).unwrap();
        assert!(registry.insert(code, handle()).is_err());
    }
}
