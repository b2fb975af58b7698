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

//! Pairing State Machine (spec §3 "Pairing", §4.3).
//!
//! Maintains `{PeerCode -> PeerState}` and enforces I1 (mutual exclusivity), I2
//! (self-freedom), and I3 (cleanup on close) while gating forwarding decisions.

use std::sync::Arc;

use dashmap::DashMap;

use crate::metrics::Metrics;
use crate::protocol::{PeerCode, SignalKind};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerState {
    Free,
    Dialing(PeerCode),
    Paired(PeerCode),
}

impl PeerState {
    fn counterpart(&self) -> Option<&PeerCode> {
        match self {
            PeerState::Free => None,
            PeerState::Dialing(c) | PeerState::Paired(c) => Some(c),
        }
    }
}

/// What the caller (the connection supervisor) should do with an inbound signal after
/// it has passed the state machine.
#[derive(Debug, PartialEq, Eq)]
pub enum Decision {
    /// Forward the original payload to `to`.
    Forward,
    /// Drop the frame; nothing is sent anywhere.
    Drop,
    /// Synthesize and send a `busy` reply to the sender (never to `to`).
    ReplyBusy,
}

/// Process-local pairing table. `PeerCode`s may reference peers that are not hosted
/// locally (I4); this table only ever mutates entries for codes that originate on this
/// instance — a remote peer's own `PeerState` lives on its own instance.
pub struct PairingTable {
    states: DashMap<PeerCode, PeerState>,
    metrics: Arc<Metrics>,
}

impl PairingTable {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self {
            states: DashMap::new(),
            metrics,
        }
    }

    /// Recompute and publish the `ws_pairs` gauge. Called after every mutation rather
    /// than on a timer so tests observe the gauge immediately.
    fn refresh_pairs_gauge(&self) {
        self.metrics.ws_pairs.set(self.mutual_pair_count() as i64);
    }

    fn state_of(&self, peer: &PeerCode) -> PeerState {
        self.states
            .get(peer)
            .map(|entry| entry.value().clone())
            .unwrap_or(PeerState::Free)
        // Note: not-present is equivalent to Free per spec.md §3 (Pairing[X]=∅ means
        // unpaired), so a missing entry and an explicit Free entry are interchangeable.
    }

    /// Evaluate one inbound signal of `kind` from `from` addressed `to`, mutating
    /// pairing state as the table in spec.md §4.3 dictates, and return what the caller
    /// should do with the payload.
    ///
    /// `from == to` is rejected by the caller before this is reached (a peer may not
    /// address itself); this function assumes `from != to`.
    pub fn on_signal(&self, kind: SignalKind, from: &PeerCode, to: &PeerCode) -> Decision {
        debug_assert_ne!(from, to);
        match kind {
            SignalKind::Offer => self.on_offer(from, to),
            SignalKind::Answer => self.on_answer(from, to),
            SignalKind::Candidate => self.on_candidate(from, to),
            SignalKind::Bye => self.on_bye(from, to),
            // `busy` is a server-synthesized message; clients may not send it inbound.
            SignalKind::Busy => Decision::Drop,
        }
    }

    fn on_offer(&self, from: &PeerCode, to: &PeerCode) -> Decision {
        let from_state = self.state_of(from);
        let from_ok = match &from_state {
            PeerState::Free => true,
            PeerState::Dialing(x) | PeerState::Paired(x) => x == to,
        };
        if !from_ok {
            // A's existing Dialing/Paired target is untouched; sender is told it's busy
            // about the *new* target it just tried to reach.
            return Decision::ReplyBusy;
        }

        let to_state = self.state_of(to);
        let to_ok = match &to_state {
            PeerState::Free => true,
            PeerState::Dialing(x) | PeerState::Paired(x) => x == from,
        };
        if !to_ok {
            return Decision::ReplyBusy;
        }

        self.states.insert(from.clone(), PeerState::Dialing(to.clone()));
        Decision::Forward
    }

    fn on_answer(&self, from: &PeerCode, to: &PeerCode) -> Decision {
        let from_state = self.state_of(from);
        let to_state = self.state_of(to);
        let from_matches = matches!(&from_state, PeerState::Dialing(x) | PeerState::Paired(x) if x == to);
        let to_matches = matches!(&to_state, PeerState::Dialing(x) | PeerState::Paired(x) if x == from);
        if !from_matches || !to_matches {
            return Decision::Drop;
        }
        self.states.insert(from.clone(), PeerState::Paired(to.clone()));
        self.states.insert(to.clone(), PeerState::Paired(from.clone()));
        self.refresh_pairs_gauge();
        Decision::Forward
    }

    fn on_candidate(&self, from: &PeerCode, to: &PeerCode) -> Decision {
        let from_state = self.state_of(from);
        let to_state = self.state_of(to);
        let mutually_paired = matches!(&from_state, PeerState::Paired(x) if x == to)
            && matches!(&to_state, PeerState::Paired(x) if x == from);
        let dialing_each_other = matches!(&from_state, PeerState::Dialing(x) if x == to)
            || matches!(&to_state, PeerState::Dialing(x) if x == from);
        let both_free = matches!(from_state, PeerState::Free) && matches!(to_state, PeerState::Free);
        if mutually_paired || dialing_each_other || both_free {
            Decision::Forward
        } else {
            Decision::Drop
        }
    }

    fn on_bye(&self, from: &PeerCode, to: &PeerCode) -> Decision {
        let from_state = self.state_of(from);
        if matches!(&from_state, PeerState::Dialing(x) | PeerState::Paired(x) if x == to) {
            self.states.insert(from.clone(), PeerState::Free);
        }
        let to_state = self.state_of(to);
        if matches!(&to_state, PeerState::Paired(x) if x == from) {
            self.states.insert(to.clone(), PeerState::Free);
        }
        self.refresh_pairs_gauge();
        // Unconditional per spec.md §4.3: forward regardless of whether the precondition
        // held, so the peer protocol's own `bye` semantics are not second-guessed here.
        Decision::Forward
    }

    /// Apply I3 for a connection that is closing: free `peer` and, if its counterpart
    /// considered `peer` its partner, free the counterpart too.
    pub fn on_close(&self, peer: &PeerCode) {
        if let Some((_, state)) = self.states.remove(peer) {
            if let Some(counterpart) = state.counterpart() {
                if let Some(mut entry) = self.states.get_mut(counterpart) {
                    if entry.value().counterpart() == Some(peer) {
                        *entry.value_mut() = PeerState::Free;
                    }
                }
            }
            self.refresh_pairs_gauge();
        }
    }

    /// `ws_pairs` gauge: number of mutual pairings, counted as unordered pairs.
    pub fn mutual_pair_count(&self) -> usize {
        let mut count = 0usize;
        for entry in self.states.iter() {
            if let PeerState::Paired(counterpart) = entry.value() {
                if counterpart > entry.key() {
                    count += 1;
                }
            }
        }
        count
    }

    #[cfg(test)]
    fn state(&self, peer: &PeerCode) -> PeerState {
        self.state_of(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(s: &str) -> PeerCode {
        PeerCode::from(s.to_string())
    }

    #[test]
    fn happy_path_offer_answer_candidate_bye() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");

        assert_eq!(table.on_signal(SignalKind::Offer, &a, &b), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Dialing(b.clone()));

        assert_eq!(table.on_signal(SignalKind::Answer, &b, &a), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Paired(b.clone()));
        assert_eq!(table.state(&b), PeerState::Paired(a.clone()));
        assert_eq!(table.mutual_pair_count(), 1);

        assert_eq!(table.on_signal(SignalKind::Candidate, &a, &b), Decision::Forward);
        assert_eq!(table.on_signal(SignalKind::Candidate, &b, &a), Decision::Forward);

        assert_eq!(table.on_signal(SignalKind::Bye, &a, &b), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Free);
        assert_eq!(table.state(&b), PeerState::Free);
        assert_eq!(table.mutual_pair_count(), 0);
    }

    #[test]
    fn busy_rejection_leaves_existing_pairing_untouched() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        let c = code("CCCCCCCC");

        table.on_signal(SignalKind::Offer, &a, &b);
        table.on_signal(SignalKind::Answer, &b, &a);
        assert_eq!(table.state(&a), PeerState::Paired(b.clone()));

        let decision = table.on_signal(SignalKind::Offer, &c, &a);
        assert_eq!(decision, Decision::ReplyBusy);
        assert_eq!(table.state(&a), PeerState::Paired(b.clone()));
        assert_eq!(table.state(&b), PeerState::Paired(a.clone()));
        assert_eq!(table.state(&c), PeerState::Free);
    }

    #[test]
    fn second_offer_to_different_peer_is_busy_without_disturbing_dialing() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        let c = code("CCCCCCCC");

        table.on_signal(SignalKind::Offer, &a, &b);
        let decision = table.on_signal(SignalKind::Offer, &a, &c);
        assert_eq!(decision, Decision::ReplyBusy);
        assert_eq!(table.state(&a), PeerState::Dialing(b));
    }

    #[test]
    fn simultaneous_offers_both_become_paired_on_first_answer() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");

        assert_eq!(table.on_signal(SignalKind::Offer, &a, &b), Decision::Forward);
        assert_eq!(table.on_signal(SignalKind::Offer, &b, &a), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Dialing(b.clone()));
        assert_eq!(table.state(&b), PeerState::Dialing(a.clone()));

        assert_eq!(table.on_signal(SignalKind::Answer, &a, &b), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Paired(b.clone()));
        assert_eq!(table.state(&b), PeerState::Paired(a.clone()));
    }

    #[test]
    fn answer_pairing_mismatch_is_dropped() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        assert_eq!(table.on_signal(SignalKind::Answer, &a, &b), Decision::Drop);
    }

    #[test]
    fn candidate_in_free_race_window_is_forwarded() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        assert_eq!(table.on_signal(SignalKind::Candidate, &a, &b), Decision::Forward);
    }

    #[test]
    fn candidate_to_unrelated_third_party_is_dropped() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        let c = code("CCCCCCCC");
        table.on_signal(SignalKind::Offer, &a, &b);
        table.on_signal(SignalKind::Answer, &b, &a);
        assert_eq!(table.on_signal(SignalKind::Candidate, &c, &a), Decision::Drop);
    }

    #[test]
    fn repeated_bye_is_idempotent() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        table.on_signal(SignalKind::Offer, &a, &b);
        table.on_signal(SignalKind::Answer, &b, &a);
        table.on_signal(SignalKind::Bye, &a, &b);
        assert_eq!(table.on_signal(SignalKind::Bye, &a, &b), Decision::Forward);
        assert_eq!(table.state(&a), PeerState::Free);
        assert_eq!(table.state(&b), PeerState::Free);
    }

    #[test]
    fn close_applies_i3_to_both_sides() {
        let table = PairingTable::new(Arc::new(Metrics::new()));
        let a = code("AAAAAAAA");
        let b = code("BBBBBBBB");
        table.on_signal(SignalKind::Offer, &a, &b);
        table.on_signal(SignalKind::Answer, &b, &a);
        table.on_close(&a);
        assert_eq!(table.state(&a), PeerState::Free);
        assert_eq!(table.state(&b), PeerState::Free);
    }

    /// Property-style check of invariants I1/I2 across a randomized sequence of
    /// offer/answer/bye among a small fixed pool of peers.
    #[test]
    fn invariants_hold_across_randomized_sequences() {
        use rand::Rng;

        let table = PairingTable::new(Arc::new(Metrics::new()));
        let peers: Vec<PeerCode> = (0..5).map(|i| code(&format!("PEER{i:04}"))).collect();
        let mut rng = rand::thread_rng();

        for _ in 0..2000 {
            let from = &peers[rng.gen_range(0..peers.len())];
            let mut to = &peers[rng.gen_range(0..peers.len())];
            while to == from {
                to = &peers[rng.gen_range(0..peers.len())];
            }
            let kind = [SignalKind::Offer, SignalKind::Answer, SignalKind::Bye][rng.gen_range(0..3)];
            table.on_signal(kind, from, to);

            // I2: nobody is paired/dialing itself.
            for p in &peers {
                match table.state(p) {
                    PeerState::Dialing(x) | PeerState::Paired(x) => assert_ne!(&x, p),
                    PeerState::Free => {}
                }
            }

            // I1: no peer is the mutual counterpart of two different peers.
            for p in &peers {
                let mutual_partners: Vec<_> = peers
                    .iter()
                    .filter(|other| {
                        matches!(table.state(other), PeerState::Paired(ref x) if x == p)
                            && matches!(table.state(p), PeerState::Paired(ref x) if x == *other)
                    })
                    .collect();
                assert!(mutual_partners.len() <= 1, "peer {p:?} has {mutual_partners:?}");
            }
        }
    }
}
