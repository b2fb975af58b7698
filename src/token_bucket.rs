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

//! Token bucket rate limiter (spec §3 "Connection", §4.4 step 2).
//!
//! Non-blocking arithmetic only: refilling and consuming a token never suspends, so it
//! is safe to call from inside a connection's read loop on every inbound frame.

use std::time::Instant;

#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            tokens: capacity as f64,
            capacity: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Refill by `elapsed * rate`, capped at capacity, then try to consume one token.
    /// Returns `true` if a token was available and consumed.
    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    fn try_consume_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn sustained_rate_never_exhausts_bucket() {
        let mut bucket = TokenBucket::new(5, 10.0);
        let mut now = Instant::now();
        for _ in 0..1000 {
            assert!(bucket.try_consume_at(now));
            now += Duration::from_millis(100); // one message every 100ms == 10/s == rate
        }
    }

    #[test]
    fn burst_of_capacity_plus_one_exhausts_at_t0() {
        let mut bucket = TokenBucket::new(2, 0.0);
        let now = Instant::now();
        assert!(bucket.try_consume_at(now));
        assert!(bucket.try_consume_at(now));
        assert!(!bucket.try_consume_at(now));
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let mut bucket = TokenBucket::new(3, 100.0);
        let now = Instant::now();
        bucket.try_consume_at(now);
        let later = now + Duration::from_secs(10); // would refill far past capacity
        assert!(bucket.try_consume_at(later));
        assert!(bucket.try_consume_at(later));
        assert!(!bucket.try_consume_at(later));
    }
}
