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

//! Per-IP concurrent connection accounting (spec §4.5 step 3, §5 "IP counters").

use std::net::IpAddr;

use dashmap::DashMap;

#[derive(Default)]
pub struct IpQuota {
    counts: DashMap<IpAddr, u32>,
}

impl IpQuota {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt to reserve a slot for `ip`. Returns `false` (and leaves the counter
    /// unchanged) if `ip` is already at `max`.
    pub fn try_acquire(&self, ip: IpAddr, max: u32) -> bool {
        let mut entry = self.counts.entry(ip).or_insert(0);
        if *entry >= max {
            false
        } else {
            *entry += 1;
            true
        }
    }

    /// Idempotent: releasing more than was acquired saturates at zero rather than
    /// underflowing, since teardown can race a failed upgrade in principle.
    pub fn release(&self, ip: IpAddr) {
        if let dashmap::mapref::entry::Entry::Occupied(mut entry) = self.counts.entry(ip) {
            let value = entry.get_mut();
            *value = value.saturating_sub(1);
            if *value == 0 {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_rejects_once_at_max() {
        let quota = IpQuota::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(quota.try_acquire(ip, 2));
        assert!(quota.try_acquire(ip, 2));
        assert!(!quota.try_acquire(ip, 2));
        quota.release(ip);
        assert!(quota.try_acquire(ip, 2));
    }

    #[test]
    fn release_without_acquire_does_not_underflow() {
        let quota = IpQuota::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        quota.release(ip);
        assert!(quota.try_acquire(ip, 1));
    }
}
