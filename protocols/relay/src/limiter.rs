// Copyright 2021 dep2p contributors.
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Unified rate and resource limiter shared by the relay client and server.
//!
//! One set of tunables covers reservations and circuits alike. A zero
//! count cap means unbounded; zero bandwidth means no throttle.

use dep2p_core::{Error, PeerId, Result};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// How long a reservation request record stays fresh. A re-issue by the
/// same peer within this window is treated as a refresh and admitted
/// without a second cap check.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Copy, Debug)]
pub struct LimiterConfig {
    /// Bytes per second; 0 disables the throttle.
    pub max_bandwidth: u64,
    /// Total circuits; 0 means unbounded.
    pub max_connections: usize,
    /// Circuits per peer; 0 means unbounded.
    pub max_connections_per_peer: usize,
    /// Circuits idle longer than this are scrubbed.
    pub idle_timeout: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            max_bandwidth: 0,
            max_connections: 0,
            max_connections_per_peer: 0,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

/// Snapshot of current totals and caps.
#[derive(Clone, Copy, Debug)]
pub struct LimiterStats {
    pub total_circuits: usize,
    pub unique_peers: usize,
    pub max_connections: usize,
    pub max_connections_per_peer: usize,
    pub max_bandwidth: u64,
}

#[derive(Default)]
struct Counters {
    per_peer: FnvHashMap<PeerId, usize>,
    total: usize,
    requests: FnvHashMap<PeerId, Instant>,
}

/// Token bucket refilled by wall-clock elapsed time. Burst capacity is one
/// second worth of tokens.
struct TokenBucket {
    rate: u64,
    capacity: u64,
    available: AtomicU64,
    last_refill_nanos: AtomicU64,
    epoch: Instant,
}

impl TokenBucket {
    fn new(rate: u64) -> Self {
        TokenBucket {
            rate,
            capacity: rate,
            available: AtomicU64::new(rate),
            last_refill_nanos: AtomicU64::new(0),
            epoch: Instant::now(),
        }
    }

    fn try_take(&self, tokens: u64) -> bool {
        if self.rate == 0 {
            return true;
        }
        let now = self.epoch.elapsed().as_nanos() as u64;
        let last = self.last_refill_nanos.swap(now, Ordering::AcqRel);
        let refill =
            (now.saturating_sub(last) as u128 * self.rate as u128 / 1_000_000_000) as u64;
        if refill > 0 {
            let capacity = self.capacity;
            let _ = self
                .available
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                    Some(v.saturating_add(refill).min(capacity))
                });
        }
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(tokens))
            .is_ok()
    }
}

/// Admission control for reservations and circuits plus bandwidth shaping.
pub struct Limiter {
    config: LimiterConfig,
    counters: Mutex<Counters>,
    bucket: TokenBucket,
}

impl Limiter {
    pub fn new(config: LimiterConfig) -> Self {
        Limiter {
            bucket: TokenBucket::new(config.max_bandwidth),
            counters: Mutex::new(Counters::default()),
            config,
        }
    }

    pub fn config(&self) -> &LimiterConfig {
        &self.config
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.idle_timeout
    }

    /// Takes `bytes` from the bandwidth bucket. True when unthrottled.
    pub fn allow_bytes(&self, bytes: u64) -> bool {
        self.bucket.try_take(bytes)
    }

    /// Admission check for a reservation request by `peer`.
    pub fn allow_reservation(&self, peer: PeerId) -> Result<()> {
        let mut counters = self.counters.lock();
        let now = Instant::now();
        counters
            .requests
            .retain(|_, issued| now.duration_since(*issued) < REQUEST_EXPIRY);

        if let Some(issued) = counters.requests.get_mut(&peer) {
            *issued = now;
            return Ok(());
        }
        if !self.bucket.try_take(1) {
            return Err(Error::BandwidthExceeded);
        }
        if self.config.max_connections > 0 && counters.total >= self.config.max_connections {
            return Err(Error::ResourceLimit);
        }
        let per_peer = counters.per_peer.get(&peer).copied().unwrap_or(0);
        if self.config.max_connections_per_peer > 0
            && per_peer >= self.config.max_connections_per_peer
        {
            return Err(Error::TooManyCircuits);
        }
        counters.requests.insert(peer, now);
        Ok(())
    }

    /// Admission check for a circuit involving `peer`; increments the
    /// per-peer and total counters on success.
    pub fn allow_circuit(&self, peer: PeerId) -> Result<()> {
        let mut counters = self.counters.lock();
        if self.config.max_connections > 0 && counters.total >= self.config.max_connections {
            return Err(Error::ResourceLimit);
        }
        let per_peer = counters.per_peer.get(&peer).copied().unwrap_or(0);
        if self.config.max_connections_per_peer > 0
            && per_peer >= self.config.max_connections_per_peer
        {
            return Err(Error::TooManyCircuits);
        }
        *counters.per_peer.entry(peer).or_insert(0) += 1;
        counters.total += 1;
        Ok(())
    }

    /// Releases a circuit slot. Extra or unknown-peer releases are no-ops;
    /// counters never underflow.
    pub fn release_circuit(&self, peer: PeerId) {
        let mut counters = self.counters.lock();
        if let Some(count) = counters.per_peer.get_mut(&peer) {
            *count -= 1;
            if *count == 0 {
                counters.per_peer.remove(&peer);
            }
            counters.total = counters.total.saturating_sub(1);
        }
    }

    pub fn stats(&self) -> LimiterStats {
        let counters = self.counters.lock();
        LimiterStats {
            total_circuits: counters.total,
            unique_peers: counters.per_peer.len(),
            max_connections: self.config.max_connections,
            max_connections_per_peer: self.config.max_connections_per_peer,
            max_bandwidth: self.config.max_bandwidth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(total: usize, per_peer: usize) -> Limiter {
        Limiter::new(LimiterConfig {
            max_connections: total,
            max_connections_per_peer: per_peer,
            ..Default::default()
        })
    }

    #[test]
    fn circuit_caps_enforced() {
        let l = limiter(2, 1);
        let a = PeerId::random();
        let b = PeerId::random();
        let c = PeerId::random();

        l.allow_circuit(a).unwrap();
        assert!(matches!(l.allow_circuit(a), Err(Error::TooManyCircuits)));
        l.allow_circuit(b).unwrap();
        assert!(matches!(l.allow_circuit(c), Err(Error::ResourceLimit)));

        l.release_circuit(a);
        l.allow_circuit(c).unwrap();
    }

    #[test]
    fn zero_caps_mean_unbounded() {
        let l = limiter(0, 0);
        let peer = PeerId::random();
        for _ in 0..1000 {
            l.allow_circuit(peer).unwrap();
        }
        assert_eq!(l.stats().total_circuits, 1000);
    }

    #[test]
    fn release_never_underflows() {
        let l = limiter(4, 4);
        let a = PeerId::random();
        let stranger = PeerId::random();

        l.release_circuit(stranger);
        l.allow_circuit(a).unwrap();
        l.release_circuit(a);
        l.release_circuit(a);
        l.release_circuit(stranger);

        let stats = l.stats();
        assert_eq!(stats.total_circuits, 0);
        assert_eq!(stats.unique_peers, 0);
    }

    quickcheck::quickcheck! {
        // Any interleaving of allows and (possibly unmatched) releases
        // keeps `total == sum(per_peer)` and both non-negative.
        fn counters_stay_consistent(ops: Vec<(bool, u8)>) -> bool {
            let l = limiter(0, 0);
            let peers: Vec<PeerId> = (0..8).map(|_| PeerId::random()).collect();
            for (allow, idx) in ops {
                let peer = peers[idx as usize % peers.len()];
                if allow {
                    let _ = l.allow_circuit(peer);
                } else {
                    l.release_circuit(peer);
                }
            }
            let counters = l.counters.lock();
            counters.total == counters.per_peer.values().sum::<usize>()
        }
    }

    #[test]
    fn reservation_is_idempotent_within_expiry() {
        let l = limiter(1, 1);
        let peer = PeerId::random();
        l.allow_reservation(peer).unwrap();
        // Fill the circuit table; the refresh must still pass.
        l.allow_circuit(peer).unwrap();
        l.allow_reservation(peer).unwrap();
    }

    #[test]
    fn bandwidth_bucket_throttles_and_refills() {
        let bucket = TokenBucket::new(100);
        assert!(bucket.try_take(100));
        assert!(!bucket.try_take(1));
        std::thread::sleep(Duration::from_millis(50));
        // ~5 tokens refilled by now.
        assert!(bucket.try_take(1));
    }

    #[test]
    fn zero_bandwidth_never_throttles() {
        let bucket = TokenBucket::new(0);
        assert!(bucket.try_take(u64::MAX));
    }
}
