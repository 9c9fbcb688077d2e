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

//! Local address bookkeeping.
//!
//! Maintains the listen set, the observed-address scoreboard fed by the
//! identify subscriber, and derives the four address views: `addrs`
//! (listen set with the local `/p2p/` suffix), `advertised_addrs`
//! (verified-direct, then relay, then listen), `shareable_addrs`
//! (safe to hand to other peers) and `hole_punch_addrs` (direct-only
//! candidates for NAT traversal).
//!
//! Relay circuits are legitimate dial targets but forbidden hole-punch
//! candidates; the two classifications never share a predicate.

use crate::config::AddrsFactory;
use dep2p_core::{
    Event, EventBus, EvtLocalAddrsUpdated, LocalAddressView, Multiaddr, PeerId,
    ReachabilityCoordinator,
};
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Observed-address GC cadence.
pub const OBSERVED_GC_INTERVAL: Duration = Duration::from_secs(5 * 60);
/// Observations older than this are evicted.
pub const OBSERVED_MAX_AGE: Duration = Duration::from_secs(30 * 60);

const RECENT_BONUS_WINDOW: Duration = Duration::from_secs(5 * 60);
const STALE_BONUS_WINDOW: Duration = OBSERVED_MAX_AGE;

struct ObservedEntry {
    addr: Multiaddr,
    key: String,
    seen_count: u32,
    last_seen: Instant,
    confidence: i32,
}

fn confidence(seen_count: u32, last_seen: Instant, now: Instant) -> i32 {
    let recency_bonus = match now.duration_since(last_seen) {
        age if age <= RECENT_BONUS_WINDOW => 20,
        age if age <= STALE_BONUS_WINDOW => 10,
        _ => 0,
    };
    10 * seen_count as i32 + recency_bonus
}

/// Insertion-ordered observation pool; `top_n` ties break by insertion
/// order, so the ranking is a deterministic function of the observation
/// sequence.
#[derive(Default)]
struct ObservedPool {
    entries: Vec<ObservedEntry>,
}

impl ObservedPool {
    fn add(&mut self, addr: Multiaddr) {
        let now = Instant::now();
        let key = addr.to_string();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.key == key) {
            entry.seen_count += 1;
            entry.last_seen = now;
            entry.confidence = confidence(entry.seen_count, now, now);
            return;
        }
        self.entries.push(ObservedEntry {
            addr,
            key,
            seen_count: 1,
            last_seen: now,
            confidence: confidence(1, now, now),
        });
    }

    fn top_n(&self, n: usize) -> Vec<Multiaddr> {
        let mut ranked: Vec<(i32, usize)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(index, entry)| (entry.confidence, index))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        ranked
            .into_iter()
            .take(n)
            .map(|(_, index)| self.entries[index].addr.clone())
            .collect()
    }

    fn gc(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| now.duration_since(entry.last_seen) <= OBSERVED_MAX_AGE);
        before - self.entries.len()
    }
}

pub struct AddrManager {
    local: PeerId,
    factory: Option<AddrsFactory>,
    bus: Option<Arc<dyn EventBus>>,
    listen: Mutex<Vec<Multiaddr>>,
    observed: Mutex<ObservedPool>,
    coordinator: Mutex<Option<Arc<dyn ReachabilityCoordinator>>>,
}

impl AddrManager {
    pub fn new(
        local: PeerId,
        factory: Option<AddrsFactory>,
        bus: Option<Arc<dyn EventBus>>,
    ) -> Self {
        AddrManager {
            local,
            factory,
            bus,
            listen: Mutex::new(Vec::new()),
            observed: Mutex::new(ObservedPool::default()),
            coordinator: Mutex::new(None),
        }
    }

    pub fn set_coordinator(&self, coordinator: Arc<dyn ReachabilityCoordinator>) {
        *self.coordinator.lock() = Some(coordinator);
    }

    /// Replaces the listen set, publishing the delta.
    pub fn set_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        let mut unique: Vec<Multiaddr> = Vec::new();
        for addr in addrs {
            if !unique.contains(&addr) {
                unique.push(addr);
            }
        }
        let (current, added, removed) = {
            let mut listen = self.listen.lock();
            let added: Vec<Multiaddr> = unique
                .iter()
                .filter(|a| !listen.contains(a))
                .cloned()
                .collect();
            let removed: Vec<Multiaddr> = listen
                .iter()
                .filter(|a| !unique.contains(a))
                .cloned()
                .collect();
            *listen = unique.clone();
            (unique, added, removed)
        };
        if added.is_empty() && removed.is_empty() {
            return;
        }
        trace!("listen set changed: +{} -{}", added.len(), removed.len());
        if let Some(bus) = &self.bus {
            bus.publish(Event::LocalAddrsUpdated(EvtLocalAddrsUpdated {
                current,
                added,
                removed,
            }));
        }
    }

    /// Adds to the listen set, publishing the delta.
    pub fn add_listen_addrs(&self, addrs: Vec<Multiaddr>) {
        let merged = {
            let listen = self.listen.lock();
            let mut merged = listen.clone();
            for addr in addrs {
                if !merged.contains(&addr) {
                    merged.push(addr);
                }
            }
            merged
        };
        self.set_listen_addrs(merged);
    }

    /// Feeds one observation from the identify subscriber.
    pub fn add_observed_addr(&self, addr: Multiaddr) {
        self.observed.lock().add(addr);
    }

    pub fn observed_top_n(&self, n: usize) -> Vec<Multiaddr> {
        self.observed.lock().top_n(n)
    }

    /// Evicts stale observations; run by the periodic GC task.
    pub fn gc_observed(&self) {
        let evicted = self.observed.lock().gc(Instant::now());
        if evicted > 0 {
            debug!("evicted {} stale observed addresses", evicted);
        }
    }

    /// The listen set with `/p2p/<localId>` appended where missing, passed
    /// through the user's address factory, deduplicated.
    pub fn addrs(&self) -> Vec<Multiaddr> {
        let listen = self.listen.lock().clone();
        let with_peer: Vec<Multiaddr> = listen
            .into_iter()
            .map(|addr| addr.with_peer(self.local))
            .collect();
        let filtered = match &self.factory {
            Some(factory) => factory(with_peer),
            None => with_peer,
        };
        dedupe(filtered)
    }

    /// Advertised set, priority-ordered: verified direct, then relay, then
    /// listen; non-connectable entries dropped.
    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        let coordinator = self.coordinator.lock().clone();
        let mut out = Vec::new();
        if let Some(coordinator) = &coordinator {
            out.extend(coordinator.verified_addrs());
            out.extend(coordinator.relay_addrs());
        }
        out.extend(self.addrs());
        dedupe(out.into_iter().filter(Multiaddr::is_connectable).collect())
    }

    /// Addresses safe to hand to other peers: verified direct plus relay,
    /// falling back to the filtered listen set when both are empty.
    pub fn shareable(&self) -> Vec<Multiaddr> {
        let coordinator = self.coordinator.lock().clone();
        let mut out: Vec<Multiaddr> = Vec::new();
        if let Some(coordinator) = &coordinator {
            out.extend(coordinator.verified_addrs());
            out.extend(coordinator.relay_addrs());
        }
        let out: Vec<Multiaddr> = out
            .into_iter()
            .filter(Multiaddr::is_connectable)
            .collect();
        if !out.is_empty() {
            return dedupe(out);
        }
        dedupe(
            self.addrs()
                .into_iter()
                .filter(Multiaddr::is_connectable)
                .collect(),
        )
    }

    /// Hole-punch candidates: candidate plus verified direct addresses.
    /// Relay circuits never qualify; hole punching targets direct
    /// reachability, not a circuit.
    pub fn hole_punch_addrs(&self) -> Vec<Multiaddr> {
        let coordinator = self.coordinator.lock().clone();
        let mut out = Vec::new();
        if let Some(coordinator) = &coordinator {
            out.extend(coordinator.candidate_addrs());
            out.extend(coordinator.verified_addrs());
        }
        dedupe(
            out.into_iter()
                .filter(Multiaddr::is_direct_connectable)
                .collect(),
        )
    }

    pub fn local_peer(&self) -> PeerId {
        self.local
    }
}

impl LocalAddressView for AddrManager {
    fn shareable_addrs(&self) -> Vec<Multiaddr> {
        self.shareable()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.listen.lock().clone()
    }
}

fn dedupe(addrs: Vec<Multiaddr>) -> Vec<Multiaddr> {
    let mut seen = std::collections::HashSet::new();
    addrs
        .into_iter()
        .filter(|addr| seen.insert(addr.to_string()))
        .collect()
}
