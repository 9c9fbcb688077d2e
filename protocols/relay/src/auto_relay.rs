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

//! Background policy keeping a pool of active relay reservations.
//!
//! Discovers candidates (static seeds, DHT providers), sustains
//! `min_relays <= |active| <= max_relays` reservations, blacklists failing
//! relays for a while, refreshes reservations before they lapse and
//! publishes the resulting relay-circuit addresses.

use crate::client::{HopReserver, ReservationInfo};
use crate::selector::{CandidateInfo, RelaySelector};
use crate::RELAY_NAMESPACE;
use dep2p_core::{ConnectionHandle, Discovery, Multiaddr, PeerId, Protocol};
use fnv::FnvHashMap;
use futures_timer::Delay;
use log::{debug, info, trace};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on tracked candidates; the stalest entry is evicted first.
pub const MAX_CANDIDATES: usize = 50;

/// Reservations expiring within this margin are treated as gone and their
/// relays demoted back to candidates.
const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Reservations expiring within this window get refreshed in place.
const REFRESH_WINDOW: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
pub struct AutoRelayConfig {
    pub min_relays: usize,
    pub max_relays: usize,
    pub refresh_interval: Duration,
    pub boot_delay: Duration,
    pub blacklist_duration: Duration,
    pub static_relays: Vec<Multiaddr>,
    pub preferred_relays: Vec<PeerId>,
}

impl Default for AutoRelayConfig {
    fn default() -> Self {
        AutoRelayConfig {
            min_relays: 2,
            max_relays: 4,
            refresh_interval: Duration::from_secs(2 * 60),
            boot_delay: Duration::from_secs(3),
            blacklist_duration: Duration::from_secs(15 * 60),
            static_relays: Vec::new(),
            preferred_relays: Vec::new(),
        }
    }
}

#[derive(Clone)]
struct Candidate {
    addrs: Vec<Multiaddr>,
    last_seen: Instant,
    latency: Option<Duration>,
    capacity: f64,
    reliability: f64,
}

struct ActiveRelay {
    conn: ConnectionHandle,
    info: ReservationInfo,
    addrs: Vec<Multiaddr>,
}

#[derive(Default)]
struct State {
    /// Insertion-ordered so selection ties stay deterministic.
    candidates: Vec<(PeerId, Candidate)>,
    active: FnvHashMap<PeerId, ActiveRelay>,
    blacklist: FnvHashMap<PeerId, Instant>,
}

pub type AddrsChangedCallback = Arc<dyn Fn(Vec<Multiaddr>) + Send + Sync>;

pub struct AutoRelay {
    local: PeerId,
    config: AutoRelayConfig,
    reserver: Arc<dyn HopReserver>,
    selector: RelaySelector,
    discovery: Option<Arc<dyn Discovery>>,
    state: Mutex<State>,
    on_addrs_changed: Mutex<Option<AddrsChangedCallback>>,
    last_published: Mutex<Vec<Multiaddr>>,
}

impl AutoRelay {
    pub fn new(
        local: PeerId,
        config: AutoRelayConfig,
        reserver: Arc<dyn HopReserver>,
        selector: RelaySelector,
        discovery: Option<Arc<dyn Discovery>>,
    ) -> Self {
        AutoRelay {
            local,
            config,
            reserver,
            selector,
            discovery,
            state: Mutex::new(State::default()),
            on_addrs_changed: Mutex::new(None),
            last_published: Mutex::new(Vec::new()),
        }
    }

    /// Callback fired whenever the set of reachable circuit addresses
    /// changes; wired to the reachability coordinator.
    pub fn set_on_addrs_changed(&self, callback: AddrsChangedCallback) {
        *self.on_addrs_changed.lock() = Some(callback);
    }

    /// Feeds a relay candidate into the pool, refreshing `last_seen` if
    /// already known and evicting the stalest entry beyond capacity.
    pub fn add_candidate(&self, peer: PeerId, addrs: Vec<Multiaddr>) {
        if peer == self.local || addrs.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        if let Some((_, candidate)) = state.candidates.iter_mut().find(|(id, _)| *id == peer) {
            candidate.addrs = addrs;
            candidate.last_seen = Instant::now();
            return;
        }
        if state.candidates.len() >= MAX_CANDIDATES {
            if let Some(stalest) = state
                .candidates
                .iter()
                .enumerate()
                .min_by_key(|(_, (_, c))| c.last_seen)
                .map(|(index, _)| index)
            {
                state.candidates.remove(stalest);
            }
        }
        state.candidates.push((
            peer,
            Candidate {
                addrs,
                last_seen: Instant::now(),
                latency: None,
                capacity: 0.5,
                reliability: 0.5,
            },
        ));
    }

    pub fn candidate_count(&self) -> usize {
        self.state.lock().candidates.len()
    }

    pub fn active_relays(&self) -> Vec<(PeerId, Vec<Multiaddr>)> {
        self.state
            .lock()
            .active
            .iter()
            .map(|(peer, active)| (*peer, active.addrs.clone()))
            .collect()
    }

    pub fn is_blacklisted(&self, peer: &PeerId) -> bool {
        self.state
            .lock()
            .blacklist
            .get(peer)
            .map_or(false, |until| *until > Instant::now())
    }

    /// The relay-circuit addresses the local node is currently reachable
    /// under: `<relayAddr>/p2p-circuit/p2p/<localId>` per active relay.
    pub fn relay_circuit_addrs(&self) -> Vec<Multiaddr> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for (peer, active) in &state.active {
            for addr in &active.addrs {
                out.push(
                    addr.clone()
                        .with_peer(*peer)
                        .with(Protocol::P2pCircuit)
                        .with(Protocol::P2p(self.local)),
                );
            }
        }
        out.sort_by_key(|a| a.to_string());
        out
    }

    /// Seeds the candidate pool and runs the refresh loop forever. Meant
    /// to be spawned; cancellation is dropping the task.
    pub async fn run(self: Arc<Self>) {
        for addr in self.config.static_relays.clone() {
            if let Some(peer) = addr.final_peer() {
                self.add_candidate(peer, vec![addr]);
            } else {
                debug!("static relay {} has no /p2p component, ignoring", addr);
            }
        }
        Delay::new(self.config.boot_delay).await;
        loop {
            self.tick().await;
            // Jitter keeps a fleet of nodes from refreshing in lockstep.
            let jitter = rand::thread_rng().gen_range(0..=self.config.refresh_interval.as_millis() as u64 / 10);
            Delay::new(self.config.refresh_interval + Duration::from_millis(jitter)).await;
        }
    }

    /// One round of pool upkeep. Public for tests and for the manager's
    /// forced refresh.
    pub async fn tick(&self) {
        let now = Instant::now();

        // Expired blacklist entries and lapsing reservations first.
        let demoted: Vec<(PeerId, ActiveRelay)> = {
            let mut state = self.state.lock();
            state.blacklist.retain(|_, until| *until > now);
            let lapsing: Vec<PeerId> = state
                .active
                .iter()
                .filter(|(_, active)| active.info.expires_at <= now + EXPIRY_SAFETY_MARGIN)
                .map(|(peer, _)| *peer)
                .collect();
            lapsing
                .into_iter()
                .filter_map(|peer| state.active.remove(&peer).map(|active| (peer, active)))
                .collect()
        };
        for (peer, active) in demoted {
            debug!("relay {} reservation lapsed, demoting", peer.short());
            let _ = active.conn.close().await;
            self.add_candidate(peer, active.addrs);
        }

        self.top_up().await;
        self.refresh_expiring().await;
        self.publish_addrs();
    }

    async fn top_up(&self) {
        let (needed, mut picks) = {
            let state = self.state.lock();
            if state.active.len() >= self.config.min_relays {
                return;
            }
            let needed = (self.config.min_relays - state.active.len())
                .min(self.config.max_relays - state.active.len());
            let now = Instant::now();
            let eligible: Vec<CandidateInfo> = state
                .candidates
                .iter()
                .filter(|(peer, _)| {
                    !state.active.contains_key(peer)
                        && state.blacklist.get(peer).map_or(true, |until| *until <= now)
                })
                .map(|(peer, candidate)| CandidateInfo {
                    peer: *peer,
                    addrs: candidate.addrs.clone(),
                    latency: candidate.latency,
                    capacity: candidate.capacity,
                    reliability: candidate.reliability,
                })
                .collect();

            // Preferred relays jump the queue; the selector ranks the rest.
            let (preferred, rest): (Vec<CandidateInfo>, Vec<CandidateInfo>) = eligible
                .into_iter()
                .partition(|c| self.config.preferred_relays.contains(&c.peer));
            let mut picks = preferred;
            picks.extend(
                self.selector
                    .select_multiple(needed.saturating_sub(picks.len()), &rest),
            );
            picks.truncate(needed);
            (needed, picks)
        };

        if picks.len() < needed {
            self.discover_more().await;
        }

        for pick in picks.drain(..) {
            match self.reserver.reserve(pick.peer, pick.addrs.clone()).await {
                Ok((conn, info)) => {
                    info!("reserved relay slot at {}", pick.peer.short());
                    let mut state = self.state.lock();
                    state.candidates.retain(|(peer, _)| *peer != pick.peer);
                    state.active.insert(
                        pick.peer,
                        ActiveRelay {
                            conn,
                            addrs: if info.relay_addrs.is_empty() {
                                pick.addrs.clone()
                            } else {
                                info.relay_addrs.clone()
                            },
                            info,
                        },
                    );
                }
                Err(e) => {
                    debug!("reservation at {} failed: {}", pick.peer.short(), e);
                    let mut state = self.state.lock();
                    state.candidates.retain(|(peer, _)| *peer != pick.peer);
                    state
                        .blacklist
                        .insert(pick.peer, Instant::now() + self.config.blacklist_duration);
                }
            }
        }
    }

    async fn discover_more(&self) {
        let discovery = match &self.discovery {
            Some(discovery) => discovery.clone(),
            None => return,
        };
        match discovery.find_providers(RELAY_NAMESPACE, MAX_CANDIDATES).await {
            Ok(providers) => {
                trace!("discovered {} relay providers", providers.len());
                for (peer, addrs) in providers {
                    self.add_candidate(peer, addrs);
                }
            }
            Err(e) => debug!("relay discovery failed: {}", e),
        }
    }

    async fn refresh_expiring(&self) {
        let now = Instant::now();
        let expiring: Vec<(PeerId, Vec<Multiaddr>)> = {
            let state = self.state.lock();
            state
                .active
                .iter()
                .filter(|(_, active)| active.info.expires_at <= now + REFRESH_WINDOW)
                .map(|(peer, active)| (*peer, active.addrs.clone()))
                .collect()
        };
        for (peer, addrs) in expiring {
            match self.reserver.reserve(peer, addrs).await {
                Ok((conn, info)) => {
                    trace!("refreshed reservation at {}", peer.short());
                    let mut state = self.state.lock();
                    if let Some(active) = state.active.get_mut(&peer) {
                        active.conn = conn;
                        active.info = info;
                    }
                }
                Err(e) => {
                    debug!("refresh at {} failed, demoting: {}", peer.short(), e);
                    let removed = self.state.lock().active.remove(&peer);
                    if let Some(active) = removed {
                        let _ = active.conn.close().await;
                        self.add_candidate(peer, active.addrs);
                    }
                }
            }
        }
    }

    fn publish_addrs(&self) {
        let addrs = self.relay_circuit_addrs();
        {
            let mut last = self.last_published.lock();
            if *last == addrs {
                return;
            }
            *last = addrs.clone();
        }
        if let Some(callback) = self.on_addrs_changed.lock().clone() {
            callback(addrs);
        }
    }
}
