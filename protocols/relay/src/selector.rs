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

//! Relay candidate scoring.
//!
//! `score = 100 + latency_bonus + capacity * 20 + reliability * 20 +
//! same_region_bonus`. Ties break by input order, so selection is a
//! deterministic function of the candidate sequence.

use dep2p_core::{Multiaddr, PeerId};
use std::sync::Arc;
use std::time::Duration;

/// What the selector knows about one relay candidate.
#[derive(Clone, Debug)]
pub struct CandidateInfo {
    pub peer: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub latency: Option<Duration>,
    /// Free capacity, `0.0..=1.0`.
    pub capacity: f64,
    /// Observed reliability, `0.0..=1.0`.
    pub reliability: f64,
}

/// Maps addresses to coarse regions, e.g. via a GeoIP database.
pub trait GeoResolver: Send + Sync {
    fn region(&self, addr: &Multiaddr) -> Option<String>;
}

const SAME_REGION_BONUS: i32 = 15;

pub struct RelaySelector {
    geo: Option<Arc<dyn GeoResolver>>,
    local_region: Option<String>,
}

impl RelaySelector {
    pub fn new(geo: Option<Arc<dyn GeoResolver>>, local_addrs: &[Multiaddr]) -> Self {
        let local_region = geo
            .as_ref()
            .and_then(|geo| local_addrs.iter().find_map(|addr| geo.region(addr)));
        RelaySelector { geo, local_region }
    }

    pub fn score(&self, candidate: &CandidateInfo) -> i32 {
        let latency_bonus = match candidate.latency {
            Some(latency) if latency < Duration::from_millis(50) => 30,
            Some(latency) if latency < Duration::from_millis(100) => 20,
            Some(latency) if latency < Duration::from_millis(200) => 10,
            _ => 0,
        };
        let region_bonus = match (&self.geo, &self.local_region) {
            (Some(geo), Some(local)) => {
                let same = candidate
                    .addrs
                    .iter()
                    .find_map(|addr| geo.region(addr))
                    .map_or(false, |region| region == *local);
                if same {
                    SAME_REGION_BONUS
                } else {
                    0
                }
            }
            _ => 0,
        };
        100 + latency_bonus
            + (candidate.capacity.clamp(0.0, 1.0) * 20.0) as i32
            + (candidate.reliability.clamp(0.0, 1.0) * 20.0) as i32
            + region_bonus
    }

    /// The `k` best candidates, highest score first. Stable: equal scores
    /// keep their input order. Empty input yields an empty result.
    pub fn select_multiple(&self, k: usize, candidates: &[CandidateInfo]) -> Vec<CandidateInfo> {
        let mut scored: Vec<(i32, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(index, candidate)| (self.score(candidate), index))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        scored
            .into_iter()
            .take(k)
            .map(|(_, index)| candidates[index].clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(latency_ms: Option<u64>, capacity: f64, reliability: f64) -> CandidateInfo {
        CandidateInfo {
            peer: PeerId::random(),
            addrs: vec!["/ip4/203.0.113.1/tcp/4001".parse().unwrap()],
            latency: latency_ms.map(Duration::from_millis),
            capacity,
            reliability,
        }
    }

    #[test]
    fn latency_tiers() {
        let selector = RelaySelector::new(None, &[]);
        assert_eq!(selector.score(&candidate(Some(10), 0.0, 0.0)), 130);
        assert_eq!(selector.score(&candidate(Some(70), 0.0, 0.0)), 120);
        assert_eq!(selector.score(&candidate(Some(150), 0.0, 0.0)), 110);
        assert_eq!(selector.score(&candidate(Some(500), 0.0, 0.0)), 100);
        assert_eq!(selector.score(&candidate(None, 0.0, 0.0)), 100);
    }

    #[test]
    fn capacity_and_reliability_weights() {
        let selector = RelaySelector::new(None, &[]);
        assert_eq!(selector.score(&candidate(None, 1.0, 1.0)), 140);
        assert_eq!(selector.score(&candidate(None, 0.5, 0.0)), 110);
    }

    #[test]
    fn same_region_bonus_applies() {
        struct ByOctet;
        impl GeoResolver for ByOctet {
            fn region(&self, addr: &Multiaddr) -> Option<String> {
                addr.ip().map(|ip| match ip {
                    std::net::IpAddr::V4(v4) => format!("region-{}", v4.octets()[0]),
                    std::net::IpAddr::V6(_) => "region-v6".to_string(),
                })
            }
        }
        let local: Multiaddr = "/ip4/203.0.113.9/tcp/1".parse().unwrap();
        let selector = RelaySelector::new(Some(Arc::new(ByOctet)), &[local]);

        let same = candidate(None, 0.0, 0.0);
        assert_eq!(selector.score(&same), 115);

        let mut other = candidate(None, 0.0, 0.0);
        other.addrs = vec!["/ip4/198.51.100.1/tcp/1".parse().unwrap()];
        assert_eq!(selector.score(&other), 100);
    }

    #[test]
    fn select_multiple_is_deterministic_and_stable() {
        let selector = RelaySelector::new(None, &[]);
        let a = candidate(Some(10), 0.0, 0.0); // 130
        let b = candidate(None, 1.0, 0.5); // 130
        let c = candidate(None, 0.0, 0.0); // 100
        let picked = selector.select_multiple(2, &[a.clone(), b.clone(), c]);
        assert_eq!(picked.len(), 2);
        // Tie between a and b resolves to input order.
        assert_eq!(picked[0].peer, a.peer);
        assert_eq!(picked[1].peer, b.peer);

        assert!(selector.select_multiple(3, &[]).is_empty());
    }
}
