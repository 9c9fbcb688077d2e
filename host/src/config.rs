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

use dep2p_core::Multiaddr;
use dep2p_relay::{
    AutoRelayConfig, LimiterConfig, RelayClientConfig, RelayManagerConfig, RelayServerConfig,
};
use std::sync::Arc;
use std::time::Duration;

/// User-supplied filter over the listen address set.
pub type AddrsFactory = Arc<dyn Fn(Vec<Multiaddr>) -> Vec<Multiaddr> + Send + Sync>;

/// Flat host configuration. Zero means default for durations and sizes;
/// zero means unlimited for the count caps that say so.
#[derive(Clone)]
pub struct Config {
    pub user_agent: String,
    pub protocol_version: String,

    /// Multistream-select deadline.
    pub negotiation_timeout: Duration,
    pub addrs_factory: Option<AddrsFactory>,
    /// TTL for peerstore entries written on connection establishment.
    pub connected_addr_ttl: Duration,

    pub enable_relay_client: bool,
    pub enable_relay_server: bool,
    /// Seeds for AutoRelay.
    pub static_relays: Vec<Multiaddr>,
    /// Single pinned relay used as the unified dial fallback.
    pub relay_addr: Option<Multiaddr>,

    /// Server caps; zero means unlimited for the circuit counts.
    pub max_reservations: usize,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
    /// Server-side reservation window; floored at one minute.
    pub reservation_ttl: Duration,
    /// Per-circuit byte-rate cap; zero is off.
    pub max_bandwidth: u64,
    /// Per-circuit lifetime cap; zero is off.
    pub max_duration: Duration,
    /// Forwarder buffer; floored at 1024.
    pub buffer_size: usize,

    pub keep_relay_after_hole_punch: bool,
    pub min_relays: usize,
    pub max_relays: usize,
    pub refresh_interval: Duration,
    pub boot_delay: Duration,
    pub blacklist_duration: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            user_agent: "dep2p/0.1.0".to_string(),
            protocol_version: "dep2p/1.0.0".to_string(),
            negotiation_timeout: Duration::from_secs(10),
            addrs_factory: None,
            connected_addr_ttl: Duration::from_secs(30 * 60),
            enable_relay_client: true,
            enable_relay_server: false,
            static_relays: Vec::new(),
            relay_addr: None,
            max_reservations: 128,
            max_circuits: 1024,
            max_circuits_per_peer: 16,
            reservation_ttl: Duration::from_secs(3600),
            max_bandwidth: 0,
            max_duration: Duration::from_secs(0),
            buffer_size: 4096,
            keep_relay_after_hole_punch: true,
            min_relays: 2,
            max_relays: 4,
            refresh_interval: Duration::from_secs(2 * 60),
            boot_delay: Duration::from_secs(3),
            blacklist_duration: Duration::from_secs(15 * 60),
        }
    }
}

impl Config {
    /// Applies the documented floors and zero-means-default rules.
    pub fn sanitized(mut self) -> Self {
        let defaults = Config::default();
        if self.negotiation_timeout.as_secs() == 0 {
            self.negotiation_timeout = defaults.negotiation_timeout;
        }
        if self.reservation_ttl < Duration::from_secs(60) {
            self.reservation_ttl = Duration::from_secs(60);
        }
        if self.buffer_size < 1024 {
            self.buffer_size = 1024;
        }
        if self.max_relays < self.min_relays {
            self.max_relays = self.min_relays;
        }
        if self.refresh_interval.as_secs() == 0 {
            self.refresh_interval = defaults.refresh_interval;
        }
        if self.blacklist_duration.as_secs() == 0 {
            self.blacklist_duration = defaults.blacklist_duration;
        }
        self
    }

    pub(crate) fn limiter_config(&self) -> LimiterConfig {
        LimiterConfig {
            max_bandwidth: self.max_bandwidth,
            max_connections: self.max_circuits,
            max_connections_per_peer: self.max_circuits_per_peer,
            ..Default::default()
        }
    }

    pub(crate) fn relay_server_config(&self) -> RelayServerConfig {
        RelayServerConfig {
            max_reservations: self.max_reservations,
            reservation_ttl: self.reservation_ttl,
            max_circuits: self.max_circuits,
            max_circuits_per_peer: self.max_circuits_per_peer,
            max_circuit_bytes: 0,
            max_circuit_duration: self.max_duration,
            buffer_size: self.buffer_size,
        }
    }

    pub(crate) fn relay_client_config(&self) -> RelayClientConfig {
        RelayClientConfig {
            reservation_ttl: self.reservation_ttl.as_secs() as u32,
            ..Default::default()
        }
    }

    pub(crate) fn auto_relay_config(&self) -> AutoRelayConfig {
        AutoRelayConfig {
            min_relays: self.min_relays,
            max_relays: self.max_relays,
            refresh_interval: self.refresh_interval,
            boot_delay: self.boot_delay,
            blacklist_duration: self.blacklist_duration,
            static_relays: self.static_relays.clone(),
            preferred_relays: Vec::new(),
        }
    }

    pub(crate) fn relay_manager_config(&self) -> RelayManagerConfig {
        RelayManagerConfig {
            keep_relay_after_hole_punch: self.keep_relay_after_hole_punch,
            relay_addr: self.relay_addr.clone(),
            connected_addr_ttl: self.connected_addr_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_applies_floors() {
        let config = Config {
            negotiation_timeout: Duration::from_secs(0),
            reservation_ttl: Duration::from_millis(100),
            buffer_size: 16,
            min_relays: 5,
            max_relays: 2,
            ..Default::default()
        }
        .sanitized();
        assert_eq!(config.negotiation_timeout, Duration::from_secs(10));
        assert_eq!(config.reservation_ttl, Duration::from_secs(60));
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.max_relays, 5);
    }
}
