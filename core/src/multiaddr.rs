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

//! Multiaddress support for the grammar subset used by the overlay:
//!
//! ```text
//! /ip4/<v4>|/ip6/<v6>[/tcp/<port>|/udp/<port>[/quic-v1]][/p2p/<peerId>][/p2p-circuit[/p2p/<peerId>]]
//! ```
//!
//! A relay-circuit address has the shape
//! `<transport>/p2p/<relayId>/p2p-circuit[/p2p/<destId>]`.

use crate::error::Error;
use crate::peer_id::PeerId;
use smallvec::SmallVec;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Addresses in the supported grammar have at most seven components;
/// inline storage avoids an allocation per address.
type Parts = SmallVec<[Protocol; 8]>;

/// A single component of a [`Multiaddr`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Protocol {
    Ip4(Ipv4Addr),
    Ip6(Ipv6Addr),
    Tcp(u16),
    Udp(u16),
    QuicV1,
    P2p(PeerId),
    P2pCircuit,
}

impl Protocol {
    /// The textual tag of this component.
    pub fn tag(&self) -> &'static str {
        match self {
            Protocol::Ip4(_) => "ip4",
            Protocol::Ip6(_) => "ip6",
            Protocol::Tcp(_) => "tcp",
            Protocol::Udp(_) => "udp",
            Protocol::QuicV1 => "quic-v1",
            Protocol::P2p(_) => "p2p",
            Protocol::P2pCircuit => "p2p-circuit",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Ip4(addr) => write!(f, "/ip4/{}", addr),
            Protocol::Ip6(addr) => write!(f, "/ip6/{}", addr),
            Protocol::Tcp(port) => write!(f, "/tcp/{}", port),
            Protocol::Udp(port) => write!(f, "/udp/{}", port),
            Protocol::QuicV1 => write!(f, "/quic-v1"),
            Protocol::P2p(peer) => write!(f, "/p2p/{}", peer),
            Protocol::P2pCircuit => write!(f, "/p2p-circuit"),
        }
    }
}

/// An ordered sequence of [`Protocol`] components.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct Multiaddr {
    parts: Parts,
}

impl Multiaddr {
    pub fn empty() -> Self {
        Multiaddr {
            parts: SmallVec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Protocol> {
        self.parts.iter()
    }

    pub fn push(&mut self, p: Protocol) {
        self.parts.push(p);
    }

    /// Appends a component, builder-style.
    pub fn with(mut self, p: Protocol) -> Self {
        self.parts.push(p);
        self
    }

    /// Appends `/p2p/<peer>` unless the address already ends in it.
    pub fn with_peer(self, peer: PeerId) -> Self {
        if self.parts.last() == Some(&Protocol::P2p(peer)) {
            return self;
        }
        self.with(Protocol::P2p(peer))
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.parts.iter().find_map(|p| match p {
            Protocol::Ip4(a) => Some(IpAddr::V4(*a)),
            Protocol::Ip6(a) => Some(IpAddr::V6(*a)),
            _ => None,
        })
    }

    pub fn transport_port(&self) -> Option<u16> {
        self.parts.iter().find_map(|p| match p {
            Protocol::Tcp(port) | Protocol::Udp(port) => Some(*port),
            _ => None,
        })
    }

    /// The last `/p2p/` component, i.e. the peer the address points at.
    pub fn final_peer(&self) -> Option<PeerId> {
        self.parts.iter().rev().find_map(|p| match p {
            Protocol::P2p(id) => Some(*id),
            _ => None,
        })
    }

    pub fn is_circuit(&self) -> bool {
        self.parts.contains(&Protocol::P2pCircuit)
    }

    /// The relay in a circuit address: the `/p2p/` component immediately
    /// preceding `/p2p-circuit`.
    pub fn relay_peer(&self) -> Option<PeerId> {
        let circuit = self.parts.iter().position(|p| *p == Protocol::P2pCircuit)?;
        match self.parts.get(circuit.checked_sub(1)?)? {
            Protocol::P2p(id) => Some(*id),
            _ => None,
        }
    }

    /// The destination in a circuit address: the first `/p2p/` component
    /// after `/p2p-circuit`.
    pub fn circuit_dst(&self) -> Option<PeerId> {
        let circuit = self.parts.iter().position(|p| *p == Protocol::P2pCircuit)?;
        self.parts[circuit + 1..].iter().find_map(|p| match p {
            Protocol::P2p(id) => Some(*id),
            _ => None,
        })
    }

    /// Everything before `/p2p-circuit`, i.e. the address of the relay
    /// itself. Returns the whole address when no circuit is present.
    pub fn transport_prefix(&self) -> Multiaddr {
        let end = self
            .parts
            .iter()
            .position(|p| *p == Protocol::P2pCircuit)
            .unwrap_or(self.parts.len());
        Multiaddr {
            parts: self.parts[..end].iter().cloned().collect(),
        }
    }

    /// Whether the address is usable as a dial target at all. Unspecified
    /// and loopback addresses are not; relay circuits are.
    pub fn is_connectable(&self) -> bool {
        if self.parts.is_empty() {
            return false;
        }
        match self.ip() {
            Some(IpAddr::V4(a)) => !a.is_unspecified() && !a.is_loopback(),
            Some(IpAddr::V6(a)) => !a.is_unspecified() && !a.is_loopback(),
            // Addresses without an ip component (e.g. a bare `/p2p/..`
            // prefix) cannot be dialed.
            None => false,
        }
    }

    /// Like [`is_connectable`](Multiaddr::is_connectable) but additionally
    /// excludes relay circuits. Hole punching targets direct reachability,
    /// never a circuit.
    pub fn is_direct_connectable(&self) -> bool {
        self.is_connectable() && !self.is_circuit()
    }

    /// Whether the address is globally routable: not private, not loopback,
    /// not link-local.
    pub fn is_public(&self) -> bool {
        match self.ip() {
            Some(IpAddr::V4(a)) => {
                !a.is_unspecified()
                    && !a.is_loopback()
                    && !a.is_private()
                    && !a.is_link_local()
            }
            Some(IpAddr::V6(a)) => {
                !a.is_unspecified()
                    && !a.is_loopback()
                    // fe80::/10 link-local, fc00::/7 unique-local
                    && (a.segments()[0] & 0xffc0) != 0xfe80
                    && (a.segments()[0] & 0xfe00) != 0xfc00
            }
            None => false,
        }
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.parts {
            part.fmt(f)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.to_string())
    }
}

impl FromStr for Multiaddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let invalid = |why: &str| Error::InvalidAddress(format!("{:?}: {}", s, why));
        if s.is_empty() {
            return Err(invalid("empty address"));
        }
        let mut tokens = s.split('/');
        if tokens.next() != Some("") {
            return Err(invalid("must start with '/'"));
        }
        let mut parts = Parts::new();
        while let Some(tag) = tokens.next() {
            let mut value = || tokens.next().ok_or_else(|| invalid("missing value"));
            let part = match tag {
                "ip4" => Protocol::Ip4(
                    value()?.parse().map_err(|_| invalid("bad ip4 address"))?,
                ),
                "ip6" => Protocol::Ip6(
                    value()?.parse().map_err(|_| invalid("bad ip6 address"))?,
                ),
                "tcp" => Protocol::Tcp(value()?.parse().map_err(|_| invalid("bad tcp port"))?),
                "udp" => Protocol::Udp(value()?.parse().map_err(|_| invalid("bad udp port"))?),
                "quic-v1" => Protocol::QuicV1,
                "p2p" => Protocol::P2p(value()?.parse().map_err(|_| invalid("bad peer id"))?),
                "p2p-circuit" => Protocol::P2pCircuit,
                other => return Err(invalid(&format!("unknown protocol {:?}", other))),
            };
            parts.push(part);
        }
        if parts.is_empty() {
            return Err(invalid("no components"));
        }
        Ok(Multiaddr { parts })
    }
}

impl From<Protocol> for Multiaddr {
    fn from(p: Protocol) -> Self {
        Multiaddr {
            parts: std::iter::once(p).collect(),
        }
    }
}

impl std::iter::FromIterator<Protocol> for Multiaddr {
    fn from_iter<T: IntoIterator<Item = Protocol>>(iter: T) -> Self {
        Multiaddr {
            parts: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    #[test]
    fn string_round_trip() {
        let peer = PeerId::random();
        for s in &[
            "/ip4/192.0.2.1/tcp/4001".to_string(),
            "/ip6/2001:db8::1/udp/4001/quic-v1".to_string(),
            format!("/ip4/192.0.2.1/udp/4001/quic-v1/p2p/{}", peer),
            format!("/ip4/192.0.2.1/udp/4001/quic-v1/p2p/{}/p2p-circuit/p2p/{}", peer, peer),
        ] {
            assert_eq!(&addr(s).to_string(), s);
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!("".parse::<Multiaddr>().is_err());
        assert!("ip4/1.2.3.4".parse::<Multiaddr>().is_err());
        assert!("/ip4/not-an-ip".parse::<Multiaddr>().is_err());
        assert!("/tcp".parse::<Multiaddr>().is_err());
        assert!("/dns4/example.com".parse::<Multiaddr>().is_err());
    }

    #[test]
    fn circuit_parts() {
        let relay = PeerId::random();
        let dst = PeerId::random();
        let a = addr(&format!(
            "/ip4/198.51.100.7/udp/4001/quic-v1/p2p/{}/p2p-circuit/p2p/{}",
            relay, dst
        ));
        assert!(a.is_circuit());
        assert_eq!(a.relay_peer(), Some(relay));
        assert_eq!(a.circuit_dst(), Some(dst));
        assert_eq!(a.final_peer(), Some(dst));
        assert_eq!(
            a.transport_prefix().to_string(),
            format!("/ip4/198.51.100.7/udp/4001/quic-v1/p2p/{}", relay)
        );

        let no_dst = addr(&format!("/ip4/198.51.100.7/tcp/4001/p2p/{}/p2p-circuit", relay));
        assert_eq!(no_dst.circuit_dst(), None);
    }

    #[test]
    fn connectable_predicates() {
        assert!(!addr("/ip4/0.0.0.0/tcp/1").is_connectable());
        assert!(!addr("/ip6/::/tcp/1").is_connectable());
        assert!(!addr("/ip4/127.0.0.1/tcp/1").is_connectable());
        assert!(!addr("/ip6/::1/tcp/1").is_connectable());
        assert!(addr("/ip4/192.0.2.1/tcp/1").is_connectable());

        let relay = PeerId::random();
        let circuit = addr(&format!("/ip4/192.0.2.1/tcp/1/p2p/{}/p2p-circuit", relay));
        assert!(circuit.is_connectable());
        assert!(!circuit.is_direct_connectable());
        assert!(addr("/ip4/192.0.2.1/tcp/1").is_direct_connectable());
    }

    #[test]
    fn public_predicate() {
        assert!(addr("/ip4/203.0.113.9/tcp/1").is_public());
        assert!(!addr("/ip4/10.0.0.1/tcp/1").is_public());
        assert!(!addr("/ip4/172.16.0.1/tcp/1").is_public());
        assert!(!addr("/ip4/192.168.1.1/tcp/1").is_public());
        assert!(!addr("/ip4/169.254.0.1/tcp/1").is_public());
        assert!(!addr("/ip4/127.0.0.1/tcp/1").is_public());
        assert!(!addr("/ip6/fe80::1/tcp/1").is_public());
        assert!(!addr("/ip6/fc00::1/tcp/1").is_public());
        assert!(addr("/ip6/2001:db8::1/tcp/1").is_public());
    }

    quickcheck::quickcheck! {
        // Any address assembled from the grammar survives a string round
        // trip.
        fn assembled_addrs_round_trip(parts: Vec<(u8, u16)>) -> bool {
            let mut address =
                Multiaddr::from(Protocol::Ip4(std::net::Ipv4Addr::new(203, 0, 113, 7)));
            for (tag, value) in parts {
                address.push(match tag % 5 {
                    0 => Protocol::Tcp(value),
                    1 => Protocol::Udp(value),
                    2 => Protocol::QuicV1,
                    3 => Protocol::P2pCircuit,
                    _ => Protocol::P2p(PeerId::from_bytes([value as u8; 32])),
                });
            }
            address
                .to_string()
                .parse::<Multiaddr>()
                .map(|parsed| parsed == address)
                .unwrap_or(false)
        }
    }

    #[test]
    fn with_peer_does_not_duplicate() {
        let peer = PeerId::random();
        let a = addr("/ip4/192.0.2.1/tcp/4001").with_peer(peer);
        assert_eq!(a.final_peer(), Some(peer));
        let again = a.clone().with_peer(peer);
        assert_eq!(a, again);
    }
}
