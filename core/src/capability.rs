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

//! Capability traits for the host's collaborators.
//!
//! The host and the relay manager are constructed against these traits
//! rather than concrete types. Every capability except [`Swarm`] is
//! optional; components check for presence before calling. Methods that
//! perform I/O return boxed futures so the traits stay object-safe.

use crate::event::Event;
use crate::multiaddr::Multiaddr;
use crate::peer_id::PeerId;
use crate::stream::{ConnectionHandle, Stream};
use crate::Result;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Handler invoked for an inbound stream after protocol negotiation.
pub type StreamHandler = Arc<dyn Fn(Stream) -> BoxFuture<'static, ()> + Send + Sync>;

/// The underlying connection fabric: dialing, existing-connection lookup
/// and listen management. The only mandatory capability.
pub trait Swarm: Send + Sync {
    fn local_peer(&self) -> PeerId;

    /// Dials `peer`, optionally hinting addresses. Returns the established
    /// connection, or the existing one if the swarm already holds it.
    fn dial(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> BoxFuture<'_, Result<ConnectionHandle>>;

    /// An already-established connection to `peer`, if any.
    fn connection_to(&self, peer: &PeerId) -> Option<ConnectionHandle>;

    fn listen(&self, addrs: Vec<Multiaddr>) -> Result<Vec<Multiaddr>>;

    /// Addresses the swarm is currently bound to.
    fn local_addrs(&self) -> Vec<Multiaddr>;

    /// Registers the connection notifier. Held weakly so the notifier (the
    /// host) and the swarm do not keep each other alive.
    fn set_notifier(&self, notifier: Weak<dyn SwarmNotifier>);

    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Receiver of swarm connection lifecycle callbacks and inbound streams.
pub trait SwarmNotifier: Send + Sync {
    fn connected(&self, conn: ConnectionHandle);
    fn disconnected(&self, conn: ConnectionHandle);

    /// A freshly accepted stream, before any protocol negotiation.
    fn inbound_stream(&self, stream: Stream);
}

/// Address book. Key material lives behind the same capability in the full
/// system; only the address side is needed here.
pub trait Peerstore: Send + Sync {
    fn add_addr(&self, peer: PeerId, addr: Multiaddr, ttl: Duration);
    fn addrs(&self, peer: &PeerId) -> Vec<Multiaddr>;
}

/// Topic-typed publish/subscribe bus.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
    fn subscribe(&self) -> mpsc::UnboundedReceiver<Event>;
}

/// Connection scoring hooks.
pub trait ConnManager: Send + Sync {
    fn tag_peer(&self, peer: PeerId, tag: &str, weight: u32);
    fn untag_peer(&self, peer: PeerId, tag: &str);
}

/// Fallback dispatcher for inbound streams whose protocol has no locally
/// registered handler.
pub trait Router: Send + Sync {
    /// Protocols the router can dispatch, offered during negotiation.
    fn protocols(&self) -> Vec<String>;
    fn route(&self, stream: Stream) -> BoxFuture<'static, Result<()>>;
}

/// NAT traversal service (port mapping, AutoNAT probing).
pub trait Nat: Send + Sync {
    fn start(&self) -> BoxFuture<'_, Result<()>>;
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// STUN-style direct connection upgrade.
pub trait HolePuncher: Send + Sync {
    fn direct_connect(
        &self,
        peer: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> BoxFuture<'_, Result<ConnectionHandle>>;
}

/// Provider discovery (DHT).
pub trait Discovery: Send + Sync {
    fn find_providers(
        &self,
        namespace: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<(PeerId, Vec<Multiaddr>)>>>;
    fn provide(&self, namespace: &str) -> BoxFuture<'_, Result<()>>;
}

/// Lifecycle of a relayed circuit as seen by the reachability coordinator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Active,
    Stale,
}

/// External coordinator producing verified/candidate/relay address lists
/// and consuming circuit lifecycle changes.
pub trait ReachabilityCoordinator: Send + Sync {
    fn verified_addrs(&self) -> Vec<Multiaddr>;
    fn candidate_addrs(&self) -> Vec<Multiaddr>;
    fn relay_addrs(&self) -> Vec<Multiaddr>;
    fn set_relay_addrs(&self, addrs: Vec<Multiaddr>);
    fn circuit_state_changed(&self, relay: PeerId, state: CircuitState);
}

/// Startup-phase gate notifications.
pub trait LifecycleCoordinator: Send + Sync {
    fn set_relay_configured(&self);
    fn set_relay_connected(&self);
}

/// Task spawner. The host implements this over its tracked executor so
/// every background task is joined on close.
pub trait Spawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// Registration surface for protocol stream handlers, implemented by the
/// host and handed to components that bring their own protocols.
pub trait ProtocolRegistrar: Send + Sync {
    fn register_handler(&self, protocol: &str, handler: StreamHandler);
    fn remove_handler(&self, protocol: &str);
}

/// Read-only view of the local address sets, implemented by the host's
/// address manager and consumed by the relay manager's reachability gate.
pub trait LocalAddressView: Send + Sync {
    fn shareable_addrs(&self) -> Vec<Multiaddr>;
    fn listen_addrs(&self) -> Vec<Multiaddr>;
}

/// A dial/listen mechanism. The relay subsystem exposes itself as one of
/// these for `/p2p-circuit` addresses.
pub trait Transport: Send + Sync {
    fn dial(
        &self,
        addr: Multiaddr,
        expected_peer: PeerId,
    ) -> BoxFuture<'_, Result<ConnectionHandle>>;
    fn listen(&self, addr: Multiaddr) -> Result<Box<dyn TransportListener>>;
    fn protocols(&self) -> Vec<String>;
    fn can_dial(&self, addr: &Multiaddr) -> bool;
    fn is_proxy(&self) -> bool;
    fn close(&self) -> BoxFuture<'_, Result<()>>;
}

/// Accept side of a [`Transport`].
pub trait TransportListener: Send {
    fn accept(&mut self) -> BoxFuture<'_, Result<ConnectionHandle>>;
    fn close(&mut self);
}
