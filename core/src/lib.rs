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

//! Core traits and structs of dep2p.
//!
//! This crate defines the vocabulary shared by every other crate in the
//! workspace: peer identifiers, multiaddresses, the workspace error type,
//! bus events, the stream/connection model, and the capability traits
//! through which the host and the relay subsystem talk to their
//! collaborators (swarm, peerstore, event bus, NAT service, ...).
//!
//! Collaborators are modeled as object-safe traits so that the host can be
//! composed out of whatever concrete implementations the embedder provides.
//! Every capability except [`Swarm`] is optional; an unset capability means
//! the corresponding feature is disabled.

pub mod capability;
pub mod error;
pub mod event;
pub mod multiaddr;
pub mod peer_id;
pub mod stream;
pub mod util;

pub use capability::{
    CircuitState, ConnManager, Discovery, EventBus, HolePuncher, LifecycleCoordinator,
    LocalAddressView, Nat, Peerstore, ProtocolRegistrar, ReachabilityCoordinator, Router, Spawner,
    StreamHandler, Swarm, SwarmNotifier, Transport, TransportListener,
};
pub use error::Error;
pub use event::{
    Bus, ConnectedEvent, Direction, DisconnectReason, DisconnectedEvent, Event,
    EvtLocalAddrsUpdated, EvtPeerConnected, EvtPeerDisconnected,
};
pub use multiaddr::{Multiaddr, Protocol};
pub use peer_id::PeerId;
pub use stream::{memory_pair, BoxIo, Connection, ConnectionHandle, MemoryStream, Stream};
pub use util::timeout;

/// Result alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, Error>;
