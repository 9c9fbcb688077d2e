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

//! Events published on the bus, and a minimal in-process bus.
//!
//! Emission is at-least-once and fire-and-forget; subscribers must be
//! idempotent. Per-peer connect/disconnect events are serialized by the
//! host's connection-count critical section.

use crate::capability::EventBus;
use crate::multiaddr::Multiaddr;
use crate::peer_id::PeerId;
use futures::channel::mpsc;
use parking_lot::Mutex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Why a connection went away, as reported by the connection itself when it
/// implements the disconnect-reason capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DisconnectReason {
    LocalClose,
    RemoteClose,
    TransportError,
    Unknown,
}

/// The local listen set changed.
#[derive(Clone, Debug, PartialEq)]
pub struct EvtLocalAddrsUpdated {
    pub current: Vec<Multiaddr>,
    pub added: Vec<Multiaddr>,
    pub removed: Vec<Multiaddr>,
}

/// First connection to a peer was established (0 -> 1 transition only).
#[derive(Clone, Debug)]
pub struct EvtPeerConnected {
    pub peer: PeerId,
    pub direction: Direction,
    pub num_conns: usize,
}

/// Last connection to a peer went away (1 -> 0 transition only).
#[derive(Clone, Debug)]
pub struct EvtPeerDisconnected {
    pub peer: PeerId,
    pub num_conns: usize,
    pub reason: DisconnectReason,
    pub error: Option<String>,
}

/// Public events, topic-typed by variant.
#[derive(Clone, Debug)]
pub enum Event {
    LocalAddrsUpdated(EvtLocalAddrsUpdated),
    PeerConnected(EvtPeerConnected),
    PeerDisconnected(EvtPeerDisconnected),
}

/// Internal notification passed between host components on the 0 -> 1 edge.
#[derive(Clone, Debug)]
pub struct ConnectedEvent {
    pub peer: PeerId,
    pub direction: Direction,
}

/// Internal notification passed between host components on the 1 -> 0 edge.
#[derive(Clone, Debug)]
pub struct DisconnectedEvent {
    pub peer: PeerId,
    pub reason: DisconnectReason,
}

/// In-process event bus: unbounded fan-out to every subscriber.
///
/// Dead subscribers are dropped on the next publish.
#[derive(Default)]
pub struct Bus {
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Event>>>,
}

impl Bus {
    pub fn new() -> Self {
        Bus::default()
    }
}

impl EventBus for Bus {
    fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.unbounded_send(event.clone()).is_ok());
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }
}
