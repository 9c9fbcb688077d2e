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

//! Relay server: the HOP protocol endpoint.
//!
//! Tracks reservations (one per peer, TTL-capped) and circuits (per-peer
//! and total caps), establishes circuits by running the STOP handshake
//! toward the reserved destination, and forwards bytes in both directions
//! until either leg finishes.
//!
//! Only the destination of a circuit must hold a reservation; the source
//! is, by definition, the reachable side.

use crate::codec::{read_message, write_message, Message, StatusCode};
use crate::copy_future::{copy_bidirectional, CopyLimits};
use crate::limiter::Limiter;
use crate::STOP_PROTOCOL;
use dep2p_core::{
    timeout, Error, Event, Multiaddr, PeerId, Spawner, Stream, StreamHandler, Swarm,
};
use dep2p_multistream_select::dialer_select;
use fnv::FnvHashMap;
use futures::future::FutureExt;
use futures::StreamExt;
use futures_timer::Delay;
use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Hook deciding which peers may reserve and which pairs may connect.
pub trait RelayAcl: Send + Sync {
    fn allow_reserve(&self, peer: PeerId) -> bool;
    fn allow_connect(&self, src: PeerId, dst: PeerId) -> bool;
}

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RESERVATION_GC_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct RelayServerConfig {
    /// Reservation table size; 0 means unbounded.
    pub max_reservations: usize,
    /// Ceiling on granted reservation lifetimes.
    pub reservation_ttl: Duration,
    /// Concurrent circuits; 0 means unbounded.
    pub max_circuits: usize,
    /// Concurrent circuits touching one peer; 0 means unbounded.
    pub max_circuits_per_peer: usize,
    /// Per-circuit byte cap per direction; 0 disables.
    pub max_circuit_bytes: u64,
    /// Per-circuit lifetime cap; zero disables.
    pub max_circuit_duration: Duration,
    pub buffer_size: usize,
}

impl Default for RelayServerConfig {
    fn default() -> Self {
        RelayServerConfig {
            max_reservations: 128,
            reservation_ttl: Duration::from_secs(3600),
            max_circuits: 1024,
            max_circuits_per_peer: 16,
            max_circuit_bytes: 0,
            max_circuit_duration: Duration::from_secs(0),
            buffer_size: 4096,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct Reservation {
    expires_at: Instant,
    slots: u16,
}

#[derive(Default)]
struct ServerState {
    reservations: FnvHashMap<PeerId, Reservation>,
    /// Endpoint counts: every circuit increments both its source and its
    /// destination here, and decrements both exactly once on termination.
    circuits: FnvHashMap<PeerId, usize>,
    num_circuits: usize,
}

/// Observability snapshot.
#[derive(Clone, Copy, Debug)]
pub struct RelayServerStats {
    pub active_reservations: usize,
    /// Sum over the per-peer circuit counts.
    pub total_circuits: usize,
    pub unique_relayed_peers: usize,
}

pub struct RelayServer {
    local: PeerId,
    config: RelayServerConfig,
    swarm: Arc<dyn Swarm>,
    limiter: Arc<Limiter>,
    acl: Option<Arc<dyn RelayAcl>>,
    spawner: Arc<dyn Spawner>,
    state: Mutex<ServerState>,
}

impl RelayServer {
    pub fn new(
        local: PeerId,
        config: RelayServerConfig,
        swarm: Arc<dyn Swarm>,
        limiter: Arc<Limiter>,
        acl: Option<Arc<dyn RelayAcl>>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        RelayServer {
            local,
            config,
            swarm,
            limiter,
            acl,
            spawner,
            state: Mutex::new(ServerState::default()),
        }
    }

    /// Handler for the HOP protocols (reserve entry point and connect),
    /// registered on the host under both ids.
    pub fn handler(self: Arc<Self>) -> StreamHandler {
        let server = Arc::downgrade(&self);
        Arc::new(move |stream| {
            let server = server.clone();
            async move {
                match server.upgrade() {
                    Some(server) => server.handle_hop(stream).await,
                    None => stream.reset().await,
                }
            }
            .boxed()
        })
    }

    async fn handle_hop(self: Arc<Self>, mut stream: Stream) {
        let peer = stream.peer();
        let first = match timeout(HANDSHAKE_TIMEOUT, read_message(&mut stream)).await {
            Ok(Ok(message)) => message,
            _ => return stream.reset().await,
        };
        match first {
            Message::Reserve { ttl } => self.handle_reserve(stream, peer, ttl).await,
            Message::Connect { dst, protocol: _ } => {
                self.handle_connect(stream, peer, dst).await
            }
            Message::Status { .. } => {
                // Observability probe; answer with the current snapshot.
                let stats = self.stats();
                let _ = write_message(
                    &mut stream,
                    &Message::Status {
                        reservations: stats.active_reservations as u32,
                        circuits: stats.total_circuits as u32,
                        data_rate: self.limiter.config().max_bandwidth,
                    },
                )
                .await;
            }
            other => {
                debug!("unexpected hop message from {}: {:?}", peer.short(), other);
                let _ = write_message(
                    &mut stream,
                    &Message::ReserveError {
                        code: StatusCode::Unexpected,
                    },
                )
                .await;
                stream.reset().await;
            }
        }
    }

    async fn handle_reserve(self: Arc<Self>, mut stream: Stream, peer: PeerId, requested_ttl: u32) {
        if let Some(acl) = &self.acl {
            if !acl.allow_reserve(peer) {
                let _ = write_message(
                    &mut stream,
                    &Message::ReserveError {
                        code: StatusCode::PermissionDenied,
                    },
                )
                .await;
                return;
            }
        }
        if let Err(e) = self.limiter.allow_reservation(peer) {
            debug!("reservation by {} refused: {}", peer.short(), e);
            let _ = write_message(
                &mut stream,
                &Message::ReserveError {
                    code: StatusCode::from_error(&e),
                },
            )
            .await;
            return;
        }

        let granted = {
            let mut state = self.state.lock();
            // Expired entries must not hold slots between GC ticks.
            let now = Instant::now();
            state.reservations.retain(|_, r| r.expires_at > now);
            let renewal = state.reservations.contains_key(&peer);
            if !renewal
                && self.config.max_reservations > 0
                && state.reservations.len() >= self.config.max_reservations
            {
                None
            } else {
                let requested = Duration::from_secs(u64::from(requested_ttl));
                let ttl = if requested.as_secs() == 0 || requested > self.config.reservation_ttl {
                    self.config.reservation_ttl
                } else {
                    requested
                };
                let slots = self.config.max_circuits_per_peer as u16;
                state.reservations.insert(
                    peer,
                    Reservation {
                        expires_at: Instant::now() + ttl,
                        slots,
                    },
                );
                Some((ttl, slots, renewal))
            }
        };

        match granted {
            Some((ttl, slots, renewal)) => {
                info!(
                    "reservation for {} granted (ttl {:?}, renewal: {})",
                    peer.short(),
                    ttl,
                    renewal
                );
                let addrs: Vec<Multiaddr> = self
                    .swarm
                    .local_addrs()
                    .into_iter()
                    .filter(Multiaddr::is_connectable)
                    .take(u8::MAX as usize)
                    .collect();
                let _ = write_message(
                    &mut stream,
                    &Message::ReserveOk {
                        ttl: ttl.as_secs() as u32,
                        slots,
                        addrs,
                    },
                )
                .await;
            }
            None => {
                debug!("reservation table full, refusing {}", peer.short());
                let _ = write_message(
                    &mut stream,
                    &Message::ReserveError {
                        code: StatusCode::ResourceLimit,
                    },
                )
                .await;
            }
        }
    }

    async fn handle_connect(self: Arc<Self>, mut src_stream: Stream, src: PeerId, dst: PeerId) {
        // v2 rule: only the destination must hold a reservation.
        let reserved = {
            let state = self.state.lock();
            state
                .reservations
                .get(&dst)
                .map_or(false, |r| r.expires_at > Instant::now())
        };
        if !reserved {
            trace!("connect {} -> {}: no reservation", src.short(), dst.short());
            return refuse(&mut src_stream, StatusCode::NoReservation).await;
        }
        if let Some(acl) = &self.acl {
            if !acl.allow_connect(src, dst) {
                return refuse(&mut src_stream, StatusCode::PermissionDenied).await;
            }
        }
        if let Err(e) = self.limiter.allow_circuit(src) {
            return refuse(&mut src_stream, StatusCode::from_error(&e)).await;
        }
        if let Err(e) = self.limiter.allow_circuit(dst) {
            self.limiter.release_circuit(src);
            return refuse(&mut src_stream, StatusCode::from_error(&e)).await;
        }

        let admitted = {
            let mut state = self.state.lock();
            let per_peer_ok = |state: &ServerState, peer: &PeerId| {
                self.config.max_circuits_per_peer == 0
                    || state.circuits.get(peer).copied().unwrap_or(0)
                        < self.config.max_circuits_per_peer
            };
            if (self.config.max_circuits > 0 && state.num_circuits >= self.config.max_circuits)
                || !per_peer_ok(&state, &src)
                || !per_peer_ok(&state, &dst)
            {
                false
            } else {
                *state.circuits.entry(src).or_insert(0) += 1;
                *state.circuits.entry(dst).or_insert(0) += 1;
                state.num_circuits += 1;
                true
            }
        };
        if !admitted {
            self.limiter.release_circuit(src);
            self.limiter.release_circuit(dst);
            return refuse(&mut src_stream, StatusCode::ResourceLimit).await;
        }
        let slot = CircuitSlot {
            server: self.clone(),
            src,
            dst,
            released: AtomicBool::new(false),
        };

        // Prefer the existing connection: the destination is the one
        // behind NAT, a fresh dial rarely works.
        let dst_conn = match self.swarm.connection_to(&dst) {
            Some(conn) => conn,
            None => match timeout(HANDSHAKE_TIMEOUT, self.swarm.dial(dst, Vec::new())).await {
                Ok(Ok(conn)) => conn,
                _ => {
                    slot.release();
                    return refuse(&mut src_stream, StatusCode::PeerNotFound).await;
                }
            },
        };

        let mut dst_stream = match timeout(HANDSHAKE_TIMEOUT, dst_conn.open_stream()).await {
            Ok(Ok(stream)) => stream,
            _ => {
                slot.release();
                return refuse(&mut src_stream, StatusCode::ConnectionFailed).await;
            }
        };

        let stop = async {
            dialer_select(&mut dst_stream, STOP_PROTOCOL).await?;
            write_message(
                &mut dst_stream,
                &Message::StopConnect {
                    relay: self.local,
                    src,
                },
            )
            .await?;
            match read_message(&mut dst_stream).await? {
                Message::StopConnectOk => Ok(()),
                Message::StopConnectError { code } => Err(code.into_error()),
                other => Err(Error::ProtocolError(format!(
                    "unexpected stop answer {:?}",
                    other
                ))),
            }
        };
        match timeout(HANDSHAKE_TIMEOUT, stop).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("stop handshake with {} failed: {}", dst.short(), e);
                slot.release();
                dst_stream.reset().await;
                // Forward the destination's refusal code to the source.
                return refuse(&mut src_stream, StatusCode::from_error(&e)).await;
            }
            Err(_) => {
                slot.release();
                dst_stream.reset().await;
                return refuse(&mut src_stream, StatusCode::ConnectionFailed).await;
            }
        }

        if write_message(&mut src_stream, &Message::ConnectOk).await.is_err() {
            slot.release();
            dst_stream.reset().await;
            return src_stream.reset().await;
        }

        info!("circuit established: {} -> {}", src.short(), dst.short());
        let limits = CopyLimits {
            max_bytes: self.config.max_circuit_bytes,
            max_duration: self.config.max_circuit_duration,
            buffer_size: self.config.buffer_size,
        };
        self.spawner.spawn(
            async move {
                match copy_bidirectional(src_stream, dst_stream, limits).await {
                    Ok(bytes) => {
                        trace!(
                            "circuit {} -> {} closed after {} bytes",
                            slot.src.short(),
                            slot.dst.short(),
                            bytes
                        )
                    }
                    Err(e) => debug!(
                        "circuit {} -> {} failed: {}",
                        slot.src.short(),
                        slot.dst.short(),
                        e
                    ),
                }
                slot.release();
            }
            .boxed(),
        );
    }

    fn release_slot(&self, src: PeerId, dst: PeerId) {
        let mut state = self.state.lock();
        for peer in [src, dst].iter() {
            if let Some(count) = state.circuits.get_mut(peer) {
                *count -= 1;
                if *count == 0 {
                    state.circuits.remove(peer);
                }
            }
        }
        state.num_circuits = state.num_circuits.saturating_sub(1);
        drop(state);
        self.limiter.release_circuit(src);
        self.limiter.release_circuit(dst);
    }

    /// Evicts expired reservations. Called by the GC loop every minute.
    pub fn gc_expired(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let before = state.reservations.len();
        state.reservations.retain(|_, r| r.expires_at > now);
        let evicted = before - state.reservations.len();
        if evicted > 0 {
            debug!("evicted {} expired reservations", evicted);
        }
    }

    /// Immediate cleanup when a peer's last connection goes away.
    pub fn on_peer_disconnected(&self, peer: PeerId) {
        let removed = {
            let mut state = self.state.lock();
            state.reservations.remove(&peer);
            state.circuits.remove(&peer).unwrap_or(0)
        };
        for _ in 0..removed {
            self.limiter.release_circuit(peer);
        }
        if removed > 0 {
            debug!(
                "dropped {} circuit slots for disconnected {}",
                removed,
                peer.short()
            );
        }
    }

    pub fn stats(&self) -> RelayServerStats {
        let state = self.state.lock();
        RelayServerStats {
            active_reservations: state.reservations.len(),
            total_circuits: state.circuits.values().sum(),
            unique_relayed_peers: state.circuits.len(),
        }
    }

    /// Reservation GC ticker. Holds the server weakly so that dropping
    /// the last strong handle (relay disabled) ends the loop.
    pub async fn gc_loop(server: std::sync::Weak<RelayServer>) {
        loop {
            Delay::new(RESERVATION_GC_INTERVAL).await;
            match server.upgrade() {
                Some(server) => server.gc_expired(),
                None => return,
            }
        }
    }

    /// Watches the event bus for peer disconnects; ends with the server or
    /// the bus, whichever goes first.
    pub async fn watch_disconnects(
        server: std::sync::Weak<RelayServer>,
        mut events: futures::channel::mpsc::UnboundedReceiver<Event>,
    ) {
        while let Some(event) = events.next().await {
            if let Event::PeerDisconnected(ev) = event {
                match server.upgrade() {
                    Some(server) => server.on_peer_disconnected(ev.peer),
                    None => return,
                }
            }
        }
    }
}

struct CircuitSlot {
    server: Arc<RelayServer>,
    src: PeerId,
    dst: PeerId,
    released: AtomicBool,
}

impl CircuitSlot {
    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.server.release_slot(self.src, self.dst);
        }
    }
}

impl Drop for CircuitSlot {
    fn drop(&mut self) {
        self.release();
    }
}

async fn refuse(stream: &mut Stream, code: StatusCode) {
    if let Err(e) = write_message(stream, &Message::ConnectError { code }).await {
        warn!("failed to send refusal: {}", e);
    }
}
