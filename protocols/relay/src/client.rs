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

//! Client side of the relay protocols.
//!
//! Holds the single-relay state machine
//! (`None -> Configured -> Connecting -> Connected`, with `Failed` terminal
//! for the attempt), acquires reservations over HOP, accepts inbound
//! circuits over STOP and dials peers through the configured relay.

use crate::circuit::{Circuit, Role, StateCallback};
use crate::codec::{read_message, write_message, Message, StatusCode, Voucher};
use crate::transport::CircuitDialer;
use crate::{HOP_PROTOCOL, RESERVE_PROTOCOL};
use dep2p_core::{
    timeout, Connection, ConnectionHandle, Direction, Error, Multiaddr, PeerId, Protocol,
    ReachabilityCoordinator, Result, Spawner, Stream, StreamHandler, Swarm,
};
use dep2p_multistream_select::dialer_select;
use futures::future::{self, BoxFuture, FutureExt};
use futures::StreamExt;
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// State of the configured primary relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RelayState {
    None,
    Configured,
    Connecting,
    Connected,
    Failed,
}

/// A granted reservation, as seen by the client.
#[derive(Clone, Debug)]
pub struct ReservationInfo {
    pub expires_at: Instant,
    pub ttl: Duration,
    pub slots: u16,
    /// Addresses the relay advertises for itself.
    pub relay_addrs: Vec<Multiaddr>,
    pub voucher: Voucher,
}

/// Anything that can acquire a HOP reservation at a given relay. AutoRelay
/// is written against this so its pool logic can be exercised without a
/// live relay.
pub trait HopReserver: Send + Sync {
    fn reserve(
        &self,
        relay: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> BoxFuture<'_, Result<(ConnectionHandle, ReservationInfo)>>;
}

#[derive(Clone, Copy, Debug)]
pub struct RelayClientConfig {
    pub reserve_timeout: Duration,
    pub dial_timeout: Duration,
    /// Reservation lifetime requested from relays, in seconds.
    pub reservation_ttl: u32,
    /// Idle window after which a circuit is reported stale.
    pub idle_timeout: Duration,
}

impl Default for RelayClientConfig {
    fn default() -> Self {
        RelayClientConfig {
            reserve_timeout: Duration::from_secs(10),
            dial_timeout: Duration::from_secs(30),
            reservation_ttl: 3600,
            idle_timeout: Duration::from_secs(5 * 60),
        }
    }
}

struct ClientInner {
    state: RelayState,
    relay_addr: Option<Multiaddr>,
    relay_peer: Option<PeerId>,
    relay_conn: Option<ConnectionHandle>,
    reservation: Option<ReservationInfo>,
}

/// Client service for the configured primary relay plus the STOP endpoint
/// shared by every reservation (primary and autorelay alike).
pub struct RelayClient {
    local: PeerId,
    config: RelayClientConfig,
    swarm: Arc<dyn Swarm>,
    spawner: Arc<dyn Spawner>,
    coordinator: Mutex<Option<Arc<dyn ReachabilityCoordinator>>>,
    /// Host inbound pipeline; logical streams accepted over circuits are
    /// fed through it so the payload protocol gets negotiated.
    inbound_hook: Mutex<Option<StreamHandler>>,
    /// Sink for whole inbound circuit connections (the relay transport's
    /// listener).
    deliver_inbound: Mutex<Option<Arc<dyn Fn(ConnectionHandle) + Send + Sync>>>,
    inner: Mutex<ClientInner>,
}

impl RelayClient {
    pub fn new(
        local: PeerId,
        config: RelayClientConfig,
        swarm: Arc<dyn Swarm>,
        spawner: Arc<dyn Spawner>,
    ) -> Self {
        RelayClient {
            local,
            config,
            swarm,
            spawner,
            coordinator: Mutex::new(None),
            inbound_hook: Mutex::new(None),
            deliver_inbound: Mutex::new(None),
            inner: Mutex::new(ClientInner {
                state: RelayState::None,
                relay_addr: None,
                relay_peer: None,
                relay_conn: None,
                reservation: None,
            }),
        }
    }

    pub fn set_coordinator(&self, coordinator: Arc<dyn ReachabilityCoordinator>) {
        *self.coordinator.lock() = Some(coordinator);
    }

    pub fn set_inbound_hook(&self, hook: StreamHandler) {
        *self.inbound_hook.lock() = Some(hook);
    }

    pub fn set_deliver_inbound(&self, deliver: Arc<dyn Fn(ConnectionHandle) + Send + Sync>) {
        *self.deliver_inbound.lock() = Some(deliver);
    }

    pub fn state(&self) -> RelayState {
        self.inner.lock().state
    }

    /// The configured relay address and whether the client is currently
    /// connected to it.
    pub fn relay_addr(&self) -> (Option<Multiaddr>, bool) {
        let inner = self.inner.lock();
        (
            inner.relay_addr.clone(),
            inner.state == RelayState::Connected,
        )
    }

    /// Configures the relay to use. The address must carry the relay's
    /// peer id; using the local peer as relay is rejected.
    pub fn set_relay(&self, addr: Multiaddr) -> Result<()> {
        let relay = addr
            .final_peer()
            .ok_or_else(|| Error::InvalidAddress(format!("{} has no /p2p component", addr)))?;
        if relay == self.local {
            return Err(Error::CannotRelayToSelf);
        }
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.relay_conn.take() {
            drop_connection(&self.spawner, conn);
        }
        inner.relay_addr = Some(addr);
        inner.relay_peer = Some(relay);
        inner.reservation = None;
        inner.state = RelayState::Configured;
        Ok(())
    }

    /// Drops the relay configuration entirely.
    pub fn remove_relay(&self) {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.relay_conn.take() {
            drop_connection(&self.spawner, conn);
        }
        inner.relay_addr = None;
        inner.relay_peer = None;
        inner.reservation = None;
        inner.state = RelayState::None;
    }

    /// Connects to the configured relay and acquires a reservation.
    /// Idempotent: returns Ok immediately when already connecting or
    /// connected.
    pub async fn connect(&self) -> Result<()> {
        let (relay, addr) = {
            let mut inner = self.inner.lock();
            match inner.state {
                RelayState::Connected | RelayState::Connecting => return Ok(()),
                RelayState::None => return Err(Error::NotInitialized),
                RelayState::Failed => {
                    return Err(Error::ReservationFailed(Box::new(Error::Internal(
                        "previous attempt failed; reconfigure the relay".into(),
                    ))))
                }
                RelayState::Configured => {}
            }
            inner.state = RelayState::Connecting;
            (
                inner.relay_peer.expect("configured state has a relay peer"),
                inner.relay_addr.clone().expect("configured state has an addr"),
            )
        };

        match hop_reserve(
            self.swarm.as_ref(),
            self.local,
            relay,
            vec![addr],
            self.config.reservation_ttl,
            self.config.reserve_timeout,
        )
        .await
        {
            Ok((conn, info)) => {
                let mut inner = self.inner.lock();
                inner.relay_conn = Some(conn);
                inner.reservation = Some(info);
                inner.state = RelayState::Connected;
                Ok(())
            }
            Err(e) => {
                let mut inner = self.inner.lock();
                inner.state = RelayState::Failed;
                inner.relay_conn = None;
                inner.reservation = None;
                debug!("relay reservation at {} failed: {}", relay.short(), e);
                Err(Error::ReservationFailed(Box::new(e)))
            }
        }
    }

    /// Closes the connection to the relay, returning to `Configured`.
    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        if inner.state != RelayState::Connected {
            return;
        }
        if let Some(conn) = inner.relay_conn.take() {
            drop_connection(&self.spawner, conn);
        }
        inner.reservation = None;
        inner.state = RelayState::Configured;
    }

    /// Periodic upkeep: an expired reservation drops the client back to
    /// `Configured` so the next dial reconnects.
    pub fn maintenance_tick(&self) {
        let expired = {
            let inner = self.inner.lock();
            matches!(
                (&inner.state, &inner.reservation),
                (RelayState::Connected, Some(res)) if res.expires_at <= Instant::now()
            )
        };
        if expired {
            debug!("relay reservation expired");
            self.disconnect();
        }
    }

    /// Dials `target` through the configured relay and returns the
    /// multiplexed circuit as a connection.
    pub async fn dial_via_relay(&self, target: PeerId) -> Result<ConnectionHandle> {
        if self.state() != RelayState::Connected {
            self.connect().await?;
        }
        let (conn, relay, relay_addr) = {
            let inner = self.inner.lock();
            match (&inner.relay_conn, inner.relay_peer, &inner.relay_addr) {
                (Some(conn), Some(relay), Some(addr)) => {
                    (conn.clone(), relay, addr.clone())
                }
                _ => return Err(Error::NotInitialized),
            }
        };

        let mut stream = timeout(self.config.dial_timeout, conn.open_stream()).await??;
        let handshake = async {
            dialer_select(&mut stream, HOP_PROTOCOL).await?;
            write_message(
                &mut stream,
                &Message::Connect {
                    dst: target,
                    protocol: None,
                },
            )
            .await?;
            match read_message(&mut stream).await? {
                Message::ConnectOk => Ok(()),
                Message::ConnectError { code } => Err(code.into_error()),
                other => Err(Error::ProtocolError(format!(
                    "unexpected connect answer {:?}",
                    other
                ))),
            }
        };
        if let Err(e) = timeout(self.config.dial_timeout, handshake).await? {
            stream.reset().await;
            return Err(e);
        }

        let remote_addr = relay_addr
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(target));
        Ok(self.wrap_circuit(
            stream,
            relay,
            target,
            Role::Initiator,
            conn.local_addr(),
            remote_addr,
            Direction::Outbound,
        ))
    }

    /// Handler for the STOP protocol, registered on the host. Completes
    /// the handshake, wraps the stream as a multiplexed circuit and hands
    /// the connection to the transport listener.
    pub fn stop_handler(self: Arc<Self>) -> StreamHandler {
        let client = Arc::downgrade(&self);
        Arc::new(move |stream| {
            let client = client.clone();
            async move {
                let client = match client.upgrade() {
                    Some(client) => client,
                    None => return stream.reset().await,
                };
                client.accept_stop(stream).await;
            }
            .boxed()
        })
    }

    async fn accept_stop(self: Arc<Self>, mut stream: Stream) {
        let (relay, src) = match read_message(&mut stream).await {
            Ok(Message::StopConnect { relay, src }) => (relay, src),
            Ok(other) => {
                debug!("unexpected stop message: {:?}", other);
                let _ = write_message(
                    &mut stream,
                    &Message::StopConnectError {
                        code: StatusCode::Unexpected,
                    },
                )
                .await;
                return stream.reset().await;
            }
            Err(_) => {
                let _ = write_message(
                    &mut stream,
                    &Message::StopConnectError {
                        code: StatusCode::MalformedMessage,
                    },
                )
                .await;
                return stream.reset().await;
            }
        };
        if write_message(&mut stream, &Message::StopConnectOk).await.is_err() {
            return stream.reset().await;
        }

        // Best known address for the far end: through the relay.
        let remote_addr = Multiaddr::empty()
            .with(Protocol::P2p(relay))
            .with(Protocol::P2pCircuit)
            .with(Protocol::P2p(src));
        let conn = self.wrap_circuit(
            stream,
            relay,
            src,
            Role::Receiver,
            Multiaddr::empty(),
            remote_addr,
            Direction::Inbound,
        );
        match self.deliver_inbound.lock().clone() {
            Some(deliver) => deliver(conn),
            None => warn!("inbound circuit from {} dropped: no listener", src.short()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn wrap_circuit(
        &self,
        stream: Stream,
        relay: PeerId,
        remote: PeerId,
        role: Role,
        local_addr: Multiaddr,
        remote_addr: Multiaddr,
        direction: Direction,
    ) -> ConnectionHandle {
        let on_state: Option<StateCallback> = self.coordinator.lock().clone().map(|coordinator| {
            let callback: StateCallback =
                Arc::new(move |relay, state| coordinator.circuit_state_changed(relay, state));
            callback
        });
        let (circuit, mut accepted, driver) = Circuit::new(
            stream,
            relay,
            remote,
            role,
            self.config.idle_timeout,
            on_state,
        );
        self.spawner.spawn(driver.boxed());

        // Every logical stream the remote opens goes through the host's
        // inbound pipeline for payload-protocol negotiation.
        let hook = self.inbound_hook.lock().clone();
        self.spawner.spawn(
            async move {
                while let Some(stream) = accepted.next().await {
                    match &hook {
                        Some(hook) => hook(stream).await,
                        None => stream.reset().await,
                    }
                }
            }
            .boxed(),
        );

        Arc::new(RelayedConnection {
            circuit,
            local_addr,
            remote_addr,
            direction,
        })
    }
}

impl CircuitDialer for RelayClient {
    fn dial_via_relay(&self, target: PeerId) -> BoxFuture<'_, Result<ConnectionHandle>> {
        RelayClient::dial_via_relay(self, target).boxed()
    }
}

impl HopReserver for RelayClient {
    fn reserve(
        &self,
        relay: PeerId,
        addrs: Vec<Multiaddr>,
    ) -> BoxFuture<'_, Result<(ConnectionHandle, ReservationInfo)>> {
        hop_reserve(
            self.swarm.as_ref(),
            self.local,
            relay,
            addrs,
            self.config.reservation_ttl,
            self.config.reserve_timeout,
        )
        .boxed()
    }
}

/// Dials `relay` and runs the HOP reserve handshake.
async fn hop_reserve(
    swarm: &dyn Swarm,
    local: PeerId,
    relay: PeerId,
    addrs: Vec<Multiaddr>,
    ttl_secs: u32,
    deadline: Duration,
) -> Result<(ConnectionHandle, ReservationInfo)> {
    let conn = timeout(deadline, swarm.dial(relay, addrs)).await??;
    let mut stream = timeout(deadline, conn.open_stream()).await??;
    let handshake = async {
        dialer_select(&mut stream, RESERVE_PROTOCOL).await?;
        write_message(&mut stream, &Message::Reserve { ttl: ttl_secs }).await?;
        match read_message(&mut stream).await? {
            Message::ReserveOk { ttl, slots, addrs } => Ok((ttl, slots, addrs)),
            Message::ReserveError { code } => Err(code.into_error()),
            other => Err(Error::ProtocolError(format!(
                "unexpected reserve answer {:?}",
                other
            ))),
        }
    };
    let (ttl, slots, relay_addrs) = match timeout(deadline, handshake).await? {
        Ok(granted) => granted,
        Err(e) => {
            stream.reset().await;
            return Err(e);
        }
    };

    let ttl = Duration::from_secs(u64::from(ttl));
    let now_unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);
    let info = ReservationInfo {
        expires_at: Instant::now() + ttl,
        ttl,
        slots,
        relay_addrs,
        voucher: Voucher {
            relay,
            peer: local,
            expiration: now_unix + ttl.as_secs() as i64,
            duration: ttl,
            data_limit: 0,
        },
    };
    Ok((conn, info))
}

/// Closes a connection in the background; close errors are logged only.
fn drop_connection(spawner: &Arc<dyn Spawner>, conn: ConnectionHandle) {
    spawner.spawn(
        async move {
            if let Err(e) = conn.close().await {
                debug!("closing relay connection failed: {}", e);
            }
        }
        .boxed(),
    );
}

/// A connection backed by a multiplexed relay circuit.
pub struct RelayedConnection {
    circuit: Circuit,
    local_addr: Multiaddr,
    remote_addr: Multiaddr,
    direction: Direction,
}

impl RelayedConnection {
    pub fn relay(&self) -> PeerId {
        self.circuit.relay()
    }
}

impl Connection for RelayedConnection {
    fn peer(&self) -> PeerId {
        self.circuit.remote()
    }

    fn local_addr(&self) -> Multiaddr {
        self.local_addr.clone()
    }

    fn remote_addr(&self) -> Multiaddr {
        self.remote_addr.clone()
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn open_stream(&self) -> BoxFuture<'_, Result<Stream>> {
        future::ready(self.circuit.open_stream()).boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.circuit.close();
        future::ready(Ok(())).boxed()
    }

    fn is_closed(&self) -> bool {
        self.circuit.is_closed()
    }
}
