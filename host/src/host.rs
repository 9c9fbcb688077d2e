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

//! The host facade.
//!
//! Composes the address manager and the relay subsystem with the external
//! swarm, peerstore, event bus and router, and owns the protocol-handler
//! table. Outbound streams run multistream-select client-side against the
//! one requested protocol; inbound streams run it server-side against the
//! handler table and fall back to the protocol router.
//!
//! The host is the swarm's connection notifier: per-peer connection counts
//! are kept here, and the public connect/disconnect events fire only on
//! the 0 -> 1 and 1 -> 0 edges. The emit decision is made inside the
//! count's critical section and delivered through a single queue, so the
//! per-peer event order is the edge order.

use crate::addr_manager::{AddrManager, OBSERVED_GC_INTERVAL};
use crate::config::Config;
use dep2p_core::{
    timeout, Bus, ConnManager, ConnectedEvent, ConnectionHandle, DisconnectReason,
    DisconnectedEvent, Discovery, Error, Event, EventBus, EvtPeerConnected, EvtPeerDisconnected,
    HolePuncher, LifecycleCoordinator, Multiaddr, Nat, PeerId, Peerstore, ProtocolRegistrar,
    ReachabilityCoordinator, Result, Router, Spawner, Stream, StreamHandler, Swarm, SwarmNotifier,
};
use dep2p_multistream_select::{dialer_select, listener_select};
use dep2p_relay::{
    AutoRelay, Limiter, RelayAcl, RelayClient, RelayManager, RelaySelector, RelayTransport,
};
use fnv::FnvHashMap;
use futures::channel::{mpsc, oneshot};
use futures::executor::{ThreadPool, ThreadPoolBuilder};
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt};
use futures::StreamExt;
use futures_timer::Delay;
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Tag placed on connected peers in the connection manager.
const CONNECTION_TAG: &str = "connection";
const CONNECTION_TAG_WEIGHT: u32 = 10;

/// Optional collaborators handed to [`Host::new`]. Everything is optional;
/// the swarm is the only mandatory capability and is a separate argument.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub peerstore: Option<Arc<dyn Peerstore>>,
    pub bus: Option<Arc<dyn EventBus>>,
    pub conn_manager: Option<Arc<dyn ConnManager>>,
    pub router: Option<Arc<dyn Router>>,
    pub nat: Option<Arc<dyn Nat>>,
    pub hole_puncher: Option<Arc<dyn HolePuncher>>,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub coordinator: Option<Arc<dyn ReachabilityCoordinator>>,
    pub lifecycle: Option<Arc<dyn LifecycleCoordinator>>,
    pub relay_acl: Option<Arc<dyn RelayAcl>>,
}

/// Executor plus the handles needed to cancel and join every spawned task
/// on close.
struct TaskSet {
    executor: ThreadPool,
    tasks: Mutex<Vec<(AbortHandle, oneshot::Receiver<()>)>>,
    closed: AtomicBool,
}

impl TaskSet {
    fn new() -> Result<Self> {
        let executor = ThreadPoolBuilder::new()
            .name_prefix("dep2p-host-")
            .create()
            .map_err(Error::Io)?;
        Ok(TaskSet {
            executor,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        })
    }

    async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let tasks: Vec<(AbortHandle, oneshot::Receiver<()>)> =
            self.tasks.lock().drain(..).collect();
        for (handle, _) in &tasks {
            handle.abort();
        }
        for (_, done) in tasks {
            let _ = done.await;
        }
    }
}

impl Spawner for TaskSet {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let (handle, registration) = AbortHandle::new_pair();
        let (done_tx, done_rx) = oneshot::channel();
        self.executor.spawn_ok(async move {
            let _ = Abortable::new(task, registration).await;
            let _ = done_tx.send(());
        });
        self.tasks.lock().push((handle, done_rx));
    }
}

enum InternalEvent {
    Connected(ConnectedEvent),
    Disconnected(DisconnectedEvent, Option<String>),
}

struct HostInner {
    local: PeerId,
    config: Config,
    swarm: Arc<dyn Swarm>,
    peerstore: Option<Arc<dyn Peerstore>>,
    bus: Arc<dyn EventBus>,
    conn_manager: Option<Arc<dyn ConnManager>>,
    router: Option<Arc<dyn Router>>,
    nat: Option<Arc<dyn Nat>>,
    relay: Option<Arc<RelayManager>>,
    addr_manager: Arc<AddrManager>,
    handlers: RwLock<HashMap<String, StreamHandler>>,
    conn_count: Mutex<FnvHashMap<PeerId, usize>>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    internal_rx: Mutex<Option<mpsc::UnboundedReceiver<InternalEvent>>>,
    tasks: Arc<TaskSet>,
    /// Back-reference to the owning `Arc`, for notifier callbacks that
    /// need to spawn.
    self_ref: Mutex<Weak<HostInner>>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// The public host handle; cheap to clone.
#[derive(Clone)]
pub struct Host {
    inner: Arc<HostInner>,
}

impl Host {
    /// Builds a host over the given swarm. The relay subsystem is
    /// assembled here when the configuration enables it.
    pub fn new(config: Config, swarm: Arc<dyn Swarm>, caps: HostCapabilities) -> Result<Host> {
        let config = config.sanitized();
        let local = swarm.local_peer();
        let tasks = Arc::new(TaskSet::new()?);
        let bus: Arc<dyn EventBus> = caps.bus.clone().unwrap_or_else(|| Arc::new(Bus::new()));
        let addr_manager = Arc::new(AddrManager::new(
            local,
            config.addrs_factory.clone(),
            Some(bus.clone()),
        ));
        if let Some(coordinator) = &caps.coordinator {
            addr_manager.set_coordinator(coordinator.clone());
        }

        let relay = if config.enable_relay_client || config.enable_relay_server {
            let spawner: Arc<dyn Spawner> = tasks.clone();
            let limiter = Arc::new(Limiter::new(config.limiter_config()));
            let client = Arc::new(RelayClient::new(
                local,
                config.relay_client_config(),
                swarm.clone(),
                spawner.clone(),
            ));
            let auto_relay = if config.enable_relay_client {
                Some(Arc::new(AutoRelay::new(
                    local,
                    config.auto_relay_config(),
                    client.clone(),
                    RelaySelector::new(None, &swarm.local_addrs()),
                    caps.discovery.clone(),
                )))
            } else {
                None
            };
            let transport = Arc::new(RelayTransport::new(Default::default()));
            let manager = Arc::new(RelayManager::new(
                local,
                config.relay_manager_config(),
                swarm.clone(),
                spawner,
                client.clone(),
                client,
                auto_relay,
                limiter,
                config.relay_server_config(),
                transport,
                dep2p_relay::ManagerCapabilities {
                    peerstore: caps.peerstore.clone(),
                    hole_puncher: caps.hole_puncher.clone(),
                    lifecycle: caps.lifecycle.clone(),
                    bus: Some(bus.clone()),
                    coordinator: caps.coordinator.clone(),
                    discovery: caps.discovery.clone(),
                    acl: caps.relay_acl.clone(),
                },
            ));
            Some(manager)
        } else {
            None
        };

        let (internal_tx, internal_rx) = mpsc::unbounded();
        let inner = Arc::new(HostInner {
            local,
            config,
            swarm: swarm.clone(),
            peerstore: caps.peerstore,
            bus,
            conn_manager: caps.conn_manager,
            router: caps.router,
            nat: caps.nat,
            relay,
            addr_manager,
            handlers: RwLock::new(HashMap::new()),
            conn_count: Mutex::new(FnvHashMap::default()),
            internal_tx,
            internal_rx: Mutex::new(Some(internal_rx)),
            tasks,
            self_ref: Mutex::new(Weak::new()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        *inner.self_ref.lock() = Arc::downgrade(&inner);
        swarm.set_notifier(Arc::downgrade(&inner) as Weak<dyn SwarmNotifier>);
        Ok(Host { inner })
    }

    pub fn id(&self) -> PeerId {
        self.inner.local
    }

    pub fn addrs(&self) -> Vec<Multiaddr> {
        self.inner.addr_manager.addrs()
    }

    pub fn advertised_addrs(&self) -> Vec<Multiaddr> {
        self.inner.addr_manager.advertised_addrs()
    }

    pub fn shareable_addrs(&self) -> Vec<Multiaddr> {
        self.inner.addr_manager.shareable()
    }

    pub fn hole_punch_addrs(&self) -> Vec<Multiaddr> {
        self.inner.addr_manager.hole_punch_addrs()
    }

    pub fn event_bus(&self) -> Arc<dyn EventBus> {
        self.inner.bus.clone()
    }

    /// The relay manager, when the relay subsystem is enabled.
    pub fn relay_manager(&self) -> Option<Arc<RelayManager>> {
        self.inner.relay.clone()
    }

    pub fn set_reachability_coordinator(&self, coordinator: Arc<dyn ReachabilityCoordinator>) {
        self.inner.addr_manager.set_coordinator(coordinator.clone());
        if let Some(relay) = &self.inner.relay {
            relay.set_coordinator(coordinator);
        }
    }

    pub fn set_stream_handler(&self, protocol: impl Into<String>, handler: StreamHandler) {
        self.inner
            .handlers
            .write()
            .insert(protocol.into(), handler);
    }

    pub fn remove_stream_handler(&self, protocol: &str) {
        self.inner.handlers.write().remove(protocol);
    }

    /// Starts listening on the given addresses and records the bound set.
    pub fn listen(&self, addrs: Vec<Multiaddr>) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let bound = self.inner.swarm.listen(addrs)?;
        self.inner.addr_manager.add_listen_addrs(bound);
        Ok(())
    }

    /// Ensures a connection to `peer`. Non-connectable hint addresses are
    /// silently dropped.
    pub async fn connect(&self, peer: PeerId, addrs: Vec<Multiaddr>) -> Result<ConnectionHandle> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let valid: Vec<Multiaddr> = addrs
            .into_iter()
            .filter(Multiaddr::is_connectable)
            .collect();
        if let Some(peerstore) = &self.inner.peerstore {
            for addr in &valid {
                peerstore.add_addr(peer, addr.clone(), self.inner.config.connected_addr_ttl);
            }
        }
        if let Some(conn) = self.inner.swarm.connection_to(&peer) {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }
        self.inner.swarm.dial(peer, valid).await
    }

    /// Opens a stream to `peer` bound to `protocol`. The optional priority
    /// hint is honored by quic-capable transports and silently ignored
    /// elsewhere. On any failure the stream is reset before the error is
    /// returned.
    pub async fn new_stream(
        &self,
        peer: PeerId,
        protocol: &str,
        priority: Option<u8>,
    ) -> Result<Stream> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let conn = match self.inner.swarm.connection_to(&peer) {
            Some(conn) if !conn.is_closed() => conn,
            _ => match &self.inner.relay {
                Some(relay) => relay.dial_with_priority(peer).await?,
                None => self.inner.swarm.dial(peer, Vec::new()).await?,
            },
        };
        let mut stream = conn.open_stream_prioritized(priority).await?;
        match timeout(
            self.inner.config.negotiation_timeout,
            dialer_select(&mut stream, protocol),
        )
        .await
        {
            Ok(Ok(())) => {
                stream.set_protocol(protocol);
                Ok(stream)
            }
            Ok(Err(e)) => {
                debug!("stream negotiation with {} failed: {}", peer.short(), e);
                stream.reset().await;
                Err(Error::NegotiationFailed)
            }
            Err(e) => {
                stream.reset().await;
                Err(e)
            }
        }
    }

    /// Feeds one observation of our own address, as reported by a peer.
    pub fn add_observed_addr(&self, addr: Multiaddr) -> Result<()> {
        if !self.inner.started.load(Ordering::Acquire) {
            return Err(Error::NotInitialized);
        }
        self.inner.addr_manager.add_observed_addr(addr);
        Ok(())
    }

    /// Starts the host: NAT service, then the relay manager, then the
    /// address manager. NAT and relay failures abort the start; the
    /// address manager's is logged and ignored.
    pub async fn start(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.inner.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted);
        }

        if let Some(nat) = &self.inner.nat {
            if let Err(e) = nat.start().await {
                warn!("nat service failed to start: {}", e);
                return Err(e);
            }
        }

        if let Some(relay) = &self.inner.relay {
            let registrar: Arc<dyn ProtocolRegistrar> = self.inner.clone();
            relay.clone().start(
                registrar,
                self.inner.addr_manager.clone(),
                self.inner.clone().inbound_hook(),
            )?;
            if self.inner.config.enable_relay_server {
                relay.enable_relay()?;
            }
            if relay.relay_addr().0.is_some() {
                let relay = relay.clone();
                self.inner.tasks.spawn(
                    async move {
                        if let Err(e) = relay.connect_and_register().await {
                            warn!("connecting configured relay failed: {}", e);
                        }
                    }
                    .boxed(),
                );
            }
        }

        // Address manager upkeep; a failure here is not fatal.
        let addr_manager = Arc::downgrade(&self.inner.addr_manager);
        self.inner.tasks.spawn(
            async move {
                loop {
                    Delay::new(OBSERVED_GC_INTERVAL).await;
                    match addr_manager.upgrade() {
                        Some(manager) => manager.gc_observed(),
                        None => return,
                    }
                }
            }
            .boxed(),
        );

        // Event pump: delivers the edge-triggered connection events in
        // decision order.
        if let Some(mut internal_rx) = self.inner.internal_rx.lock().take() {
            let inner = Arc::downgrade(&self.inner);
            self.inner.tasks.spawn(
                async move {
                    while let Some(event) = internal_rx.next().await {
                        let inner = match inner.upgrade() {
                            Some(inner) => inner,
                            None => return,
                        };
                        inner.pump_event(event);
                    }
                }
                .boxed(),
            );
        }

        info!("host {} started", self.inner.local.short());
        Ok(())
    }

    /// Stops everything. Idempotent; close errors are logged, never
    /// returned. Cancels the background tasks, stops NAT, relay and swarm
    /// in that order, then joins the tasks.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("host {} closing", self.inner.local.short());

        if let Some(nat) = &self.inner.nat {
            if let Err(e) = nat.close().await {
                warn!("nat close failed: {}", e);
            }
        }
        if let Some(relay) = &self.inner.relay {
            relay.close().await;
        }
        if let Err(e) = self.inner.swarm.close().await {
            warn!("swarm close failed: {}", e);
        }
        self.inner.tasks.shutdown().await;
    }
}

impl HostInner {
    /// Handler table keys plus the router's protocols: everything the
    /// inbound negotiation may settle on.
    fn supported_protocols(&self) -> Vec<String> {
        let mut supported: Vec<String> = self.handlers.read().keys().cloned().collect();
        if let Some(router) = &self.router {
            supported.extend(router.protocols());
        }
        supported
    }

    fn inbound_hook(self: Arc<Self>) -> StreamHandler {
        let inner = Arc::downgrade(&self);
        Arc::new(move |stream| {
            let inner = inner.clone();
            async move {
                match inner.upgrade() {
                    Some(inner) => inner.handle_inbound_stream(stream).await,
                    None => stream.reset().await,
                }
            }
            .boxed()
        })
    }

    /// Negotiates server-side against the handler table and dispatches.
    async fn handle_inbound_stream(self: Arc<Self>, mut stream: Stream) {
        if self.closed.load(Ordering::Acquire) {
            return stream.reset().await;
        }
        let supported = self.supported_protocols();
        let protocol = match timeout(
            self.config.negotiation_timeout,
            listener_select(&mut stream, &supported),
        )
        .await
        {
            Ok(Ok(protocol)) => protocol,
            Ok(Err(e)) => {
                trace!("inbound negotiation failed: {}", e);
                return stream.reset().await;
            }
            Err(_) => {
                trace!("inbound negotiation timed out");
                return stream.reset().await;
            }
        };
        stream.set_protocol(&protocol);

        let handler = self.handlers.read().get(&protocol).cloned();
        if let Some(handler) = handler {
            handler(stream).await;
            return;
        }
        if let Some(router) = &self.router {
            if router.protocols().contains(&protocol) {
                if let Err(e) = router.route(stream).await {
                    debug!("router failed for {}: {}", protocol, e);
                }
                return;
            }
        }
        stream.reset().await;
    }

    fn pump_event(&self, event: InternalEvent) {
        match event {
            InternalEvent::Connected(ev) => {
                self.bus.publish(Event::PeerConnected(EvtPeerConnected {
                    peer: ev.peer,
                    direction: ev.direction,
                    num_conns: 1,
                }));
                if let Some(conn_manager) = &self.conn_manager {
                    conn_manager.tag_peer(ev.peer, CONNECTION_TAG, CONNECTION_TAG_WEIGHT);
                }
            }
            InternalEvent::Disconnected(ev, error) => {
                self.bus
                    .publish(Event::PeerDisconnected(EvtPeerDisconnected {
                        peer: ev.peer,
                        num_conns: 0,
                        reason: ev.reason,
                        error,
                    }));
                if let Some(conn_manager) = &self.conn_manager {
                    conn_manager.untag_peer(ev.peer, CONNECTION_TAG);
                }
            }
        }
    }
}

impl SwarmNotifier for HostInner {
    fn connected(&self, conn: ConnectionHandle) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let peer = conn.peer();
        if let Some(peerstore) = &self.peerstore {
            peerstore.add_addr(peer, conn.remote_addr(), self.config.connected_addr_ttl);
        }
        let mut counts = self.conn_count.lock();
        let count = counts.entry(peer).or_insert(0);
        *count += 1;
        if *count == 1 {
            // The emit decision happens under the count lock so a
            // disconnect for this peer cannot overtake it.
            let _ = self
                .internal_tx
                .unbounded_send(InternalEvent::Connected(ConnectedEvent {
                    peer,
                    direction: conn.direction(),
                }));
        }
        trace!("connection to {} (now {})", peer.short(), *count);
    }

    fn disconnected(&self, conn: ConnectionHandle) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let peer = conn.peer();
        let mut counts = self.conn_count.lock();
        let count = match counts.get_mut(&peer) {
            Some(count) => count,
            None => return,
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            counts.remove(&peer);
            let reason = conn
                .disconnect_reason()
                .unwrap_or(DisconnectReason::Unknown);
            let error = match reason {
                DisconnectReason::TransportError => Some("transport error".to_string()),
                _ => None,
            };
            let _ = self
                .internal_tx
                .unbounded_send(InternalEvent::Disconnected(
                    DisconnectedEvent { peer, reason },
                    error,
                ));
        }
    }

    fn inbound_stream(&self, stream: Stream) {
        if self.closed.load(Ordering::Acquire) {
            self.tasks
                .spawn(async move { stream.reset().await }.boxed());
            return;
        }
        // Negotiation runs on its own task; handlers that block further
        // spawn their own.
        match self.self_ref.lock().upgrade() {
            Some(inner) => {
                let tasks = inner.tasks.clone();
                tasks.spawn(async move { inner.handle_inbound_stream(stream).await }.boxed());
            }
            None => self
                .tasks
                .spawn(async move { stream.reset().await }.boxed()),
        }
    }
}

impl ProtocolRegistrar for HostInner {
    fn register_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.write().insert(protocol.to_string(), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }
}
