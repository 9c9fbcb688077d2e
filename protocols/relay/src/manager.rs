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

//! Relay lifecycle coordination and the priority dialer.
//!
//! Dial order is direct -> hole-punch -> relay; a hole-punch success keeps
//! the prior relay connection as a backup for re-signalling. Enabling the
//! relay server is gated on public reachability so a NAT'd node cannot
//! claim relay capability.

use crate::auto_relay::AutoRelay;
use crate::client::RelayClient;
use crate::limiter::Limiter;
use crate::server::{RelayAcl, RelayServer, RelayServerConfig};
use crate::transport::{CircuitDialer, RelayTransport};
use crate::{HOP_PROTOCOL, RELAY_NAMESPACE, RESERVE_PROTOCOL, STOP_PROTOCOL};
use dep2p_core::{
    ConnectionHandle, Discovery, Error, EventBus, HolePuncher, LifecycleCoordinator,
    LocalAddressView, Multiaddr, PeerId, Peerstore, ProtocolRegistrar, ReachabilityCoordinator,
    Result, Spawner, StreamHandler, Swarm, Transport,
};
use fnv::FnvHashMap;
use futures::future::{BoxFuture, FutureExt};
use futures_timer::Delay;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Optional collaborators; unset means the feature is disabled.
#[derive(Clone, Default)]
pub struct ManagerCapabilities {
    pub peerstore: Option<Arc<dyn Peerstore>>,
    pub hole_puncher: Option<Arc<dyn HolePuncher>>,
    pub lifecycle: Option<Arc<dyn LifecycleCoordinator>>,
    pub bus: Option<Arc<dyn EventBus>>,
    pub coordinator: Option<Arc<dyn ReachabilityCoordinator>>,
    pub discovery: Option<Arc<dyn Discovery>>,
    pub acl: Option<Arc<dyn RelayAcl>>,
}

#[derive(Clone, Debug)]
pub struct RelayManagerConfig {
    pub keep_relay_after_hole_punch: bool,
    /// Single pinned relay configured at startup, if any.
    pub relay_addr: Option<Multiaddr>,
    /// TTL for peerstore writes made on relay registration.
    pub connected_addr_ttl: Duration,
}

impl Default for RelayManagerConfig {
    fn default() -> Self {
        RelayManagerConfig {
            keep_relay_after_hole_punch: true,
            relay_addr: None,
            connected_addr_ttl: Duration::from_secs(30 * 60),
        }
    }
}

pub struct RelayManager {
    local: PeerId,
    config: RelayManagerConfig,
    swarm: Arc<dyn Swarm>,
    spawner: Arc<dyn Spawner>,
    client: Arc<RelayClient>,
    /// The relay dial leg. In production this is the client service; tests
    /// substitute it.
    relay_dial: Arc<dyn CircuitDialer>,
    auto_relay: Option<Arc<AutoRelay>>,
    limiter: Arc<Limiter>,
    server_config: RelayServerConfig,
    transport: Arc<RelayTransport>,
    caps: ManagerCapabilities,
    registrar: Mutex<Option<Arc<dyn ProtocolRegistrar>>>,
    addr_view: Mutex<Option<Arc<dyn LocalAddressView>>>,
    server: Mutex<Option<Arc<RelayServer>>>,
    /// Live relay-backed connections by destination.
    relayed_conns: Mutex<FnvHashMap<PeerId, ConnectionHandle>>,
    /// Relay connections preserved across a hole-punch success.
    backup_relay_conns: Mutex<FnvHashMap<PeerId, ConnectionHandle>>,
}

impl RelayManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        local: PeerId,
        config: RelayManagerConfig,
        swarm: Arc<dyn Swarm>,
        spawner: Arc<dyn Spawner>,
        client: Arc<RelayClient>,
        relay_dial: Arc<dyn CircuitDialer>,
        auto_relay: Option<Arc<AutoRelay>>,
        limiter: Arc<Limiter>,
        server_config: RelayServerConfig,
        transport: Arc<RelayTransport>,
        caps: ManagerCapabilities,
    ) -> Self {
        RelayManager {
            local,
            config,
            swarm,
            spawner,
            client,
            relay_dial,
            auto_relay,
            limiter,
            server_config,
            transport,
            caps,
            registrar: Mutex::new(None),
            addr_view: Mutex::new(None),
            server: Mutex::new(None),
            relayed_conns: Mutex::new(FnvHashMap::default()),
            backup_relay_conns: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Wires the manager into the host: registers the STOP handler, points
    /// the transport at this manager and starts the background loops.
    pub fn start(
        self: Arc<Self>,
        registrar: Arc<dyn ProtocolRegistrar>,
        addr_view: Arc<dyn LocalAddressView>,
        inbound_hook: StreamHandler,
    ) -> Result<()> {
        *self.registrar.lock() = Some(registrar.clone());
        *self.addr_view.lock() = Some(addr_view);

        if let Some(coordinator) = &self.caps.coordinator {
            self.client.set_coordinator(coordinator.clone());
        }
        self.client.set_inbound_hook(inbound_hook);

        let weak = Arc::downgrade(&self);
        self.client.set_deliver_inbound(Arc::new(move |conn: ConnectionHandle| {
            if let Some(manager) = weak.upgrade() {
                manager.relayed_conns.lock().insert(conn.peer(), conn.clone());
                manager.transport.deliver_inbound(conn);
            }
        }));
        registrar.register_handler(STOP_PROTOCOL, self.client.clone().stop_handler());

        let weak: std::sync::Weak<dyn CircuitDialer> =
            Arc::downgrade(&self) as std::sync::Weak<dyn CircuitDialer>;
        self.transport.set_dialer(weak);

        if let Some(auto_relay) = &self.auto_relay {
            if let Some(coordinator) = self.caps.coordinator.clone() {
                auto_relay.set_on_addrs_changed(Arc::new(move |addrs| {
                    coordinator.set_relay_addrs(addrs);
                }));
            }
            self.spawner.spawn(auto_relay.clone().run().boxed());
        }

        if let Some(addr) = self.config.relay_addr.clone() {
            if let Err(e) = self.set_relay_addr(addr) {
                warn!("configured relay rejected: {}", e);
            }
        }

        let weak = Arc::downgrade(&self);
        self.spawner.spawn(
            async move {
                loop {
                    Delay::new(MAINTENANCE_INTERVAL).await;
                    match weak.upgrade() {
                        Some(manager) => {
                            manager.client.maintenance_tick();
                            manager.close_stale().await;
                        }
                        None => return,
                    }
                }
            }
            .boxed(),
        );
        Ok(())
    }

    /// Tries strategies in order: existing connection, direct dial,
    /// hole punch, relay. A hole-punch success preserves an existing relay
    /// connection as backup when so configured. Only after the relay leg
    /// also fails does the caller see an error.
    pub async fn dial_with_priority(&self, target: PeerId) -> Result<ConnectionHandle> {
        if let Some(conn) = self.swarm.connection_to(&target) {
            if !conn.is_closed() {
                return Ok(conn);
            }
        }

        let known: Vec<Multiaddr> = self
            .caps
            .peerstore
            .as_ref()
            .map(|peerstore| peerstore.addrs(&target))
            .unwrap_or_default();
        let direct: Vec<Multiaddr> = known
            .iter()
            .filter(|addr| addr.is_direct_connectable())
            .cloned()
            .collect();

        match self.swarm.dial(target, direct.clone()).await {
            Ok(conn) => return Ok(conn),
            Err(e) if e.is_recoverable() => {
                debug!("direct dial to {} failed: {}", target.short(), e)
            }
            Err(e) => return Err(e),
        }

        if let Some(puncher) = &self.caps.hole_puncher {
            match puncher.direct_connect(target, direct).await {
                Ok(conn) => {
                    if self.config.keep_relay_after_hole_punch {
                        if let Some(relay_conn) =
                            self.relayed_conns.lock().get(&target).cloned()
                        {
                            self.backup_relay_conns
                                .lock()
                                .entry(target)
                                .or_insert(relay_conn);
                            info!(
                                "kept relay connection to {} as backup after hole punch",
                                target.short()
                            );
                        }
                    }
                    return Ok(conn);
                }
                Err(e) if e.is_recoverable() => {
                    debug!("hole punch to {} failed: {}", target.short(), e)
                }
                Err(e) => return Err(e),
            }
        }

        match self.dial_and_track(target).await {
            Ok(conn) => Ok(conn),
            Err(e) => Err(Error::NoRelayAvailable(Box::new(e))),
        }
    }

    async fn dial_and_track(&self, target: PeerId) -> Result<ConnectionHandle> {
        let conn = self.relay_dial.dial_via_relay(target).await?;
        self.relayed_conns.lock().insert(target, conn.clone());
        Ok(conn)
    }

    /// Late-binds the reachability coordinator to the client service and
    /// the autorelay address publication.
    pub fn set_coordinator(&self, coordinator: Arc<dyn ReachabilityCoordinator>) {
        self.client.set_coordinator(coordinator.clone());
        if let Some(auto_relay) = &self.auto_relay {
            auto_relay.set_on_addrs_changed(Arc::new(move |addrs| {
                coordinator.set_relay_addrs(addrs);
            }));
        }
    }

    /// The preserved relay connection for `target`, if any.
    pub fn backup_relay_conn(&self, target: &PeerId) -> Option<ConnectionHandle> {
        self.backup_relay_conns.lock().get(target).cloned()
    }

    pub fn remove_backup_relay_conn(&self, target: &PeerId) {
        self.backup_relay_conns.lock().remove(target);
    }

    /// Pass-through to the client service plus the lifecycle notification.
    pub fn set_relay_addr(&self, addr: Multiaddr) -> Result<()> {
        self.client.set_relay(addr)?;
        if let Some(lifecycle) = &self.caps.lifecycle {
            lifecycle.set_relay_configured();
        }
        Ok(())
    }

    pub fn remove_relay_addr(&self) {
        self.client.remove_relay();
    }

    pub fn relay_addr(&self) -> (Option<Multiaddr>, bool) {
        self.client.relay_addr()
    }

    /// Connects the configured relay, records it in the address book and
    /// unblocks the lifecycle gate. The gate is released even on failure
    /// so an unreachable relay does not hold up node startup.
    pub async fn connect_and_register(&self) -> Result<()> {
        let result = async {
            self.client.connect().await?;
            if let Some(peerstore) = &self.caps.peerstore {
                if let (Some(addr), _) = self.client.relay_addr() {
                    if let Some(relay) = addr.final_peer() {
                        peerstore.add_addr(relay, addr.clone(), self.config.connected_addr_ttl);
                    }
                }
            }
            Ok(())
        }
        .await;
        if let Some(lifecycle) = &self.caps.lifecycle {
            lifecycle.set_relay_connected();
        }
        result
    }

    /// Starts the relay server. Requires at least one public shareable
    /// address; a NAT'd node may not claim relay-server capability.
    pub fn enable_relay(&self) -> Result<()> {
        if self.server.lock().is_some() {
            return Ok(());
        }
        let addr_view = self.addr_view.lock().clone().ok_or(Error::NotInitialized)?;
        if !addr_view.shareable_addrs().iter().any(Multiaddr::is_public) {
            return Err(Error::NotPubliclyReachable);
        }
        let registrar = self.registrar.lock().clone().ok_or(Error::NotInitialized)?;

        let server = Arc::new(RelayServer::new(
            self.local,
            self.server_config.clone(),
            self.swarm.clone(),
            self.limiter.clone(),
            self.caps.acl.clone(),
            self.spawner.clone(),
        ));
        registrar.register_handler(RESERVE_PROTOCOL, server.clone().handler());
        registrar.register_handler(HOP_PROTOCOL, server.clone().handler());
        self.spawner
            .spawn(RelayServer::gc_loop(Arc::downgrade(&server)).boxed());
        if let Some(bus) = &self.caps.bus {
            self.spawner.spawn(
                RelayServer::watch_disconnects(Arc::downgrade(&server), bus.subscribe()).boxed(),
            );
        }
        if let Some(discovery) = self.caps.discovery.clone() {
            self.spawner.spawn(
                async move {
                    if let Err(e) = discovery.provide(RELAY_NAMESPACE).await {
                        debug!("announcing relay capability failed: {}", e);
                    }
                }
                .boxed(),
            );
        }
        *self.server.lock() = Some(server);
        info!("relay server enabled");
        Ok(())
    }

    pub fn disable_relay(&self) {
        if self.server.lock().take().is_some() {
            if let Some(registrar) = self.registrar.lock().clone() {
                registrar.remove_handler(RESERVE_PROTOCOL);
                registrar.remove_handler(HOP_PROTOCOL);
            }
            info!("relay server disabled");
        }
    }

    pub fn is_relay_enabled(&self) -> bool {
        self.server.lock().is_some()
    }

    pub fn server_stats(&self) -> Option<crate::server::RelayServerStats> {
        self.server.lock().as_ref().map(|server| server.stats())
    }

    /// Network-change remediation: drops relay connections whose local
    /// endpoint is no longer among the swarm's bound addresses.
    async fn close_stale(&self) {
        let local_ips: Vec<IpAddr> = self
            .swarm
            .local_addrs()
            .iter()
            .filter_map(Multiaddr::ip)
            .collect();
        let stale: Vec<(PeerId, ConnectionHandle)> = {
            let mut conns = self.relayed_conns.lock();
            conns.retain(|_, conn| !conn.is_closed());
            conns
                .iter()
                .filter(|(_, conn)| match conn.local_addr().ip() {
                    Some(ip) => !local_ips.contains(&ip),
                    None => false,
                })
                .map(|(peer, conn)| (*peer, conn.clone()))
                .collect()
        };
        for (peer, conn) in stale {
            debug!("closing stale relay connection to {}", peer.short());
            if let Err(e) = conn.close().await {
                debug!("close failed: {}", e);
            }
            self.relayed_conns.lock().remove(&peer);
        }
    }

    /// Shuts the subsystem down. Close errors are logged, never returned.
    pub async fn close(&self) {
        self.disable_relay();
        if let Err(e) = self.transport.close().await {
            debug!("closing relay transport failed: {}", e);
        }
        let conns: Vec<ConnectionHandle> = {
            let mut relayed = self.relayed_conns.lock();
            let mut backups = self.backup_relay_conns.lock();
            relayed
                .drain()
                .map(|(_, c)| c)
                .chain(backups.drain().map(|(_, c)| c))
                .collect()
        };
        for conn in conns {
            if let Err(e) = conn.close().await {
                debug!("closing relay connection failed: {}", e);
            }
        }
        self.client.remove_relay();
    }
}

impl CircuitDialer for RelayManager {
    fn dial_via_relay(&self, target: PeerId) -> BoxFuture<'_, Result<ConnectionHandle>> {
        self.dial_and_track(target).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dep2p_core::{Connection, Direction, Stream, SwarmNotifier};
    use futures::future;
    use parking_lot::Mutex as PlMutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Weak;

    struct TaskSpawner;
    impl Spawner for TaskSpawner {
        fn spawn(&self, task: BoxFuture<'static, ()>) {
            async_std::task::spawn(task);
        }
    }

    struct StubConn {
        peer: PeerId,
        remote: Multiaddr,
        closed: AtomicBool,
    }
    impl StubConn {
        fn handle(peer: PeerId, remote: &str) -> ConnectionHandle {
            Arc::new(StubConn {
                peer,
                remote: remote.parse().unwrap(),
                closed: AtomicBool::new(false),
            })
        }
    }
    impl Connection for StubConn {
        fn peer(&self) -> PeerId {
            self.peer
        }
        fn local_addr(&self) -> Multiaddr {
            "/ip4/192.0.2.5/tcp/4001".parse().unwrap()
        }
        fn remote_addr(&self) -> Multiaddr {
            self.remote.clone()
        }
        fn direction(&self) -> Direction {
            Direction::Outbound
        }
        fn open_stream(&self) -> BoxFuture<'_, Result<Stream>> {
            future::ready(Err(Error::Internal("stub".into()))).boxed()
        }
        fn close(&self) -> BoxFuture<'_, Result<()>> {
            self.closed.store(true, Ordering::Release);
            future::ready(Ok(())).boxed()
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::Acquire)
        }
    }

    #[derive(Default)]
    struct StubSwarm {
        local: PlMutex<Option<PeerId>>,
        dial_ok: AtomicBool,
    }
    impl Swarm for StubSwarm {
        fn local_peer(&self) -> PeerId {
            self.local.lock().unwrap()
        }
        fn dial(
            &self,
            peer: PeerId,
            _addrs: Vec<Multiaddr>,
        ) -> BoxFuture<'_, Result<ConnectionHandle>> {
            let result = if self.dial_ok.load(Ordering::Acquire) {
                Ok(StubConn::handle(peer, "/ip4/203.0.113.4/tcp/4001"))
            } else {
                Err(Error::ConnectionFailed("stub swarm refuses".into()))
            };
            future::ready(result).boxed()
        }
        fn connection_to(&self, _: &PeerId) -> Option<ConnectionHandle> {
            None
        }
        fn listen(&self, _: Vec<Multiaddr>) -> Result<Vec<Multiaddr>> {
            Ok(Vec::new())
        }
        fn local_addrs(&self) -> Vec<Multiaddr> {
            vec!["/ip4/192.0.2.5/tcp/4001".parse().unwrap()]
        }
        fn set_notifier(&self, _: Weak<dyn SwarmNotifier>) {}
        fn close(&self) -> BoxFuture<'_, Result<()>> {
            future::ready(Ok(())).boxed()
        }
    }

    struct StubPuncher {
        succeed: AtomicBool,
    }
    impl HolePuncher for StubPuncher {
        fn direct_connect(
            &self,
            peer: PeerId,
            _addrs: Vec<Multiaddr>,
        ) -> BoxFuture<'_, Result<ConnectionHandle>> {
            let result = if self.succeed.load(Ordering::Acquire) {
                Ok(StubConn::handle(peer, "/ip4/203.0.113.4/udp/4001/quic-v1"))
            } else {
                Err(Error::TargetUnreachable)
            };
            future::ready(result).boxed()
        }
    }

    struct StubRelayDial {
        relay: PeerId,
    }
    impl CircuitDialer for StubRelayDial {
        fn dial_via_relay(&self, target: PeerId) -> BoxFuture<'_, Result<ConnectionHandle>> {
            let remote = format!(
                "/ip4/203.0.113.9/udp/4001/quic-v1/p2p/{}/p2p-circuit/p2p/{}",
                self.relay, target
            );
            future::ready(Ok(StubConn::handle(target, &remote))).boxed()
        }
    }

    struct PublicView(bool);
    impl LocalAddressView for PublicView {
        fn shareable_addrs(&self) -> Vec<Multiaddr> {
            if self.0 {
                vec!["/ip4/203.0.113.4/tcp/4001".parse().unwrap()]
            } else {
                vec!["/ip4/192.168.1.4/tcp/4001".parse().unwrap()]
            }
        }
        fn listen_addrs(&self) -> Vec<Multiaddr> {
            self.shareable_addrs()
        }
    }

    struct NoopRegistrar;
    impl ProtocolRegistrar for NoopRegistrar {
        fn register_handler(&self, _: &str, _: StreamHandler) {}
        fn remove_handler(&self, _: &str) {}
    }

    struct Fixture {
        manager: Arc<RelayManager>,
        swarm: Arc<StubSwarm>,
        puncher: Arc<StubPuncher>,
    }

    fn fixture(public: bool) -> Fixture {
        let local = PeerId::random();
        let swarm = Arc::new(StubSwarm::default());
        *swarm.local.lock() = Some(local);
        let spawner: Arc<dyn Spawner> = Arc::new(TaskSpawner);
        let puncher = Arc::new(StubPuncher {
            succeed: AtomicBool::new(false),
        });
        let client = Arc::new(RelayClient::new(
            local,
            Default::default(),
            swarm.clone(),
            spawner.clone(),
        ));
        let relay_dial = Arc::new(StubRelayDial {
            relay: PeerId::random(),
        });
        let caps = ManagerCapabilities {
            hole_puncher: Some(puncher.clone()),
            ..Default::default()
        };
        let manager = Arc::new(RelayManager::new(
            local,
            RelayManagerConfig::default(),
            swarm.clone(),
            spawner,
            client,
            relay_dial,
            None,
            Arc::new(Limiter::new(Default::default())),
            RelayServerConfig::default(),
            Arc::new(RelayTransport::new(Default::default())),
            caps,
        ));
        *manager.registrar.lock() = Some(Arc::new(NoopRegistrar));
        *manager.addr_view.lock() = Some(Arc::new(PublicView(public)));
        Fixture {
            manager,
            swarm,
            puncher,
        }
    }

    #[async_std::test]
    async fn falls_back_to_relay_and_keeps_backup_after_hole_punch() {
        let fx = fixture(true);
        let target = PeerId::random();

        // Direct and hole-punch fail: the relay leg wins.
        let conn = fx.manager.dial_with_priority(target).await.unwrap();
        assert!(conn.remote_addr().is_circuit());
        assert!(fx.manager.backup_relay_conn(&target).is_none());

        // Hole punch now works: direct connection, relay conn preserved.
        fx.puncher.succeed.store(true, Ordering::Release);
        let relay_conn = conn;
        let conn = fx.manager.dial_with_priority(target).await.unwrap();
        assert!(!conn.remote_addr().is_circuit());
        let backup = fx.manager.backup_relay_conn(&target).unwrap();
        assert!(Arc::ptr_eq(&backup, &relay_conn));

        fx.manager.remove_backup_relay_conn(&target);
        assert!(fx.manager.backup_relay_conn(&target).is_none());
    }

    #[async_std::test]
    async fn direct_dial_wins_when_available() {
        let fx = fixture(true);
        fx.swarm.dial_ok.store(true, Ordering::Release);
        let target = PeerId::random();
        let conn = fx.manager.dial_with_priority(target).await.unwrap();
        assert!(!conn.remote_addr().is_circuit());
    }

    #[test]
    fn enable_relay_requires_public_reachability() {
        let fx = fixture(false);
        assert!(matches!(
            fx.manager.enable_relay(),
            Err(Error::NotPubliclyReachable)
        ));
        assert!(!fx.manager.is_relay_enabled());

        let fx = fixture(true);
        fx.manager.enable_relay().unwrap();
        assert!(fx.manager.is_relay_enabled());
        // Idempotent.
        fx.manager.enable_relay().unwrap();
        fx.manager.disable_relay();
        assert!(!fx.manager.is_relay_enabled());
    }

    #[test]
    fn relay_addr_pass_through() {
        let fx = fixture(true);
        let relay = PeerId::random();
        let addr: Multiaddr = format!("/ip4/203.0.113.2/udp/4001/quic-v1/p2p/{}", relay)
            .parse()
            .unwrap();
        fx.manager.set_relay_addr(addr.clone()).unwrap();
        assert_eq!(fx.manager.relay_addr(), (Some(addr), false));
        fx.manager.remove_relay_addr();
        assert_eq!(fx.manager.relay_addr(), (None, false));
    }
}
