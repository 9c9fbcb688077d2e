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

//! End-to-end relay tests over an in-memory network.
//!
//! Every node is a protocol registry; dialing a peer yields a connection
//! whose streams land in the remote registry after listener-side
//! negotiation, exactly like the host's inbound path.

use dep2p_core::{
    memory_pair, Connection, ConnectionHandle, Direction, Error, Multiaddr, PeerId,
    ProtocolRegistrar, Result, Spawner, Stream, StreamHandler, Swarm, SwarmNotifier,
};
use dep2p_multistream_select::{dialer_select, listener_select};
use dep2p_relay::codec::{read_message, write_message, Message, StatusCode};
use dep2p_relay::{
    Limiter, LimiterConfig, RelayClient, RelayClientConfig, RelayServer, RelayServerConfig,
    HOP_PROTOCOL, RESERVE_PROTOCOL,
};
use futures::future::{BoxFuture, FutureExt};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

fn init_logger() {
    let _ = env_logger::try_init();
}

struct TaskSpawner;
impl Spawner for TaskSpawner {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        async_std::task::spawn(task);
    }
}

/// Per-node protocol handler table plus the inbound dispatcher.
#[derive(Clone, Default)]
struct Registry {
    handlers: Arc<RwLock<HashMap<String, StreamHandler>>>,
}

impl Registry {
    async fn dispatch(&self, mut stream: Stream) {
        let supported: Vec<String> = self.handlers.read().keys().cloned().collect();
        match listener_select(&mut stream, &supported).await {
            Ok(protocol) => {
                stream.set_protocol(&protocol);
                let handler = self.handlers.read().get(&protocol).cloned();
                match handler {
                    Some(handler) => handler(stream).await,
                    None => stream.reset().await,
                }
            }
            Err(_) => stream.reset().await,
        }
    }
}

impl ProtocolRegistrar for Registry {
    fn register_handler(&self, protocol: &str, handler: StreamHandler) {
        self.handlers.write().insert(protocol.to_string(), handler);
    }

    fn remove_handler(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }
}

#[derive(Default)]
struct TestNet {
    nodes: Mutex<HashMap<PeerId, Registry>>,
}

fn join(net: &Arc<TestNet>, peer: PeerId) -> (Arc<TestSwarm>, Registry) {
    let registry = Registry::default();
    net.nodes.lock().insert(peer, registry.clone());
    (
        Arc::new(TestSwarm {
            local: peer,
            net: net.clone(),
            conns: Mutex::new(HashMap::new()),
        }),
        registry,
    )
}

struct TestSwarm {
    local: PeerId,
    net: Arc<TestNet>,
    conns: Mutex<HashMap<PeerId, ConnectionHandle>>,
}

impl Swarm for TestSwarm {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn dial(&self, peer: PeerId, _addrs: Vec<Multiaddr>) -> BoxFuture<'_, Result<ConnectionHandle>> {
        async move {
            if let Some(conn) = self.connection_to(&peer) {
                return Ok(conn);
            }
            let registry = self
                .net
                .nodes
                .lock()
                .get(&peer)
                .cloned()
                .ok_or(Error::TargetUnreachable)?;
            let conn: ConnectionHandle = Arc::new(TestConnection {
                local: self.local,
                remote: peer,
                registry,
            });
            self.conns.lock().insert(peer, conn.clone());
            Ok(conn)
        }
        .boxed()
    }

    fn connection_to(&self, peer: &PeerId) -> Option<ConnectionHandle> {
        self.conns.lock().get(peer).cloned()
    }

    fn listen(&self, addrs: Vec<Multiaddr>) -> Result<Vec<Multiaddr>> {
        Ok(addrs)
    }

    fn local_addrs(&self) -> Vec<Multiaddr> {
        vec!["/ip4/203.0.113.77/udp/4001/quic-v1".parse().unwrap()]
    }

    fn set_notifier(&self, _: Weak<dyn SwarmNotifier>) {}

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }
}

struct TestConnection {
    local: PeerId,
    remote: PeerId,
    registry: Registry,
}

impl Connection for TestConnection {
    fn peer(&self) -> PeerId {
        self.remote
    }

    fn local_addr(&self) -> Multiaddr {
        "/ip4/203.0.113.77/udp/4001/quic-v1".parse().unwrap()
    }

    fn remote_addr(&self) -> Multiaddr {
        format!("/ip4/203.0.113.78/udp/4001/quic-v1/p2p/{}", self.remote)
            .parse()
            .unwrap()
    }

    fn direction(&self) -> Direction {
        Direction::Outbound
    }

    fn open_stream(&self) -> BoxFuture<'_, Result<Stream>> {
        let (near, far) = memory_pair();
        let inbound = Stream::new(far, self.local);
        let registry = self.registry.clone();
        async_std::task::spawn(async move { registry.dispatch(inbound).await });
        futures::future::ready(Ok(Stream::new(near, self.remote))).boxed()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        futures::future::ready(Ok(())).boxed()
    }

    fn is_closed(&self) -> bool {
        false
    }
}

fn relay_addr(relay: PeerId) -> Multiaddr {
    format!("/ip4/203.0.113.78/udp/4001/quic-v1/p2p/{}", relay)
        .parse()
        .unwrap()
}

fn start_relay_server(
    net: &Arc<TestNet>,
    config: RelayServerConfig,
    limiter: LimiterConfig,
) -> (PeerId, Arc<RelayServer>) {
    let relay_peer = PeerId::random();
    let (swarm, registry) = join(net, relay_peer);
    let server = Arc::new(RelayServer::new(
        relay_peer,
        config,
        swarm,
        Arc::new(Limiter::new(limiter)),
        None,
        Arc::new(TaskSpawner),
    ));
    registry.register_handler(RESERVE_PROTOCOL, server.clone().handler());
    registry.register_handler(HOP_PROTOCOL, server.clone().handler());
    (relay_peer, server)
}

/// Raw HOP reserve: dial the relay and run the handshake by hand.
async fn raw_reserve(swarm: &Arc<TestSwarm>, relay: PeerId, ttl: u32) -> Result<Message> {
    let conn = swarm.dial(relay, Vec::new()).await?;
    let mut stream = conn.open_stream().await?;
    dialer_select(&mut stream, RESERVE_PROTOCOL).await?;
    write_message(&mut stream, &Message::Reserve { ttl }).await?;
    read_message(&mut stream).await
}

#[async_std::test]
async fn reserve_limit_and_expiry() {
    init_logger();
    // Two slots, 100 ms window: A and B fit, C is refused until a slot
    // expires.
    let net = Arc::new(TestNet::default());
    let (relay_peer, server) = start_relay_server(
        &net,
        RelayServerConfig {
            max_reservations: 2,
            reservation_ttl: Duration::from_millis(100),
            ..Default::default()
        },
        LimiterConfig::default(),
    );

    let (swarm_a, _) = join(&net, PeerId::random());
    let (swarm_b, _) = join(&net, PeerId::random());
    let (swarm_c, _) = join(&net, PeerId::random());

    assert!(matches!(
        raw_reserve(&swarm_a, relay_peer, 0).await.unwrap(),
        Message::ReserveOk { .. }
    ));
    assert!(matches!(
        raw_reserve(&swarm_b, relay_peer, 0).await.unwrap(),
        Message::ReserveOk { .. }
    ));
    assert!(matches!(
        raw_reserve(&swarm_c, relay_peer, 0).await.unwrap(),
        Message::ReserveError {
            code: StatusCode::ResourceLimit
        }
    ));
    assert_eq!(server.stats().active_reservations, 2);

    futures_timer::Delay::new(Duration::from_millis(150)).await;
    assert!(matches!(
        raw_reserve(&swarm_c, relay_peer, 0).await.unwrap(),
        Message::ReserveOk { .. }
    ));
}

#[async_std::test]
async fn connect_requires_only_destination_reservation() {
    init_logger();
    let net = Arc::new(TestNet::default());
    let (relay_peer, server) = start_relay_server(
        &net,
        RelayServerConfig::default(),
        LimiterConfig::default(),
    );

    // Destination B: a real relay client with a STOP handler and an echo
    // protocol behind the inbound hook.
    let b_peer = PeerId::random();
    let (swarm_b, registry_b) = join(&net, b_peer);
    let client_b = Arc::new(RelayClient::new(
        b_peer,
        RelayClientConfig::default(),
        swarm_b.clone(),
        Arc::new(TaskSpawner),
    ));
    let echo: StreamHandler = Arc::new(|mut stream| {
        async move {
            let mut buf = vec![0u8; 64];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                        let _ = stream.flush().await;
                    }
                }
            }
        }
        .boxed()
    });
    registry_b.register_handler("/app/echo/1.0.0", echo);
    let hook_registry = registry_b.clone();
    client_b.set_inbound_hook(Arc::new(move |stream| {
        let registry = hook_registry.clone();
        async move { registry.dispatch(stream).await }.boxed()
    }));
    let delivered: Arc<Mutex<Vec<ConnectionHandle>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = delivered.clone();
    client_b.set_deliver_inbound(Arc::new(move |conn| sink.lock().push(conn)));
    registry_b.register_handler(
        dep2p_relay::STOP_PROTOCOL,
        client_b.clone().stop_handler(),
    );

    // B reserves at the relay.
    client_b.set_relay(relay_addr(relay_peer)).unwrap();
    client_b.connect().await.unwrap();

    // Source A holds no reservation and dials B through the relay.
    let a_peer = PeerId::random();
    let (swarm_a, _) = join(&net, a_peer);
    let client_a = Arc::new(RelayClient::new(
        a_peer,
        RelayClientConfig::default(),
        swarm_a.clone(),
        Arc::new(TaskSpawner),
    ));
    client_a.set_relay(relay_addr(relay_peer)).unwrap();
    let conn = client_a.dial_via_relay(b_peer).await.unwrap();
    assert!(conn.remote_addr().is_circuit());
    assert_eq!(conn.peer(), b_peer);

    // Payload flows end to end through the multiplexed circuit.
    let mut stream = conn.open_stream().await.unwrap();
    dialer_select(&mut stream, "/app/echo/1.0.0").await.unwrap();
    stream.write_all(b"relayed payload").await.unwrap();
    stream.flush().await.unwrap();
    let mut buf = [0u8; 15];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"relayed payload");

    assert_eq!(delivered.lock().len(), 1);
    let stats = server.stats();
    assert_eq!(stats.unique_relayed_peers, 2);
    assert_eq!(stats.total_circuits, 2);

    // D -> E with no reservation on either side is refused.
    let (swarm_d, _) = join(&net, PeerId::random());
    let e_peer = PeerId::random();
    join(&net, e_peer);
    let conn = swarm_d.dial(relay_peer, Vec::new()).await.unwrap();
    let mut stream = conn.open_stream().await.unwrap();
    dialer_select(&mut stream, HOP_PROTOCOL).await.unwrap();
    write_message(
        &mut stream,
        &Message::Connect {
            dst: e_peer,
            protocol: None,
        },
    )
    .await
    .unwrap();
    assert!(matches!(
        read_message(&mut stream).await.unwrap(),
        Message::ConnectError {
            code: StatusCode::NoReservation
        }
    ));
}

#[async_std::test]
async fn circuit_teardown_releases_slots() {
    init_logger();
    let net = Arc::new(TestNet::default());
    let (relay_peer, server) = start_relay_server(
        &net,
        RelayServerConfig::default(),
        LimiterConfig::default(),
    );

    let b_peer = PeerId::random();
    let (swarm_b, registry_b) = join(&net, b_peer);
    let client_b = Arc::new(RelayClient::new(
        b_peer,
        RelayClientConfig::default(),
        swarm_b.clone(),
        Arc::new(TaskSpawner),
    ));
    client_b.set_inbound_hook(Arc::new(|stream| async move { stream.reset().await }.boxed()));
    client_b.set_deliver_inbound(Arc::new(|_conn| {}));
    registry_b.register_handler(
        dep2p_relay::STOP_PROTOCOL,
        client_b.clone().stop_handler(),
    );
    client_b.set_relay(relay_addr(relay_peer)).unwrap();
    client_b.connect().await.unwrap();

    let a_peer = PeerId::random();
    let (swarm_a, _) = join(&net, a_peer);
    let client_a = Arc::new(RelayClient::new(
        a_peer,
        RelayClientConfig::default(),
        swarm_a.clone(),
        Arc::new(TaskSpawner),
    ));
    client_a.set_relay(relay_addr(relay_peer)).unwrap();
    let conn = client_a.dial_via_relay(b_peer).await.unwrap();
    assert_eq!(server.stats().total_circuits, 2);

    conn.close().await.unwrap();
    // Give the forwarder a moment to observe EOF and release the slots.
    futures_timer::Delay::new(Duration::from_millis(100)).await;
    let stats = server.stats();
    assert_eq!(stats.total_circuits, 0);
    assert_eq!(stats.unique_relayed_peers, 0);
}

#[async_std::test]
async fn disconnected_peer_loses_reservation() {
    init_logger();
    let net = Arc::new(TestNet::default());
    let (relay_peer, server) = start_relay_server(
        &net,
        RelayServerConfig::default(),
        LimiterConfig::default(),
    );
    let (swarm_a, _) = join(&net, PeerId::random());
    assert!(matches!(
        raw_reserve(&swarm_a, relay_peer, 0).await.unwrap(),
        Message::ReserveOk { .. }
    ));
    assert_eq!(server.stats().active_reservations, 1);

    server.on_peer_disconnected(swarm_a.local_peer());
    assert_eq!(server.stats().active_reservations, 0);
}

#[async_std::test]
async fn status_probe_reports_snapshot() {
    init_logger();
    let net = Arc::new(TestNet::default());
    let (relay_peer, _server) = start_relay_server(
        &net,
        RelayServerConfig::default(),
        LimiterConfig::default(),
    );
    let (swarm_a, _) = join(&net, PeerId::random());
    assert!(matches!(
        raw_reserve(&swarm_a, relay_peer, 0).await.unwrap(),
        Message::ReserveOk { .. }
    ));

    let conn = swarm_a.dial(relay_peer, Vec::new()).await.unwrap();
    let mut stream = conn.open_stream().await.unwrap();
    dialer_select(&mut stream, RESERVE_PROTOCOL).await.unwrap();
    write_message(
        &mut stream,
        &Message::Status {
            reservations: 0,
            circuits: 0,
            data_rate: 0,
        },
    )
    .await
    .unwrap();
    match read_message(&mut stream).await.unwrap() {
        Message::Status { reservations, .. } => assert_eq!(reservations, 1),
        other => panic!("unexpected answer {:?}", other),
    }
}
