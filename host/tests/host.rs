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

//! Host facade tests: inbound negotiation and dispatch, connection
//! deduplication, self-relay rejection and lifecycle.

use dep2p_core::{
    memory_pair, timeout, Connection, ConnectionHandle, Direction, Error, Event, Multiaddr,
    PeerId, Result, Stream, StreamHandler, Swarm, SwarmNotifier,
};
use dep2p_host::{Config, Host, HostCapabilities};
use dep2p_multistream_select::dialer_select;
use futures::channel::mpsc;
use futures::future::{self, BoxFuture, FutureExt};
use futures::io::{AsyncReadExt, AsyncWriteExt};
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

fn init_logger() {
    let _ = env_logger::try_init();
}

struct HarnessSwarm {
    local: PeerId,
    notifier: Mutex<Option<Weak<dyn SwarmNotifier>>>,
}

impl HarnessSwarm {
    fn new() -> Arc<Self> {
        Arc::new(HarnessSwarm {
            local: PeerId::random(),
            notifier: Mutex::new(None),
        })
    }

    fn notifier(&self) -> Arc<dyn SwarmNotifier> {
        self.notifier
            .lock()
            .as_ref()
            .and_then(Weak::upgrade)
            .expect("host registered a notifier")
    }
}

impl Swarm for HarnessSwarm {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn dial(&self, _: PeerId, _: Vec<Multiaddr>) -> BoxFuture<'_, Result<ConnectionHandle>> {
        future::ready(Err(Error::ConnectionFailed("harness refuses dials".into()))).boxed()
    }

    fn connection_to(&self, _: &PeerId) -> Option<ConnectionHandle> {
        None
    }

    fn listen(&self, addrs: Vec<Multiaddr>) -> Result<Vec<Multiaddr>> {
        Ok(addrs)
    }

    fn local_addrs(&self) -> Vec<Multiaddr> {
        vec!["/ip4/192.0.2.10/tcp/4001".parse().unwrap()]
    }

    fn set_notifier(&self, notifier: Weak<dyn SwarmNotifier>) {
        *self.notifier.lock() = Some(notifier);
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        future::ready(Ok(())).boxed()
    }
}

struct FakeConn {
    peer: PeerId,
}

impl Connection for FakeConn {
    fn peer(&self) -> PeerId {
        self.peer
    }
    fn local_addr(&self) -> Multiaddr {
        "/ip4/192.0.2.10/tcp/4001".parse().unwrap()
    }
    fn remote_addr(&self) -> Multiaddr {
        format!("/ip4/203.0.113.20/tcp/4001/p2p/{}", self.peer)
            .parse()
            .unwrap()
    }
    fn direction(&self) -> Direction {
        Direction::Outbound
    }
    fn open_stream(&self) -> BoxFuture<'_, Result<Stream>> {
        future::ready(Err(Error::Internal("fake".into()))).boxed()
    }
    fn close(&self) -> BoxFuture<'_, Result<()>> {
        future::ready(Ok(())).boxed()
    }
    fn is_closed(&self) -> bool {
        false
    }
}

fn no_relay_config() -> Config {
    Config {
        enable_relay_client: false,
        enable_relay_server: false,
        ..Default::default()
    }
}

#[async_std::test]
async fn inbound_negotiation_dispatches_to_handler() {
    init_logger();
    let swarm = HarnessSwarm::new();
    let host = Host::new(no_relay_config(), swarm.clone(), HostCapabilities::default()).unwrap();

    let (invoked_tx, mut invoked_rx) = mpsc::unbounded();
    let handler: StreamHandler = Arc::new(move |mut stream: Stream| {
        let invoked = invoked_tx.clone();
        async move {
            let _ = invoked.unbounded_send(stream.protocol().map(str::to_string));
            let mut buf = [0u8; 4];
            if stream.read_exact(&mut buf).await.is_ok() {
                let _ = stream.write_all(&buf).await;
                let _ = stream.flush().await;
            }
        }
        .boxed()
    });
    host.set_stream_handler("/app/echo/1.0.0", handler);

    let (mut near, far) = memory_pair();
    let remote = PeerId::random();
    swarm
        .notifier()
        .inbound_stream(Stream::new(far, remote));

    dialer_select(&mut near, "/app/echo/1.0.0").await.unwrap();
    near.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    near.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    let seen = timeout(Duration::from_secs(2), invoked_rx.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(seen.as_deref(), Some("/app/echo/1.0.0"));
}

#[async_std::test]
async fn inbound_unknown_protocol_is_reset_without_dispatch() {
    init_logger();
    let swarm = HarnessSwarm::new();
    let host = Host::new(no_relay_config(), swarm.clone(), HostCapabilities::default()).unwrap();

    let invoked = Arc::new(Mutex::new(0usize));
    let counter = invoked.clone();
    host.set_stream_handler(
        "/app/echo/1.0.0",
        Arc::new(move |stream: Stream| {
            *counter.lock() += 1;
            async move { drop(stream) }.boxed()
        }),
    );

    let (mut near, far) = memory_pair();
    swarm
        .notifier()
        .inbound_stream(Stream::new(far, PeerId::random()));

    let res = dialer_select(&mut near, "/app/other/1.0.0").await;
    assert!(matches!(res, Err(Error::NegotiationFailed)));
    assert_eq!(*invoked.lock(), 0);
}

#[async_std::test]
async fn connection_events_fire_only_on_edges() {
    init_logger();
    let swarm = HarnessSwarm::new();
    let host = Host::new(no_relay_config(), swarm.clone(), HostCapabilities::default()).unwrap();
    let mut events = host.event_bus().subscribe();
    host.start().await.unwrap();

    let peer = PeerId::random();
    let conn: ConnectionHandle = Arc::new(FakeConn { peer });
    let notifier = swarm.notifier();

    // Two connections, then two disconnects: one event per edge.
    notifier.connected(conn.clone());
    notifier.connected(conn.clone());
    notifier.disconnected(conn.clone());
    notifier.disconnected(conn.clone());

    match timeout(Duration::from_secs(2), events.next()).await.unwrap() {
        Some(Event::PeerConnected(ev)) => {
            assert_eq!(ev.peer, peer);
            assert_eq!(ev.num_conns, 1);
        }
        other => panic!("expected connected event, got {:?}", other),
    }
    match timeout(Duration::from_secs(2), events.next()).await.unwrap() {
        Some(Event::PeerDisconnected(ev)) => {
            assert_eq!(ev.peer, peer);
            assert_eq!(ev.num_conns, 0);
        }
        other => panic!("expected disconnected event, got {:?}", other),
    }

    // Extra disconnects for an unknown peer emit nothing; the next edge
    // pair arrives in order.
    notifier.disconnected(conn.clone());
    notifier.connected(conn.clone());
    match timeout(Duration::from_secs(2), events.next()).await.unwrap() {
        Some(Event::PeerConnected(_)) => {}
        other => panic!("expected connected event, got {:?}", other),
    }

    host.close().await;
    // Notifications after close are no-ops.
    notifier.connected(conn);
    assert!(timeout(Duration::from_millis(200), events.next()).await.is_err());
}

#[async_std::test]
async fn self_relay_is_rejected() {
    init_logger();
    let swarm = HarnessSwarm::new();
    let host = Host::new(Config::default(), swarm.clone(), HostCapabilities::default()).unwrap();
    let manager = host.relay_manager().expect("relay client enabled");

    let self_addr: Multiaddr = format!("/ip4/10.0.0.1/udp/4001/quic-v1/p2p/{}", host.id())
        .parse()
        .unwrap();
    assert!(matches!(
        manager.set_relay_addr(self_addr),
        Err(Error::CannotRelayToSelf)
    ));
    assert_eq!(manager.relay_addr(), (None, false));
}

#[async_std::test]
async fn lifecycle_start_close() {
    init_logger();
    let swarm = HarnessSwarm::new();
    let host = Host::new(no_relay_config(), swarm.clone(), HostCapabilities::default()).unwrap();

    host.listen(vec!["/ip4/192.0.2.10/tcp/4001".parse().unwrap()])
        .unwrap();
    let suffix = format!("/p2p/{}", host.id());
    assert!(host.addrs().iter().all(|a| a.to_string().ends_with(&suffix)));

    assert!(matches!(
        host.add_observed_addr("/ip4/203.0.113.1/tcp/1".parse().unwrap()),
        Err(Error::NotInitialized)
    ));

    host.start().await.unwrap();
    assert!(matches!(host.start().await, Err(Error::AlreadyStarted)));
    host.add_observed_addr("/ip4/203.0.113.1/tcp/1".parse().unwrap())
        .unwrap();

    host.close().await;
    host.close().await; // idempotent
    assert!(matches!(host.start().await, Err(Error::Closed)));
    assert!(matches!(
        host.listen(vec!["/ip4/192.0.2.10/tcp/4002".parse().unwrap()]),
        Err(Error::Closed)
    ));
    assert!(matches!(
        host.new_stream(PeerId::random(), "/ping/1.0.0", None).await,
        Err(Error::Closed)
    ));
}
