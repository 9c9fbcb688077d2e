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

//! The relay as a first-class transport for `/p2p-circuit` addresses.
//!
//! Dialing parses `<transport>/p2p/<relayId>/p2p-circuit/p2p/<destId>`,
//! verifies the expected peer, takes a concurrency slot and delegates to
//! the relay manager. Listening yields connections delivered by the STOP
//! handler.

use dep2p_core::{
    timeout, ConnectionHandle, Error, Multiaddr, PeerId, Result, Transport, TransportListener,
};
use fnv::FnvHashMap;
use futures::channel::mpsc;
use futures::future::{BoxFuture, FutureExt};
use futures::StreamExt;
use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Dials a destination through an established relay. Implemented by the
/// relay manager.
pub trait CircuitDialer: Send + Sync {
    fn dial_via_relay(&self, target: PeerId) -> BoxFuture<'_, Result<ConnectionHandle>>;
}

pub const CIRCUIT_PROTOCOL: &str = "/p2p-circuit";

#[derive(Clone, Copy, Debug)]
pub struct RelayTransportConfig {
    pub max_concurrent_dials: usize,
    pub dial_timeout: Duration,
}

impl Default for RelayTransportConfig {
    fn default() -> Self {
        RelayTransportConfig {
            max_concurrent_dials: 8,
            dial_timeout: Duration::from_secs(30),
        }
    }
}

/// Async counting semaphore: permits live in a bounded channel.
struct Semaphore {
    permits_tx: mpsc::Sender<()>,
    permits_rx: futures::lock::Mutex<mpsc::Receiver<()>>,
}

struct Permit {
    permits_tx: mpsc::Sender<()>,
}

impl Semaphore {
    fn new(permits: usize) -> Self {
        let (mut tx, rx) = mpsc::channel(permits.max(1));
        for _ in 0..permits.max(1) {
            tx.try_send(()).expect("fresh channel has capacity");
        }
        Semaphore {
            permits_tx: tx,
            permits_rx: futures::lock::Mutex::new(rx),
        }
    }

    async fn acquire(&self) -> Permit {
        let mut rx = self.permits_rx.lock().await;
        rx.next().await.expect("semaphore channel never closes");
        Permit {
            permits_tx: self.permits_tx.clone(),
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.permits_tx.try_send(());
    }
}

pub struct RelayTransport {
    config: RelayTransportConfig,
    dialer: Mutex<Option<Weak<dyn CircuitDialer>>>,
    dial_slots: Semaphore,
    active: Mutex<FnvHashMap<String, ConnectionHandle>>,
    listener_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionHandle>>>,
    closed: AtomicBool,
}

impl RelayTransport {
    pub fn new(config: RelayTransportConfig) -> Self {
        RelayTransport {
            dial_slots: Semaphore::new(config.max_concurrent_dials),
            config,
            dialer: Mutex::new(None),
            active: Mutex::new(FnvHashMap::default()),
            listener_tx: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Wires the dialer. Weak so transport and manager do not keep each
    /// other alive.
    pub fn set_dialer(&self, dialer: Weak<dyn CircuitDialer>) {
        *self.dialer.lock() = Some(dialer);
    }

    /// Called by the STOP path with a freshly accepted circuit connection.
    pub fn deliver_inbound(&self, conn: ConnectionHandle) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let key = track_key(&conn);
        self.active.lock().insert(key, conn.clone());
        if let Some(tx) = self.listener_tx.lock().as_ref() {
            if tx.unbounded_send(conn).is_ok() {
                return;
            }
        }
        trace!("inbound circuit arrived without an active listener");
    }

    pub fn active_connections(&self) -> usize {
        let mut active = self.active.lock();
        active.retain(|_, conn| !conn.is_closed());
        active.len()
    }

    fn parse_circuit_addr(addr: &Multiaddr) -> Result<(PeerId, PeerId)> {
        if !addr.is_circuit() {
            return Err(Error::InvalidAddress(format!(
                "{} is not a /p2p-circuit address",
                addr
            )));
        }
        let relay = addr.relay_peer().ok_or_else(|| {
            Error::InvalidAddress(format!("{} lacks the relay /p2p component", addr))
        })?;
        let dst = addr.circuit_dst().ok_or_else(|| {
            Error::InvalidAddress(format!("{} lacks the destination /p2p component", addr))
        })?;
        Ok((relay, dst))
    }
}

fn track_key(conn: &ConnectionHandle) -> String {
    let remote = conn.remote_addr();
    match (remote.relay_peer(), remote.final_peer()) {
        (Some(relay), Some(dst)) => format!("{}-{}", relay, dst),
        _ => format!("-{}", conn.peer()),
    }
}

impl Transport for RelayTransport {
    fn dial(
        &self,
        addr: Multiaddr,
        expected_peer: PeerId,
    ) -> BoxFuture<'_, Result<ConnectionHandle>> {
        async move {
            if self.closed.load(Ordering::Acquire) {
                return Err(Error::Closed);
            }
            let (relay, dst) = Self::parse_circuit_addr(&addr)?;
            if expected_peer != dst {
                return Err(Error::PeerIdMismatch {
                    expected: expected_peer,
                    found: dst,
                });
            }
            let dialer = self
                .dialer
                .lock()
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or(Error::NotInitialized)?;

            let _permit = self.dial_slots.acquire().await;
            let conn = timeout(self.config.dial_timeout, dialer.dial_via_relay(dst)).await??;
            self.active
                .lock()
                .insert(format!("{}-{}", relay, dst), conn.clone());
            debug!("dialed {} via relay {}", dst.short(), relay.short());
            Ok(conn)
        }
        .boxed()
    }

    fn listen(&self, _addr: Multiaddr) -> Result<Box<dyn TransportListener>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        let (tx, rx) = mpsc::unbounded();
        *self.listener_tx.lock() = Some(tx);
        Ok(Box::new(RelayListener { rx }))
    }

    fn protocols(&self) -> Vec<String> {
        vec![CIRCUIT_PROTOCOL.to_string()]
    }

    fn can_dial(&self, addr: &Multiaddr) -> bool {
        addr.is_circuit()
    }

    fn is_proxy(&self) -> bool {
        true
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        self.closed.store(true, Ordering::Release);
        self.listener_tx.lock().take();
        let conns: Vec<ConnectionHandle> = self.active.lock().drain().map(|(_, c)| c).collect();
        async move {
            for conn in conns {
                if let Err(e) = conn.close().await {
                    debug!("closing tracked circuit failed: {}", e);
                }
            }
            Ok(())
        }
        .boxed()
    }
}

struct RelayListener {
    rx: mpsc::UnboundedReceiver<ConnectionHandle>,
}

impl TransportListener for RelayListener {
    fn accept(&mut self) -> BoxFuture<'_, Result<ConnectionHandle>> {
        async move { self.rx.next().await.ok_or(Error::Closed) }.boxed()
    }

    fn close(&mut self) {
        self.rx.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dep2p_core::{Connection, Direction, Stream};
    use futures::future;

    struct StubConn {
        peer: PeerId,
        remote: Multiaddr,
    }
    impl Connection for StubConn {
        fn peer(&self) -> PeerId {
            self.peer
        }
        fn local_addr(&self) -> Multiaddr {
            "/ip4/192.0.2.5/tcp/1".parse().unwrap()
        }
        fn remote_addr(&self) -> Multiaddr {
            self.remote.clone()
        }
        fn direction(&self) -> Direction {
            Direction::Inbound
        }
        fn open_stream(&self) -> BoxFuture<'_, Result<Stream>> {
            future::ready(Err(Error::Internal("stub".into()))).boxed()
        }
        fn close(&self) -> BoxFuture<'_, Result<()>> {
            future::ready(Ok(())).boxed()
        }
        fn is_closed(&self) -> bool {
            false
        }
    }

    struct StubDialer {
        target_addr: Multiaddr,
    }
    impl CircuitDialer for StubDialer {
        fn dial_via_relay(&self, target: PeerId) -> BoxFuture<'_, Result<ConnectionHandle>> {
            let conn: ConnectionHandle = Arc::new(StubConn {
                peer: target,
                remote: self.target_addr.clone(),
            });
            future::ready(Ok(conn)).boxed()
        }
    }

    fn circuit_addr(relay: PeerId, dst: PeerId) -> Multiaddr {
        format!(
            "/ip4/203.0.113.1/udp/4001/quic-v1/p2p/{}/p2p-circuit/p2p/{}",
            relay, dst
        )
        .parse()
        .unwrap()
    }

    #[test]
    fn advertises_circuit_protocol() {
        let transport = RelayTransport::new(Default::default());
        assert_eq!(transport.protocols(), vec!["/p2p-circuit".to_string()]);
        assert!(transport.is_proxy());
        let relay = PeerId::random();
        let dst = PeerId::random();
        assert!(transport.can_dial(&circuit_addr(relay, dst)));
        assert!(!transport.can_dial(&"/ip4/203.0.113.1/tcp/4001".parse().unwrap()));
    }

    #[async_std::test]
    async fn dial_rejects_non_circuit_and_mismatched_peers() {
        let transport = RelayTransport::new(Default::default());
        let dst = PeerId::random();
        let relay = PeerId::random();

        let plain: Multiaddr = "/ip4/203.0.113.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            transport.dial(plain, dst).await,
            Err(Error::InvalidAddress(_))
        ));

        let no_dst: Multiaddr = format!("/ip4/203.0.113.1/tcp/4001/p2p/{}/p2p-circuit", relay)
            .parse()
            .unwrap();
        assert!(matches!(
            transport.dial(no_dst, dst).await,
            Err(Error::InvalidAddress(_))
        ));

        let other = PeerId::random();
        assert!(matches!(
            transport.dial(circuit_addr(relay, dst), other).await,
            Err(Error::PeerIdMismatch { .. })
        ));
    }

    #[async_std::test]
    async fn dial_delegates_and_tracks() {
        let transport = RelayTransport::new(Default::default());
        let relay = PeerId::random();
        let dst = PeerId::random();
        let addr = circuit_addr(relay, dst);
        let dialer = Arc::new(StubDialer {
            target_addr: addr.clone(),
        });
        transport.set_dialer(Arc::downgrade(&dialer) as Weak<dyn CircuitDialer>);

        let conn = transport.dial(addr, dst).await.unwrap();
        assert_eq!(conn.peer(), dst);
        assert_eq!(transport.active_connections(), 1);
    }

    #[async_std::test]
    async fn listener_receives_inbound_circuits() {
        let transport = RelayTransport::new(Default::default());
        let mut listener = transport
            .listen("/p2p-circuit".parse::<Multiaddr>().unwrap())
            .unwrap();
        let relay = PeerId::random();
        let src = PeerId::random();
        let conn: ConnectionHandle = Arc::new(StubConn {
            peer: src,
            remote: circuit_addr(relay, src),
        });
        transport.deliver_inbound(conn);
        let accepted = listener.accept().await.unwrap();
        assert_eq!(accepted.peer(), src);
    }

    #[async_std::test]
    async fn close_drops_listener_and_conns() {
        let transport = RelayTransport::new(Default::default());
        transport.close().await.unwrap();
        let dst = PeerId::random();
        let relay = PeerId::random();
        assert!(matches!(
            transport.dial(circuit_addr(relay, dst), dst).await,
            Err(Error::Closed)
        ));
        assert!(transport.listen(Multiaddr::empty()).is_err());
    }
}
