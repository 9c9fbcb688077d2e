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

//! Stream multiplexing over a single circuit byte-pipe.
//!
//! The HOP/STOP handshake yields one raw stream per circuit. This module
//! wraps it in a data-frame multiplexer so several logical streams share
//! the circuit without re-reserving: each frame carries a stream id and
//! FIN/RST flags. The initiator allocates odd ids, the receiver even ids.
//!
//! The circuit reports `Active <-> Stale` transitions (idle window elapsed,
//! read error) through a state callback wired to the reachability
//! coordinator.

use crate::codec::{
    read_message, write_message, DataFrame, Message, FLAG_FIN, FLAG_RST, MAX_DATA_PAYLOAD,
};
use bytes::Bytes;
use dep2p_core::stream::AsyncIo;
use dep2p_core::{timeout, CircuitState, Error, PeerId, Result, Stream};
use fnv::FnvHashMap;
use futures::channel::mpsc;
use futures::future::{self, Either};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use futures::stream::Stream as _;
use futures::StreamExt;
use log::{debug, trace};
use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

/// Which side of the circuit this endpoint is. Decides stream-id parity so
/// both sides can open streams without colliding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

/// Callback invoked on every `Active <-> Stale` transition.
pub type StateCallback = Arc<dyn Fn(PeerId, CircuitState) + Send + Sync>;

struct MuxState {
    streams: FnvHashMap<u32, mpsc::UnboundedSender<Bytes>>,
    next_stream_id: u32,
    closed: bool,
}

struct Shared {
    relay: PeerId,
    remote: PeerId,
    outbound: mpsc::UnboundedSender<DataFrame>,
    mux: Mutex<MuxState>,
    state: Mutex<CircuitState>,
    on_state: Option<StateCallback>,
}

impl Shared {
    fn set_state(&self, next: CircuitState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        *state = next;
        drop(state);
        debug!(
            "circuit via {} to {}: {:?}",
            self.relay.short(),
            self.remote.short(),
            next
        );
        if let Some(cb) = &self.on_state {
            cb(self.relay, next);
        }
    }

    fn shutdown(&self) {
        let mut mux = self.mux.lock();
        mux.closed = true;
        // Dropping the senders gives every open logical stream EOF.
        mux.streams.clear();
    }
}

/// A multiplexed circuit to `remote` through `relay`.
#[derive(Clone)]
pub struct Circuit {
    shared: Arc<Shared>,
}

impl Circuit {
    /// Wraps `io` in a multiplexer. Returns the circuit handle, the
    /// receiver of logical streams opened by the remote, and the driver
    /// future the caller must spawn.
    pub fn new<S>(
        io: S,
        relay: PeerId,
        remote: PeerId,
        role: Role,
        idle_timeout: Duration,
        on_state: Option<StateCallback>,
    ) -> (
        Circuit,
        mpsc::UnboundedReceiver<Stream>,
        impl std::future::Future<Output = ()> + Send,
    )
    where
        S: AsyncIo + 'static,
    {
        let (out_tx, out_rx) = mpsc::unbounded();
        let (in_tx, in_rx) = mpsc::unbounded();
        let shared = Arc::new(Shared {
            relay,
            remote,
            outbound: out_tx,
            mux: Mutex::new(MuxState {
                streams: FnvHashMap::default(),
                next_stream_id: match role {
                    Role::Initiator => 1,
                    Role::Receiver => 2,
                },
                closed: false,
            }),
            state: Mutex::new(CircuitState::Active),
            on_state,
        });
        let circuit = Circuit {
            shared: shared.clone(),
        };
        let driver = drive(io, shared, in_tx, idle_timeout, out_rx);
        (circuit, in_rx, driver)
    }

    /// The peer on the far side of the circuit.
    pub fn remote(&self) -> PeerId {
        self.shared.remote
    }

    pub fn relay(&self) -> PeerId {
        self.shared.relay
    }

    pub fn state(&self) -> CircuitState {
        *self.shared.state.lock()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.mux.lock().closed
    }

    /// Opens a new logical stream over the circuit.
    pub fn open_stream(&self) -> Result<Stream> {
        let mut mux = self.shared.mux.lock();
        if mux.closed {
            return Err(Error::ConnectionFailed("circuit is closed".into()));
        }
        let id = mux.next_stream_id;
        mux.next_stream_id += 2;
        let (tx, rx) = mpsc::unbounded();
        mux.streams.insert(id, tx);
        drop(mux);
        trace!("opened logical stream {} to {}", id, self.shared.remote.short());
        Ok(Stream::new(
            CircuitStream {
                id,
                incoming: rx,
                buffer: Bytes::new(),
                outbound: self.shared.outbound.clone(),
                fin_sent: false,
            },
            self.shared.remote,
        ))
    }

    /// Tears the circuit down. The driver exits once the outbound queue
    /// drains.
    pub fn close(&self) {
        self.shared.shutdown();
        self.shared.outbound.close_channel();
    }
}

/// Runs the read and write halves of the multiplexer until either side
/// finishes, then marks the circuit stale and gives every logical stream
/// EOF.
async fn drive<S>(
    io: S,
    shared: Arc<Shared>,
    in_tx: mpsc::UnboundedSender<Stream>,
    idle_timeout: Duration,
    mut out_rx: mpsc::UnboundedReceiver<DataFrame>,
) where
    S: AsyncIo + 'static,
{
    let (mut reader, mut writer) = io.split();

    let write_loop = async move {
        while let Some(frame) = out_rx.next().await {
            if let Err(e) = write_message(&mut writer, &Message::Data(frame)).await {
                debug!("circuit write failed: {}", e);
                break;
            }
        }
    };

    let read_shared = shared.clone();
    let read_loop = async move {
        loop {
            let next = timeout(idle_timeout, read_message(&mut reader)).await;
            match next {
                Err(Error::Timeout) => {
                    read_shared.set_state(CircuitState::Stale);
                    continue;
                }
                Err(_) | Ok(Err(_)) => break,
                Ok(Ok(Message::Data(frame))) => {
                    read_shared.set_state(CircuitState::Active);
                    dispatch(&read_shared, &in_tx, frame);
                }
                Ok(Ok(other)) => {
                    debug!("unexpected message on circuit: {:?}", other);
                    break;
                }
            }
        }
    };

    futures::pin_mut!(write_loop);
    futures::pin_mut!(read_loop);
    match future::select(read_loop, write_loop).await {
        Either::Left(_) | Either::Right(_) => {}
    }
    shared.set_state(CircuitState::Stale);
    shared.shutdown();
}

fn dispatch(shared: &Arc<Shared>, in_tx: &mpsc::UnboundedSender<Stream>, frame: DataFrame) {
    let mut mux = shared.mux.lock();
    if mux.closed {
        return;
    }
    if let Some(tx) = mux.streams.get(&frame.stream_id) {
        if frame.flags & FLAG_RST != 0 {
            mux.streams.remove(&frame.stream_id);
            return;
        }
        if !frame.data.is_empty() {
            let _ = tx.unbounded_send(frame.data);
        }
        if frame.flags & FLAG_FIN != 0 {
            // Dropping the sender delivers EOF once buffered data drains.
            mux.streams.remove(&frame.stream_id);
        }
        return;
    }
    if frame.flags & FLAG_RST != 0 {
        return;
    }
    // New logical stream opened by the remote.
    let (tx, rx) = mpsc::unbounded();
    if !frame.data.is_empty() {
        let _ = tx.unbounded_send(frame.data.clone());
    }
    if frame.flags & FLAG_FIN == 0 {
        mux.streams.insert(frame.stream_id, tx);
    }
    let stream = Stream::new(
        CircuitStream {
            id: frame.stream_id,
            incoming: rx,
            buffer: Bytes::new(),
            outbound: shared.outbound.clone(),
            fin_sent: false,
        },
        shared.remote,
    );
    if in_tx.unbounded_send(stream).is_err() {
        mux.streams.remove(&frame.stream_id);
    }
}

/// One logical stream over a circuit.
struct CircuitStream {
    id: u32,
    incoming: mpsc::UnboundedReceiver<Bytes>,
    buffer: Bytes,
    outbound: mpsc::UnboundedSender<DataFrame>,
    fin_sent: bool,
}

impl CircuitStream {
    fn send_frame(&self, flags: u8, data: Bytes) -> io::Result<()> {
        self.outbound
            .unbounded_send(DataFrame {
                stream_id: self.id,
                flags,
                data,
            })
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "circuit closed"))
    }
}

impl AsyncRead for CircuitStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if !self.buffer.is_empty() {
                let n = self.buffer.len().min(buf.len());
                buf[..n].copy_from_slice(&self.buffer[..n]);
                let _ = self.buffer.split_to(n);
                return Poll::Ready(Ok(n));
            }
            match Pin::new(&mut self.incoming).poll_next(cx) {
                Poll::Ready(Some(chunk)) => self.buffer = chunk,
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for CircuitStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let n = buf.len().min(MAX_DATA_PAYLOAD);
        self.send_frame(0, Bytes::copy_from_slice(&buf[..n]))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.fin_sent {
            self.fin_sent = true;
            let _ = self.send_frame(FLAG_FIN, Bytes::new());
        }
        Poll::Ready(Ok(()))
    }
}

impl Drop for CircuitStream {
    fn drop(&mut self) {
        if !self.fin_sent {
            let _ = self.send_frame(FLAG_RST, Bytes::new());
        }
    }
}
