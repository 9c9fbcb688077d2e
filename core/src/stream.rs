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

//! The stream and connection model.
//!
//! A [`Stream`] is a bidirectional byte pipe to a peer, optionally tagged
//! with the protocol that negotiation settled on. A [`Connection`] can open
//! streams and is handed around as an `Arc<dyn Connection>`.
//! [`memory_pair`] provides an in-process duplex used by tests everywhere
//! in the workspace.

use crate::event::{Direction, DisconnectReason};
use crate::multiaddr::Multiaddr;
use crate::peer_id::PeerId;
use crate::Result;
use futures::channel::mpsc;
use futures::future::BoxFuture;
use futures::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use futures::stream::Stream as _;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Object-safe alias for the raw byte pipes streams are built from.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> AsyncIo for T {}

pub type BoxIo = Box<dyn AsyncIo>;

/// A stream to a remote peer.
pub struct Stream {
    io: BoxIo,
    peer: PeerId,
    protocol: Option<String>,
}

impl Stream {
    pub fn new(io: impl AsyncIo + 'static, peer: PeerId) -> Self {
        Stream {
            io: Box::new(io),
            peer,
            protocol: None,
        }
    }

    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// The protocol negotiation settled on, if it ran.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn set_protocol(&mut self, protocol: impl Into<String>) {
        self.protocol = Some(protocol.into());
    }

    /// Abruptly terminates the stream. Errors are ignored; the remote sees
    /// the pipe go away.
    pub async fn reset(mut self) {
        let _ = self.io.close().await;
    }
}

impl AsyncRead for Stream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_close(cx)
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("peer", &self.peer.short())
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// An established connection to a peer.
pub trait Connection: Send + Sync {
    fn peer(&self) -> PeerId;
    fn local_addr(&self) -> Multiaddr;
    fn remote_addr(&self) -> Multiaddr;
    fn direction(&self) -> Direction;

    /// Opens a fresh stream on this connection. The stream has no protocol
    /// tag yet; negotiation is the caller's job.
    fn open_stream(&self) -> BoxFuture<'_, Result<Stream>>;

    /// Like [`open_stream`](Connection::open_stream) with a transport
    /// priority hint. Honored by quic-capable transports; the default
    /// ignores the hint.
    fn open_stream_prioritized(&self, _priority: Option<u8>) -> BoxFuture<'_, Result<Stream>> {
        self.open_stream()
    }

    fn close(&self) -> BoxFuture<'_, Result<()>>;
    fn is_closed(&self) -> bool;

    /// Why the connection went away, when the transport can tell.
    fn disconnect_reason(&self) -> Option<DisconnectReason> {
        None
    }
}

pub type ConnectionHandle = Arc<dyn Connection>;

/// One end of an in-process duplex byte pipe.
pub struct MemoryStream {
    incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    buffer: Vec<u8>,
}

/// Creates a connected pair of in-memory streams. Closing one end makes
/// reads on the other end return EOF once buffered data is drained.
pub fn memory_pair() -> (MemoryStream, MemoryStream) {
    let (a_tx, b_rx) = mpsc::unbounded();
    let (b_tx, a_rx) = mpsc::unbounded();
    (
        MemoryStream {
            incoming: a_rx,
            outgoing: a_tx,
            buffer: Vec::new(),
        },
        MemoryStream {
            incoming: b_rx,
            outgoing: b_tx,
            buffer: Vec::new(),
        },
    )
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        loop {
            if !self.buffer.is_empty() {
                let n = self.buffer.len().min(buf.len());
                buf[..n].copy_from_slice(&self.buffer[..n]);
                self.buffer.drain(..n);
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

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.outgoing
            .unbounded_send(buf.to_vec())
            .map(|()| buf.len())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "remote end closed"))
            .into()
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.outgoing.close_channel();
        Poll::Ready(Ok(()))
    }
}
