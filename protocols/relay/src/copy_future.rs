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

//! Bidirectional byte forwarding between the two legs of a circuit.
//!
//! Copies in both directions until either leg sees EOF or an error, then
//! drops both, which closes them. The first completion decides; the caller
//! runs its cleanup exactly once, after the future resolves.

use dep2p_core::{timeout, Error, Result};
use futures::future::{self, Either};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::trace;
use std::time::Duration;

/// Limits applied to one circuit's forwarding.
#[derive(Clone, Copy, Debug)]
pub struct CopyLimits {
    /// Bytes forwarded per direction; 0 disables the cap.
    pub max_bytes: u64,
    /// Wall-clock lifetime of the circuit; zero disables the cap.
    pub max_duration: Duration,
    pub buffer_size: usize,
}

impl Default for CopyLimits {
    fn default() -> Self {
        CopyLimits {
            max_bytes: 0,
            max_duration: Duration::from_secs(0),
            buffer_size: 4096,
        }
    }
}

async fn copy_one_direction<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    max_bytes: u64,
) -> Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buffer = vec![0u8; buffer_size.max(1)];
    let mut forwarded = 0u64;
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            let _ = writer.close().await;
            return Ok(forwarded);
        }
        forwarded += n as u64;
        if max_bytes > 0 && forwarded > max_bytes {
            return Err(Error::ResourceLimit);
        }
        writer.write_all(&buffer[..n]).await?;
        writer.flush().await?;
    }
}

/// Forwards bytes between `a` and `b` until either direction finishes.
/// Returns the byte count of the direction that finished first. Both
/// streams are dropped (and thereby closed) on return.
pub async fn copy_bidirectional<A, B>(a: A, b: B, limits: CopyLimits) -> Result<u64>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (a_read, a_write) = a.split();
    let (b_read, b_write) = b.split();
    let forward = copy_one_direction(a_read, b_write, limits.buffer_size, limits.max_bytes);
    let backward = copy_one_direction(b_read, a_write, limits.buffer_size, limits.max_bytes);

    let race = async move {
        futures::pin_mut!(forward);
        futures::pin_mut!(backward);
        match future::select(forward, backward).await {
            Either::Left((result, _)) | Either::Right((result, _)) => result,
        }
    };

    let result = if limits.max_duration > Duration::from_secs(0) {
        timeout(limits.max_duration, race).await?
    } else {
        race.await
    };
    trace!("circuit forwarding finished: {:?}", result);
    result
}
