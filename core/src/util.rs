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

use crate::error::Error;
use crate::Result;
use futures::future::{self, Either};
use futures::pin_mut;
use futures_timer::Delay;
use std::future::Future;
use std::time::Duration;

/// Runs `fut` under a deadline. Cancellation of an operation is dropping
/// its future; this wrapper adds the time bound.
pub async fn timeout<F>(duration: Duration, fut: F) -> Result<F::Output>
where
    F: Future,
{
    let delay = Delay::new(duration);
    pin_mut!(fut);
    match future::select(fut, delay).await {
        Either::Left((out, _)) => Ok(out),
        Either::Right(((), _)) => Err(Error::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[async_std::test]
    async fn passes_through_fast_futures() {
        let out = timeout(Duration::from_secs(1), async { 7 }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[async_std::test]
    async fn times_out_slow_futures() {
        let res = timeout(Duration::from_millis(10), future::pending::<()>()).await;
        assert!(matches!(res, Err(Error::Timeout)));
    }
}
