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

use dep2p_core::{Error, Result};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use log::{debug, trace};

/// Negotiation header exchanged by both sides before any proposal.
pub const HEADER: &str = "/multistream/1.0.0";

const MSG_NA: &str = "na";

/// Longest message accepted, header and newline included. Protocol names
/// are short ASCII paths; anything larger is a protocol violation.
const MAX_MESSAGE_LEN: usize = 1024;

async fn write_message<S>(io: &mut S, message: &str) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut frame = Vec::with_capacity(message.len() + 3);
    let mut varint_buf = unsigned_varint::encode::usize_buffer();
    frame.extend_from_slice(unsigned_varint::encode::usize(
        message.len() + 1,
        &mut varint_buf,
    ));
    frame.extend_from_slice(message.as_bytes());
    frame.push(b'\n');
    io.write_all(&frame).await?;
    io.flush().await?;
    Ok(())
}

async fn read_message<S>(io: &mut S) -> Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut varint_bytes = Vec::with_capacity(2);
    let len = loop {
        let mut byte = [0u8; 1];
        io.read_exact(&mut byte).await?;
        varint_bytes.push(byte[0]);
        if byte[0] & 0x80 == 0 {
            let (len, _) = unsigned_varint::decode::usize(&varint_bytes)
                .map_err(|e| Error::ProtocolError(format!("bad length prefix: {}", e)))?;
            break len;
        }
        if varint_bytes.len() > 2 {
            return Err(Error::ProtocolError("length prefix too long".into()));
        }
    };
    if len == 0 || len > MAX_MESSAGE_LEN {
        return Err(Error::ProtocolError(format!("message length {} out of range", len)));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    if payload.pop() != Some(b'\n') {
        return Err(Error::ProtocolError("message not newline-terminated".into()));
    }
    String::from_utf8(payload).map_err(|_| Error::ProtocolError("message not utf-8".into()))
}

async fn exchange_headers<S>(io: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(io, HEADER).await?;
    let remote = read_message(io).await?;
    if remote != HEADER {
        return Err(Error::ProtocolError(format!(
            "unexpected negotiation header {:?}",
            remote
        )));
    }
    Ok(())
}

/// Dialer side: propose exactly one protocol and wait for the listener to
/// settle on it. Fails with [`Error::NegotiationFailed`] if the listener
/// answers `na`.
pub async fn dialer_select<S>(io: &mut S, protocol: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_headers(io).await?;
    write_message(io, protocol).await?;
    let answer = read_message(io).await?;
    if answer == protocol {
        trace!("dialer settled on {}", protocol);
        return Ok(());
    }
    if answer == MSG_NA {
        debug!("dialer: {} not supported by remote", protocol);
        return Err(Error::NegotiationFailed);
    }
    Err(Error::ProtocolError(format!(
        "unexpected negotiation answer {:?}",
        answer
    )))
}

/// Listener side: answer proposals against `supported` until one matches,
/// rejecting the rest with `na`. Returns the selected protocol.
///
/// An EOF before settling means the dialer gave up; that surfaces as
/// [`Error::NegotiationFailed`].
pub async fn listener_select<S>(io: &mut S, supported: &[String]) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    exchange_headers(io).await?;
    loop {
        let proposal = match read_message(io).await {
            Ok(p) => p,
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::NegotiationFailed)
            }
            Err(e) => return Err(e),
        };
        if supported.iter().any(|p| *p == proposal) {
            write_message(io, &proposal).await?;
            trace!("listener settled on {}", proposal);
            return Ok(proposal);
        }
        debug!("listener: {} not supported", proposal);
        write_message(io, MSG_NA).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dep2p_core::memory_pair;
    use futures::join;

    fn init_logger() {
        let _ = env_logger::try_init();
    }

    #[async_std::test]
    async fn settles_on_common_protocol() {
        init_logger();
        let (mut dialer, mut listener) = memory_pair();
        let supported = vec!["/app/echo/1.0.0".to_string(), "/ping/1.0.0".to_string()];

        let (dial_res, listen_res) = join!(
            dialer_select(&mut dialer, "/app/echo/1.0.0"),
            listener_select(&mut listener, &supported),
        );
        dial_res.unwrap();
        assert_eq!(listen_res.unwrap(), "/app/echo/1.0.0");
    }

    #[async_std::test]
    async fn rejects_unknown_protocol() {
        init_logger();
        let (mut dialer, mut listener) = memory_pair();
        let supported = vec!["/ping/1.0.0".to_string()];

        let (dial_res, listen_res) = join!(
            async {
                let res = dialer_select(&mut dialer, "/app/echo/1.0.0").await;
                // Listener keeps waiting for another proposal; hang up.
                drop(dialer);
                res
            },
            listener_select(&mut listener, &supported),
        );
        assert!(matches!(dial_res, Err(Error::NegotiationFailed)));
        assert!(matches!(listen_res, Err(Error::NegotiationFailed)));
    }

    #[async_std::test]
    async fn rejects_bad_header() {
        init_logger();
        let (mut dialer, mut listener) = memory_pair();
        let (_, listen_res) = join!(
            async {
                write_message(&mut dialer, "/not-multistream/9").await.unwrap();
            },
            listener_select(&mut listener, &[]),
        );
        assert!(matches!(listen_res, Err(Error::ProtocolError(_))));
    }

    #[async_std::test]
    async fn oversize_message_is_rejected() {
        init_logger();
        let (mut dialer, mut listener) = memory_pair();
        let huge = "x".repeat(MAX_MESSAGE_LEN + 1);
        let (_, listen_res) = join!(
            async {
                let _ = write_message(&mut dialer, &huge).await;
            },
            listener_select(&mut listener, &[]),
        );
        assert!(listen_res.is_err());
    }
}
