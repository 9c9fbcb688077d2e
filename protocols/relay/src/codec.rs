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

//! Wire format of the HOP/STOP/status/data/voucher messages.
//!
//! Every message is length-framed: `u32` big-endian length (including the
//! type byte), one `u8` message type, then a type-specific payload. The
//! protocol-version byte carried by most payloads is emitted as `1` and
//! ignored on read; rejecting on mismatch is deliberately left to a future
//! revision.

use asynchronous_codec::{Decoder, Encoder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use dep2p_core::{Error, Multiaddr, PeerId, Result};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::convert::TryFrom;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Upper bound on any framed message, type byte included.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Upper bound on the payload of a single data frame.
pub const MAX_DATA_PAYLOAD: usize = 32 * 1024;

/// Version byte emitted in every message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Data-frame flag: sender is done writing on this logical stream.
pub const FLAG_FIN: u8 = 1;
/// Data-frame flag: abort this logical stream.
pub const FLAG_RST: u8 = 2;

const TYPE_HOP_RESERVE: u8 = 1;
const TYPE_HOP_RESERVE_OK: u8 = 2;
const TYPE_HOP_RESERVE_ERROR: u8 = 3;
const TYPE_HOP_CONNECT: u8 = 4;
const TYPE_HOP_CONNECT_OK: u8 = 5;
const TYPE_HOP_CONNECT_ERROR: u8 = 6;
const TYPE_STOP_CONNECT: u8 = 10;
const TYPE_STOP_CONNECT_OK: u8 = 11;
const TYPE_STOP_CONNECT_ERROR: u8 = 12;
const TYPE_STATUS: u8 = 20;
const TYPE_DATA: u8 = 100;

/// Status codes carried by error responses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusCode {
    None = 0,
    MalformedMessage = 100,
    Unexpected = 101,
    ResourceLimit = 200,
    NoReservation = 201,
    ConnectionFailed = 300,
    PeerNotFound = 301,
    PeerNoReservation = 302,
    RelayBusy = 400,
    PermissionDenied = 401,
    ProtocolNotAllowed = 402,
}

impl StatusCode {
    pub fn code(self) -> u16 {
        self as u16
    }

    pub fn from_code(code: u16) -> Option<StatusCode> {
        Some(match code {
            0 => StatusCode::None,
            100 => StatusCode::MalformedMessage,
            101 => StatusCode::Unexpected,
            200 => StatusCode::ResourceLimit,
            201 => StatusCode::NoReservation,
            300 => StatusCode::ConnectionFailed,
            301 => StatusCode::PeerNotFound,
            302 => StatusCode::PeerNoReservation,
            400 => StatusCode::RelayBusy,
            401 => StatusCode::PermissionDenied,
            402 => StatusCode::ProtocolNotAllowed,
            _ => return None,
        })
    }

    /// The error a received status surfaces as.
    pub fn into_error(self) -> Error {
        match self {
            StatusCode::None => Error::Internal("status code 0 is not an error".into()),
            StatusCode::MalformedMessage => Error::MalformedMessage,
            StatusCode::Unexpected => Error::ProtocolError("unexpected message".into()),
            StatusCode::ResourceLimit => Error::ResourceLimit,
            StatusCode::NoReservation | StatusCode::PeerNoReservation => Error::NoReservation,
            StatusCode::ConnectionFailed => Error::ConnectionFailed("relay reported failure".into()),
            StatusCode::PeerNotFound => Error::TargetUnreachable,
            StatusCode::RelayBusy => Error::RelayBusy,
            StatusCode::PermissionDenied => Error::PermissionDenied,
            StatusCode::ProtocolNotAllowed => Error::ProtocolNotAllowed,
        }
    }

    /// The status code a local admission error maps to on the wire.
    pub fn from_error(error: &Error) -> StatusCode {
        match error {
            Error::ResourceLimit | Error::BandwidthExceeded | Error::TooManyCircuits => {
                StatusCode::ResourceLimit
            }
            Error::NoReservation => StatusCode::NoReservation,
            Error::PermissionDenied => StatusCode::PermissionDenied,
            Error::ProtocolNotAllowed => StatusCode::ProtocolNotAllowed,
            Error::TargetUnreachable => StatusCode::PeerNotFound,
            Error::RelayBusy => StatusCode::RelayBusy,
            Error::MalformedMessage => StatusCode::MalformedMessage,
            _ => StatusCode::ConnectionFailed,
        }
    }
}

/// One frame of relay data: a chunk of a logical stream multiplexed over a
/// circuit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DataFrame {
    pub stream_id: u32,
    pub flags: u8,
    pub data: Bytes,
}

/// A relay protocol message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// Client asks the relay to hold a reservation for `ttl` seconds.
    Reserve { ttl: u32 },
    /// Relay granted the reservation.
    ReserveOk {
        ttl: u32,
        slots: u16,
        addrs: Vec<Multiaddr>,
    },
    ReserveError { code: StatusCode },
    /// Source asks the relay to open a circuit to `dst`.
    Connect {
        dst: PeerId,
        protocol: Option<String>,
    },
    ConnectOk,
    ConnectError { code: StatusCode },
    /// Relay tells a reserved destination that `src` wants a circuit.
    StopConnect { relay: PeerId, src: PeerId },
    StopConnectOk,
    StopConnectError { code: StatusCode },
    /// Server observability snapshot.
    Status {
        reservations: u32,
        circuits: u32,
        data_rate: u64,
    },
    Data(DataFrame),
}

impl Message {
    fn message_type(&self) -> u8 {
        match self {
            Message::Reserve { .. } => TYPE_HOP_RESERVE,
            Message::ReserveOk { .. } => TYPE_HOP_RESERVE_OK,
            Message::ReserveError { .. } => TYPE_HOP_RESERVE_ERROR,
            Message::Connect { .. } => TYPE_HOP_CONNECT,
            Message::ConnectOk => TYPE_HOP_CONNECT_OK,
            Message::ConnectError { .. } => TYPE_HOP_CONNECT_ERROR,
            Message::StopConnect { .. } => TYPE_STOP_CONNECT,
            Message::StopConnectOk => TYPE_STOP_CONNECT_OK,
            Message::StopConnectError { .. } => TYPE_STOP_CONNECT_ERROR,
            Message::Status { .. } => TYPE_STATUS,
            Message::Data(_) => TYPE_DATA,
        }
    }

    fn encode_payload(&self, out: &mut BytesMut) {
        match self {
            Message::Reserve { ttl } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u32(*ttl);
            }
            Message::ReserveOk { ttl, slots, addrs } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u32(*ttl);
                out.put_u16(*slots);
                out.put_u8(addrs.len() as u8);
                for addr in addrs {
                    let bytes = addr.to_string().into_bytes();
                    out.put_u16(bytes.len() as u16);
                    out.put_slice(&bytes);
                }
            }
            Message::ReserveError { code } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u16(code.code());
            }
            Message::Connect { dst, protocol } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_slice(dst.as_bytes());
                let proto = protocol.as_deref().unwrap_or("");
                out.put_u16(proto.len() as u16);
                out.put_slice(proto.as_bytes());
            }
            Message::ConnectOk => {
                out.put_u8(PROTOCOL_VERSION);
            }
            Message::ConnectError { code } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u16(code.code());
            }
            Message::StopConnect { relay, src } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_slice(relay.as_bytes());
                out.put_slice(src.as_bytes());
            }
            Message::StopConnectOk => {
                out.put_u8(PROTOCOL_VERSION);
            }
            Message::StopConnectError { code } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u16(code.code());
            }
            Message::Status {
                reservations,
                circuits,
                data_rate,
            } => {
                out.put_u8(PROTOCOL_VERSION);
                out.put_u32(*reservations);
                out.put_u32(*circuits);
                out.put_u64(*data_rate);
            }
            Message::Data(frame) => {
                out.put_u32(frame.stream_id);
                out.put_u8(frame.flags);
                out.put_u32(frame.data.len() as u32);
                out.put_slice(&frame.data);
            }
        }
    }

    /// Serializes the message into one length-framed buffer.
    pub fn to_bytes(&self) -> BytesMut {
        let mut payload = BytesMut::new();
        self.encode_payload(&mut payload);
        let mut framed = BytesMut::with_capacity(5 + payload.len());
        framed.put_u32((1 + payload.len()) as u32);
        framed.put_u8(self.message_type());
        framed.extend_from_slice(&payload);
        framed
    }

    fn decode_body(message_type: u8, mut payload: Bytes) -> Result<Message> {
        fn need(payload: &Bytes, n: usize) -> Result<()> {
            if payload.remaining() < n {
                Err(Error::MalformedMessage)
            } else {
                Ok(())
            }
        }
        fn take_peer(payload: &mut Bytes) -> Result<PeerId> {
            need(payload, PeerId::LEN)?;
            let raw = payload.split_to(PeerId::LEN);
            PeerId::try_from(&raw[..]).map_err(|_| Error::MalformedMessage)
        }
        fn take_code(payload: &mut Bytes) -> Result<StatusCode> {
            need(payload, 2)?;
            StatusCode::from_code(payload.get_u16()).ok_or(Error::MalformedMessage)
        }
        fn take_version(payload: &mut Bytes) -> Result<()> {
            // Read and discarded; see the module docs.
            need(payload, 1)?;
            let _ = payload.get_u8();
            Ok(())
        }

        let message = match message_type {
            TYPE_HOP_RESERVE => {
                take_version(&mut payload)?;
                need(&payload, 4)?;
                Message::Reserve {
                    ttl: payload.get_u32(),
                }
            }
            TYPE_HOP_RESERVE_OK => {
                take_version(&mut payload)?;
                need(&payload, 7)?;
                let ttl = payload.get_u32();
                let slots = payload.get_u16();
                let count = payload.get_u8();
                let mut addrs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    need(&payload, 2)?;
                    let len = payload.get_u16() as usize;
                    need(&payload, len)?;
                    let raw = payload.split_to(len);
                    let text =
                        std::str::from_utf8(&raw).map_err(|_| Error::MalformedMessage)?;
                    addrs.push(text.parse().map_err(|_| Error::MalformedMessage)?);
                }
                Message::ReserveOk { ttl, slots, addrs }
            }
            TYPE_HOP_RESERVE_ERROR => {
                take_version(&mut payload)?;
                Message::ReserveError {
                    code: take_code(&mut payload)?,
                }
            }
            TYPE_HOP_CONNECT => {
                take_version(&mut payload)?;
                let dst = take_peer(&mut payload)?;
                need(&payload, 2)?;
                let proto_len = payload.get_u16() as usize;
                need(&payload, proto_len)?;
                let protocol = if proto_len == 0 {
                    None
                } else {
                    let raw = payload.split_to(proto_len);
                    Some(
                        std::str::from_utf8(&raw)
                            .map_err(|_| Error::MalformedMessage)?
                            .to_string(),
                    )
                };
                Message::Connect { dst, protocol }
            }
            TYPE_HOP_CONNECT_OK => {
                take_version(&mut payload)?;
                Message::ConnectOk
            }
            TYPE_HOP_CONNECT_ERROR => {
                take_version(&mut payload)?;
                Message::ConnectError {
                    code: take_code(&mut payload)?,
                }
            }
            TYPE_STOP_CONNECT => {
                take_version(&mut payload)?;
                let relay = take_peer(&mut payload)?;
                let src = take_peer(&mut payload)?;
                Message::StopConnect { relay, src }
            }
            TYPE_STOP_CONNECT_OK => {
                take_version(&mut payload)?;
                Message::StopConnectOk
            }
            TYPE_STOP_CONNECT_ERROR => {
                take_version(&mut payload)?;
                Message::StopConnectError {
                    code: take_code(&mut payload)?,
                }
            }
            TYPE_STATUS => {
                take_version(&mut payload)?;
                need(&payload, 16)?;
                Message::Status {
                    reservations: payload.get_u32(),
                    circuits: payload.get_u32(),
                    data_rate: payload.get_u64(),
                }
            }
            TYPE_DATA => {
                need(&payload, 9)?;
                let stream_id = payload.get_u32();
                let flags = payload.get_u8();
                let len = payload.get_u32() as usize;
                if len > MAX_DATA_PAYLOAD {
                    return Err(Error::MalformedMessage);
                }
                need(&payload, len)?;
                let data = payload.split_to(len);
                Message::Data(DataFrame {
                    stream_id,
                    flags,
                    data,
                })
            }
            _ => return Err(Error::MalformedMessage),
        };
        if payload.has_remaining() {
            return Err(Error::MalformedMessage);
        }
        Ok(message)
    }
}

/// [`Encoder`]/[`Decoder`] for [`Message`] frames, for use with
/// `asynchronous_codec::Framed`.
#[derive(Clone, Copy, Debug, Default)]
pub struct RelayCodec;

impl Encoder for RelayCodec {
    type Item = Message;
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        dst.extend_from_slice(&item.to_bytes());
        Ok(())
    }
}

impl Decoder for RelayCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len == 0 || len > MAX_MESSAGE_SIZE {
            return Err(Error::MalformedMessage);
        }
        if src.len() < 4 + len {
            return Ok(None);
        }
        src.advance(4);
        let mut frame = src.split_to(len).freeze();
        let message_type = frame.get_u8();
        Message::decode_body(message_type, frame).map(Some)
    }
}

/// Reads one framed message off a raw stream.
pub async fn read_message<S>(io: &mut S) -> Result<Message>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    io.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len == 0 || len > MAX_MESSAGE_SIZE {
        return Err(Error::MalformedMessage);
    }
    let mut frame = vec![0u8; len];
    io.read_exact(&mut frame).await?;
    let mut frame = Bytes::from(frame);
    let message_type = frame.get_u8();
    Message::decode_body(message_type, frame)
}

/// Writes one framed message to a raw stream and flushes.
pub async fn write_message<S>(io: &mut S, message: &Message) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    io.write_all(&message.to_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// Self-contained reservation attestation. Authenticated by the hop
/// connection it is issued on, so it carries no signature of its own.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Voucher {
    pub relay: PeerId,
    pub peer: PeerId,
    /// Unix seconds.
    pub expiration: i64,
    pub duration: Duration,
    pub data_limit: i64,
}

impl Voucher {
    pub const ENCODED_LEN: usize = 2 * PeerId::LEN + 24;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::ENCODED_LEN);
        out.extend_from_slice(self.relay.as_bytes());
        out.extend_from_slice(self.peer.as_bytes());
        out.extend_from_slice(&self.expiration.to_be_bytes());
        out.extend_from_slice(&(self.duration.as_nanos() as i64).to_be_bytes());
        out.extend_from_slice(&self.data_limit.to_be_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Voucher> {
        if bytes.len() != Self::ENCODED_LEN {
            return Err(Error::MalformedMessage);
        }
        let mut buf = Bytes::copy_from_slice(bytes);
        let relay = PeerId::try_from(&buf.split_to(PeerId::LEN)[..])
            .map_err(|_| Error::MalformedMessage)?;
        let peer = PeerId::try_from(&buf.split_to(PeerId::LEN)[..])
            .map_err(|_| Error::MalformedMessage)?;
        let expiration = buf.get_i64();
        let duration_nanos = buf.get_i64();
        let data_limit = buf.get_i64();
        Ok(Voucher {
            relay,
            peer,
            expiration,
            duration: Duration::from_nanos(duration_nanos.max(0) as u64),
            data_limit,
        })
    }

    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        now_unix > self.expiration
    }

    pub fn is_expired(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.is_expired_at(now)
    }
}
