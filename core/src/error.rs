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

use crate::peer_id::PeerId;

/// Errors produced by the host and the relay subsystem.
///
/// Public APIs return these with the original cause preserved through
/// wrapping; internal retry and failover stays invisible to callers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("host is closed")]
    Closed,
    #[error("host already started")]
    AlreadyStarted,
    #[error("component not initialized")]
    NotInitialized,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("cannot use self as relay")]
    CannotRelayToSelf,
    #[error("no relay available")]
    NoRelayAvailable(#[source] Box<Error>),
    #[error("node is not publicly reachable")]
    NotPubliclyReachable,
    #[error("peer id mismatch: expected {expected}, found {found}")]
    PeerIdMismatch { expected: PeerId, found: PeerId },
    #[error("protocol negotiation failed")]
    NegotiationFailed,
    #[error("reservation failed")]
    ReservationFailed(#[source] Box<Error>),
    #[error("relay busy")]
    RelayBusy,
    #[error("no reservation")]
    NoReservation,
    #[error("resource limit exceeded")]
    ResourceLimit,
    #[error("bandwidth limit exceeded")]
    BandwidthExceeded,
    #[error("too many circuits")]
    TooManyCircuits,
    #[error("permission denied")]
    PermissionDenied,
    #[error("protocol not allowed")]
    ProtocolNotAllowed,
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("target unreachable")]
    TargetUnreachable,
    #[error("protocol error: {0}")]
    ProtocolError(String),
    #[error("internal error: {0}")]
    Internal(String),
    #[error("malformed message")]
    MalformedMessage,
    #[error("operation timed out")]
    Timeout,
    #[error("operation canceled")]
    Canceled,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a dial strategy failing with this error may be followed by
    /// the next strategy. Only a closed host stops the ladder.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Closed | Error::Canceled)
    }
}
