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
use std::convert::TryFrom;
use std::fmt;
use std::str::FromStr;

/// Identifier of a node on the overlay.
///
/// Peer ids are opaque 32-byte values. They order by byte value, render as
/// base58 and carry a [`short`](PeerId::short) form for log lines.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId([u8; 32]);

impl PeerId {
    /// Length of a peer id in bytes.
    pub const LEN: usize = 32;

    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    pub fn to_bytes(self) -> [u8; Self::LEN] {
        self.0
    }

    /// Generates a random peer id, e.g. for tests.
    pub fn random() -> Self {
        PeerId(rand::random())
    }

    /// First eight base58 characters, for log lines.
    pub fn short(&self) -> String {
        let full = self.to_string();
        full.chars().take(8).collect()
    }
}

impl TryFrom<&[u8]> for PeerId {
    type Error = Error;

    fn try_from(slice: &[u8]) -> Result<Self, Error> {
        if slice.len() != Self::LEN {
            return Err(Error::InvalidAddress(format!(
                "peer id must be {} bytes, got {}",
                Self::LEN,
                slice.len()
            )));
        }
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(slice);
        Ok(PeerId(bytes))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl FromStr for PeerId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let bytes = bs58::decode(s)
            .into_vec()
            .map_err(|e| Error::InvalidAddress(format!("invalid peer id {:?}: {}", s, e)))?;
        PeerId::try_from(bytes.as_slice())
    }
}
