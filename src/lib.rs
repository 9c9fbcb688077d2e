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

//! dep2p: peer-to-peer overlay networking.
//!
//! This facade crate re-exports the workspace members:
//!
//! - [`core`]: ids, multiaddresses, errors, events, capability traits.
//! - [`multistream_select`]: client-first protocol negotiation.
//! - [`relay`]: circuit relay client, server, autorelay and transport.
//! - [`host`]: the host facade composing everything above.

pub use dep2p_core as core;
pub use dep2p_host as host;
pub use dep2p_multistream_select as multistream_select;
pub use dep2p_relay as relay;

pub use dep2p_core::{Error, Multiaddr, PeerId, Protocol};
pub use dep2p_host::{Config, Host, HostCapabilities};
