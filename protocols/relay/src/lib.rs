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

//! Circuit relay for dep2p.
//!
//! ## Terminology
//!
//! - **Source**: the node initiating a connection via a *relay* to a
//!   *destination*.
//! - **Relay**: the node asked by a *source* to relay to a *destination*.
//! - **Destination**: the node contacted by the *source* via the *relay*.
//! - **Reservation**: the relay's commitment to route for a destination
//!   until a TTL.
//! - **HOP**: the protocol between a client and the relay (reserve,
//!   connect).
//! - **STOP**: the protocol from the relay to a reserved destination
//!   delivering an incoming circuit.
//!
//! Only the destination of a circuit needs a reservation; the source is by
//! definition the reachable party.

pub mod auto_relay;
pub mod circuit;
pub mod client;
pub mod codec;
pub mod copy_future;
pub mod limiter;
pub mod manager;
pub mod selector;
pub mod server;
pub mod transport;

pub use auto_relay::{AutoRelay, AutoRelayConfig};
pub use circuit::{Circuit, Role};
pub use client::{HopReserver, RelayClient, RelayClientConfig, RelayState, ReservationInfo};
pub use codec::{Message, RelayCodec, StatusCode, Voucher};
pub use limiter::{Limiter, LimiterConfig, LimiterStats};
pub use manager::{ManagerCapabilities, RelayManager, RelayManagerConfig};
pub use selector::{CandidateInfo, GeoResolver, RelaySelector};
pub use server::{RelayAcl, RelayServer, RelayServerConfig, RelayServerStats};
pub use transport::{CircuitDialer, RelayTransport, RelayTransportConfig};

/// HOP reserve entry point.
pub const RESERVE_PROTOCOL: &str = "/dep2p/sys/relay/1.0.0";
/// HOP connect.
pub const HOP_PROTOCOL: &str = "/dep2p/sys/relay/hop/1.0.0";
/// STOP connect, spoken by the relay toward a reserved destination.
pub const STOP_PROTOCOL: &str = "/dep2p/sys/relay/stop/1.0.0";

/// Namespace relay servers announce under.
pub const RELAY_NAMESPACE: &str = "relay";
/// Provider key used by DHT-backed discovery for the relay namespace.
pub const RELAY_DISCOVERY_KEY: &str = "dep2p/v1/sys/relay";
