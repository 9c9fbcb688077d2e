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

//! Multistream-select protocol negotiation.
//!
//! Client-first negotiation over a freshly opened stream: both sides send
//! the protocol header, then the dialer proposes exactly one protocol and
//! the listener answers with either an echo (settled) or `na` (try the
//! next, which for a single-protocol dialer means failure).
//!
//! Messages are varint-length-delimited and newline-terminated:
//!
//! ```text
//! <varint len> /multistream/1.0.0 \n
//! <varint len> /app/echo/1.0.0    \n
//! <varint len> na                 \n
//! ```

mod protocol;

pub use protocol::{dialer_select, listener_select, HEADER};
