// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Error taxonomy for the FastCGI wire protocol.
//!
//! Every variant of `ProtocolError` is fatal to the connection it occurred
//! on; there is no recoverable decode error in this protocol short of the
//! encoder's "no room" outcome, which is not an error at all and is
//! represented as a plain `bool` return, not a `Result`.

/// A fatal error on a connection's record stream.
#[derive(Debug, thiserror::Error)]
pub(crate) enum ProtocolError {
    /// Header version was not 1.
    #[error("FastCGI version mismatch")]
    Version,

    /// A record type neither recognized nor explicitly handled.
    #[error("unrecognized FastCGI record type")]
    UnknownType,

    /// A second `BEGIN_REQUEST` arrived while assembling a request, or a
    /// record's request-id disagreed with the one being assembled.
    #[error("FastCGI connection attempted request multiplexing")]
    Multiplex,

    /// `PARAMS`/`STDIN` arrived with no request being assembled, or the
    /// peer sent `DATA`, `GET_VALUES`, or `ABORT_REQUEST`.
    #[error("FastCGI protocol violation")]
    Protocol,

    /// An advertised record length exceeds the inbound buffer's capacity
    /// and the buffer is already full.
    #[error("oversize FastCGI record")]
    Oversize,

    /// The underlying socket read or write failed.
    #[error("FastCGI transport error")]
    Transport(#[from] std::io::Error),
}
