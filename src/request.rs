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

//! A completed FastCGI request, handed to application code by
//! [`Responder::pop_request_blocking`](crate::Responder::pop_request_blocking)
//! or its non-blocking counterpart.

use std::collections::HashMap;
use std::fmt;
use std::sync::Weak;

use bytes::Bytes;

use crate::connection::Connection;
use crate::meta::{BeginRequestFlags, Role};
use crate::params::Params;

/// One in-flight FastCGI request, published once its `STDIN` stream has
/// been closed by the peer.
///
/// The back-reference to the originating connection is weak: once the
/// connection has been destroyed, `stdout`/`end_stdout`/`reply` silently
/// return `false` instead of writing anywhere.
pub struct Request {
    request_id: u16,
    role: Role,
    flags: BeginRequestFlags,
    params: Params,
    stdin: Bytes,
    connection: Weak<Connection>,
}

impl Request {
    pub(crate) fn new(
        request_id: u16, role: Role, flags: BeginRequestFlags, params: HashMap<Bytes, Bytes>,
        stdin: Bytes, connection: Weak<Connection>,
    ) -> Self {
        Self { request_id, role, flags, params: Params::new(params), stdin, connection }
    }

    /// The FastCGI request-id this request arrived under.
    pub fn id(&self) -> u16 {
        self.request_id
    }

    /// The role the peer asked this request to perform. This core only
    /// behaves specially for `Role::Responder`; other roles are recorded
    /// but not otherwise enforced.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Whether the peer asked to keep the connection open after this
    /// request completes.
    pub fn keep_conn(&self) -> bool {
        self.flags.keep_conn()
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// The request body accumulated from `STDIN` records.
    pub fn stdin(&self) -> &[u8] {
        &self.stdin
    }

    /// Writes `payload` as one or more `STDOUT` records. Returns `false`
    /// without writing anything if the connection is gone, or if the
    /// outbound buffer has no room (the caller should retry once more
    /// output has drained).
    pub fn stdout(&self, payload: &[u8]) -> bool {
        self.connection.upgrade().is_some_and(|conn| conn.stdout(self.request_id, payload))
    }

    /// Appends the zero-content `STDOUT` record that terminates the
    /// response body stream.
    pub fn end_stdout(&self) -> bool {
        self.connection.upgrade().is_some_and(|conn| conn.end_stdout(self.request_id))
    }

    /// Appends `END_REQUEST` with the given application status. The
    /// connection is closed once this (and anything queued ahead of it)
    /// has drained, unless the peer's `BEGIN_REQUEST` carried `KEEP_CONN`.
    pub fn reply(&self, app_status: u32) -> bool {
        let close_after = !self.flags.keep_conn();
        self.connection.upgrade().is_some_and(|conn| conn.reply(self.request_id, app_status, close_after))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("request_id", &self.request_id)
            .field("role", &self.role)
            .field("params", &self.params.len())
            .field("stdin_len", &self.stdin.len())
            .finish()
    }
}
