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

//! Per-connection request assembly state machine.
//!
//! The aggregator is owned exclusively by a connection's read task, so none
//! of its state needs a lock: it is only ever touched from the single
//! sequential stream of record-completion events on that connection.

use std::collections::HashMap;
use std::sync::Weak;

use bytes::Bytes;

use crate::buffer::{InboundBuffer, RecordKind};
use crate::connection::Connection;
use crate::error::ProtocolError;
use crate::meta::{BeginRequestFlags, Role};
use crate::request::Request;

/// What the read pump should do after feeding one record to the aggregator.
pub(crate) enum Fed {
    /// Record consumed; advance past it and keep parsing.
    Continue,
    /// Record consumed and a request was published; advance past it too.
    Published(Request),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    ParamsOpen,
    StdinOpen,
}

struct Pending {
    request_id: u16,
    role: Role,
    flags: BeginRequestFlags,
    params: HashMap<Bytes, Bytes>,
    stdin: Vec<u8>,
}

/// Assembles one `Request` at a time out of a stream of decoded FastCGI
/// records.
pub(crate) struct Aggregator {
    state: State,
    pending: Option<Pending>,
}

impl Aggregator {
    pub(crate) fn new() -> Self {
        Self { state: State::Idle, pending: None }
    }

    /// Feeds one already-classified record to the state machine. The
    /// connection driver has already advanced past the record's header and
    /// version check.
    pub(crate) fn feed(
        &mut self, inbound: &InboundBuffer, kind: RecordKind, connection: &Weak<Connection>,
    ) -> Result<Fed, ProtocolError> {
        match kind {
            RecordKind::BeginRequest { role, flags } => self.on_begin_request(inbound, role, flags),
            RecordKind::Params => self.on_params(inbound),
            RecordKind::Stdin => self.on_stdin(inbound, connection),
            RecordKind::ProtocolViolation => Err(ProtocolError::Protocol),
            RecordKind::UnknownType => Err(ProtocolError::UnknownType),
        }
    }

    fn on_begin_request(
        &mut self, inbound: &InboundBuffer, role: Role, flags: BeginRequestFlags,
    ) -> Result<Fed, ProtocolError> {
        if self.pending.is_some() {
            return Err(ProtocolError::Multiplex);
        }
        self.pending = Some(Pending {
            request_id: inbound.request_id(),
            role,
            flags,
            params: HashMap::new(),
            stdin: Vec::new(),
        });
        self.state = State::ParamsOpen;
        Ok(Fed::Continue)
    }

    fn on_params(&mut self, inbound: &InboundBuffer) -> Result<Fed, ProtocolError> {
        let pending = self.pending.as_mut().ok_or(ProtocolError::Protocol)?;
        if pending.request_id != inbound.request_id() {
            return Err(ProtocolError::Multiplex);
        }

        let is_empty = {
            let mut iter = inbound.decode_params().peekable();
            if iter.peek().is_none() {
                true
            } else {
                for (name, value) in iter {
                    pending.params.insert(Bytes::copy_from_slice(name), Bytes::copy_from_slice(value));
                }
                false
            }
        };

        match self.state {
            State::ParamsOpen if is_empty => {
                self.state = State::StdinOpen;
                Ok(Fed::Continue)
            }
            State::ParamsOpen => Ok(Fed::Continue),
            // PARAMS after STDIN bytes have already been appended is a
            // protocol error; see DESIGN.md for why this stricter reading
            // was chosen.
            State::StdinOpen => Err(ProtocolError::Protocol),
            State::Idle => unreachable!("no record is fed while a request is not pending"),
        }
    }

    fn on_stdin(
        &mut self, inbound: &InboundBuffer, connection: &Weak<Connection>,
    ) -> Result<Fed, ProtocolError> {
        let pending = self.pending.as_mut().ok_or(ProtocolError::Protocol)?;
        if pending.request_id != inbound.request_id() {
            return Err(ProtocolError::Multiplex);
        }

        // STDIN content is opaque bytes, not name/value pairs.
        let bytes = inbound.current_content();

        if bytes.is_empty() {
            let pending = self.pending.take().expect("checked above");
            self.state = State::Idle;
            let request = Request::new(
                pending.request_id,
                pending.role,
                pending.flags,
                pending.params,
                Bytes::from(pending.stdin),
                connection.clone(),
            );
            Ok(Fed::Published(request))
        } else {
            pending.stdin.extend_from_slice(bytes);
            self.state = State::StdinOpen;
            Ok(Fed::Continue)
        }
    }
}

