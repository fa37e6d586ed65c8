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

//! One TCP session with a web server.
//!
//! The read pump and write pump both run as Tokio tasks on the responder's
//! shared multi-threaded runtime; either may resume on any worker thread,
//! so every mutation of the outbound buffer and the "write in flight" /
//! "close after drain" flags goes through `Shared`'s mutex. The inbound
//! buffer and the aggregator are touched only from the read task and carry
//! no lock at all.

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, trace, warn};

use crate::aggregator::{Aggregator, Fed};
use crate::buffer::{InboundBuffer, OutboundBuffer};
use crate::error::ProtocolError;
use crate::responder::RuntimeHandle;

struct Shared {
    outbound: OutboundBuffer,
    write_in_flight: bool,
    close_after_drain: bool,
    closed: bool,
}

/// A connection is kept alive by shared ownership between its read task and
/// any in-flight write-drain task; a published `Request` holds only a
/// `Weak` reference and never keeps the connection alive by itself.
pub(crate) struct Connection {
    write_half: AsyncMutex<tokio::net::tcp::OwnedWriteHalf>,
    shared: Mutex<Shared>,
    runtime: RuntimeHandle,
}

impl Connection {
    fn new(write_half: tokio::net::tcp::OwnedWriteHalf, runtime: RuntimeHandle) -> Self {
        Self {
            write_half: AsyncMutex::new(write_half),
            shared: Mutex::new(Shared {
                outbound: OutboundBuffer::new(),
                write_in_flight: false,
                close_after_drain: false,
                closed: false,
            }),
            runtime,
        }
    }

    /// Splits `stream`, spawns the read pump, and returns the shared
    /// connection handle the read pump (and later, write drains) keep
    /// alive.
    pub(crate) fn spawn(stream: TcpStream, runtime: RuntimeHandle) {
        let (read_half, write_half) = stream.into_split();
        let conn = Arc::new(Connection::new(write_half, runtime.clone()));
        runtime.spawn(run_read_pump(conn, read_half));
    }

    /// Writes `payload` as `STDOUT` record(s).
    pub(crate) fn stdout(self: &Arc<Self>, request_id: u16, payload: &[u8]) -> bool {
        let (ok, in_flight) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.closed {
                return false;
            }
            let ok = shared.outbound.write_stdout(request_id, payload);
            (ok, shared.write_in_flight)
        };
        if ok && !in_flight {
            self.post_write();
        }
        ok
    }

    /// Appends the zero-content `STDOUT` terminator record.
    pub(crate) fn end_stdout(self: &Arc<Self>, request_id: u16) -> bool {
        let (ok, in_flight) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.closed {
                return false;
            }
            let ok = shared.outbound.write_end_stdout(request_id);
            (ok, shared.write_in_flight)
        };
        if ok && !in_flight {
            self.post_write();
        }
        ok
    }

    /// Appends `END_REQUEST` and latches `close_after` so the socket shuts
    /// down once the buffer has fully drained.
    pub(crate) fn reply(self: &Arc<Self>, request_id: u16, app_status: u32, close_after: bool) -> bool {
        let (ok, in_flight) = {
            let mut shared = self.shared.lock().unwrap();
            if shared.closed {
                return false;
            }
            let ok = shared.outbound.write_end_request(request_id, app_status);
            shared.close_after_drain = close_after;
            (ok, shared.write_in_flight)
        };
        if ok && !in_flight {
            self.post_write();
        }
        ok
    }

    /// If the outbound buffer holds pending bytes and no drain is already
    /// running, spawns one.
    fn post_write(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.outbound.is_empty() {
                shared.write_in_flight = false;
                return;
            }
            if shared.write_in_flight {
                return;
            }
            shared.write_in_flight = true;
        }
        self.runtime.spawn(Arc::clone(self).drain_once());
    }

    /// Performs one partial write of the pending outbound bytes, then
    /// either shuts down (if "close after drain" latched and the buffer is
    /// now empty) or kicks off another drain.
    async fn drain_once(self: Arc<Self>) {
        let pending: Vec<u8> = {
            let shared = self.shared.lock().unwrap();
            shared.outbound.pending().to_vec()
        };

        let write_result = {
            let mut write_half = self.write_half.lock().await;
            write_half.write(&pending).await
        };

        match write_result {
            Ok(n) => {
                trace!(n, "wrote outbound bytes");
                let close_now = {
                    let mut shared = self.shared.lock().unwrap();
                    shared.outbound.transferred(n);
                    shared.write_in_flight = false;
                    shared.close_after_drain && shared.outbound.is_empty()
                };
                if close_now {
                    self.shutdown().await;
                } else {
                    // write_in_flight is now false, so this re-enters and
                    // spawns another drain if a partial write left bytes
                    // pending, or if stdout/end_stdout/reply appended more
                    // while this write was outstanding.
                    self.post_write();
                }
            }
            Err(err) => {
                let err = ProtocolError::Transport(err);
                warn!(error = %err, "closing connection");
                self.close().await;
            }
        }
    }

    /// Abortive close: used on any fatal protocol or transport error.
    async fn close(self: &Arc<Self>) {
        let already_closed = {
            let mut shared = self.shared.lock().unwrap();
            let was = shared.closed;
            shared.closed = true;
            was
        };
        if already_closed {
            return;
        }
        let mut write_half = self.write_half.lock().await;
        let _ = write_half.shutdown().await;
        drop(write_half);
        self.runtime.decrement_connection_count();
    }

    /// Graceful `shutdown(both)`, the policy used once "close after drain"
    /// completes.
    async fn shutdown(self: &Arc<Self>) {
        self.close().await;
    }
}

async fn run_read_pump(conn: Arc<Connection>, mut read_half: tokio::net::tcp::OwnedReadHalf) {
    let mut inbound = InboundBuffer::new();
    let mut aggregator = Aggregator::new();
    let weak = Arc::downgrade(&conn);

    loop {
        let n = match read_half.read(inbound.writable()).await {
            Ok(0) => {
                debug!("peer closed connection");
                conn.close().await;
                return;
            }
            Ok(n) => n,
            Err(err) => {
                let err = ProtocolError::Transport(err);
                warn!(error = %err, "closing connection");
                conn.close().await;
                return;
            }
        };
        inbound.transferred(n);

        loop {
            if !inbound.can_read() {
                break;
            }
            if !inbound.version_ok() {
                let err = ProtocolError::Version;
                warn!(error = %err, "closing connection");
                conn.close().await;
                return;
            }

            let kind = inbound.classify();
            match aggregator.feed(&inbound, kind, &weak) {
                Ok(Fed::Continue) => inbound.advance(),
                Ok(Fed::Published(request)) => {
                    inbound.advance();
                    conn.runtime.push_request(request);
                }
                Err(err) => {
                    warn!(error = %err, "closing connection");
                    conn.close().await;
                    return;
                }
            }
        }

        inbound.compact();
        if inbound.buf_full() {
            let err = ProtocolError::Oversize;
            warn!(error = %err, "closing connection");
            conn.close().await;
            return;
        }
    }
}
