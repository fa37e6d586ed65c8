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

//! The responder runtime: the listening acceptor, the event-loop worker
//! pool, and the hand-off queue of completed requests. Constructed as an
//! explicit handle (see `DESIGN.md`) rather than a process-wide singleton.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::time::Duration;

use tracing::{info, warn};

use crate::connection::Connection;
use crate::request::Request;

/// FIFO carrying published requests from connection read pumps to
/// application threads, guarded by a condvar so `pop_request_blocking` can
/// be called from plain OS threads outside the Tokio runtime.
struct HandoffQueue {
    state: Mutex<QueueState>,
    cond: Condvar,
}

struct QueueState {
    queue: VecDeque<Request>,
    enqueue_num: u64,
    dequeue_num: u64,
}

impl HandoffQueue {
    fn new() -> Self {
        Self { state: Mutex::new(QueueState { queue: VecDeque::new(), enqueue_num: 0, dequeue_num: 0 }), cond: Condvar::new() }
    }

    fn push(&self, request: Request) {
        {
            let mut state = self.state.lock().unwrap();
            state.queue.push_back(request);
            state.enqueue_num += 1;
        }
        self.cond.notify_one();
    }

    fn pop_blocking(&self) -> Request {
        let mut state = self.state.lock().unwrap();
        while state.queue.is_empty() {
            state = self.cond.wait(state).unwrap();
        }
        let request = state.queue.pop_front().expect("just checked non-empty");
        state.dequeue_num += 1;
        request
    }

    fn pop_nonblocking(&self) -> Option<Request> {
        let mut state = self.state.lock().unwrap();
        let request = state.queue.pop_front();
        if request.is_some() {
            state.dequeue_num += 1;
        }
        request
    }

    fn reset_statistics(&self) {
        let mut state = self.state.lock().unwrap();
        state.enqueue_num = 0;
        state.dequeue_num = 0;
    }

    fn counts(&self) -> (u64, u64) {
        let state = self.state.lock().unwrap();
        (state.enqueue_num, state.dequeue_num)
    }
}

struct RuntimeInner {
    queue: HandoffQueue,
    connection_num: AtomicU64,
    thread_num: AtomicU64,
    handle: OnceLock<tokio::runtime::Handle>,
}

/// A cheap, `Clone`-able handle to the runtime's shared state, held by every
/// `Connection` so its read pump can publish requests, spawn write drains,
/// and report its own destruction without needing the full `Responder`
/// (which additionally owns the `tokio::runtime::Runtime` itself).
///
/// `spawn` goes through the stored `tokio::runtime::Handle` rather than the
/// ambient `tokio::spawn`, since `Connection::stdout`/`end_stdout`/`reply`
/// must be callable from whatever thread application code is running on
/// after `pop_request_blocking`/`pop_request_nonblocking` — a thread with
/// no Tokio context of its own.
#[derive(Clone)]
pub(crate) struct RuntimeHandle(Arc<RuntimeInner>);

impl RuntimeHandle {
    pub(crate) fn push_request(&self, request: Request) {
        self.0.queue.push(request);
    }

    pub(crate) fn decrement_connection_count(&self) {
        self.0.connection_num.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.0.handle.get().expect("runtime handle set before any connection is spawned").spawn(future);
    }

    fn increment_connection_count(&self) {
        self.0.connection_num.fetch_add(1, Ordering::Relaxed);
    }
}

/// A snapshot of the runtime's counters.
#[derive(Debug, Clone, Copy)]
pub struct Statistics {
    pub thread_num: u64,
    pub connection_num: u64,
    pub enqueue_num: u64,
    pub dequeue_num: u64,
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "thread_num={} connection_num={} enqueue_num={} dequeue_num={}",
            self.thread_num, self.connection_num, self.enqueue_num, self.dequeue_num
        )
    }
}

/// Owns the listening acceptor, the event-loop worker pool, and the
/// hand-off queue of completed requests.
///
/// Exposed as an explicit handle (see `DESIGN.md`) rather than a
/// process-wide singleton, constructed with [`Responder::new`] and started
/// with [`Responder::start`].
pub struct Responder {
    inner: Arc<RuntimeInner>,
    rt: Mutex<Option<tokio::runtime::Runtime>>,
}

impl Default for Responder {
    fn default() -> Self {
        Self::new()
    }
}

impl Responder {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                queue: HandoffQueue::new(),
                connection_num: AtomicU64::new(0),
                thread_num: AtomicU64::new(0),
                handle: OnceLock::new(),
            }),
            rt: Mutex::new(None),
        }
    }

    /// Binds the acceptor to `listener`, spawns the accept loop, and spawns
    /// `thread_num` event-loop worker threads. Returns immediately; the
    /// accept loop and every connection it spawns run on the runtime this
    /// call builds.
    pub fn start(&self, listener: std::net::TcpListener, thread_num: usize) -> std::io::Result<()> {
        listener.set_nonblocking(true)?;

        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(thread_num.max(1))
            .enable_all()
            .build()?;

        let tokio_listener = {
            let _guard = rt.enter();
            tokio::net::TcpListener::from_std(listener)?
        };

        self.inner.thread_num.store(thread_num as u64, Ordering::Relaxed);
        let _ = self.inner.handle.set(rt.handle().clone());
        let handle = RuntimeHandle(Arc::clone(&self.inner));
        rt.spawn(accept_loop(tokio_listener, handle));

        info!(thread_num, version = env!("LIB_BUILD_VERSION"), "responder started");
        *self.rt.lock().unwrap() = Some(rt);
        Ok(())
    }

    /// Blocks until the hand-off queue is non-empty, then returns the head.
    pub fn pop_request_blocking(&self) -> Request {
        self.inner.queue.pop_blocking()
    }

    /// Returns the head of the hand-off queue without blocking, or `None`.
    pub fn pop_request_nonblocking(&self) -> Option<Request> {
        self.inner.queue.pop_nonblocking()
    }

    /// Destroys a request that application code has finished with. In Rust
    /// this is ownership made explicit rather than a manual `delete`: the
    /// request is simply dropped, releasing its weak back-reference.
    pub fn free_request(&self, request: Request) {
        drop(request);
    }

    /// Zeroes the enqueue/dequeue counters.
    pub fn reset_statistics(&self) {
        self.inner.queue.reset_statistics();
    }

    pub fn statistics(&self) -> Statistics {
        let (enqueue_num, dequeue_num) = self.inner.queue.counts();
        Statistics {
            thread_num: self.inner.thread_num.load(Ordering::Relaxed),
            connection_num: self.inner.connection_num.load(Ordering::Relaxed),
            enqueue_num,
            dequeue_num,
        }
    }

    /// Closes the acceptor, stops the executor, and joins all worker
    /// threads. Any requests still sitting in the hand-off queue are
    /// dropped.
    pub fn shutdown(&self) {
        if let Some(rt) = self.rt.lock().unwrap().take() {
            rt.shutdown_timeout(Duration::from_secs(5));
        }
    }

    /// Wraps file descriptor 0 — the FastCGI listening socket a process
    /// conventionally inherits from its parent web server —
    /// as a `std::net::TcpListener` suitable for [`Responder::start`].
    ///
    /// # Safety
    ///
    /// The caller must ensure file descriptor 0 is a valid, already-bound
    /// `AF_INET`/`AF_INET6` `SOCK_STREAM` socket handed down by the parent
    /// process, and that nothing else in the process will also take
    /// ownership of it.
    #[cfg(unix)]
    pub unsafe fn listener_from_inherited_fd() -> std::io::Result<std::net::TcpListener> {
        use std::os::unix::io::FromRawFd;
        Ok(unsafe { std::net::TcpListener::from_raw_fd(0) })
    }
}

async fn accept_loop(listener: tokio::net::TcpListener, handle: RuntimeHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_linger(Some(Duration::from_secs(30))) {
                    warn!(error = %err, "failed to set SO_LINGER on accepted socket");
                }
                handle.increment_connection_count();
                tracing::debug!(%peer, "accepted connection");
                Connection::spawn(stream, handle.clone());
            }
            Err(err) => {
                warn!(error = %err, "accept failed");
            }
        }
    }
}
