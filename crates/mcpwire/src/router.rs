//! Background routing of responses to waiting callers.
//!
//! The router thread is the only reader of the server's stdout. Every framed
//! message is classified; responses are handed to the [`PendingRequests`]
//! entry for their id, everything else is counted and dropped. When stdout
//! closes, every remaining waiter is released with [`Delivery::Closed`].

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{McpError, Result};
use crate::framing::LineFramer;
use crate::protocol::{Incoming, JsonRpcNotification, JsonRpcResponse};

/// Callback invoked on the router thread for each inbound notification.
pub type NotificationHandler = Box<dyn FnMut(JsonRpcNotification) + Send + 'static>;

/// What a waiter receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// The matching response.
    Response(JsonRpcResponse),
    /// The connection closed before a response arrived.
    Closed,
}

/// One caller's claim on a response id.
#[derive(Debug)]
pub struct Waiter {
    id: u64,
    rx: Receiver<Delivery>,
}

impl Waiter {
    /// Request id this waiter is registered under.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Block until delivery or until `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> std::result::Result<Delivery, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Take a delivery that has already arrived, without blocking.
    pub fn try_take(&self) -> Option<Delivery> {
        match self.rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Delivery::Closed),
        }
    }
}

#[derive(Default)]
struct PendingInner {
    waiters: HashMap<u64, SyncSender<Delivery>>,
    closed: bool,
}

/// Thread-safe table of outstanding requests, keyed by id.
///
/// This is the only state shared between callers and the router thread.
#[derive(Default)]
pub struct PendingRequests {
    inner: Mutex<PendingInner>,
}

impl PendingRequests {
    /// Create an empty, open table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `id`.
    ///
    /// Fails with [`McpError::ConnectionClosed`] once the table is closed and
    /// with [`McpError::DuplicateRequestId`] if `id` is already outstanding.
    pub fn register(&self, id: u64) -> Result<Waiter> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(McpError::ConnectionClosed);
        }
        if inner.waiters.contains_key(&id) {
            return Err(McpError::DuplicateRequestId(id));
        }
        // Capacity 1: delivery is a single non-blocking send.
        let (tx, rx) = mpsc::sync_channel(1);
        inner.waiters.insert(id, tx);
        Ok(Waiter { id, rx })
    }

    /// Remove the waiter for `id`. Returns false if nothing was registered,
    /// which means a delivery has already been made.
    pub fn deregister(&self, id: u64) -> bool {
        self.inner.lock().waiters.remove(&id).is_some()
    }

    /// Hand `response` to its waiter. Returns false if no waiter is registered
    /// for its id.
    pub fn deliver(&self, response: JsonRpcResponse) -> bool {
        let Some(tx) = self.inner.lock().waiters.remove(&response.id) else {
            return false;
        };
        // The receiver may already be gone; that is the caller's business.
        let _ = tx.try_send(Delivery::Response(response));
        true
    }

    /// Close the table and release every waiter. Returns how many were
    /// released. Idempotent.
    pub fn close(&self) -> usize {
        let drained: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.waiters.drain().collect()
        };
        for (_, tx) in &drained {
            let _ = tx.try_send(Delivery::Closed);
        }
        drained.len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of outstanding requests.
    pub fn len(&self) -> usize {
        self.inner.lock().waiters.len()
    }

    /// Whether no requests are outstanding.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Snapshot of what the router has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    /// Responses handed to a waiting caller.
    pub delivered: u64,
    /// Responses nobody was waiting for, server requests and id-less errors.
    pub unsolicited: u64,
    /// Notifications received.
    pub notifications: u64,
    /// Non-JSON lines and JSON that is not a JSON-RPC message.
    pub malformed: u64,
}

#[derive(Default)]
struct Counters {
    delivered: AtomicU64,
    unsolicited: AtomicU64,
    notifications: AtomicU64,
    invalid: AtomicU64,
    dropped_lines: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> RouterStats {
        RouterStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            unsolicited: self.unsolicited.load(Ordering::Relaxed),
            notifications: self.notifications.load(Ordering::Relaxed),
            malformed: self.invalid.load(Ordering::Relaxed)
                + self.dropped_lines.load(Ordering::Relaxed),
        }
    }
}

/// Closes the pending table when the router thread ends, including by panic.
struct CloseOnExit<'a> {
    server: &'a str,
    pending: &'a PendingRequests,
}

impl Drop for CloseOnExit<'_> {
    fn drop(&mut self) {
        let released = self.pending.close();
        if released > 0 {
            tracing::warn!(
                server = %self.server,
                released,
                "server output closed with requests outstanding"
            );
        }
    }
}

/// Handle to the background router thread.
pub struct ResponseRouter {
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_name: String,
    counters: Arc<Counters>,
}

impl ResponseRouter {
    /// Start routing messages read from `reader` into `pending`.
    pub fn spawn<R>(
        server: &str,
        reader: R,
        pending: Arc<PendingRequests>,
        on_notification: Option<NotificationHandler>,
    ) -> Result<Self>
    where
        R: Read + Send + 'static,
    {
        let counters = Arc::new(Counters::default());
        let thread_counters = Arc::clone(&counters);
        let server = server.to_string();
        let thread_name = format!("mcp-router-{server}");

        let handle = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                route(
                    &server,
                    LineFramer::new(reader),
                    &pending,
                    &thread_counters,
                    on_notification,
                )
            })?;

        Ok(Self {
            handle: Mutex::new(Some(handle)),
            thread_name,
            counters,
        })
    }

    /// Name of the router thread, as shown by debuggers and thread dumps.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Current counters.
    pub fn stats(&self) -> RouterStats {
        self.counters.snapshot()
    }

    /// Whether the router thread has stopped.
    pub fn is_finished(&self) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_none_or(JoinHandle::is_finished)
    }

    /// Wait up to `timeout` for the router thread to stop. Returns true if it
    /// has stopped. A thread still running after the timeout is left detached.
    pub fn join(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.is_finished() {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
        true
    }
}

fn route<R: Read>(
    server: &str,
    mut frames: LineFramer<R>,
    pending: &PendingRequests,
    counters: &Counters,
    mut on_notification: Option<NotificationHandler>,
) {
    let _close = CloseOnExit { server, pending };
    tracing::debug!(server = %server, "response router started");

    while let Some(value) = frames.next() {
        counters
            .dropped_lines
            .store(frames.malformed_count(), Ordering::Relaxed);
        tracing::trace!(server = %server, json = %value, "received MCP message");

        match Incoming::classify(value) {
            Incoming::Response(response) => {
                let id = response.id;
                if pending.deliver(response) {
                    counters.delivered.fetch_add(1, Ordering::Relaxed);
                } else {
                    counters.unsolicited.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(server = %server, id, "discarding response with no waiter");
                }
            }
            Incoming::Notification(notification) => {
                counters.notifications.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    server = %server,
                    method = %notification.method,
                    "received notification"
                );
                if let Some(handler) = on_notification.as_mut() {
                    handler(notification);
                }
            }
            Incoming::ServerRequest { method } => {
                counters.unsolicited.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(server = %server, method = %method, "ignoring request from server");
            }
            Incoming::OrphanError(error) => {
                counters.unsolicited.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    server = %server,
                    code = error.code,
                    message = %error.message,
                    "server reported an error without a request id"
                );
            }
            Incoming::Malformed(reason) => {
                counters.invalid.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(server = %server, reason = %reason, "dropping malformed message");
            }
        }
    }

    counters
        .dropped_lines
        .store(frames.malformed_count(), Ordering::Relaxed);
    tracing::debug!(server = %server, "response router stopped");
}
