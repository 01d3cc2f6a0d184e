//! Request/response correlation.

use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::time::{Duration, Instant};

use serde_json::Value;

use crate::error::{McpError, Result};
use crate::protocol::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, Params};
use crate::router::{Delivery, PendingRequests};

/// Somewhere to write one serialized message per line.
///
/// Implementations must write `line` and its terminating newline as one unit
/// with respect to other callers.
pub trait LineSink: Send + Sync {
    /// Write `line` followed by `\n` and flush, giving up with
    /// [`ErrorKind::TimedOut`] if that takes longer than `timeout`.
    fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()>;
}

impl<S: LineSink + ?Sized> LineSink for Arc<S> {
    fn send_line(&self, line: &str, timeout: Duration) -> io::Result<()> {
        (**self).send_line(line, timeout)
    }
}

/// Assigns request ids, writes requests and waits for the matching response.
///
/// Safe to share between threads: concurrent [`send`](Self::send) calls only
/// wait on their own id.
pub struct RequestCorrelator<S> {
    sink: S,
    pending: Arc<PendingRequests>,
    next_id: AtomicU64,
}

impl<S: LineSink> RequestCorrelator<S> {
    /// Create a correlator writing to `sink` and waiting on `pending`.
    pub fn new(sink: S, pending: Arc<PendingRequests>) -> Self {
        Self {
            sink,
            pending,
            next_id: AtomicU64::new(1),
        }
    }

    /// The pending-request table shared with the router.
    pub fn pending(&self) -> &Arc<PendingRequests> {
        &self.pending
    }

    /// Get the next request ID. Ids start at 1 and are never reused.
    fn next_request_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Send a request and block until its response arrives or `timeout`
    /// elapses. The timeout covers writing the request as well as waiting.
    ///
    /// A JSON-RPC error response is still a response: it is returned as-is
    /// for the caller to interpret.
    pub fn send(&self, method: &str, params: Params, timeout: Duration) -> Result<JsonRpcResponse> {
        let deadline = Instant::now() + timeout;
        let id = self.next_request_id();
        let line = JsonRpcRequest::new(id, method, params).to_line()?;

        // Register before writing so a fast response cannot beat us.
        let waiter = self.pending.register(id)?;

        if let Err(e) = self.sink.send_line(&line, timeout) {
            self.pending.deregister(id);
            if e.kind() == ErrorKind::TimedOut {
                tracing::debug!(id, method = %method, ?timeout, "request write timed out");
                return Err(McpError::Timeout {
                    method: method.to_string(),
                    id,
                    timeout,
                });
            }
            return Err(write_error(e));
        }
        tracing::trace!(id, method = %method, json = %line, "sent MCP request");

        match waiter.wait(deadline.saturating_duration_since(Instant::now())) {
            Ok(Delivery::Response(response)) => Ok(response),
            Ok(Delivery::Closed) | Err(RecvTimeoutError::Disconnected) => {
                Err(McpError::ConnectionClosed)
            }
            Err(RecvTimeoutError::Timeout) => {
                if self.pending.deregister(id) {
                    tracing::debug!(id, method = %method, ?timeout, "request timed out");
                    return Err(McpError::Timeout {
                        method: method.to_string(),
                        id,
                        timeout,
                    });
                }
                // The router got there between the deadline and deregistration.
                match waiter.try_take() {
                    Some(Delivery::Response(response)) => Ok(response),
                    _ => Err(McpError::ConnectionClosed),
                }
            }
        }
    }

    /// Send a notification. Nothing is registered and no response is
    /// awaited; the write itself may take up to `timeout`.
    pub fn notify(&self, method: &str, params: Option<Value>, timeout: Duration) -> Result<()> {
        if self.pending.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        self.sink.send_line(&line, timeout).map_err(write_error)?;
        tracing::trace!(method = %method, json = %line, "sent MCP notification");
        Ok(())
    }
}

fn write_error(e: io::Error) -> McpError {
    match e.kind() {
        ErrorKind::BrokenPipe | ErrorKind::NotConnected | ErrorKind::UnexpectedEof => {
            McpError::ConnectionClosed
        }
        _ => McpError::Io(e),
    }
}
