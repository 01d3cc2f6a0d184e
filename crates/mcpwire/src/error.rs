//! Error types for MCP client operations.

use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, McpError>;

/// Everything a client call can fail with.
///
/// Lines that are not valid JSON never show up here: the framing layer drops
/// them and the router counts them (see [`RouterStats`](crate::router::RouterStats)).
#[derive(Debug, Error)]
pub enum McpError {
    /// The server process could not be spawned, or died during the startup
    /// grace period.
    #[error("failed to launch MCP server: {message}{}", stderr_suffix(.stderr))]
    Launch {
        /// What went wrong.
        message: String,
        /// Whatever the process wrote to stderr before it exited.
        stderr: String,
    },

    /// No response arrived before the deadline.
    #[error("timed out after {timeout:?} waiting for response to '{method}' (id {id})")]
    Timeout {
        /// Method of the request that timed out.
        method: String,
        /// Request id that timed out.
        id: u64,
        /// The deadline that elapsed.
        timeout: Duration,
    },

    /// The server process exited or was terminated.
    #[error("connection closed")]
    ConnectionClosed,

    /// The response was valid JSON-RPC but not what the operation expects.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server answered a request with an error payload.
    #[error("server error {code}: {message}")]
    Invocation {
        /// `error.code` from the response.
        code: i64,
        /// `error.message` from the response.
        message: String,
        /// `error.data`, when the server sent one.
        data: Option<serde_json::Value>,
    },

    /// The tool ran but reported failure (`isError: true`).
    #[error("tool error: {0}")]
    ToolError(String),

    /// Launch configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// A waiter for this id is already registered.
    #[error("request id {0} is already awaiting a response")]
    DuplicateRequestId(u64),

    /// A request could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Writing to or managing the child failed for a reason other than a
    /// closed pipe.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn stderr_suffix(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(" (stderr: {trimmed})")
    }
}

impl McpError {
    /// Create a launch error with no captured stderr.
    pub fn launch(msg: impl Into<String>) -> Self {
        Self::Launch {
            message: msg.into(),
            stderr: String::new(),
        }
    }

    /// Create a launch error carrying captured stderr output.
    pub fn launch_with_stderr(msg: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Launch {
            message: msg.into(),
            stderr: stderr.into(),
        }
    }

    /// Shorthand for [`McpError::Protocol`].
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create an invocation error from a server error payload.
    pub fn invocation(
        code: i64,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) -> Self {
        Self::Invocation {
            code,
            message: message.into(),
            data,
        }
    }

    /// Shorthand for [`McpError::ToolError`].
    pub fn tool_error(msg: impl Into<String>) -> Self {
        Self::ToolError(msg.into())
    }

    /// Create a config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether the caller may reasonably retry with a fresh request.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Whether the client instance is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Launch { .. } | Self::ConnectionClosed)
    }
}
