//! MCP client for communicating with a stdio MCP server.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;

use crate::config::McpServerConfig;
use crate::correlator::RequestCorrelator;
use crate::error::{McpError, Result};
use crate::process::{ChildState, ProcessHandle};
use crate::protocol::{
    CallToolParams, CallToolResult, ClientCapabilities, ClientInfo, InitializeParams,
    InitializeResult, JsonRpcNotification, JsonRpcResponse, ListToolsResult, MCP_PROTOCOL_VERSION,
    Params, ServerInfo, ToolInfo,
};
use crate::router::{NotificationHandler, PendingRequests, ResponseRouter, RouterStats};

/// How long shutdown waits for the router thread to see EOF.
const ROUTER_JOIN_TIMEOUT: Duration = Duration::from_secs(1);

/// An MCP client connected to a single MCP server over stdio.
///
/// All request methods take `&self`; a client can be shared between threads
/// and requests from different threads proceed independently.
pub struct McpClient {
    /// Launch configuration.
    config: McpServerConfig,
    /// The server process.
    process: Arc<ProcessHandle>,
    /// Writes requests and waits for their responses.
    correlator: RequestCorrelator<Arc<ProcessHandle>>,
    /// Background reader of the server's stdout.
    router: ResponseRouter,
    /// Result of the initialize handshake.
    init: Option<InitializeResult>,
    /// Set once shutdown has run.
    shut_down: AtomicBool,
}

impl McpClient {
    /// Spawn the server and start routing its responses.
    ///
    /// This does NOT initialize the connection - call
    /// [`initialize`](Self::initialize) after connecting.
    pub fn connect(config: McpServerConfig) -> Result<Self> {
        Self::spawn(config, None)
    }

    /// Like [`connect`](Self::connect), with a callback for server
    /// notifications. The callback runs on the router thread and should not
    /// block.
    pub fn connect_with<F>(config: McpServerConfig, on_notification: F) -> Result<Self>
    where
        F: FnMut(JsonRpcNotification) + Send + 'static,
    {
        Self::spawn(config, Some(Box::new(on_notification)))
    }

    fn spawn(
        config: McpServerConfig,
        on_notification: Option<NotificationHandler>,
    ) -> Result<Self> {
        let process = Arc::new(ProcessHandle::start(&config)?);
        let stdout = process
            .take_stdout()
            .ok_or_else(|| McpError::launch("server stdout was not captured"))?;

        let pending = Arc::new(PendingRequests::new());
        let router =
            ResponseRouter::spawn(&config.name, stdout, Arc::clone(&pending), on_notification)?;
        let correlator = RequestCorrelator::new(Arc::clone(&process), pending);

        tracing::info!(
            server = %config.name,
            command = %config.command,
            "connected to MCP server via stdio"
        );

        Ok(Self {
            config,
            process,
            correlator,
            router,
            init: None,
            shut_down: AtomicBool::new(false),
        })
    }

    /// Name from the launch configuration.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The launch configuration this client was started with.
    pub fn config(&self) -> &McpServerConfig {
        &self.config
    }

    /// `serverInfo` from the handshake, once [`initialize`](Self::initialize) succeeded.
    pub fn server_info(&self) -> Option<&ServerInfo> {
        self.init.as_ref().map(|init| &init.server_info)
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.init.is_some()
    }

    /// Lifecycle state of the server process.
    pub fn state(&self) -> ChildState {
        self.process.state()
    }

    /// Check if the connection is still usable.
    pub fn is_connected(&self) -> bool {
        !self.correlator.pending().is_closed() && self.process.is_alive()
    }

    /// Everything the server has written to stderr (most recent 64 KiB).
    pub fn stderr_output(&self) -> String {
        self.process.stderr_output()
    }

    /// Router counters: delivered, unsolicited, notifications, malformed.
    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    /// Send an arbitrary request and wait up to `timeout` for its response.
    pub fn request(
        &self,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<JsonRpcResponse> {
        self.correlator.send(method, params, timeout)
    }

    /// Send a notification. No response is awaited; writing it is bounded by
    /// the configured request timeout.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.correlator.notify(method, params, self.config.request_timeout)
    }

    /// Send a request with the configured timeout and return its `result`,
    /// turning an `error` payload into [`McpError::Invocation`].
    fn call(&self, method: &str, params: Params) -> Result<Value> {
        self.correlator
            .send(method, params, self.config.request_timeout)?
            .into_result()
            .map_err(|e| McpError::invocation(e.code, e.message, e.data))
    }

    /// Run the `initialize` handshake.
    ///
    /// This performs the MCP handshake, exchanging capabilities and protocol
    /// versions, then sends `notifications/initialized`.
    pub fn initialize(
        &mut self,
        protocol_version: &str,
        client_info: ClientInfo,
    ) -> Result<&InitializeResult> {
        let params = InitializeParams {
            protocol_version: protocol_version.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info,
        };

        let response =
            self.correlator
                .send("initialize", to_params(&params)?, self.config.request_timeout)?;
        let result = response.into_result().map_err(|e| {
            McpError::protocol(format!("initialize rejected ({}): {}", e.code, e.message))
        })?;
        let init: InitializeResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("unexpected initialize result: {e}")))?;

        tracing::info!(
            server = %init.server_info.name,
            version = %init.server_info.version,
            protocol = %init.protocol_version,
            "MCP server initialized"
        );

        self.correlator.notify(
            "notifications/initialized",
            None,
            self.config.request_timeout,
        )?;

        Ok(&*self.init.insert(init))
    }

    /// [`initialize`](Self::initialize) with this crate's protocol version and
    /// client info.
    pub fn initialize_default(&mut self) -> Result<&InitializeResult> {
        self.initialize(MCP_PROTOCOL_VERSION, ClientInfo::default())
    }

    /// List available tools from the server, in server order.
    pub fn list_tools(&self) -> Result<Vec<ToolInfo>> {
        let result = self.call("tools/list", Params::new())?;
        let list_result: ListToolsResult = if result.is_null() {
            ListToolsResult::default()
        } else {
            serde_json::from_value(result)
                .map_err(|e| McpError::protocol(format!("unexpected tools/list result: {e}")))?
        };

        tracing::debug!(
            server = %self.config.name,
            tool_count = list_result.tools.len(),
            "listed MCP tools"
        );

        Ok(list_result.tools)
    }

    /// Call a tool on the server and return the whole result.
    ///
    /// A result flagged `isError` is still returned as `Ok`.
    pub fn call_tool(&self, name: &str, arguments: Params) -> Result<CallToolResult> {
        let params = CallToolParams {
            name: name.to_string(),
            arguments,
        };

        let result = self.call("tools/call", to_params(&params)?)?;
        let call_result: CallToolResult = serde_json::from_value(result)
            .map_err(|e| McpError::protocol(format!("unexpected tools/call result: {e}")))?;

        if call_result.is_error() {
            tracing::warn!(
                server = %self.config.name,
                tool = %name,
                "tool call returned error"
            );
        } else {
            tracing::debug!(
                server = %self.config.name,
                tool = %name,
                "tool call succeeded"
            );
        }

        Ok(call_result)
    }

    /// Call a tool and return the text of its first content item.
    pub fn invoke(&self, name: &str, arguments: Params) -> Result<String> {
        let result = self.call_tool(name, arguments)?;
        if result.is_error() {
            return Err(McpError::tool_error(result.text().unwrap_or_default()));
        }
        result
            .primary_text()
            .map(str::to_string)
            .ok_or_else(|| McpError::protocol(format!("tool '{name}' returned no text content")))
    }

    /// Shutdown the connection.
    ///
    /// Closes the server's stdin, kills it if it does not exit within the
    /// configured grace period, and fails every outstanding request with
    /// [`McpError::ConnectionClosed`]. Safe to call more than once.
    pub fn shutdown(&self) -> Result<()> {
        if !self.shut_down.swap(true, Ordering::SeqCst) {
            tracing::info!(server = %self.config.name, "shutting down MCP client");
        }

        let terminated = self.process.terminate(self.config.shutdown_grace);
        self.correlator.pending().close();
        if !self.router.join(ROUTER_JOIN_TIMEOUT) {
            tracing::warn!(
                server = %self.config.name,
                pid = self.process.pid(),
                thread = %self.router.thread_name(),
                "router still running after shutdown; server output is held open"
            );
        }
        terminated
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

fn to_params<T: Serialize>(value: &T) -> Result<Params> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(McpError::protocol(format!(
            "request parameters must be an object, got {other}"
        ))),
    }
}
