//! Stdio JSON-RPC 2.0 client core for MCP servers.
//!
//! This crate launches an MCP server as a child process, speaks
//! newline-delimited JSON-RPC over its stdin/stdout, and matches responses to
//! requests by id while tolerating hangs, junk output and early exit.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  McpClient                                                  │
//! │  - initialize, tools/list, tools/call                       │
//! └─────────────────────────────────────────────────────────────┘
//!            │ send()                          ▲ deliver()
//!            ▼                                 │
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │  RequestCorrelator       │    │  ResponseRouter (thread)     │
//! │  - id allocation         │    │  - classify each message     │
//! │  - register, write, wait │◄──►│  - wake the matching waiter  │
//! └──────────────────────────┘    └──────────────────────────────┘
//!      PendingRequests (id → waiter, the only shared state)
//!            │ stdin                            ▲ LineFramer
//!            ▼                                  │ stdout
//! ┌─────────────────────────────────────────────────────────────┐
//! │  ProcessHandle - spawn, startup check, stderr drain, kill   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use mcpwire::{ClientInfo, McpClient, McpServerConfig};
//! use serde_json::json;
//!
//! let config = McpServerConfig::new("demo", "mcp-server-demo");
//!
//! let mut client = McpClient::connect(config)?;
//! let init = client.initialize("2024-11-05", ClientInfo::new("my-app", "1.0.0"))?;
//! println!("Connected to: {} v{}", init.server_info.name, init.server_info.version);
//!
//! for tool in client.list_tools()? {
//!     println!("Tool: {} - {:?}", tool.name, tool.description);
//! }
//!
//! let args = json!({"a": 100, "b": 200}).as_object().cloned().unwrap_or_default();
//! println!("Result: {}", client.invoke("calculator_add", args)?);
//!
//! client.shutdown()?;
//! ```
//!
//! # Wire format
//!
//! One JSON object per line, UTF-8, `\n` terminated:
//!
//! ```text
//! → {"jsonrpc":"2.0","id":1,"method":"tools/call","params":{"name":"echo","arguments":{}}}
//! ← {"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"..."}]}}
//! ```
//!
//! Lines on stdout that are not JSON are dropped and counted; diagnostics
//! belong on stderr, which is captured separately.

pub mod client;
pub mod config;
pub mod correlator;
pub mod error;
pub mod framing;
pub mod process;
pub mod protocol;
pub mod router;

// Re-export main types
pub use client::McpClient;
pub use config::{McpServerConfig, ServerEntry, ServersFile, claude_settings_path};
pub use correlator::{LineSink, RequestCorrelator};
pub use error::{McpError, Result};
pub use framing::{DEFAULT_MAX_LINE_LEN, LineFramer, frames};
pub use process::{ChildState, ProcessHandle};
pub use protocol::{
    CallToolParams, CallToolResult, ClientInfo, Incoming, InitializeParams, InitializeResult,
    JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult,
    MCP_PROTOCOL_VERSION, Params, ServerCapabilities, ServerInfo, ToolContent, ToolInfo,
    ToolsCapability,
};
pub use router::{PendingRequests, ResponseRouter, RouterStats};
