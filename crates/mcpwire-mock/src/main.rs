//! Mock MCP server for integration testing.
//!
//! Speaks newline-delimited JSON-RPC on stdin/stdout and logs to stderr.
//! Flags inject the failure modes a stdio client has to survive: slow and
//! reordered replies, crashes, junk on stdout, startup failure, unanswered
//! methods and unsolicited messages.
//!
//! Log verbosity is controlled by `MOCK_MCP_LOG` (an `EnvFilter` directive,
//! default `info`).

use std::io::{self, BufRead, Write};
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use clap::Parser;
use serde_json::{Value, json};

/// Mock MCP server (newline-delimited JSON-RPC over stdio)
#[derive(Parser, Debug)]
#[command(name = "mock-mcp-server")]
struct Args {
    /// Name reported in serverInfo
    #[arg(long, default_value = "mock-mcp-server")]
    name: String,

    /// Delay every response by N milliseconds
    #[arg(long, default_value_t = 0)]
    delay_ms: u64,

    /// Exit with code 1 when TOOL is called
    #[arg(long, value_name = "TOOL")]
    crash_on: Option<String>,

    /// Write a non-JSON line to stdout before serving
    #[arg(long)]
    banner: bool,

    /// Send a notifications/message after answering initialize
    #[arg(long)]
    notify: bool,

    /// Write a response for an id nobody asked for before serving
    #[arg(long)]
    stray_response: bool,

    /// Print MSG to stderr and exit with code 3 instead of serving
    #[arg(long, value_name = "MSG")]
    fail_start: Option<String>,

    /// Never answer METHOD (may be repeated)
    #[arg(long, value_name = "METHOD")]
    ignore: Vec<String>,

    /// Answer initialize with an error payload
    #[arg(long)]
    init_error: bool,
}

/// Stdout shared between the main loop and slow-tool workers. Every write is
/// one whole line under the lock.
#[derive(Clone)]
struct Output(Arc<Mutex<io::Stdout>>);

impl Output {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(io::stdout())))
    }

    fn send(&self, message: &Value) -> io::Result<()> {
        self.send_raw(&message.to_string())
    }

    fn send_raw(&self, line: &str) -> io::Result<()> {
        let mut out = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        out.write_all(format!("{line}\n").as_bytes())?;
        out.flush()
    }
}

fn main() -> ExitCode {
    let args = Args::parse();

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(io::stderr)
                .with_ansi(false)
                .with_target(false)
                .with_filter(
                    tracing_subscriber::EnvFilter::try_from_env("MOCK_MCP_LOG")
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
                ),
        )
        .init();

    if let Some(msg) = &args.fail_start {
        eprintln!("{msg}");
        return ExitCode::from(3);
    }

    match serve(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "mock server stopped");
            ExitCode::FAILURE
        }
    }
}

fn serve(args: &Args) -> io::Result<()> {
    let out = Output::new();
    tracing::info!(name = %args.name, "mock MCP server ready");

    if args.banner {
        out.send_raw("mock-mcp-server starting up (this line is not JSON)")?;
    }
    if args.stray_response {
        out.send(&json!({"jsonrpc": "2.0", "id": 999_999, "result": {}}))?;
    }

    for line in io::stdin().lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        let message: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "unparseable request line");
                out.send(&json!({
                    "jsonrpc": "2.0",
                    "error": {"code": -32700, "message": format!("Parse error: {e}")}
                }))?;
                continue;
            }
        };

        let Some(method) = message.get("method").and_then(Value::as_str) else {
            tracing::warn!("message without a method ignored");
            continue;
        };
        let Some(id) = message.get("id").filter(|id| !id.is_null()).cloned() else {
            tracing::debug!(method, "notification received");
            continue;
        };
        if args.ignore.iter().any(|m| m == method) {
            tracing::info!(method, "ignoring request");
            continue;
        }

        if args.delay_ms > 0 {
            thread::sleep(Duration::from_millis(args.delay_ms));
        }

        let params = message.get("params").cloned().unwrap_or_else(|| json!({}));
        match method {
            "initialize" => {
                out.send(&initialize(args, &id))?;
                if args.notify {
                    out.send(&json!({
                        "jsonrpc": "2.0",
                        "method": "notifications/message",
                        "params": {"level": "info", "data": "mock server initialized"}
                    }))?;
                }
            }
            "tools/list" => out.send(&success(&id, list_tools()))?,
            "tools/call" => call_tool(args, &out, id, &params)?,
            other => out.send(&failure(
                &id,
                -32601,
                &format!("Method not found: {other}"),
            ))?,
        }
    }

    tracing::info!("stdin closed, exiting");
    Ok(())
}

fn success(id: &Value, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn failure(id: &Value, code: i64, message: &str) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": message}})
}

fn text_result(text: impl Into<String>) -> Value {
    json!({"content": [{"type": "text", "text": text.into()}]})
}

fn initialize(args: &Args, id: &Value) -> Value {
    if args.init_error {
        return failure(id, -32602, "unsupported protocol version");
    }
    success(
        id,
        json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": args.name, "version": "1.0.0"}
        }),
    )
}

fn list_tools() -> Value {
    json!({
        "tools": [
            {
                "name": "echo",
                "description": "Echo back the input",
                "inputSchema": {
                    "type": "object",
                    "properties": {"message": {"type": "string"}},
                    "required": ["message"]
                }
            },
            {
                "name": "calculator_add",
                "description": "Add two numbers",
                "inputSchema": {
                    "type": "object",
                    "properties": {"a": {"type": "number"}, "b": {"type": "number"}},
                    "required": ["a", "b"]
                }
            },
            {
                "name": "slow",
                "description": "Replies after delay_ms without blocking other requests",
                "inputSchema": {
                    "type": "object",
                    "properties": {"delay_ms": {"type": "number"}, "message": {"type": "string"}}
                }
            },
            {
                "name": "crash",
                "description": "Crashes the server",
                "inputSchema": {"type": "object", "properties": {}}
            },
            {
                "name": "fail",
                "description": "Always reports a tool failure",
                "inputSchema": {"type": "object", "properties": {}}
            }
        ]
    })
}

fn call_tool(args: &Args, out: &Output, id: Value, params: &Value) -> io::Result<()> {
    let name = params.get("name").and_then(Value::as_str).unwrap_or("");
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    if args.crash_on.as_deref() == Some(name) || name == "crash" {
        tracing::warn!(tool = name, "crashing on request");
        std::process::exit(1);
    }

    let result = match name {
        "echo" => {
            let message = arguments.get("message").and_then(Value::as_str).unwrap_or("");
            text_result(message)
        }
        "calculator_add" => {
            let a = &arguments["a"];
            let b = &arguments["b"];
            let sum = match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.saturating_add(b).to_string(),
                _ => (a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)).to_string(),
            };
            text_result(sum)
        }
        "slow" => {
            let delay = arguments
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(1000);
            let text = arguments
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| format!("Slept for {delay} ms"), str::to_string);
            let out = out.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(delay));
                if let Err(e) = out.send(&success(&id, text_result(text))) {
                    tracing::warn!(error = %e, "failed to send slow reply");
                }
            });
            return Ok(());
        }
        "fail" => json!({
            "content": [{"type": "text", "text": "tool failed on purpose"}],
            "isError": true
        }),
        other => json!({
            "content": [{"type": "text", "text": format!("Unknown tool: {other}")}],
            "isError": true
        }),
    };

    out.send(&success(&id, result))
}
