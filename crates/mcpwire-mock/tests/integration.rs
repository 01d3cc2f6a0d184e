//! Integration tests for the MCP client.
//!
//! These tests drive the `mock-mcp-server` binary from this package over real
//! pipes to verify the full protocol flow and the failure modes around it.

use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use mcpwire::{ChildState, ClientInfo, McpClient, McpError, McpServerConfig, Params};
use serde_json::{Value, json};

/// Launch configuration for the mock server with the given flags.
fn mock(flags: &[&str]) -> McpServerConfig {
    McpServerConfig::new("mock", env!("CARGO_BIN_EXE_mock-mcp-server"))
        .with_args(flags.iter().map(|f| f.to_string()).collect())
        .with_startup_grace(Duration::from_millis(100))
        .with_request_timeout(Duration::from_secs(5))
        .with_shutdown_grace(Duration::from_secs(1))
}

fn args(value: Value) -> Params {
    value.as_object().cloned().expect("arguments must be an object")
}

fn connect(flags: &[&str]) -> McpClient {
    let mut client = McpClient::connect(mock(flags)).expect("Failed to connect");
    client
        .initialize("2024-11-05", ClientInfo::new("integration", "1.0.0"))
        .expect("Failed to initialize");
    client
}

#[test]
fn test_connect_and_initialize() {
    let mut client = McpClient::connect(mock(&["--name", "demo"])).expect("Failed to connect");
    assert!(!client.is_initialized());

    let init = client
        .initialize("2024-11-05", ClientInfo::new("t", "1.0.0"))
        .expect("Failed to initialize");
    assert_eq!(init.server_info.name, "demo");
    assert_eq!(init.server_info.version, "1.0.0");
    assert_eq!(init.protocol_version, "2024-11-05");
    assert!(init.capabilities.tools.is_some());

    assert!(client.is_initialized());
    assert_eq!(client.state(), ChildState::Running);
    assert!(client.is_connected());
}

#[test]
fn test_list_tools() {
    let client = connect(&[]);

    let tools = client.list_tools().expect("Failed to list tools");
    let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(names, ["echo", "calculator_add", "slow", "crash", "fail"]);

    let add = &tools[1];
    assert_eq!(add.description.as_deref(), Some("Add two numbers"));
    let params = add.parameters().expect("calculator_add has parameters");
    assert!(params.contains_key("a"));
    assert!(params.contains_key("b"));
}

#[test]
fn test_invoke_calculator_add() {
    let client = connect(&[]);
    let result = client
        .invoke("calculator_add", args(json!({"a": 100, "b": 200})))
        .expect("Failed to invoke");
    assert_eq!(result, "300");
}

#[test]
fn test_call_tool_echo() {
    let client = connect(&[]);
    let result = client
        .call_tool("echo", args(json!({"message": "Hello, MCP!"})))
        .expect("Failed to call tool");
    assert!(!result.is_error());
    assert_eq!(result.primary_text(), Some("Hello, MCP!"));
}

#[test]
fn test_tool_failure_is_tool_error() {
    let client = connect(&[]);

    let err = client.invoke("fail", Params::new()).unwrap_err();
    assert!(matches!(&err, McpError::ToolError(msg) if msg.contains("on purpose")));

    // call_tool hands the flagged result back instead
    let result = client.call_tool("fail", Params::new()).unwrap();
    assert!(result.is_error());

    // The connection is still usable
    assert_eq!(
        client.invoke("echo", args(json!({"message": "still here"}))).unwrap(),
        "still here"
    );
}

#[test]
fn test_unknown_method_is_invocation_error() {
    let client = connect(&[]);
    let response = client
        .request("resources/list", Params::new(), Duration::from_secs(5))
        .expect("server answers unknown methods");
    let error = response.error.expect("error payload");
    assert_eq!(error.code, -32601);
    assert!(error.message.contains("resources/list"));
}

#[test]
fn test_concurrent_calls_with_reordered_replies() {
    let client = connect(&[]);

    // Longer delays first, so the server answers in reverse order.
    let delays = [400u64, 300, 200, 100, 0];
    let results: Vec<String> = thread::scope(|s| {
        let handles: Vec<_> = delays
            .iter()
            .map(|&delay| {
                let client = &client;
                s.spawn(move || {
                    client
                        .invoke(
                            "slow",
                            args(json!({"delay_ms": delay, "message": format!("slept {delay}")})),
                        )
                        .expect("slow call failed")
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for (delay, result) in delays.iter().zip(&results) {
        assert_eq!(result, &format!("slept {delay}"));
    }
    assert!(client.stats().delivered >= delays.len() as u64);
    assert_eq!(client.stats().unsolicited, 0);
}

#[test]
fn test_timeout_then_late_response_is_discarded() {
    let client = connect(&[]);

    let started = Instant::now();
    let err = client
        .request(
            "tools/call",
            args(json!({"name": "slow", "arguments": {"delay_ms": 800}})),
            Duration::from_millis(200),
        )
        .unwrap_err();
    assert!(matches!(&err, McpError::Timeout { method, .. } if method == "tools/call"));
    assert!(err.is_retryable());
    assert!(started.elapsed() < Duration::from_millis(700));

    // Let the late reply arrive, then keep using the client.
    thread::sleep(Duration::from_millis(900));
    assert_eq!(
        client.invoke("echo", args(json!({"message": "after"}))).unwrap(),
        "after"
    );
    assert!(client.stats().unsolicited >= 1);
}

#[test]
fn test_ignored_method_times_out() {
    let mut client = McpClient::connect(
        mock(&["--ignore", "initialize"]).with_request_timeout(Duration::from_millis(300)),
    )
    .unwrap();
    let err = client.initialize_default().unwrap_err();
    assert!(matches!(err, McpError::Timeout { .. }));
    assert!(!client.is_initialized());
    assert!(client.is_connected());
}

#[test]
fn test_crash_releases_outstanding_calls() {
    let client = connect(&[]);

    let started = Instant::now();
    let outcomes: Vec<Result<String, McpError>> = thread::scope(|s| {
        let mut handles: Vec<_> = (0..4)
            .map(|_| {
                let client = &client;
                s.spawn(move || client.invoke("slow", args(json!({"delay_ms": 10_000}))))
            })
            .collect();

        let client = &client;
        handles.push(s.spawn(move || {
            thread::sleep(Duration::from_millis(200));
            client.invoke("crash", Params::new())
        }));
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(outcomes.len(), 5);
    for outcome in outcomes {
        assert!(matches!(outcome, Err(McpError::ConnectionClosed)));
    }
    assert!(started.elapsed() < Duration::from_secs(4));

    assert!(!client.is_connected());
    assert!(matches!(
        client.invoke("echo", Params::new()),
        Err(McpError::ConnectionClosed)
    ));
    assert!(matches!(client.state(), ChildState::Exited(Some(1))));
}

#[test]
fn test_crash_on_named_tool() {
    let client = connect(&["--crash-on", "echo"]);
    let err = client
        .invoke("echo", args(json!({"message": "boom"})))
        .unwrap_err();
    assert!(err.is_fatal());
}

#[test]
fn test_banner_and_malformed_lines_are_tolerated() {
    let client = connect(&["--banner"]);
    assert_eq!(
        client.invoke("calculator_add", args(json!({"a": 1, "b": 2}))).unwrap(),
        "3"
    );
    assert!(client.stats().malformed >= 1);
}

#[test]
fn test_stray_response_is_counted() {
    let client = connect(&["--stray-response"]);
    client.list_tools().unwrap();
    assert!(client.stats().unsolicited >= 1);
}

#[test]
fn test_notification_callback() {
    let (tx, rx) = mpsc::channel();
    let mut client = McpClient::connect_with(mock(&["--notify"]), move |notification| {
        let _ = tx.send(notification);
    })
    .unwrap();
    client.initialize_default().unwrap();

    let notification = rx
        .recv_timeout(Duration::from_secs(5))
        .expect("notification delivered");
    assert_eq!(notification.method, "notifications/message");
    assert_eq!(notification.params.unwrap()["level"], "info");

    // The router counts it once the callback has run.
    client.list_tools().unwrap();
    assert_eq!(client.stats().notifications, 1);
}

#[test]
fn test_fail_start_reports_stderr() {
    let result = McpClient::connect(
        mock(&["--fail-start", "cannot open database"]).with_startup_grace(Duration::from_millis(500)),
    );
    let Err(McpError::Launch { stderr, .. }) = result else {
        panic!("expected launch error");
    };
    assert!(stderr.contains("cannot open database"));
}

#[test]
fn test_initialize_error_is_protocol_error() {
    let mut client = McpClient::connect(mock(&["--init-error"])).unwrap();
    let err = client.initialize_default().unwrap_err();
    assert!(matches!(&err, McpError::Protocol(msg) if msg.contains("unsupported protocol version")));
}

#[test]
fn test_shutdown_is_idempotent() {
    let client = connect(&[]);

    // An outstanding slow call must not hold shutdown up.
    thread::scope(|s| {
        let client = &client;
        let pending = s.spawn(move || client.invoke("slow", args(json!({"delay_ms": 10_000}))));
        thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        client.shutdown().expect("Failed to shutdown");
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(matches!(pending.join().unwrap(), Err(McpError::ConnectionClosed)));
    });

    client.shutdown().expect("Second shutdown is a no-op");
    assert!(!client.is_connected());
    assert!(client.state().is_terminal());
}

#[test]
fn test_server_stderr_is_captured() {
    let client = connect(&[]);
    client.list_tools().unwrap();
    client.shutdown().unwrap();

    let deadline = Instant::now() + Duration::from_secs(2);
    while !client.stderr_output().contains("mock MCP server ready") {
        assert!(Instant::now() < deadline, "stderr never captured");
        thread::sleep(Duration::from_millis(20));
    }
}
