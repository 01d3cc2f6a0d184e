//! Wire types: JSON-RPC 2.0 envelopes and the MCP payloads this client uses.
//!
//! Every message is a single JSON object on its own line. Inbound lines are
//! classified with [`Incoming::classify`] before the router looks at them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Value of every message's `jsonrpc` field.
pub const JSONRPC_VERSION: &str = "2.0";

/// Protocol version offered by [`initialize_default`](crate::McpClient::initialize_default).
pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

/// Parameter object of a request or notification.
pub type Params = Map<String, Value>;

// ─────────────────────────────────────────────────────────────────────────────
// Envelopes
// ─────────────────────────────────────────────────────────────────────────────

/// An outbound request. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    /// Assigned by the correlator; unique within one session.
    pub id: u64,
    pub method: String,
    /// Method parameters. Serialized as `{}` when empty.
    #[serde(default)]
    pub params: Params,
}

impl JsonRpcRequest {
    /// Build a `"2.0"` request.
    pub fn new(id: u64, method: impl Into<String>, params: Params) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            method: method.into(),
            params,
        }
    }

    /// Serialize to a single wire line, without the trailing newline.
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// A message with no `id`. Nobody answers it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    /// Build a `"2.0"` notification.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.into(),
            params,
        }
    }
}

/// A reply to one of our requests.
///
/// Exactly one of `result` and `error` is set on responses produced by
/// [`Incoming::classify`]. A `"result": null` on the wire becomes
/// `Some(Value::Null)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    /// Id of the request being answered.
    pub id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Build a success response.
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: u64, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Whether the server answered with an error object.
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Split into the result (null when absent) or the error object.
    pub fn into_result(self) -> Result<Value, JsonRpcError> {
        if let Some(error) = self.error {
            Err(error)
        } else {
            Ok(self.result.unwrap_or(Value::Null))
        }
    }
}

/// The `error` member of a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    /// Server-defined detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Reserved codes from the JSON-RPC 2.0 specification.
impl JsonRpcError {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

// ─────────────────────────────────────────────────────────────────────────────
// Inbound classification
// ─────────────────────────────────────────────────────────────────────────────

/// An inbound message, classified by shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// A response to one of our requests.
    Response(JsonRpcResponse),
    /// A message without an `id`: nobody is waiting for it.
    Notification(JsonRpcNotification),
    /// The server is calling us. This client does not serve requests.
    ServerRequest {
        /// Method the server asked for.
        method: String,
    },
    /// An error object with no usable id, typically a server-side parse failure.
    OrphanError(JsonRpcError),
    /// Valid JSON that is not a JSON-RPC message we understand.
    Malformed(String),
}

impl Incoming {
    /// Classify a parsed JSON value.
    pub fn classify(value: Value) -> Self {
        let Value::Object(mut obj) = value else {
            return Self::Malformed("message is not a JSON object".to_string());
        };

        let method = match obj.get("method") {
            Some(Value::String(m)) => Some(m.clone()),
            Some(_) => return Self::Malformed("method is not a string".to_string()),
            None => None,
        };
        let id = obj.remove("id").filter(|id| !id.is_null());

        match (id, method) {
            (None, Some(method)) => Self::Notification(JsonRpcNotification {
                jsonrpc: JSONRPC_VERSION.to_string(),
                method,
                params: obj.remove("params"),
            }),
            (Some(_), Some(method)) => Self::ServerRequest { method },
            (None, None) => match obj.remove("error").map(serde_json::from_value) {
                Some(Ok(error)) => Self::OrphanError(error),
                _ => Self::Malformed("message has neither id nor method".to_string()),
            },
            (Some(id), None) => Self::classify_response(id, obj),
        }
    }

    fn classify_response(id: Value, mut obj: Map<String, Value>) -> Self {
        let Some(id) = id.as_u64() else {
            return Self::Malformed(format!("response id {id} is not a non-negative integer"));
        };

        let result = obj.remove("result");
        let error = obj.remove("error");
        let (result, error) = match (result, error) {
            (Some(result), None) => (Some(result), None),
            (None, Some(error)) => match serde_json::from_value::<JsonRpcError>(error) {
                Ok(error) => (None, Some(error)),
                Err(e) => return Self::Malformed(format!("invalid error object: {e}")),
            },
            (Some(_), Some(_)) => {
                return Self::Malformed(format!("response {id} has both result and error"));
            }
            (None, None) => {
                return Self::Malformed(format!("response {id} has neither result nor error"));
            }
        };

        Self::Response(JsonRpcResponse {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result,
            error,
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MCP payloads
// ─────────────────────────────────────────────────────────────────────────────

/// What this client offers the server. Empty unless the caller fills it in;
/// serializes as `{}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCapabilities {
    #[serde(flatten)]
    pub entries: Map<String, Value>,
}

/// `clientInfo` of the initialize request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    pub version: String,
}

impl ClientInfo {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self::new("mcpwire", env!("CARGO_PKG_VERSION"))
    }
}

/// `params` of `initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    pub protocol_version: String,
    pub capabilities: ClientCapabilities,
    pub client_info: ClientInfo,
}

impl Default for InitializeParams {
    fn default() -> Self {
        Self {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ClientCapabilities::default(),
            client_info: ClientInfo::default(),
        }
    }
}

/// What the server said it supports. Only `tools` is interpreted; the rest
/// (`resources`, `prompts`, `logging`, ...) is kept as sent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerCapabilities {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
    #[serde(flatten)]
    pub other: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    /// Server emits `notifications/tools/list_changed`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub list_changed: Option<bool>,
}

/// `serverInfo` from the initialize result. Both fields are required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// `result` of `initialize`. Fails to deserialize without `serverInfo`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    #[serde(default)]
    pub capabilities: ServerCapabilities,
    pub server_info: ServerInfo,
}

/// One entry of `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema; the argument names live under `properties`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

impl ToolInfo {
    /// The `properties` object of the input schema, if there is one.
    pub fn parameters(&self) -> Option<&Map<String, Value>> {
        self.input_schema
            .as_ref()?
            .get("properties")?
            .as_object()
    }
}

/// `result` of `tools/list`. A server with no tools may omit the array.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListToolsResult {
    #[serde(default)]
    pub tools: Vec<ToolInfo>,
}

/// `params` of `tools/call`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: Params,
}

/// One item of a tool result's `content`.
///
/// Servers differ in which fields they send; only `text` matters to the
/// client, everything else is kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolContent {
    /// Content type, usually `"text"`.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Text payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Any other fields (`data`, `mimeType`, `uri`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `result` of `tools/call`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallToolResult {
    #[serde(default)]
    pub content: Vec<ToolContent>,
    /// Set by the server when the tool ran and failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl CallToolResult {
    /// Text of the first content item.
    pub fn primary_text(&self) -> Option<&str> {
        self.content.first()?.text.as_deref()
    }

    /// All text content joined by newlines.
    pub fn text(&self) -> Option<String> {
        let parts: Vec<&str> = self
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("\n"))
        }
    }

    /// Whether the server flagged the call as failed.
    pub fn is_error(&self) -> bool {
        self.is_error == Some(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> Params {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_request_is_one_line() {
        let req = JsonRpcRequest::new(1, "initialize", params(json!({"test": true})));
        let json = req.to_line().unwrap();
        assert!(json.contains("\"jsonrpc\":\"2.0\""));
        assert!(json.contains("\"id\":1"));
        assert!(json.contains("\"method\":\"initialize\""));
        assert!(!json.contains('\n'));
    }

    #[test]
    fn test_request_empty_params_serialized_as_object() {
        let req = JsonRpcRequest::new(3, "tools/list", Params::new());
        let value: Value = serde_json::from_str(&req.to_line().unwrap()).unwrap();
        assert_eq!(value["params"], json!({}));
    }

    #[test]
    fn test_request_parses_back_to_same_triple() {
        let req = JsonRpcRequest::new(
            42,
            "tools/call",
            params(json!({"name": "calculator_add", "arguments": {"a": 100, "b": 200}})),
        );
        let parsed: JsonRpcRequest = serde_json::from_str(&req.to_line().unwrap()).unwrap();
        assert_eq!(parsed, req);
    }

    #[test]
    fn test_classify_success_response() {
        let msg = Incoming::classify(json!({"jsonrpc":"2.0","id":1,"result":{"value":42}}));
        let Incoming::Response(resp) = msg else {
            panic!("expected response, got {msg:?}");
        };
        assert_eq!(resp.id, 1);
        assert_eq!(resp.result, Some(json!({"value": 42})));
        assert!(!resp.is_error());
    }

    #[test]
    fn test_classify_null_result_is_success() {
        let msg = Incoming::classify(json!({"jsonrpc":"2.0","id":5,"result":null}));
        let Incoming::Response(resp) = msg else {
            panic!("expected response, got {msg:?}");
        };
        assert_eq!(resp.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_classify_error_response() {
        let msg = Incoming::classify(
            json!({"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"Invalid Request"}}),
        );
        let Incoming::Response(resp) = msg else {
            panic!("expected response, got {msg:?}");
        };
        assert!(resp.is_error());
        assert_eq!(resp.error.unwrap().code, JsonRpcError::INVALID_REQUEST);
    }

    #[test]
    fn test_classify_notification() {
        let msg = Incoming::classify(
            json!({"jsonrpc":"2.0","method":"notifications/message","params":{"level":"info"}}),
        );
        assert_eq!(
            msg,
            Incoming::Notification(JsonRpcNotification::new(
                "notifications/message",
                Some(json!({"level": "info"}))
            ))
        );
    }

    #[test]
    fn test_classify_server_request() {
        let msg = Incoming::classify(json!({"jsonrpc":"2.0","id":"s1","method":"roots/list"}));
        assert_eq!(
            msg,
            Incoming::ServerRequest {
                method: "roots/list".to_string()
            }
        );
    }

    #[test]
    fn test_classify_orphan_error() {
        let msg = Incoming::classify(
            json!({"jsonrpc":"2.0","error":{"code":-32700,"message":"Unexpected character"}}),
        );
        assert!(matches!(msg, Incoming::OrphanError(e) if e.code == JsonRpcError::PARSE_ERROR));

        let msg = Incoming::classify(
            json!({"jsonrpc":"2.0","id":null,"error":{"code":-32700,"message":"bad"}}),
        );
        assert!(matches!(msg, Incoming::OrphanError(_)));
    }

    #[test]
    fn test_classify_malformed_shapes() {
        let cases = [
            json!([1, 2, 3]),
            json!("hello"),
            json!({"jsonrpc":"2.0","id":1}),
            json!({"jsonrpc":"2.0","id":1,"result":1,"error":{"code":1,"message":"x"}}),
            json!({"jsonrpc":"2.0","id":-4,"result":1}),
            json!({"jsonrpc":"2.0","id":"abc","result":1}),
            json!({"jsonrpc":"2.0","id":1,"error":"boom"}),
            json!({"jsonrpc":"2.0","method":7}),
            json!({"banner":"Spring Boot"}),
        ];
        for case in cases {
            let msg = Incoming::classify(case.clone());
            assert!(
                matches!(msg, Incoming::Malformed(_)),
                "{case} classified as {msg:?}"
            );
        }
    }

    #[test]
    fn test_default_initialize_params_shape() {
        let params = InitializeParams::default();
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["protocolVersion"], MCP_PROTOCOL_VERSION);
        assert_eq!(json["capabilities"], json!({}));
        assert_eq!(json["clientInfo"]["name"], "mcpwire");
    }

    #[test]
    fn test_initialize_result_without_capabilities() {
        let result: InitializeResult = serde_json::from_value(json!({
            "serverInfo": {"name": "demo", "version": "1.0.0"},
            "protocolVersion": "2024-11-05"
        }))
        .unwrap();
        assert_eq!(result.server_info.name, "demo");
        assert!(result.capabilities.tools.is_none());
    }

    #[test]
    fn test_server_capabilities_keep_unknown_entries() {
        let caps: ServerCapabilities = serde_json::from_value(json!({
            "tools": {"listChanged": true},
            "resources": {"subscribe": false},
            "logging": {}
        }))
        .unwrap();
        assert_eq!(caps.tools.unwrap().list_changed, Some(true));
        assert_eq!(caps.other["resources"], json!({"subscribe": false}));
        assert!(caps.other.contains_key("logging"));
        assert!(!caps.other.contains_key("tools"));
    }

    #[test]
    fn test_tool_info_parameters() {
        let json = r#"{
            "name": "calculator_add",
            "description": "Add two numbers",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "a": {"type": "number", "description": "first"},
                    "b": {"type": "number", "description": "second"}
                },
                "required": ["a", "b"]
            }
        }"#;
        let tool: ToolInfo = serde_json::from_str(json).unwrap();
        assert_eq!(tool.name, "calculator_add");
        let props = tool.parameters().unwrap();
        assert_eq!(props.len(), 2);
        assert_eq!(props["a"]["type"], "number");

        let bare: ToolInfo = serde_json::from_str(r#"{"name":"ping"}"#).unwrap();
        assert!(bare.parameters().is_none());
    }

    #[test]
    fn test_call_tool_result_untyped_content() {
        let result: CallToolResult =
            serde_json::from_value(json!({"content": [{"text": "300"}]})).unwrap();
        assert_eq!(result.primary_text(), Some("300"));
        assert!(!result.is_error());
    }

    #[test]
    fn test_call_tool_result_mixed_content() {
        let result: CallToolResult = serde_json::from_value(json!({
            "content": [
                {"type": "image", "data": "aGk=", "mimeType": "image/png"},
                {"type": "text", "text": "first"},
                {"type": "text", "text": "second"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.primary_text(), None);
        assert_eq!(result.text(), Some("first\nsecond".to_string()));
        assert_eq!(result.content[0].kind.as_deref(), Some("image"));
        assert_eq!(result.content[0].extra["mimeType"], "image/png");
    }

    #[test]
    fn test_call_tool_result_error_flag() {
        let result: CallToolResult = serde_json::from_value(json!({
            "isError": true,
            "content": [{"type": "text", "text": "Unknown tool: nope"}]
        }))
        .unwrap();
        assert!(result.is_error());
        assert_eq!(result.primary_text(), Some("Unknown tool: nope"));
    }
}
