//! JSON-RPC 2.0 envelope types exchanged with the worker

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";

/// Standard JSON-RPC and LSP error codes
pub mod error_codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    pub const REQUEST_CANCELLED: i32 = -32800;
}

fn default_jsonrpc() -> String {
    JSONRPC_VERSION.to_string()
}

/// Correlation id of an outgoing request.
///
/// Ids are tagged with the worker generation that issued them, so a response
/// from a previous generation can never be matched against a fresh call.
/// On the wire the id is the string `"<generation>:<seq>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId {
    pub generation: u64,
    pub seq: u64,
}

impl CorrelationId {
    pub fn new(generation: u64, seq: u64) -> Self {
        Self { generation, seq }
    }

    pub fn to_wire(self) -> Value {
        Value::String(self.to_string())
    }

    /// Parse a wire id. Returns `None` for ids this client never issued.
    pub fn from_wire(value: &Value) -> Option<Self> {
        let (generation, seq) = value.as_str()?.split_once(':')?;
        Some(Self {
            generation: generation.parse().ok()?,
            seq: seq.parse().ok()?,
        })
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.generation, self.seq)
    }
}

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: impl Into<Value>, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id: id.into(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Notification (no id, never answered)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default = "default_jsonrpc")]
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
}

impl JsonRpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            // Some(Null) still serializes as `"result": null`
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Value, error: ResponseError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into the call outcome. A missing `result` is `null`.
    pub fn into_result(self) -> std::result::Result<Value, ResponseError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// JSON-RPC 2.0 Error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ResponseError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            error_codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (code {})", self.message, self.code)
    }
}

/// One discrete message unit exchanged over the transport
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Request(JsonRpcRequest),
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

impl Envelope {
    /// Method name for requests and notifications
    pub fn method(&self) -> Option<&str> {
        match self {
            Envelope::Request(r) => Some(&r.method),
            Envelope::Notification(n) => Some(&n.method),
            Envelope::Response(_) => None,
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            Envelope::Request(r) => serde_json::to_vec(r),
            Envelope::Response(r) => serde_json::to_vec(r),
            Envelope::Notification(n) => serde_json::to_vec(n),
        }
    }
}

impl From<JsonRpcRequest> for Envelope {
    fn from(r: JsonRpcRequest) -> Self {
        Envelope::Request(r)
    }
}

impl From<JsonRpcResponse> for Envelope {
    fn from(r: JsonRpcResponse) -> Self {
        Envelope::Response(r)
    }
}

impl From<JsonRpcNotification> for Envelope {
    fn from(n: JsonRpcNotification) -> Self {
        Envelope::Notification(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_correlation_id_wire_format() {
        let id = CorrelationId::new(4, 17);
        assert_eq!(id.to_wire(), json!("4:17"));
        assert_eq!(CorrelationId::from_wire(&json!("4:17")), Some(id));
    }

    #[test]
    fn test_foreign_ids_do_not_parse() {
        assert_eq!(CorrelationId::from_wire(&json!(17)), None);
        assert_eq!(CorrelationId::from_wire(&json!("abc")), None);
        assert_eq!(CorrelationId::from_wire(&json!("1:x")), None);
        assert_eq!(CorrelationId::from_wire(&Value::Null), None);
    }

    #[test]
    fn test_null_result_is_serialized() {
        let response = JsonRpcResponse::success(json!(1), Value::Null);
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"result\":null"));
        assert_eq!(response.into_result().unwrap(), Value::Null);
    }

    #[test]
    fn test_envelope_method_names() {
        let request = Envelope::Request(JsonRpcRequest::new(json!("1:1"), "chat/new", None));
        let notification = Envelope::Notification(JsonRpcNotification::new("exit", None));
        let response = Envelope::Response(JsonRpcResponse::success(json!("1:1"), Value::Null));
        assert_eq!(request.method(), Some("chat/new"));
        assert_eq!(notification.method(), Some("exit"));
        assert_eq!(response.method(), None);
    }

    #[test]
    fn test_notification_has_no_id() {
        let n = JsonRpcNotification::new("initialized", None);
        let json = serde_json::to_string(&n).unwrap();
        assert!(!json.contains("\"id\""));
        assert!(!json.contains("params"));
    }
}
