//! Envelope classification and response construction

use crate::error::TransportError;
use crate::types::{Envelope, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ResponseError};
use serde_json::Value;
use tracing::trace;

/// Decode one frame into an envelope
pub fn parse_envelope(frame: &[u8]) -> Result<Envelope, TransportError> {
    let value: Value = serde_json::from_slice(frame).map_err(|e| {
        let snippet = String::from_utf8_lossy(frame).chars().take(300).collect::<String>();
        TransportError::Decode(format!("invalid JSON ({}): {}", e, snippet))
    })?;
    parse_message(value)
}

/// Classify a JSON value as request, response or notification.
///
/// `id` plus `result`/`error` is a response, `method` plus `id` is a request,
/// `method` alone is a notification. Anything else is malformed.
pub fn parse_message(value: Value) -> Result<Envelope, TransportError> {
    let Value::Object(ref obj) = value else {
        return Err(TransportError::Decode(format!(
            "expected a JSON object, got: {}",
            truncate(&value)
        )));
    };

    let has_id = obj.contains_key("id");
    let has_method = obj.contains_key("method");
    let has_outcome = obj.contains_key("result") || obj.contains_key("error");

    let envelope = if has_id && has_outcome && !has_method {
        let response: JsonRpcResponse = from_value(value)?;
        Envelope::Response(response)
    } else if has_method && has_id {
        let request: JsonRpcRequest = from_value(value)?;
        Envelope::Request(request)
    } else if has_method {
        let notification: JsonRpcNotification = from_value(value)?;
        Envelope::Notification(notification)
    } else {
        return Err(TransportError::Decode(format!(
            "unknown message shape: {}",
            truncate(&value)
        )));
    };

    trace!("Parsed envelope: {:?}", envelope);
    Ok(envelope)
}

fn from_value<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    let snippet = truncate(&value);
    serde_json::from_value(value)
        .map_err(|e| TransportError::Decode(format!("malformed envelope ({}): {}", e, snippet)))
}

fn truncate(value: &Value) -> String {
    value.to_string().chars().take(300).collect()
}

/// Create an error response for an inbound request
pub fn create_error_response(request_id: Value, code: i32, message: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(request_id, ResponseError::new(code, message))
}

pub fn create_method_not_found_response(request_id: Value, method: &str) -> JsonRpcResponse {
    JsonRpcResponse::failure(request_id, ResponseError::method_not_found(method))
}
