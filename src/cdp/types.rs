//! Hand-written CDP types for the commands and events this crate touches
//!
//! Only the Fetch, Network, Runtime and domain-enable surface is modeled;
//! everything else belongs to the caller's protocol client.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =========================================================================
// Commands
// =========================================================================

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEnable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_post_data_size: Option<i64>,
}

/// URL filter for `Fetch.enable`; `*` intercepts everything
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestPattern {
    pub url_pattern: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchEnable {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub patterns: Option<Vec<RequestPattern>>,
}

/// One `name: value` pair in a protocol header list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderEntry {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchContinueRequest {
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Base64-encoded request body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_data: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<HeaderEntry>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFailRequest {
    pub request_id: String,
    pub error_reason: ErrorReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchFulfillRequest {
    pub request_id: String,
    pub response_code: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<HeaderEntry>>,
    /// Base64-encoded response body
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

/// Protocol error reasons accepted by `Fetch.failRequest`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorReason {
    Failed,
    Aborted,
    TimedOut,
    AccessDenied,
    ConnectionRefused,
    ConnectionReset,
    InternetDisconnected,
    BlockedByClient,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvaluate {
    pub expression: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_by_value: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub await_promise: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeEvaluateResult {
    #[serde(default)]
    pub result: RemoteObject,
    #[serde(default)]
    pub exception_details: Option<ExceptionDetails>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub subtype: Option<String>,
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    pub text: String,
    #[serde(default)]
    pub line_number: i32,
    #[serde(default)]
    pub column_number: i32,
}

// =========================================================================
// Events
// =========================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequest {
    pub url: String,
    pub method: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub post_data: Option<String>,
    #[serde(default)]
    pub has_post_data: Option<bool>,
    #[serde(default)]
    pub post_data_entries: Option<Vec<PostDataEntry>>,
}

/// One chunk of a possibly-chunked POST body, base64-encoded
#[derive(Debug, Clone, Deserialize)]
pub struct PostDataEntry {
    #[serde(default)]
    pub bytes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponse {
    pub url: String,
    pub status: i32,
    #[serde(default)]
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkRequestWillBeSentEvent {
    pub request_id: String,
    pub request: NetworkRequest,
    #[serde(default)]
    pub timestamp: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkResponseReceivedEvent {
    pub request_id: String,
    pub response: NetworkResponse,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLoadingFinishedEvent {
    pub request_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkLoadingFailedEvent {
    pub request_id: String,
    #[serde(default)]
    pub error_text: String,
    #[serde(default)]
    pub canceled: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchRequestPausedEvent {
    pub request_id: String,
    pub request: NetworkRequest,
    #[serde(default)]
    pub network_id: Option<String>,
    #[serde(default)]
    pub resource_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConsoleApiCalledEvent {
    pub r#type: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWebSocketCreatedEvent {
    pub request_id: String,
    pub url: String,
}

/// Payload of a sent/received WebSocket frame.
///
/// `payload_data` is plain text for text frames and base64 for binary and
/// control frames. The opcode arrives as a JSON number that some backends
/// emit as a float.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketFrameData {
    #[serde(default)]
    pub opcode: f64,
    #[serde(default)]
    pub mask: bool,
    #[serde(default)]
    pub payload_data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWebSocketFrameEvent {
    pub request_id: String,
    #[serde(default)]
    pub timestamp: f64,
    pub response: WebSocketFrameData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWebSocketClosedEvent {
    pub request_id: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub code: Option<u16>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkWebSocketFrameErrorEvent {
    pub request_id: String,
    #[serde(default)]
    pub error_message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_continue_request_skips_empty_overrides() {
        let params = FetchContinueRequest {
            request_id: "interception-1".into(),
            ..Default::default()
        };
        let value = serde_json::to_value(&params).unwrap();
        assert_eq!(value, json!({"requestId": "interception-1"}));
    }

    #[test]
    fn test_error_reason_wire_names() {
        assert_eq!(
            serde_json::to_value(ErrorReason::TimedOut).unwrap(),
            json!("TimedOut")
        );
        assert_eq!(
            serde_json::to_value(ErrorReason::AccessDenied).unwrap(),
            json!("AccessDenied")
        );
    }

    #[test]
    fn test_frame_event_accepts_float_opcode() {
        let event: NetworkWebSocketFrameEvent = serde_json::from_value(json!({
            "requestId": "ws-1",
            "timestamp": 12.5,
            "response": {"opcode": 1.0, "mask": false, "payloadData": "hello"}
        }))
        .unwrap();
        assert_eq!(event.response.opcode as u8, 0x1);
        assert_eq!(event.response.payload_data, "hello");
    }
}
