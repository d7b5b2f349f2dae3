//! JSON-RPC wire types and SSE body parsing.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use krait_core::error::McpError;

pub const PROTOCOL_VERSION: &str = "2025-03-26";

#[derive(Debug, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    pub id: u64,
}

#[derive(Debug, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcResponse {
    pub result: Option<Value>,
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
}

impl JsonRpcResponse {
    /// Unwrap the result, turning a JSON-RPC error into [`McpError::Rpc`].
    pub fn into_result(self) -> Result<Value, McpError> {
        if let Some(err) = self.error {
            return Err(McpError::Rpc {
                code: err.code,
                message: err.message,
            });
        }
        self.result
            .ok_or_else(|| McpError::Protocol("response missing both result and error".into()))
    }
}

// Tool discovery and invocation payloads.

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteToolDef {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
pub struct ToolsListResult {
    pub tools: Vec<RemoteToolDef>,
}

#[derive(Debug, Deserialize)]
pub struct CallContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResult {
    pub content: Vec<CallContent>,
    #[serde(default)]
    pub is_error: bool,
}

impl CallResult {
    /// Join the text blocks; non-text content is skipped.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| {
                if c.content_type == "text" {
                    c.text.as_deref()
                } else {
                    None
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse all SSE `data:` payloads from a `text/event-stream` body.
/// Multi-line data fields are concatenated per the SSE spec.
pub fn extract_sse_events(body: &str) -> Result<Vec<String>, McpError> {
    let mut events: Vec<String> = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in body.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                events.push(current.join("\n"));
                current.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            current.push(rest.strip_prefix(' ').unwrap_or(rest));
        }
    }
    if !current.is_empty() {
        events.push(current.join("\n"));
    }

    if events.is_empty() {
        return Err(McpError::Protocol("no data field in SSE response".into()));
    }
    Ok(events)
}

/// Locate the JSON-RPC response with `expected_id` among SSE payloads,
/// falling back to the last event when no ID matches.
pub fn find_rpc_response(events: &[String], expected_id: u64) -> Result<String, McpError> {
    for event in events {
        if let Ok(value) = serde_json::from_str::<Value>(event) {
            if value.get("id").and_then(Value::as_u64) == Some(expected_id) {
                return Ok(event.clone());
            }
        }
    }
    events
        .last()
        .cloned()
        .ok_or_else(|| McpError::Protocol("no events in SSE response".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_omits_null_params() {
        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            method: "tools/list".into(),
            params: None,
            id: 7,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["id"], 7);
        assert!(value.get("params").is_none());
    }

    #[test]
    fn notification_has_no_id() {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0",
            method: "notifications/initialized".into(),
            params: None,
        };
        let value = serde_json::to_value(&notification).unwrap();
        assert!(value.get("id").is_none());
    }

    #[test]
    fn response_error_maps_to_rpc_error() {
        let response: JsonRpcResponse =
            serde_json::from_str(r#"{"error":{"code":-32601,"message":"Method not found"}}"#)
                .unwrap();
        let err = response.into_result().unwrap_err();
        assert!(matches!(err, McpError::Rpc { code: -32601, .. }));
    }

    #[test]
    fn sse_single_event() {
        let body = "event: message\ndata: {\"id\":1,\"result\":{}}\n\n";
        let events = extract_sse_events(body).unwrap();
        assert_eq!(events, vec![r#"{"id":1,"result":{}}"#]);
    }

    #[test]
    fn sse_no_space_after_colon() {
        let events = extract_sse_events("data:{\"ok\":true}\n").unwrap();
        assert_eq!(events[0], r#"{"ok":true}"#);
    }

    #[test]
    fn sse_multi_line_data_concatenated() {
        let events = extract_sse_events("data: first\ndata: second\n\n").unwrap();
        assert_eq!(events[0], "first\nsecond");
    }

    #[test]
    fn sse_without_data_is_an_error() {
        assert!(extract_sse_events("event: ping\n\n").is_err());
    }

    #[test]
    fn rpc_response_found_by_id() {
        let events = vec![
            r#"{"method":"notifications/progress"}"#.to_string(),
            r#"{"id":5,"result":{"tools":[]}}"#.to_string(),
        ];
        assert!(find_rpc_response(&events, 5).unwrap().contains("tools"));
    }

    #[test]
    fn rpc_response_falls_back_to_last_event() {
        let events = vec![r#"{"id":99,"result":{}}"#.to_string()];
        assert!(find_rpc_response(&events, 1).unwrap().contains("99"));
    }

    #[test]
    fn call_result_joins_text_blocks() {
        let result: CallResult = serde_json::from_value(json!({
            "content": [
                {"type": "text", "text": "one"},
                {"type": "image"},
                {"type": "text", "text": "two"}
            ],
            "isError": false
        }))
        .unwrap();
        assert_eq!(result.text(), "one\ntwo");
        assert!(!result.is_error);
    }
}
