//! Wire types for the line-delimited JSON-RPC tool boundary: one JSON object
//! per message, requests read from stdin, responses written to stdout.
//!
//! Shape follows §6 exactly: `{id?, method, params?}` in, `{id, result|error}`
//! out. Error codes follow the conventional JSON-RPC reservations the same
//! way the extension bridge protocol reuses a small fixed vocabulary.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request id: either side of JSON-RPC may use a number or a string: the
/// extension bridge protocol already does the same thing for its own ids.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl From<i64> for RequestId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

impl RpcResponse {
    #[must_use]
    pub fn success(id: Option<RequestId>, result: Value) -> Self {
        Self { id, result: Some(result), error: None }
    }

    #[must_use]
    pub fn failure(id: Option<RequestId>, error: RpcErrorBody) -> Self {
        Self { id, result: None, error: Some(error) }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcErrorBody {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorBody {
    #[must_use]
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    #[must_use]
    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::new(-32700, "Parse error").with_data(serde_json::json!({ "detail": detail.into() }))
    }

    #[must_use]
    pub fn invalid_request(detail: impl Into<String>) -> Self {
        Self::new(-32600, "Invalid Request").with_data(serde_json::json!({ "detail": detail.into() }))
    }

    #[must_use]
    pub fn method_not_found(method: &str) -> Self {
        Self::new(-32601, "Method not found").with_data(serde_json::json!({ "method": method }))
    }

    #[must_use]
    pub fn invalid_params(detail: impl Into<String>) -> Self {
        Self::new(-32602, "Invalid params").with_data(serde_json::json!({ "detail": detail.into() }))
    }

    #[must_use]
    pub fn internal_error(detail: impl Into<String>) -> Self {
        Self::new(-32603, "Internal error").with_data(serde_json::json!({ "detail": detail.into() }))
    }
}

/// Turns a [`crate::error::CoreError`] into the same `{reason, suggestion,
/// details?}` shape every tool result uses, carried as `error.data` so
/// agents reading the JSON-RPC error never have to special-case it.
impl From<&crate::error::CoreError> for RpcErrorBody {
    fn from(e: &crate::error::CoreError) -> Self {
        let code = match e.kind {
            crate::error::ErrorKind::Timeout | crate::error::ErrorKind::StateBrick => -32001,
            crate::error::ErrorKind::TransportFailure => -32002,
            crate::error::ErrorKind::NotConfigured => -32003,
            crate::error::ErrorKind::PolicyViolation => -32004,
            crate::error::ErrorKind::NotFound => -32005,
            crate::error::ErrorKind::ValidationError => -32602,
            crate::error::ErrorKind::ProtocolViolation => -32600,
        };
        Self::new(code, e.reason.clone()).with_data(e.to_json())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_id_roundtrips_number_and_string() {
        let n: RequestId = 7.into();
        let s: RequestId = "abc".into();
        assert_eq!(serde_json::to_string(&n).unwrap(), "7");
        assert_eq!(serde_json::to_string(&s).unwrap(), "\"abc\"");
    }

    #[test]
    fn request_deserializes_without_id_or_params() {
        let req: RpcRequest = serde_json::from_str(r#"{"method":"ping"}"#).unwrap();
        assert_eq!(req.method, "ping");
        assert!(req.id.is_none());
        assert!(req.params.is_none());
    }

    #[test]
    fn response_success_omits_error_field() {
        let resp = RpcResponse::success(Some(1.into()), serde_json::json!({"ok": true}));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("error").is_none());
        assert_eq!(json["result"]["ok"], true);
    }

    #[test]
    fn core_error_maps_to_stable_rpc_code() {
        let err = crate::error::CoreError::timeout("CDP timed out");
        let body = RpcErrorBody::from(&err);
        assert_eq!(body.code, -32001);
        assert_eq!(body.data.unwrap()["kind"], "timeout");
    }
}
