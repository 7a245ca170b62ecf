//! JSON-RPC 2.0 envelope types shared by the router and the HTTP surface.
//!
//! The gateway forwards request bodies opaquely; these types exist to build
//! well-formed error envelopes and to validate what comes back from workers.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// JSON-RPC "internal error" code, used for every gateway-originated failure
/// on the request path.
pub const INTERNAL_ERROR: i64 = -32603;

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

/// The `error` member of a JSON-RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Extract the `id` member from a raw request body, if any.
///
/// Malformed bodies yield `None`; the error envelope then carries a null id,
/// which is what the protocol prescribes for unidentifiable requests.
pub fn request_id(body: &Value) -> Option<Value> {
    body.get("id").cloned()
}

/// Build a gateway-originated error envelope with [`INTERNAL_ERROR`].
pub fn internal_error(id: Option<Value>, message: &str, data: Option<Value>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {
            "code": INTERNAL_ERROR,
            "message": message,
            "data": data,
        },
    })
}

/// Build a plain JSON-RPC request body for gateway-initiated calls
/// (bootstrap introspection against the default worker).
pub fn request(id: u64, method: &str, params: Option<Value>) -> Value {
    let mut req = json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
    });
    if let Some(params) = params {
        req["params"] = params;
    }
    req
}

/// Whether a worker reply is a structurally valid JSON-RPC response.
///
/// The only hard requirement is the `jsonrpc` version marker; everything else
/// is passed through to the caller untouched.
pub fn is_valid_response(body: &Value) -> bool {
    body.get("jsonrpc").and_then(Value::as_str) == Some("2.0")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_error_carries_request_id() {
        let body = json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"});
        let err = internal_error(request_id(&body), "No available worker", None);
        assert_eq!(err["id"], json!(7));
        assert_eq!(err["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(err["error"]["message"], json!("No available worker"));
    }

    #[test]
    fn internal_error_defaults_to_null_id() {
        let err = internal_error(None, "invalid response", None);
        assert!(err["id"].is_null());
    }

    #[test]
    fn response_validation_requires_version_marker() {
        assert!(is_valid_response(
            &json!({"jsonrpc": "2.0", "id": 1, "result": {}})
        ));
        assert!(!is_valid_response(&json!({"id": 1, "result": {}})));
        assert!(!is_valid_response(&json!({"jsonrpc": "1.0", "id": 1})));
    }

    #[test]
    fn error_envelope_round_trips_through_typed_form() {
        let err = internal_error(Some(json!(3)), "boom", Some(json!({"status": "error"})));
        let typed: RpcResponse = serde_json::from_value(err).expect("envelope must parse");
        let rpc_error = typed.error.expect("error member present");
        assert_eq!(rpc_error.code, INTERNAL_ERROR);
        assert_eq!(rpc_error.data, Some(json!({"status": "error"})));
    }
}
