// Wire protocol: one JSON object per line in each direction.
// Requests: {id?, method, params?}
// Responses: {type:"response", id, result?|error?}
// Events: {type:"event", event, body}

use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

pub fn parse_request(line: &str) -> Result<Request, String> {
    serde_json::from_str(line).map_err(|e| format!("malformed request: {}", e))
}

pub fn response_ok(id: &Option<Value>, result: Value) -> String {
    json!({
        "type": "response",
        "id": id.clone().unwrap_or(Value::Null),
        "result": result,
    })
    .to_string()
}

pub fn response_err(id: &Option<Value>, code: i64, message: &str) -> String {
    json!({
        "type": "response",
        "id": id.clone().unwrap_or(Value::Null),
        "error": { "code": code, "message": message },
    })
    .to_string()
}

pub fn event(name: &str, body: Value) -> String {
    json!({
        "type": "event",
        "event": name,
        "body": body,
    })
    .to_string()
}

/// Error code for unknown methods (JSON-RPC's "method not found")
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Error code for invalid parameters
pub const INVALID_PARAMS: i64 = -32602;
/// Error code for requests that need a paused VM
pub const NOT_PAUSED: i64 = -32001;
/// Error code for launch/session failures
pub const SESSION_ERROR: i64 = -32002;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request() {
        let r = parse_request(r#"{"id": 1, "method": "initialize"}"#).unwrap();
        assert_eq!(r.method, "initialize");
        assert_eq!(r.id, Some(serde_json::json!(1)));
        assert!(r.params.is_null());
    }

    #[test]
    fn test_parse_request_with_params() {
        let r = parse_request(r#"{"method": "continue", "params": {"threadId": 0}}"#).unwrap();
        assert!(r.id.is_none());
        assert_eq!(r.params["threadId"], 0);
    }

    #[test]
    fn test_malformed_request() {
        assert!(parse_request("not json").is_err());
    }

    #[test]
    fn test_response_shapes() {
        let ok = response_ok(&Some(serde_json::json!(7)), serde_json::json!({"a": 1}));
        let parsed: serde_json::Value = serde_json::from_str(&ok).unwrap();
        assert_eq!(parsed["type"], "response");
        assert_eq!(parsed["id"], 7);
        assert_eq!(parsed["result"]["a"], 1);

        let err = response_err(&None, METHOD_NOT_FOUND, "nope");
        let parsed: serde_json::Value = serde_json::from_str(&err).unwrap();
        assert_eq!(parsed["error"]["code"], METHOD_NOT_FOUND);
    }
}
