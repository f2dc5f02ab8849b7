//! # Command Wire Model
//!
//! JSON command/response format for the client surface. Commands arrive on
//! `{prefix}/{clientId}/cmd` and responses leave on `{prefix}/{clientId}/res`,
//! both as UTF-8 JSON objects:
//!
//! ```json
//! {"id":"4f7c...","op":"SET","key":"user:1","value":"alice"}
//! {"id":"4f7c...","status":"OK"}
//! {"id":"9a10...","op":"MGET","keys":["a","b"]}
//! {"id":"9a10...","status":"OK","results":[{"key":"a","status":"OK","value":"1"},
//!                                          {"key":"b","status":"ERROR","errorCode":102}]}
//! ```
//!
//! Parsing here is purely structural: which operation, which arguments.
//! Size limits and semantic validation live in the processor so they are
//! enforced identically whether a command arrives over MQTT or is built
//! in-process.

use serde::{Deserialize, Serialize};

use crate::error::{CommandError, ErrorCode};

/// The operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    #[serde(rename = "GET")]
    Get,
    #[serde(rename = "SET")]
    Set,
    #[serde(rename = "DEL")]
    Del,
    #[serde(rename = "INCR")]
    Incr,
    #[serde(rename = "DECR")]
    Decr,
    #[serde(rename = "APPEND")]
    Append,
    #[serde(rename = "PREPEND")]
    Prepend,
    #[serde(rename = "MGET")]
    Mget,
    #[serde(rename = "MSET")]
    Mset,
}

impl Operation {
    /// Bulk operations carry multiple keys and get the longer client
    /// timeout window.
    pub fn is_multi_key(self) -> bool {
        matches!(self, Operation::Mget | Operation::Mset)
    }

    /// Operations that mutate state and therefore produce replication
    /// events.
    pub fn is_write(self) -> bool {
        !matches!(self, Operation::Get | Operation::Mget)
    }
}

/// A client command as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Request identifier echoed in the response. Empty means the caller
    /// opted out of idempotency tracking.
    #[serde(default)]
    pub id: String,

    pub op: Operation,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    /// Ordered key/value pairs for MSET. serde_json preserves the
    /// submission order of the JSON object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_values: Option<serde_json::Map<String, serde_json::Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,

    /// Opaque extension parameters, passed through untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl CommandRequest {
    pub fn new(op: Operation) -> Self {
        Self {
            id: String::new(),
            op,
            key: None,
            keys: None,
            value: None,
            key_values: None,
            amount: None,
            params: None,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(Operation::Get)
        }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::new(Operation::Set)
        }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::new(Operation::Del)
        }
    }

    pub fn incr(key: impl Into<String>, amount: i64) -> Self {
        Self {
            key: Some(key.into()),
            amount: Some(amount),
            ..Self::new(Operation::Incr)
        }
    }

    pub fn decr(key: impl Into<String>, amount: i64) -> Self {
        Self {
            key: Some(key.into()),
            amount: Some(amount),
            ..Self::new(Operation::Decr)
        }
    }

    pub fn append(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::new(Operation::Append)
        }
    }

    pub fn prepend(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: Some(value.into()),
            ..Self::new(Operation::Prepend)
        }
    }

    pub fn mget(keys: Vec<String>) -> Self {
        Self {
            keys: Some(keys),
            ..Self::new(Operation::Mget)
        }
    }

    pub fn mset(pairs: Vec<(String, String)>) -> Self {
        let mut map = serde_json::Map::new();
        for (k, v) in pairs {
            map.insert(k, serde_json::Value::String(v));
        }
        Self {
            key_values: Some(map),
            ..Self::new(Operation::Mset)
        }
    }

    /// Parse a raw command payload.
    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        serde_json::from_slice(payload)
            .map_err(|e| CommandError::invalid(format!("malformed command: {}", e)))
    }
}

/// Response status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

/// Per-key outcome inside a bulk response, in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyResult {
    pub key: String,
    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl KeyResult {
    pub fn ok(key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            key: key.into(),
            status: Status::Ok,
            value,
            error_code: None,
            error: None,
        }
    }

    pub fn err(key: impl Into<String>, error: &CommandError) -> Self {
        Self {
            key: key.into(),
            status: Status::Error,
            value: None,
            error_code: Some(error.code()),
            error: Some(error.to_string()),
        }
    }
}

/// A command response as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    /// Echo of the request id.
    pub id: String,

    pub status: Status,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ErrorCode>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<Vec<KeyResult>>,
}

impl Response {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: Status::Ok,
            value: None,
            error: None,
            error_code: None,
            results: None,
        }
    }

    pub fn ok_value(id: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            ..Self::ok(id)
        }
    }

    pub fn ok_results(id: impl Into<String>, results: Vec<KeyResult>) -> Self {
        Self {
            results: Some(results),
            ..Self::ok(id)
        }
    }

    pub fn error(id: impl Into<String>, error: &CommandError) -> Self {
        Self {
            id: id.into(),
            status: Status::Error,
            value: None,
            error: Some(error.to_string()),
            error_code: Some(error.code()),
            results: None,
        }
    }

    /// Tag a response as a cached replay. The status is untouched; only
    /// the code changes so the caller can tell replay from first delivery.
    pub fn tagged_replay(mut self) -> Self {
        self.error_code = Some(ErrorCode::IdempotentReplay);
        self
    }

    pub fn parse(payload: &[u8]) -> Result<Self, CommandError> {
        serde_json::from_slice(payload)
            .map_err(|e| CommandError::invalid(format!("malformed response: {}", e)))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        // Serialization of a Response cannot fail: every field is a plain
        // string, number, or vec thereof.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_set_command() {
        let raw = br#"{"id":"r1","op":"SET","key":"user:1","value":"alice"}"#;
        let cmd = CommandRequest::parse(raw).unwrap();
        assert_eq!(cmd.id, "r1");
        assert_eq!(cmd.op, Operation::Set);
        assert_eq!(cmd.key.as_deref(), Some("user:1"));
        assert_eq!(cmd.value.as_deref(), Some("alice"));
    }

    #[test]
    fn parses_command_without_id() {
        let raw = br#"{"op":"GET","key":"k"}"#;
        let cmd = CommandRequest::parse(raw).unwrap();
        assert!(cmd.id.is_empty());
        assert_eq!(cmd.op, Operation::Get);
    }

    #[test]
    fn mset_preserves_submission_order() {
        let raw = br#"{"id":"r","op":"MSET","keyValues":{"zz":"1","aa":"2","mm":"3"}}"#;
        let cmd = CommandRequest::parse(raw).unwrap();
        let keys: Vec<&String> = cmd.key_values.as_ref().unwrap().keys().collect();
        assert_eq!(keys, ["zz", "aa", "mm"]);
    }

    #[test]
    fn rejects_malformed_json_and_unknown_op() {
        assert!(CommandRequest::parse(b"{not json").is_err());
        assert!(CommandRequest::parse(br#"{"op":"EXPLODE","key":"k"}"#).is_err());
        assert!(CommandRequest::parse(br#"{"key":"k"}"#).is_err());
    }

    #[test]
    fn response_roundtrip_with_error_code() {
        let response = Response::error("r1", &CommandError::NotFound);
        let bytes = response.to_bytes();
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(text.contains(r#""status":"ERROR""#));
        assert!(text.contains(r#""errorCode":102"#));
        assert_eq!(Response::parse(&bytes).unwrap(), response);
    }

    #[test]
    fn ok_response_omits_optional_fields() {
        let text = String::from_utf8(Response::ok("r1").to_bytes()).unwrap();
        assert_eq!(text, r#"{"id":"r1","status":"OK"}"#);
    }

    #[test]
    fn bulk_results_serialize_in_camel_case() {
        let response = Response::ok_results(
            "r1",
            vec![
                KeyResult::ok("a", Some("1".into())),
                KeyResult::err("b", &CommandError::NotFound),
            ],
        );
        let text = String::from_utf8(response.to_bytes()).unwrap();
        assert!(text.contains(r#""errorCode":102"#));
        assert!(text.contains(r#""key":"b""#));
        let back = Response::parse(text.as_bytes()).unwrap();
        assert_eq!(back.results.as_ref().unwrap().len(), 2);
    }

    #[test]
    fn replay_tag_keeps_status() {
        let tagged = Response::ok_value("r1", "v").tagged_replay();
        assert_eq!(tagged.status, Status::Ok);
        assert_eq!(tagged.error_code, Some(ErrorCode::IdempotentReplay));
        assert_eq!(tagged.value.as_deref(), Some("v"));
    }

    #[test]
    fn multi_key_classification() {
        assert!(Operation::Mget.is_multi_key());
        assert!(Operation::Mset.is_multi_key());
        assert!(!Operation::Get.is_multi_key());
        assert!(Operation::Set.is_write());
        assert!(!Operation::Mget.is_write());
    }
}
