//! Structural validation of decoded JSON frames.
//!
//! Validation runs in two passes. The base pass decides whether a frame is
//! speaking the protocol at all; frames that fail it are treated as foreign
//! traffic. The full pass checks the per-type shape and reports every issue
//! found so the peer can be told exactly what was wrong.

use super::envelope::StreamType;
use crate::config::ProtocolConfig;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::LazyLock;

/// Message types accepted by the base shape.
pub const MESSAGE_TYPES: [&str; 6] = [
    "request",
    "response",
    "notification",
    "error",
    "stream:init",
    "stream:close",
];

/// Longest request id accepted from a peer.
const MAX_REQUEST_ID_LEN: usize = 128;

/// Longest message id that still fits an acknowledgment frame.
pub const MAX_MESSAGE_ID_LEN: usize = u8::MAX as usize;

/// A single validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaIssue {
    pub path: String,
    pub message: String,
}

impl SchemaIssue {
    fn new(path: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.to_string(),
            message: message.into(),
        }
    }
}

static VERSION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+$").expect("version regex must compile"));

static WIRE_METHOD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.:]*$").expect("method regex must compile"));

/// Check a method name as it may appear on the wire.
///
/// This is looser than registration: dots are allowed so peers can address
/// methods of other starlings through the proxy.
pub fn is_valid_wire_method(name: &str) -> bool {
    name.len() >= ProtocolConfig::MIN_METHOD_NAME_LEN && WIRE_METHOD.is_match(name)
}

/// Validate the minimal envelope shape.
pub fn validate_base(value: &Value) -> Result<(), Vec<SchemaIssue>> {
    let Some(obj) = value.as_object() else {
        return Err(vec![SchemaIssue::new("", "expected an object")]);
    };

    let mut issues = Vec::new();

    if let Some(protocol) = obj.get("protocol") {
        if protocol.as_str() != Some(ProtocolConfig::PROTOCOL_NAME) {
            issues.push(SchemaIssue::new(
                "protocol",
                format!("expected \"{}\"", ProtocolConfig::PROTOCOL_NAME),
            ));
        }
    }

    if let Some(version) = obj.get("version") {
        match version.as_str() {
            Some(v) if VERSION.is_match(v) => {}
            _ => issues.push(SchemaIssue::new("version", "expected a X.Y.Z version")),
        }
    }

    if let Some(timestamp) = obj.get("timestamp") {
        match timestamp.as_u64() {
            Some(ts) if ts > 0 => {}
            _ => issues.push(SchemaIssue::new(
                "timestamp",
                "expected a positive integer",
            )),
        }
    }

    match obj.get("type").and_then(Value::as_str) {
        Some(t) if MESSAGE_TYPES.contains(&t) => {}
        Some(t) => issues.push(SchemaIssue::new(
            "type",
            format!("unknown message type {:?}", t),
        )),
        None => issues.push(SchemaIssue::new("type", "required")),
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

/// Validate the full per-type envelope shape (includes the base shape).
pub fn validate_envelope(value: &Value) -> Result<(), Vec<SchemaIssue>> {
    validate_base(value)?;

    // validate_base guarantees an object with a known string type
    let Some(obj) = value.as_object() else {
        return Err(vec![SchemaIssue::new("", "expected an object")]);
    };
    let kind = obj.get("type").and_then(Value::as_str).unwrap_or_default();

    let mut issues = Vec::new();

    for key in ["id", "peer"] {
        if let Some(v) = obj.get(key) {
            if !v.as_str().is_some_and(|s| !s.is_empty()) {
                issues.push(SchemaIssue::new(key, "expected a non-empty string"));
            }
        }
    }
    if let Some(id) = obj.get("id").and_then(Value::as_str) {
        if id.len() > MAX_MESSAGE_ID_LEN {
            issues.push(SchemaIssue::new(
                "id",
                format!("must be at most {} bytes", MAX_MESSAGE_ID_LEN),
            ));
        }
    }

    match kind {
        "request" => {
            check_request_id(obj, &mut issues);
            match obj.get("method").and_then(Value::as_str) {
                Some(m) if is_valid_wire_method(m) => {}
                Some(_) => issues.push(SchemaIssue::new(
                    "method",
                    "must start with a letter and contain only letters, digits, '_', '.' or ':' (min 3 chars)",
                )),
                None => issues.push(SchemaIssue::new("method", "required")),
            }
        }
        "response" => {
            check_request_id(obj, &mut issues);
            if !obj.get("success").is_some_and(Value::is_boolean) {
                issues.push(SchemaIssue::new("success", "expected a boolean"));
            }
            if let Some(error) = obj.get("error") {
                check_error_body(error, "error", &mut issues);
            }
        }
        "notification" => {}
        "error" => match obj.get("error") {
            Some(error) => check_error_body(error, "error", &mut issues),
            None => issues.push(SchemaIssue::new("error", "required")),
        },
        "stream:init" => {
            check_stream_id(obj, &mut issues);
            match obj.get("streamType").and_then(Value::as_str) {
                Some(t) if StreamType::ALL.contains(&t) => {}
                _ => issues.push(SchemaIssue::new(
                    "streamType",
                    format!("expected one of {:?}", StreamType::ALL),
                )),
            }
            if !obj.get("metadata").is_some_and(Value::is_object) {
                issues.push(SchemaIssue::new("metadata", "expected an object"));
            }
        }
        "stream:close" => {
            check_stream_id(obj, &mut issues);
            if let Some(reason) = obj.get("reason") {
                if !reason.is_string() {
                    issues.push(SchemaIssue::new("reason", "expected a string"));
                }
            }
        }
        _ => issues.push(SchemaIssue::new("type", "unknown message type")),
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(issues)
    }
}

fn check_request_id(obj: &Map<String, Value>, issues: &mut Vec<SchemaIssue>) {
    match obj.get("requestId").and_then(Value::as_str) {
        Some(id) if !id.is_empty() && id.len() <= MAX_REQUEST_ID_LEN => {}
        Some(_) => issues.push(SchemaIssue::new(
            "requestId",
            format!("expected 1 to {} characters", MAX_REQUEST_ID_LEN),
        )),
        None => issues.push(SchemaIssue::new("requestId", "required")),
    }
}

fn check_stream_id(obj: &Map<String, Value>, issues: &mut Vec<SchemaIssue>) {
    let valid = obj
        .get("streamId")
        .and_then(Value::as_str)
        .is_some_and(|s| uuid::Uuid::parse_str(s).is_ok());
    if !valid {
        issues.push(SchemaIssue::new("streamId", "expected a uuid"));
    }
}

fn check_error_body(value: &Value, path: &str, issues: &mut Vec<SchemaIssue>) {
    let Some(obj) = value.as_object() else {
        issues.push(SchemaIssue::new(path, "expected an object"));
        return;
    };
    if !obj.get("code").is_some_and(Value::is_string) {
        issues.push(SchemaIssue::new(&format!("{}.code", path), "expected a string"));
    }
    if !obj.get("message").is_some_and(Value::is_string) {
        issues.push(SchemaIssue::new(
            &format!("{}.message", path),
            "expected a string",
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base_accepts_minimal_request() {
        let value = json!({"type": "request", "requestId": "r1", "method": "echo"});
        assert!(validate_base(&value).is_ok());
        assert!(validate_envelope(&value).is_ok());
    }

    #[test]
    fn test_base_rejects_foreign_json() {
        assert!(validate_base(&json!({"hello": "world"})).is_err());
        assert!(validate_base(&json!([1, 2, 3])).is_err());
        assert!(validate_base(&json!({"type": "chat"})).is_err());
    }

    #[test]
    fn test_base_checks_protocol_and_version() {
        let issues = validate_base(&json!({
            "protocol": "other",
            "version": "1.0",
            "timestamp": 1,
            "type": "notification"
        }))
        .unwrap_err();

        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["protocol", "version"]);
    }

    #[test]
    fn test_base_rejects_non_positive_timestamp() {
        assert!(validate_base(&json!({"timestamp": 0, "type": "notification"})).is_err());
        assert!(validate_base(&json!({"timestamp": -3, "type": "notification"})).is_err());
        assert!(validate_base(&json!({"timestamp": 1.5, "type": "notification"})).is_err());
    }

    #[test]
    fn test_full_rejects_bad_method() {
        let issues = validate_envelope(&json!({
            "timestamp": 1,
            "type": "request",
            "requestId": "r1",
            "method": "1x"
        }))
        .unwrap_err();

        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "method");
    }

    #[test]
    fn test_full_response_requires_success_flag() {
        let issues = validate_envelope(&json!({
            "timestamp": 1,
            "type": "response",
            "requestId": "r1",
            "error": {"code": 5}
        }))
        .unwrap_err();

        let paths: Vec<_> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"success"));
        assert!(paths.contains(&"error.code"));
        assert!(paths.contains(&"error.message"));
    }

    #[test]
    fn test_full_stream_init_requires_uuid() {
        let ok = json!({
            "timestamp": 1,
            "type": "stream:init",
            "streamId": "6f1c2a8e-7d8b-4f7e-9a53-2b3c4d5e6f70",
            "streamType": "audio",
            "metadata": {"codec": "opus"}
        });
        assert!(validate_envelope(&ok).is_ok());

        let bad = json!({
            "timestamp": 1,
            "type": "stream:init",
            "streamId": "nope",
            "streamType": "hologram",
            "metadata": {}
        });
        assert_eq!(validate_envelope(&bad).unwrap_err().len(), 2);
    }

    #[test]
    fn test_wire_method_names() {
        assert!(is_valid_wire_method("echo"));
        assert!(is_valid_wire_method("user:create"));
        assert!(is_valid_wire_method("peer.chat:send"));
        assert!(!is_valid_wire_method("ab"));
        assert!(!is_valid_wire_method("_abc"));
        assert!(!is_valid_wire_method("a-b-c"));
        assert!(!is_valid_wire_method("abé"));
        assert!(!is_valid_wire_method("user:créer"));
    }

    #[test]
    fn test_version_digits_are_ascii() {
        assert!(validate_base(&json!({"version": "1.0.0", "type": "notification"})).is_ok());
        assert!(validate_base(&json!({"version": "١.٠.٠", "type": "notification"})).is_err());
    }

    #[test]
    fn test_full_rejects_unackable_id() {
        let envelope = |id: String| {
            json!({
                "timestamp": 1,
                "type": "notification",
                "id": id,
                "notification": {}
            })
        };

        assert!(validate_envelope(&envelope("a".repeat(MAX_MESSAGE_ID_LEN))).is_ok());

        let issues = validate_envelope(&envelope("a".repeat(MAX_MESSAGE_ID_LEN + 1))).unwrap_err();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].path, "id");
    }
}
