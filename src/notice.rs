//! Purpose: Define a stable, structured schema for non-fatal stderr notices.
//! Exports: `Notice`, `notice_json`.
//! Role: Shared contract helper for CLI and web-console diagnostics (non-error events).
//! Invariants: Notices are non-fatal and never alter the console byte stream.
//! Invariants: JSON schema is stable once published; fields are additive-only.
//! Invariants: `session` and `reason` appear at the top level only when known.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub board: String,
    pub message: String,
    pub session: Option<String>,
    pub reason: Option<String>,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(notice.kind));
    inner.insert("time".to_string(), json!(notice.time));
    inner.insert("cmd".to_string(), json!(notice.cmd));
    inner.insert("board".to_string(), json!(notice.board));
    inner.insert("message".to_string(), json!(notice.message));
    if let Some(session) = &notice.session {
        inner.insert("session".to_string(), json!(session));
    }
    if let Some(reason) = &notice.reason {
        inner.insert("reason".to_string(), json!(reason));
    }
    inner.insert("details".to_string(), Value::Object(notice.details.clone()));

    let mut outer = Map::new();
    outer.insert("notice".to_string(), Value::Object(inner));
    Value::Object(outer)
}
