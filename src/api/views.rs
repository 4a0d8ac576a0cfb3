//! Purpose: Wire shapes for proxy, session and logger records on the v0 control API.
//! Exports: `ProxyView`, `ProxySummaryView`, `SessionView`, `LogView`, `format_time`.
//! Role: One schema shared by the HTTP server (serialize) and `ControlClient` (deserialize).
//! Invariants: Key names are stable; new fields are additive and optional.
//! Invariants: Timestamps are RFC 3339 strings in UTC.
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::session::SessionInfo;
use crate::core::session_log::LoggerStatus;
use crate::core::supervisor::{ProxyStatus, ProxySummary};

pub fn format_time(value: OffsetDateTime) -> String {
    value.format(&Rfc3339).unwrap_or_else(|_| value.to_string())
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProxySummaryView {
    pub board: String,
    pub state: String,
    pub session_count: usize,
}

impl From<&ProxySummary> for ProxySummaryView {
    fn from(summary: &ProxySummary) -> Self {
        Self {
            board: summary.board.clone(),
            state: summary.state.as_str().to_string(),
            session_count: summary.session_count,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LogView {
    pub dir: String,
    #[serde(default)]
    pub current_segment: Option<String>,
    pub segment_bytes: u64,
    pub total_bytes: u64,
    pub segments_rotated: u64,
    #[serde(default)]
    pub input_bytes: u64,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl From<&LoggerStatus> for LogView {
    fn from(status: &LoggerStatus) -> Self {
        Self {
            dir: status.dir.display().to_string(),
            current_segment: status
                .current_segment
                .as_ref()
                .map(|path| path.display().to_string()),
            segment_bytes: status.segment_bytes,
            total_bytes: status.total_bytes,
            segments_rotated: status.segments_rotated,
            input_bytes: status.input_bytes,
            last_error: status.last_error.clone(),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ProxyView {
    pub board: String,
    pub state: String,
    pub endpoint: String,
    pub policy: String,
    pub session_count: usize,
    #[serde(default)]
    pub write_holder: Option<String>,
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub listen_addr: Option<String>,
    pub started_at: String,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub log: Option<LogView>,
}

impl From<&ProxyStatus> for ProxyView {
    fn from(status: &ProxyStatus) -> Self {
        Self {
            board: status.board.clone(),
            state: status.state.as_str().to_string(),
            endpoint: status.endpoint.to_string(),
            policy: status.policy.as_str().to_string(),
            session_count: status.session_count,
            write_holder: status.write_holder.map(|id| id.to_string()),
            reconnect_attempts: status.reconnect_attempts,
            listen_addr: status.listen_addr.map(|addr| addr.to_string()),
            started_at: format_time(status.started_at),
            last_error: status.last_error.clone(),
            log: status.log.as_ref().map(LogView::from),
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    pub session_id: String,
    pub role: String,
    pub grant: String,
    pub can_write: bool,
    pub transport: String,
    pub attached_at: String,
    pub idle_ms: u64,
}

impl From<&SessionInfo> for SessionView {
    fn from(info: &SessionInfo) -> Self {
        let grant = match serde_json::to_value(info.grant) {
            Ok(serde_json::Value::String(grant)) => grant,
            _ => format!("{:?}", info.grant),
        };
        Self {
            session_id: info.id.to_string(),
            role: info.role.as_str().to_string(),
            grant,
            can_write: info.can_write,
            transport: info.transport.clone(),
            attached_at: format_time(info.attached_at),
            idle_ms: info.idle_ms,
        }
    }
}
