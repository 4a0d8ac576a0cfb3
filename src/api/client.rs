//! Purpose: Blocking HTTP client for the labctl v0 control API.
//! Exports: `ControlClient`, `StartRequest`, `decode_error_body`.
//! Role: What the CLI uses to talk to a running `labctl serve`.
//! Invariants: Error envelopes from the server map back to the same `ErrorKind`.
//! Invariants: The base URL carries no path; routes are built from fixed segments.
#![allow(clippy::result_large_err)]

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use super::views::{ProxySummaryView, ProxyView, SessionView};
use crate::core::error::{Error, ErrorKind};
use crate::core::session::Role;

type ApiResult<T> = Result<T, Error>;

pub const DEFAULT_SERVER: &str = "http://127.0.0.1:7300";

#[derive(Clone)]
pub struct ControlClient {
    inner: Arc<ControlClientInner>,
}

struct ControlClientInner {
    base_url: Url,
    agent: ureq::Agent,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StartRequest {
    pub board: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy: Option<String>,
    /// Overrides the registry lookup, e.g. `tcp:127.0.0.1:4001`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Deserialize)]
struct ProxyEnvelope {
    proxy: ProxyView,
}

#[derive(Deserialize)]
struct ProxiesEnvelope {
    proxies: Vec<ProxySummaryView>,
}

#[derive(Deserialize)]
struct SessionsEnvelope {
    sessions: Vec<SessionView>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: RemoteError,
}

#[derive(Deserialize)]
struct RemoteError {
    kind: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    hint: Option<String>,
    #[serde(default)]
    board: Option<String>,
    #[serde(default)]
    session: Option<String>,
}

impl ControlClient {
    pub fn new(base_url: impl Into<String>) -> ApiResult<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(std::time::Duration::from_secs(5))
            .build();
        Ok(Self {
            inner: Arc::new(ControlClientInner { base_url, agent }),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    pub fn list(&self) -> ApiResult<Vec<ProxySummaryView>> {
        let url = build_url(self.base_url(), &["v0", "proxies"])?;
        let envelope: ProxiesEnvelope = self.request_json("GET", &url, &())?;
        Ok(envelope.proxies)
    }

    pub fn start(&self, request: &StartRequest) -> ApiResult<ProxyView> {
        let url = build_url(self.base_url(), &["v0", "proxies"])?;
        let envelope: ProxyEnvelope = self.request_json("POST", &url, request)?;
        Ok(envelope.proxy)
    }

    pub fn stop(&self, board: &str) -> ApiResult<()> {
        let url = build_url(self.base_url(), &["v0", "proxies", board])?;
        let _: serde_json::Value = self.request_json("DELETE", &url, &())?;
        Ok(())
    }

    pub fn status(&self, board: &str) -> ApiResult<ProxyView> {
        let url = build_url(self.base_url(), &["v0", "proxies", board])?;
        let envelope: ProxyEnvelope = self.request_json("GET", &url, &())?;
        Ok(envelope.proxy)
    }

    pub fn sessions(&self, board: &str) -> ApiResult<Vec<SessionView>> {
        let url = build_url(self.base_url(), &["v0", "proxies", board, "sessions"])?;
        let envelope: SessionsEnvelope = self.request_json("GET", &url, &())?;
        Ok(envelope.sessions)
    }

    pub fn reconnect(&self, board: &str) -> ApiResult<ProxyView> {
        let url = build_url(self.base_url(), &["v0", "proxies", board, "reconnect"])?;
        let envelope: ProxyEnvelope = self.request_json("POST", &url, &())?;
        Ok(envelope.proxy)
    }

    /// WebSocket URL of the console bridge, `ws://` or `wss://` matching the server scheme.
    pub fn console_url(&self, board: &str, role: Role) -> ApiResult<Url> {
        let mut url = build_url(self.base_url(), &["v0", "proxies", board, "console"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme).map_err(|_| {
            Error::new(ErrorKind::Internal).with_message("failed to derive websocket url")
        })?;
        url.query_pairs_mut().append_pair("role", role.as_str());
        Ok(url)
    }

    fn request_json<T, R>(&self, method: &str, url: &Url, body: &T) -> ApiResult<R>
    where
        T: Serialize,
        R: DeserializeOwned,
    {
        let request = self
            .inner
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        let response = if method == "GET" || method == "DELETE" {
            request.call()
        } else {
            let payload = serde_json::to_string(body).map_err(|err| {
                Error::new(ErrorKind::Internal)
                    .with_message("failed to encode request json")
                    .with_source(err)
            })?;
            request
                .set("Content-Type", "application/json")
                .send_string(&payload)
        };

        match response {
            Ok(resp) => read_json_response(resp),
            Err(ureq::Error::Status(code, resp)) => Err(parse_error_response(code, resp)),
            Err(ureq::Error::Transport(err)) => Err(Error::new(ErrorKind::Io)
                .with_message(format!("request to {} failed", self.base_url()))
                .with_hint("Is `labctl serve` running? Use --server to point at it.")
                .with_source(err)),
        }
    }
}

fn normalize_base_url(raw: String) -> ApiResult<Url> {
    let mut url = Url::parse(&raw).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message("invalid server url")
            .with_source(err)
    })?;
    let scheme = url.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Error::new(ErrorKind::Usage).with_message("server url must use http or https"));
    }
    if url.path() != "/" && !url.path().is_empty() {
        return Err(Error::new(ErrorKind::Usage).with_message("server url must not include a path"));
    }
    url.set_path("/");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

fn build_url(base_url: &Url, segments: &[&str]) -> ApiResult<Url> {
    let mut url = base_url.clone();
    {
        let mut path = url.path_segments_mut().map_err(|_| {
            Error::new(ErrorKind::Usage).with_message("server url cannot be a base")
        })?;
        path.clear();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

fn read_json_response<R>(response: ureq::Response) -> ApiResult<R>
where
    R: DeserializeOwned,
{
    let body = response.into_string().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to read response body")
            .with_source(err)
    })?;
    serde_json::from_str(&body).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("invalid response json")
            .with_source(err)
    })
}

fn parse_error_response(status: u16, response: ureq::Response) -> Error {
    let body = response.into_string().unwrap_or_default();
    decode_error_body(status, body.as_bytes())
}

/// Rebuilds an `Error` from a non-2xx control API response, falling back to the status code
/// when the body is not an error envelope.
pub fn decode_error_body(status: u16, body: &[u8]) -> Error {
    if let Ok(envelope) = serde_json::from_slice::<ErrorEnvelope>(body) {
        return error_from_remote(envelope.error, status);
    }
    Error::new(error_kind_from_status(status)).with_message(format!("server error status {status}"))
}

fn error_from_remote(remote: RemoteError, status: u16) -> Error {
    let kind = ErrorKind::parse(&remote.kind).unwrap_or_else(|| error_kind_from_status(status));
    let mut err = Error::new(kind);
    if let Some(message) = remote.message {
        err = err.with_message(message);
    }
    if let Some(hint) = remote.hint {
        err = err.with_hint(hint);
    }
    if let Some(board) = remote.board {
        err = err.with_board(board);
    }
    if let Some(session) = remote.session.and_then(|value| value.trim_start_matches('s').parse().ok()) {
        err = err.with_session(session);
    }
    err
}

fn error_kind_from_status(status: u16) -> ErrorKind {
    match status {
        400 => ErrorKind::Usage,
        404 => ErrorKind::NotFound,
        409 => ErrorKind::NotRunning,
        423 => ErrorKind::NotWriteHolder,
        502 => ErrorKind::Connection,
        503 => ErrorKind::CapacityExceeded,
        500..=599 => ErrorKind::Internal,
        _ => ErrorKind::Io,
    }
}
