//! Purpose: Provide the HTTP/JSON control API and the WebSocket console bridge for labctl.
//! Exports: `ServeConfig`, `serve`.
//! Role: Axum daemon owning one `Supervisor`; the CLI talks to it through `ControlClient`.
//! Invariants: JSON envelopes (`proxy`, `proxies`, `sessions`, `error`) and error kinds are stable.
//! Invariants: Shutdown stops every proxy before the listener closes.
//! Notes: Console bytes travel as binary frames; control and notices are JSON text frames.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use labctl::api::{
    Error, ErrorKind, FileRegistry, ProxySummaryView, ProxyView, Role, Session, SessionInput,
    SessionView, StartRequest, Supervisor, UpstreamEndpoint, WritePolicy,
};
use labctl::config::Config;

/// How long a detached console may keep flushing its queued tail to a slow browser.
const DETACH_GRACE: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub bind: SocketAddr,
    pub config: Config,
}

#[derive(Clone)]
struct AppState {
    supervisor: Arc<Supervisor>,
}

pub async fn serve(config: ServeConfig) -> Result<(), Error> {
    init_tracing(&config.config.log_level);

    let settings = config.config.proxy_settings()?;
    let registry = Arc::new(FileRegistry::new(config.config.registry.clone()));
    let supervisor = Arc::new(Supervisor::new(settings, registry));
    let state = Arc::new(AppState {
        supervisor: Arc::clone(&supervisor),
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v0/proxies", post(start_proxy).get(list_proxies))
        .route("/v0/proxies/:board", get(proxy_status).delete(stop_proxy))
        .route("/v0/proxies/:board/reconnect", post(reconnect_proxy))
        .route("/v0/proxies/:board/sessions", get(list_sessions))
        .route("/v0/proxies/:board/console", get(console))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to bind control api on {}", config.bind))
                .with_source(err)
        })?;
    tracing::info!(bind = %config.bind, registry = %config.config.registry.display(), "labctl serve listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server = axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown_rx.await;
        })
        .into_future();
    tokio::pin!(server);

    tokio::select! {
        result = &mut server => {
            supervisor.shutdown().await;
            result.map_err(|err| {
                Error::new(ErrorKind::Io)
                    .with_message("server failed")
                    .with_source(err)
            })?;
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown requested; stopping proxies");
            supervisor.shutdown().await;
            let _ = shutdown_tx.send(());
            match tokio::time::timeout(Duration::from_secs(10), &mut server).await {
                Ok(result) => result.map_err(|err| {
                    Error::new(ErrorKind::Io)
                        .with_message("server failed")
                        .with_source(err)
                })?,
                Err(_) => {
                    return Err(Error::new(ErrorKind::Io).with_message("server shutdown timed out"));
                }
            }
        }
    };
    Ok(())
}

fn init_tracing(default_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler");
        signal.recv().await;
    };
    #[cfg(unix)]
    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    #[cfg(not(unix))]
    ctrl_c.await;
}

async fn healthz() -> Response {
    json_response(json!({ "ok": true }))
}

async fn list_proxies(State(state): State<Arc<AppState>>) -> Response {
    let proxies: Vec<ProxySummaryView> = state
        .supervisor
        .list()
        .iter()
        .map(ProxySummaryView::from)
        .collect();
    json_response(json!({ "proxies": proxies }))
}

async fn start_proxy(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartRequest>,
) -> Response {
    let policy = match payload.policy.as_deref().map(str::parse::<WritePolicy>).transpose() {
        Ok(policy) => policy,
        Err(err) => return error_response(err),
    };
    let started = match payload.endpoint.as_deref() {
        Some(endpoint) => match UpstreamEndpoint::parse(endpoint) {
            Ok(endpoint) => state.supervisor.start(&payload.board, endpoint, policy).await,
            Err(err) => return error_response(err),
        },
        None => {
            state
                .supervisor
                .start_from_registry(&payload.board, policy)
                .await
        }
    };
    if let Err(err) = started {
        return error_response(err);
    }
    proxy_response(&state, &payload.board)
}

async fn proxy_status(
    State(state): State<Arc<AppState>>,
    AxumPath(board): AxumPath<String>,
) -> Response {
    proxy_response(&state, &board)
}

async fn stop_proxy(
    State(state): State<Arc<AppState>>,
    AxumPath(board): AxumPath<String>,
) -> Response {
    match state.supervisor.stop(&board).await {
        Ok(()) => json_response(json!({ "ok": true })),
        Err(err) => error_response(err),
    }
}

async fn reconnect_proxy(
    State(state): State<Arc<AppState>>,
    AxumPath(board): AxumPath<String>,
) -> Response {
    if let Err(err) = state.supervisor.reconnect(&board) {
        return error_response(err);
    }
    proxy_response(&state, &board)
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    AxumPath(board): AxumPath<String>,
) -> Response {
    match state.supervisor.list_sessions(&board) {
        Ok(sessions) => {
            let sessions: Vec<SessionView> = sessions.iter().map(SessionView::from).collect();
            json_response(json!({ "sessions": sessions }))
        }
        Err(err) => error_response(err),
    }
}

fn proxy_response(state: &AppState, board: &str) -> Response {
    match state.supervisor.status(board) {
        Ok(status) => json_response(json!({ "proxy": ProxyView::from(&status) })),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Deserialize)]
struct ConsoleQuery {
    role: Option<String>,
}

async fn console(
    State(state): State<Arc<AppState>>,
    AxumPath(board): AxumPath<String>,
    Query(query): Query<ConsoleQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let role = match query.role.as_deref().map(str::parse::<Role>).transpose() {
        Ok(role) => role.unwrap_or_default(),
        Err(err) => return error_response(err),
    };
    match state.supervisor.attach(&board, role, "websocket") {
        Ok(session) => ws.on_upgrade(move |socket| bridge_console(socket, session)),
        Err(err) => error_response(err),
    }
}

#[derive(Debug, Eq, PartialEq)]
enum Control {
    RequestWrite,
    Ping,
}

/// Text frames that parse as `{"type": ...}` objects are control messages; anything else is input.
fn control_message(text: &str) -> Option<Control> {
    let value: Value = serde_json::from_str(text).ok()?;
    match value.get("type")?.as_str()? {
        "request_write" => Some(Control::RequestWrite),
        "ping" => Some(Control::Ping),
        _ => None,
    }
}

fn console_notice(kind: &str, message: impl Into<String>) -> Message {
    Message::Text(
        json!({
            "type": "notice",
            "kind": kind,
            "message": message.into(),
        })
        .to_string(),
    )
}

async fn bridge_console(mut socket: WebSocket, session: Session) {
    let board = session.board().to_string();
    let session_id = session.id();
    let (mut output, input) = session.split();
    let stalled = output.detached(DETACH_GRACE);
    tokio::pin!(stalled);

    let hello = json!({
        "type": "notice",
        "kind": "attached",
        "board": board,
        "session": session_id.to_string(),
        "can_write": input.can_write(),
    });
    let sent = tokio::select! {
        sent = socket.send(Message::Text(hello.to_string())) => sent.is_ok(),
        () = &mut stalled => false,
    };
    if !sent {
        input.detach();
        return;
    }

    let mut rejected = false;
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => {
                    let sent = tokio::select! {
                        sent = socket.send(Message::Binary(chunk.to_vec())) => sent.is_ok(),
                        () = &mut stalled => false,
                    };
                    if !sent {
                        input.detach();
                        break;
                    }
                }
                None => {
                    let reason = output
                        .detach_reason()
                        .map(|reason| reason.as_str())
                        .unwrap_or("closed");
                    let detached = json!({
                        "type": "notice",
                        "kind": "detached",
                        "reason": reason,
                        "message": format!("session closed: {reason}"),
                    });
                    tokio::select! {
                        _ = async {
                            socket.send(Message::Text(detached.to_string())).await?;
                            socket.send(Message::Close(None)).await
                        } => {}
                        () = &mut stalled => {}
                    }
                    break;
                }
            },
            incoming = socket.recv() => {
                let reply = match incoming {
                    Some(Ok(Message::Binary(bytes))) => submit_input(&input, &bytes, &mut rejected).await,
                    Some(Ok(Message::Text(text))) => match control_message(&text) {
                        Some(Control::RequestWrite) => {
                            rejected = false;
                            Some(match input.request_write() {
                                Ok(()) => console_notice("write_granted", "write access granted"),
                                Err(err) => console_notice(err.kind().as_str(), describe(&err)),
                            })
                        }
                        Some(Control::Ping) => {
                            input.touch();
                            Some(Message::Text(json!({ "type": "pong" }).to_string()))
                        }
                        None => submit_input(&input, text.as_bytes(), &mut rejected).await,
                    },
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        input.detach();
                        break;
                    }
                    Some(Ok(_)) => {
                        input.touch();
                        None
                    }
                };
                if let Some(reply) = reply {
                    let sent = tokio::select! {
                        sent = socket.send(reply) => sent.is_ok(),
                        () = &mut stalled => false,
                    };
                    if !sent {
                        input.detach();
                        break;
                    }
                }
            }
        }
    }
    tracing::debug!(board = %board, session = %session_id, "web console closed");
}

async fn submit_input(input: &SessionInput, bytes: &[u8], rejected: &mut bool) -> Option<Message> {
    match input.submit(bytes).await {
        Ok(_) => {
            *rejected = false;
            None
        }
        Err(err) if err.kind() == ErrorKind::NotWriteHolder => {
            if std::mem::replace(rejected, true) {
                return None;
            }
            Some(console_notice(err.kind().as_str(), describe(&err)))
        }
        Err(err) => Some(console_notice(err.kind().as_str(), describe(&err))),
    }
}

fn describe(err: &Error) -> String {
    err.message().unwrap_or(err.kind().as_str()).to_string()
}

#[derive(Debug, Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    kind: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    board: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<String>,
}

fn json_response(payload: serde_json::Value) -> Response {
    let mut response = Json(payload).into_response();
    response
        .headers_mut()
        .insert("labctl-version", HeaderValue::from_static("0"));
    response
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Usage => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::AlreadyRunning | ErrorKind::NotRunning => StatusCode::CONFLICT,
        ErrorKind::CapacityExceeded => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::NotWriteHolder => StatusCode::LOCKED,
        ErrorKind::Connection | ErrorKind::Write => StatusCode::BAD_GATEWAY,
        ErrorKind::Logging | ErrorKind::Io | ErrorKind::Internal => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn error_response(err: Error) -> Response {
    let status = status_for(err.kind());
    if status.is_server_error() {
        tracing::warn!(error = %err, "request failed");
    }
    let body = ErrorEnvelope {
        error: ErrorBody {
            kind: err.kind().as_str().to_string(),
            message: describe(&err),
            hint: err.hint().map(str::to_string),
            board: err.board().map(str::to_string),
            session: err.session().map(|session| format!("s{session}")),
        },
    };
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert("labctl-version", HeaderValue::from_static("0"));
    response
}
