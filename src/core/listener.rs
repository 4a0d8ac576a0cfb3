//! Purpose: Serve a proxy's sessions over plain TCP (telnet/nc style consoles).
//! Exports: `ListenConfig`, `EscapeParser`, `ConsoleInput`, `ESCAPE_BYTE`, `REFUSED_PREFIX`,
//!          `CLOSED_PREFIX`.
//! Role: One listener per proxy; every accepted connection becomes a writer-capable session.
//! Invariants: Rejected input is never forwarded; the client hears about it once per streak.
//! Invariants: The accept loop ends when the proxy is cancelled; connections end when their
//!             session is detached, even if the peer has stopped reading.
//! Invariants: Connection tasks are owned by the listener and never outlive it.
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::core::error::{Error, ErrorKind};
use crate::core::hub::Hub;
use crate::core::session::{Role, SessionInput};

/// Ctrl-]
pub const ESCAPE_BYTE: u8 = 0x1d;

/// First bytes a refused connection receives: `<prefix><ErrorKind>: <message>]\r\n`.
pub const REFUSED_PREFIX: &[u8] = b"[labctl: session refused: ";
/// Last line a session closed by the proxy receives: `<prefix><reason>]\r\n`.
pub const CLOSED_PREFIX: &[u8] = b"[labctl: session closed: ";

/// How long a detached session may keep writing its queued tail to a slow peer.
const DETACH_GRACE: Duration = Duration::from_millis(500);
/// How long a stopping listener waits for its connections before aborting them.
const CONNECTION_DRAIN: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct ListenConfig {
    pub host: String,
    /// First port tried; `0` asks the OS for an ephemeral port.
    pub base_port: u16,
    pub port_range: u16,
    pub banner: bool,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            base_port: 0,
            port_range: 1,
            banner: true,
        }
    }
}

/// Binds the first free port in `[base_port, base_port + port_range)`.
pub(crate) async fn bind(config: &ListenConfig) -> Result<TcpListener, Error> {
    if config.base_port == 0 {
        return TcpListener::bind((config.host.as_str(), 0))
            .await
            .map_err(|err| bind_error(config, err));
    }
    let last = config
        .base_port
        .saturating_add(config.port_range.max(1) - 1);
    let mut last_err = None;
    for port in config.base_port..=last {
        match TcpListener::bind((config.host.as_str(), port)).await {
            Ok(listener) => return Ok(listener),
            Err(err) => last_err = Some(err),
        }
    }
    let err = Error::new(ErrorKind::Io)
        .with_message(format!(
            "no free session port in {}:{}-{}",
            config.host, config.base_port, last
        ))
        .with_hint("Widen proxy.port_range or stop unused proxies.");
    Err(match last_err {
        Some(source) => err.with_source(source),
        None => err,
    })
}

fn bind_error(config: &ListenConfig, err: std::io::Error) -> Error {
    Error::new(ErrorKind::Io)
        .with_message(format!("failed to bind session listener on {}", config.host))
        .with_source(err)
}

pub(crate) async fn serve(
    listener: TcpListener,
    hub: Arc<Hub>,
    banner: bool,
    mut cancel: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let hub = Arc::clone(&hub);
                    connections.spawn(async move {
                        if let Err(err) = handle_connection(socket, peer, hub, banner).await {
                            tracing::debug!(%peer, error = %err, "console connection ended with error");
                        }
                    });
                }
                Err(err) => {
                    tracing::warn!(board = %hub.board(), error = %err, "session accept failed");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    // Connections end on their own once the hub closes; stragglers are aborted.
    let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        tracing::debug!(board = %hub.board(), remaining = connections.len(), "aborting console connections");
        connections.shutdown().await;
    }
    tracing::debug!(board = %hub.board(), "session listener stopped");
}

async fn handle_connection(
    mut socket: TcpStream,
    peer: SocketAddr,
    hub: Arc<Hub>,
    banner: bool,
) -> io::Result<()> {
    let _ = socket.set_nodelay(true);
    let session = match hub.attach(Role::Writer, format!("tcp:{peer}")) {
        Ok(session) => session,
        Err(err) => {
            let line = format!(
                "{}{}: {}]\r\n",
                String::from_utf8_lossy(REFUSED_PREFIX),
                err.kind().as_str(),
                describe(&err)
            );
            socket.write_all(line.as_bytes()).await?;
            return socket.shutdown().await;
        }
    };
    let (mut reader, mut writer) = socket.into_split();
    let (mut output, input) = session.split();
    let stalled = output.detached(DETACH_GRACE);
    tokio::pin!(stalled);

    if banner {
        let access = if input.can_write() {
            "write access"
        } else {
            "read-only"
        };
        let line = format!("[labctl: connected to {} ({access})]\r\n", hub.board());
        tokio::select! {
            written = writer.write_all(line.as_bytes()) => written?,
            () = &mut stalled => return Ok(()),
        }
    }

    let mut parser = EscapeParser::default();
    let mut rejected = false;
    let mut buf = [0u8; 1024];
    loop {
        tokio::select! {
            chunk = output.recv() => match chunk {
                Some(chunk) => tokio::select! {
                    written = writer.write_all(&chunk) => written?,
                    () = &mut stalled => break,
                },
                None => {
                    if let Some(reason) = output.detach_reason().filter(|reason| reason.is_unexpected()) {
                        let line = format!("\r\n{}{reason}]\r\n", String::from_utf8_lossy(CLOSED_PREFIX));
                        tokio::select! {
                            written = writer.write_all(line.as_bytes()) => written?,
                            () = &mut stalled => {}
                        }
                    }
                    break;
                }
            },
            read = reader.read(&mut buf) => {
                let n = match read {
                    Ok(0) | Err(_) => {
                        input.detach();
                        break;
                    }
                    Ok(n) => n,
                };
                input.touch();
                let mut quit = false;
                for event in parser.feed(&buf[..n]) {
                    let notice = match event {
                        ConsoleInput::Data(bytes) => submit_notice(&input, &bytes, &mut rejected).await,
                        ConsoleInput::RequestWrite => {
                            rejected = false;
                            Some(match input.request_write() {
                                Ok(()) => "[labctl: write access granted]".to_string(),
                                Err(err) => format!("[labctl: {}]", describe(&err)),
                            })
                        }
                        ConsoleInput::Detach => {
                            quit = true;
                            None
                        }
                    };
                    if let Some(line) = notice {
                        let framed = format!("\r\n{line}\r\n");
                        tokio::select! {
                            written = writer.write_all(framed.as_bytes()) => written?,
                            () = &mut stalled => return Ok(()),
                        }
                    }
                    if quit {
                        break;
                    }
                }
                if quit {
                    input.detach();
                    break;
                }
            }
        }
    }
    writer.shutdown().await
}

async fn submit_notice(input: &SessionInput, bytes: &[u8], rejected: &mut bool) -> Option<String> {
    match input.submit(bytes).await {
        Ok(_) => {
            *rejected = false;
            None
        }
        Err(err) if err.kind() == ErrorKind::NotWriteHolder => {
            if std::mem::replace(rejected, true) {
                return None;
            }
            Some(format!(
                "[labctl: input ignored: {} (Ctrl-] w requests write access)]",
                describe(&err)
            ))
        }
        Err(err) => Some(format!("[labctl: {}]", describe(&err))),
    }
}

fn describe(err: &Error) -> String {
    err.message().unwrap_or(err.kind().as_str()).to_string()
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConsoleInput {
    Data(Vec<u8>),
    RequestWrite,
    Detach,
}

/// Splits raw client input into data and `Ctrl-]` commands.
///
/// `Ctrl-] w` requests the write lock, `Ctrl-] q` detaches and `Ctrl-] Ctrl-]` sends one literal
/// escape byte. Any other byte after the escape is passed through together with the escape.
#[derive(Debug, Default)]
pub struct EscapeParser {
    escaped: bool,
}

impl EscapeParser {
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ConsoleInput> {
        let mut events = Vec::new();
        let mut data = Vec::with_capacity(bytes.len());
        for &byte in bytes {
            if self.escaped {
                self.escaped = false;
                match byte {
                    b'w' | b'W' => {
                        flush_data(&mut data, &mut events);
                        events.push(ConsoleInput::RequestWrite);
                    }
                    b'q' | b'Q' => {
                        flush_data(&mut data, &mut events);
                        events.push(ConsoleInput::Detach);
                    }
                    ESCAPE_BYTE => data.push(ESCAPE_BYTE),
                    other => data.extend_from_slice(&[ESCAPE_BYTE, other]),
                }
            } else if byte == ESCAPE_BYTE {
                self.escaped = true;
            } else {
                data.push(byte);
            }
        }
        flush_data(&mut data, &mut events);
        events
    }
}

fn flush_data(data: &mut Vec<u8>, events: &mut Vec<ConsoleInput>) {
    if !data.is_empty() {
        events.push(ConsoleInput::Data(std::mem::take(data)));
    }
}
