//! Purpose: Pipe the local terminal to a board console for `labctl console`.
//! Exports: `attach`, `watch`, `session_addr`, `ConsoleOutcome`.
//! Role: Blocking client side of the TCP session listener and the web console bridge.
//! Invariants: Device bytes reach stdout verbatim; proxy notices surface as `Notice`s.
//! Invariants: stdin EOF detaches the writer session; nothing is buffered past it.
//! Invariants: A refusal is recognized only when it is the whole transcript; a closure only
//!             when it is the final line. Device text carrying either marker stays device text.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::thread;

use bstr::ByteSlice;
use serde_json::{Map, Value};
use tungstenite::Message;

use labctl::api::{
    CLOSED_PREFIX, ControlClient, DetachReason, Error, ErrorKind, ProxyView, REFUSED_PREFIX, Role,
    decode_error_body,
};
use labctl::notice::Notice;

const HEAD_BYTES: usize = 256;
const TAIL_BYTES: usize = 256;

pub(super) struct ConsoleOutcome {
    pub(super) notice: Option<Notice>,
}

/// Address of the proxy's TCP session listener, reachable from this host.
pub(super) fn session_addr(client: &ControlClient, proxy: &ProxyView) -> Result<SocketAddr, Error> {
    let raw = proxy.listen_addr.as_deref().ok_or_else(|| {
        Error::new(ErrorKind::NotRunning)
            .with_message(format!("proxy for {} has no session listener", proxy.board))
            .with_board(proxy.board.clone())
    })?;
    let addr: SocketAddr = raw.parse().map_err(|_| {
        Error::new(ErrorKind::Internal).with_message(format!("invalid listen address `{raw}`"))
    })?;
    if !addr.ip().is_unspecified() {
        return Ok(addr);
    }
    let host = client.base_url().host_str().unwrap_or("127.0.0.1");
    (host, addr.port())
        .to_socket_addrs()
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message(format!("failed to resolve {host}"))
                .with_source(err)
        })?
        .next()
        .ok_or_else(|| Error::new(ErrorKind::Io).with_message(format!("no address for {host}")))
}

/// Writer-capable session over the proxy's TCP listener.
pub(super) fn attach(board: &str, addr: SocketAddr) -> Result<ConsoleOutcome, Error> {
    let stream = TcpStream::connect(addr).map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message(format!("failed to connect to {addr}"))
            .with_hint("Check that the proxy is running with `labctl proxy status`.")
            .with_board(board)
            .with_source(err)
    })?;
    let mut upstream = stream.try_clone().map_err(|err| {
        Error::new(ErrorKind::Io)
            .with_message("failed to clone console socket")
            .with_source(err)
    })?;

    let _input = thread::Builder::new()
        .name("labctl-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; 4096];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if upstream.write_all(&buf[..n]).is_err() {
                            return;
                        }
                    }
                }
            }
            let _ = upstream.shutdown(Shutdown::Write);
        })
        .map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to spawn stdin thread")
                .with_source(err)
        })?;

    let transcript = pump_output(stream)?;
    if let Some((kind, message)) = refusal(&transcript) {
        return Err(Error::new(kind)
            .with_message(format!("session refused: {message}"))
            .with_board(board));
    }
    let notice = closing_reason(&transcript.tail)
        .and_then(|reason| detach_notice(board, None, &reason));
    Ok(ConsoleOutcome { notice })
}

/// First and last bytes of a console connection's output.
#[derive(Debug, Default)]
struct Transcript {
    head: Vec<u8>,
    tail: Vec<u8>,
    total: usize,
}

impl Transcript {
    fn push(&mut self, bytes: &[u8]) {
        self.total += bytes.len();
        if self.head.len() < HEAD_BYTES {
            let room = HEAD_BYTES - self.head.len();
            self.head.extend_from_slice(&bytes[..bytes.len().min(room)]);
        }
        self.tail.extend_from_slice(bytes);
        if self.tail.len() > TAIL_BYTES {
            self.tail.drain(..self.tail.len() - TAIL_BYTES);
        }
    }
}

/// Copies the socket to stdout until EOF.
fn pump_output(mut stream: TcpStream) -> Result<Transcript, Error> {
    let mut stdout = io::stdout().lock();
    let mut buf = [0u8; 4096];
    let mut transcript = Transcript::default();
    loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == io::ErrorKind::ConnectionReset => break,
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("console connection failed")
                    .with_source(err));
            }
        };
        write_stdout(&mut stdout, &buf[..n])?;
        transcript.push(&buf[..n]);
    }
    Ok(transcript)
}

/// The listener refuses by writing one line and closing: `<prefix><Kind>: <message>]\r\n`.
fn refusal(transcript: &Transcript) -> Option<(ErrorKind, String)> {
    if transcript.total != transcript.head.len() {
        return None;
    }
    let body = transcript
        .head
        .strip_prefix(REFUSED_PREFIX)?
        .strip_suffix(b"]\r\n")?;
    if body.contains_str("\r\n") {
        return None;
    }
    let body = body.to_str_lossy();
    match body.split_once(": ") {
        Some((kind, message)) => match ErrorKind::parse(kind) {
            Some(kind) => Some((kind, message.to_string())),
            None => Some((ErrorKind::CapacityExceeded, body.into_owned())),
        },
        None => Some((ErrorKind::CapacityExceeded, body.into_owned())),
    }
}

/// Reason from a closing line, only when it is the last line the proxy sent.
fn closing_reason(tail: &[u8]) -> Option<String> {
    let trimmed = tail.trim_end_with(|c| c == '\r' || c == '\n');
    let last = match trimmed.rfind_byte(b'\n') {
        Some(pos) => &trimmed[pos + 1..],
        None => trimmed,
    };
    let reason = last.strip_prefix(CLOSED_PREFIX)?.strip_suffix(b"]")?;
    Some(reason.to_str_lossy().into_owned())
}

/// Read-only session over the web console bridge.
pub(super) fn watch(client: &ControlClient, board: &str) -> Result<ConsoleOutcome, Error> {
    let url = client.console_url(board, Role::Reader)?;
    let (mut socket, _response) = tungstenite::connect(url.as_str()).map_err(|err| match err {
        tungstenite::Error::Http(response) => {
            let body = response.body().as_deref().unwrap_or_default();
            decode_error_body(response.status().as_u16(), body)
        }
        other => Error::new(ErrorKind::Io)
            .with_message(format!("failed to open console for {board}"))
            .with_hint("Is `labctl serve` running? Use --server to point at it.")
            .with_board(board)
            .with_source(other),
    })?;

    let mut stdout = io::stdout().lock();
    let mut session = None;
    loop {
        match socket.read() {
            Ok(Message::Binary(bytes)) => write_stdout(&mut stdout, &bytes)?,
            Ok(Message::Text(text)) => match bridge_notice(text.as_str()) {
                Some(BridgeNotice::Attached(id)) => session = Some(id),
                Some(BridgeNotice::Detached(reason)) => {
                    return Ok(ConsoleOutcome {
                        notice: detach_notice(board, session, &reason),
                    });
                }
                None => {}
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => break,
            Err(err) => {
                return Err(Error::new(ErrorKind::Io)
                    .with_message("console connection failed")
                    .with_board(board)
                    .with_source(err));
            }
        }
    }
    Ok(ConsoleOutcome { notice: None })
}

#[derive(Debug, PartialEq, Eq)]
enum BridgeNotice {
    Attached(String),
    Detached(String),
}

fn bridge_notice(text: &str) -> Option<BridgeNotice> {
    let value: Value = serde_json::from_str(text).ok()?;
    if value.get("type")?.as_str()? != "notice" {
        return None;
    }
    match value.get("kind")?.as_str()? {
        "attached" => Some(BridgeNotice::Attached(value.get("session")?.as_str()?.to_string())),
        "detached" => Some(BridgeNotice::Detached(value.get("reason")?.as_str()?.to_string())),
        _ => None,
    }
}

/// Only proxy-initiated drops become notices; a clean detach or stop is silent.
fn detach_notice(board: &str, session: Option<String>, reason: &str) -> Option<Notice> {
    let parsed = DetachReason::parse(reason)?;
    if !parsed.is_unexpected() {
        return None;
    }
    let mut details = Map::new();
    details.insert("reason".to_string(), Value::from(reason));
    Some(Notice {
        kind: "detached".to_string(),
        time: super::notice_time_now(),
        cmd: "console".to_string(),
        board: board.to_string(),
        message: format!("session closed by proxy ({reason})"),
        session,
        reason: Some(reason.to_string()),
        details,
    })
}

fn write_stdout(stdout: &mut impl Write, bytes: &[u8]) -> Result<(), Error> {
    stdout
        .write_all(bytes)
        .and_then(|()| stdout.flush())
        .map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to write stdout")
                .with_source(err)
        })
}
