//! Purpose: Client-side handle for one attached console session.
//! Exports: `Session`, `SessionInput`, `SessionOutput`, `SessionId`, `Role`, `DetachReason`,
//!          `SubmitOutcome`, `SessionInfo`.
//! Role: What transports (TCP, WebSocket, in-process callers) hold while attached to a hub.
//! Invariants: Dropping the last handle half detaches the session and releases its write lock.
//! Invariants: Outbound chunks arrive in device order; the stream ends only on detach.
//! Invariants: After the stream ends, `detach_reason` tells an eviction from a deliberate stop.
//! Invariants: `detached(grace)` resolves at most `grace` after the hub drops the session, so a
//!             transport stuck writing to a stalled peer can still be torn down.
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::core::arbiter::Grant;
use crate::core::error::{Error, ErrorKind};
use crate::core::hub::Hub;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits = value.strip_prefix('s').unwrap_or(value);
        digits.parse().map(SessionId).map_err(|_| {
            Error::new(ErrorKind::Usage).with_message(format!("invalid session id `{value}`"))
        })
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    #[default]
    Writer,
    Reader,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Writer => "writer",
            Role::Reader => "reader",
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "writer" | "rw" => Ok(Role::Writer),
            "reader" | "read-only" | "ro" => Ok(Role::Reader),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown session role `{other}`"))
                .with_hint("Use reader or writer.")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DetachReason {
    Client,
    SlowConsumer,
    Idle,
    ProxyStopped,
    UpstreamLost,
}

impl DetachReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DetachReason::Client => "client",
            DetachReason::SlowConsumer => "slow-consumer",
            DetachReason::Idle => "idle",
            DetachReason::ProxyStopped => "proxy-stopped",
            DetachReason::UpstreamLost => "upstream-lost",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let reason = match value {
            "client" => DetachReason::Client,
            "slow-consumer" => DetachReason::SlowConsumer,
            "idle" => DetachReason::Idle,
            "proxy-stopped" => DetachReason::ProxyStopped,
            "upstream-lost" => DetachReason::UpstreamLost,
            _ => return None,
        };
        Some(reason)
    }

    /// True when the proxy dropped the session rather than the client leaving
    /// or an operator stopping the proxy.
    pub fn is_unexpected(self) -> bool {
        matches!(
            self,
            DetachReason::SlowConsumer | DetachReason::Idle | DetachReason::UpstreamLost
        )
    }
}

impl fmt::Display for DetachReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubmitOutcome {
    Forwarded,
    /// Held in the session's line buffer until a line end arrives (queued policy).
    Pending,
}

#[derive(Clone, Debug)]
pub struct SessionInfo {
    pub id: SessionId,
    pub role: Role,
    pub grant: Grant,
    pub can_write: bool,
    pub transport: String,
    pub attached_at: OffsetDateTime,
    pub idle_ms: u64,
}

/// Bytes travelling from a session to the upstream writer.
pub(crate) struct WriteRequest {
    pub(crate) session: SessionId,
    pub(crate) bytes: Bytes,
    pub(crate) reply: oneshot::Sender<Result<(), Error>>,
}

/// Detach state shared between the hub entry and the session handles; the first reason wins.
#[derive(Debug)]
pub(crate) struct SessionShared {
    reason: watch::Sender<Option<DetachReason>>,
}

impl Default for SessionShared {
    fn default() -> Self {
        let (reason, _) = watch::channel(None);
        Self { reason }
    }
}

impl SessionShared {
    pub(crate) fn mark(&self, reason: DetachReason) {
        self.reason.send_if_modified(|slot| {
            if slot.is_some() {
                return false;
            }
            *slot = Some(reason);
            true
        });
    }

    fn reason(&self) -> Option<DetachReason> {
        *self.reason.borrow()
    }

    fn detached(&self, grace: Duration) -> impl Future<Output = ()> + Send + 'static {
        let mut reason = self.reason.subscribe();
        async move {
            let _ = reason.wait_for(Option::is_some).await;
            tokio::time::sleep(grace).await;
        }
    }
}

struct Attachment {
    id: SessionId,
    role: Role,
    grant: Grant,
    hub: Arc<Hub>,
    shared: Arc<SessionShared>,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.hub.detach(self.id, DetachReason::Client);
    }
}

pub struct Session {
    attachment: Arc<Attachment>,
    rx: mpsc::Receiver<Bytes>,
}

impl Session {
    pub(crate) fn new(
        id: SessionId,
        role: Role,
        grant: Grant,
        hub: Arc<Hub>,
        shared: Arc<SessionShared>,
        rx: mpsc::Receiver<Bytes>,
    ) -> Self {
        Self {
            attachment: Arc::new(Attachment {
                id,
                role,
                grant,
                hub,
                shared,
            }),
            rx,
        }
    }

    pub fn id(&self) -> SessionId {
        self.attachment.id
    }

    pub fn role(&self) -> Role {
        self.attachment.role
    }

    pub fn grant(&self) -> Grant {
        self.attachment.grant
    }

    pub fn board(&self) -> &str {
        self.attachment.hub.board()
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub async fn submit(&self, bytes: &[u8]) -> Result<SubmitOutcome, Error> {
        submit(&self.attachment, bytes).await
    }

    pub fn request_write(&self) -> Result<(), Error> {
        self.attachment.hub.request_write(self.attachment.id)
    }

    pub fn can_write(&self) -> bool {
        self.attachment.hub.can_write(self.attachment.id)
    }

    pub fn touch(&self) {
        self.attachment.hub.touch(self.attachment.id);
    }

    pub fn detach_reason(&self) -> Option<DetachReason> {
        self.attachment.shared.reason()
    }

    /// Resolves `grace` after the hub has detached this session.
    pub fn detached(&self, grace: Duration) -> impl Future<Output = ()> + Send + 'static {
        self.attachment.shared.detached(grace)
    }

    pub fn detach(self) {
        self.attachment.hub.detach(self.attachment.id, DetachReason::Client);
    }

    pub fn split(self) -> (SessionOutput, SessionInput) {
        let input = SessionInput {
            attachment: Arc::clone(&self.attachment),
        };
        let output = SessionOutput {
            attachment: self.attachment,
            rx: self.rx,
        };
        (output, input)
    }

    pub fn into_stream(self) -> (ReceiverStream<Bytes>, SessionInput) {
        let (output, input) = self.split();
        (ReceiverStream::new(output.rx), input)
    }
}

/// Receiving half produced by [`Session::split`].
pub struct SessionOutput {
    attachment: Arc<Attachment>,
    rx: mpsc::Receiver<Bytes>,
}

impl SessionOutput {
    pub fn id(&self) -> SessionId {
        self.attachment.id
    }

    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn detach_reason(&self) -> Option<DetachReason> {
        self.attachment.shared.reason()
    }

    /// Resolves `grace` after the hub has detached this session. Transports race outbound socket
    /// writes against it; the queued tail still drains to a peer that keeps reading.
    pub fn detached(&self, grace: Duration) -> impl Future<Output = ()> + Send + 'static {
        self.attachment.shared.detached(grace)
    }
}

/// Sending half produced by [`Session::split`].
#[derive(Clone)]
pub struct SessionInput {
    attachment: Arc<Attachment>,
}

impl SessionInput {
    pub fn id(&self) -> SessionId {
        self.attachment.id
    }

    pub fn role(&self) -> Role {
        self.attachment.role
    }

    pub async fn submit(&self, bytes: &[u8]) -> Result<SubmitOutcome, Error> {
        submit(&self.attachment, bytes).await
    }

    pub fn request_write(&self) -> Result<(), Error> {
        self.attachment.hub.request_write(self.attachment.id)
    }

    pub fn can_write(&self) -> bool {
        self.attachment.hub.can_write(self.attachment.id)
    }

    pub fn touch(&self) {
        self.attachment.hub.touch(self.attachment.id);
    }

    pub fn detach(&self) {
        self.attachment.hub.detach(self.attachment.id, DetachReason::Client);
    }

    pub fn detach_reason(&self) -> Option<DetachReason> {
        self.attachment.shared.reason()
    }
}

async fn submit(attachment: &Attachment, bytes: &[u8]) -> Result<SubmitOutcome, Error> {
    let hub = &attachment.hub;
    let Some(forward) = hub.submit(attachment.id, bytes)? else {
        return Ok(SubmitOutcome::Pending);
    };
    let (reply, result) = oneshot::channel();
    let request = WriteRequest {
        session: attachment.id,
        bytes: forward,
        reply,
    };
    let stopped = || {
        Error::new(ErrorKind::NotRunning)
            .with_message("proxy stopped")
            .with_board(hub.board())
            .with_session(attachment.id.get())
    };
    hub.writes().send(request).await.map_err(|_| stopped())?;
    result.await.map_err(|_| stopped())??;
    Ok(SubmitOutcome::Forwarded)
}

#[cfg(test)]
mod tests {
    use super::{DetachReason, Role, SessionId};
    use crate::core::error::ErrorKind;

    #[test]
    fn session_id_round_trips_display() {
        let id = SessionId::new(42);
        assert_eq!(id.to_string(), "s42");
        assert_eq!("s42".parse::<SessionId>().expect("id"), id);
        assert_eq!("42".parse::<SessionId>().expect("id"), id);
        assert_eq!("sx".parse::<SessionId>().expect_err("bad").kind(), ErrorKind::Usage);
    }

    #[test]
    fn role_parsing_and_reason_classes() {
        assert_eq!("read-only".parse::<Role>().expect("role"), Role::Reader);
        assert_eq!("writer".parse::<Role>().expect("role"), Role::Writer);
        assert!(DetachReason::SlowConsumer.is_unexpected());
        assert!(DetachReason::UpstreamLost.is_unexpected());
        assert!(!DetachReason::ProxyStopped.is_unexpected());
        assert!(!DetachReason::Client.is_unexpected());
    }
}
