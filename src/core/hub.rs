//! Purpose: Fan device bytes out to every attached session and gate their input.
//! Exports: `Hub`, `HubLimits`.
//! Role: Owns the session table and the write arbiter behind one mutex.
//! Invariants: attach/detach/deliver/submit are serialized by the same lock, so a chunk reaches
//!             exactly the sessions attached when it was delivered.
//! Invariants: Delivery never blocks: a full outbound queue evicts that session (drop-slow-reader).
//! Invariants: The lock is never held across an `.await`.
//! Invariants: Only client input, write requests and pings count as activity; device output
//!             does not keep an abandoned session alive.
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::core::arbiter::{Admission, Grant, WriteArbiter, WritePolicy};
use crate::core::error::{Error, ErrorKind};
use crate::core::session::{
    DetachReason, Role, Session, SessionId, SessionInfo, SessionShared, WriteRequest,
};

/// Queued-policy line buffers flush once they reach this size even without a line end.
pub const QUEUED_LINE_LIMIT: usize = 4096;

#[derive(Clone, Copy, Debug)]
pub struct HubLimits {
    pub max_sessions: usize,
    pub session_buffer: usize,
}

impl Default for HubLimits {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            session_buffer: 256,
        }
    }
}

struct SessionEntry {
    role: Role,
    grant: Grant,
    transport: String,
    attached_at: OffsetDateTime,
    last_activity: Instant,
    tx: mpsc::Sender<Bytes>,
    shared: Arc<SessionShared>,
    pending: Vec<u8>,
}

struct HubState {
    sessions: BTreeMap<SessionId, SessionEntry>,
    arbiter: WriteArbiter,
    next_id: u64,
}

pub struct Hub {
    board: String,
    limits: HubLimits,
    state: Mutex<HubState>,
    closed: AtomicBool,
    writes: mpsc::Sender<WriteRequest>,
}

impl Hub {
    pub(crate) fn new(
        board: impl Into<String>,
        policy: WritePolicy,
        limits: HubLimits,
        writes: mpsc::Sender<WriteRequest>,
    ) -> Arc<Self> {
        Arc::new(Self {
            board: board.into(),
            limits,
            state: Mutex::new(HubState {
                sessions: BTreeMap::new(),
                arbiter: WriteArbiter::new(policy),
                next_id: 1,
            }),
            closed: AtomicBool::new(false),
            writes,
        })
    }

    pub fn board(&self) -> &str {
        &self.board
    }

    pub fn policy(&self) -> WritePolicy {
        self.lock().arbiter.policy()
    }

    pub(crate) fn writes(&self) -> &mpsc::Sender<WriteRequest> {
        &self.writes
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    pub fn attach(self: &Arc<Self>, role: Role, transport: impl Into<String>) -> Result<Session, Error> {
        let transport = transport.into();
        let mut state = self.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::new(ErrorKind::NotRunning)
                .with_message("proxy is stopping")
                .with_board(self.board.clone()));
        }
        if state.sessions.len() >= self.limits.max_sessions {
            tracing::warn!(board = %self.board, %transport, "rejecting session: capacity reached");
            return Err(Error::new(ErrorKind::CapacityExceeded)
                .with_message(format!(
                    "session limit of {} reached",
                    self.limits.max_sessions
                ))
                .with_board(self.board.clone()));
        }
        let id = SessionId::new(state.next_id);
        state.next_id += 1;
        let grant = state.arbiter.on_attach(id, role);
        let (tx, rx) = mpsc::channel(self.limits.session_buffer);
        let shared = Arc::new(SessionShared::default());
        state.sessions.insert(
            id,
            SessionEntry {
                role,
                grant,
                transport: transport.clone(),
                attached_at: OffsetDateTime::now_utc(),
                last_activity: Instant::now(),
                tx,
                shared: Arc::clone(&shared),
                pending: Vec::new(),
            },
        );
        drop(state);
        tracing::info!(board = %self.board, session = %id, role = role.as_str(), ?grant, %transport, "session attached");
        Ok(Session::new(id, role, grant, Arc::clone(self), shared, rx))
    }

    /// Idempotent; a session that is already gone is ignored.
    pub fn detach(&self, id: SessionId, reason: DetachReason) {
        let mut state = self.lock();
        remove_session(&mut state, &self.board, id, reason);
    }

    /// Offers `bytes` to every attached session; returns the sessions evicted while doing so.
    pub fn deliver(&self, bytes: &Bytes) -> Vec<SessionId> {
        let mut state = self.lock();
        let mut dropped = Vec::new();
        for (id, entry) in state.sessions.iter() {
            match entry.tx.try_send(bytes.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => dropped.push((*id, DetachReason::SlowConsumer)),
                Err(TrySendError::Closed(_)) => dropped.push((*id, DetachReason::Client)),
            }
        }
        let mut evicted = Vec::new();
        for (id, reason) in dropped {
            remove_session(&mut state, &self.board, id, reason);
            if reason == DetachReason::SlowConsumer {
                evicted.push(id);
            }
        }
        evicted
    }

    /// Applies the write policy to `bytes` from session `id` and returns what should go upstream
    /// now; `None` means the bytes are held in the session's line buffer.
    pub(crate) fn submit(&self, id: SessionId, bytes: &[u8]) -> Result<Option<Bytes>, Error> {
        let mut state = self.lock();
        let HubState {
            sessions, arbiter, ..
        } = &mut *state;
        let Some(entry) = sessions.get_mut(&id) else {
            return Err(detached_error(&self.board, id));
        };
        entry.last_activity = Instant::now();
        let admission = arbiter
            .admit(id, entry.role)
            .map_err(|err| err.with_board(self.board.clone()))?;
        match admission {
            Admission::Forward => Ok(Some(Bytes::copy_from_slice(bytes))),
            Admission::Enqueue => {
                entry.pending.extend_from_slice(bytes);
                Ok(take_complete_lines(&mut entry.pending))
            }
        }
    }

    pub fn request_write(&self, id: SessionId) -> Result<(), Error> {
        let mut state = self.lock();
        let HubState {
            sessions, arbiter, ..
        } = &mut *state;
        let Some(entry) = sessions.get_mut(&id) else {
            return Err(detached_error(&self.board, id));
        };
        entry.last_activity = Instant::now();
        arbiter
            .request(id, entry.role)
            .map_err(|err| err.with_board(self.board.clone()))?;
        tracing::info!(board = %self.board, session = %id, "write lock granted on request");
        Ok(())
    }

    pub fn can_write(&self, id: SessionId) -> bool {
        let state = self.lock();
        state
            .sessions
            .get(&id)
            .is_some_and(|entry| state.arbiter.can_write(id, entry.role))
    }

    pub fn touch(&self, id: SessionId) {
        if let Some(entry) = self.lock().sessions.get_mut(&id) {
            entry.last_activity = Instant::now();
        }
    }

    pub fn holder(&self) -> Option<SessionId> {
        self.lock().arbiter.holder()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    pub fn sessions(&self) -> Vec<SessionInfo> {
        let state = self.lock();
        let now = Instant::now();
        state
            .sessions
            .iter()
            .map(|(id, entry)| SessionInfo {
                id: *id,
                role: entry.role,
                grant: entry.grant,
                can_write: state.arbiter.can_write(*id, entry.role),
                transport: entry.transport.clone(),
                attached_at: entry.attached_at,
                idle_ms: now.duration_since(entry.last_activity).as_millis() as u64,
            })
            .collect()
    }

    pub fn evict_idle(&self, timeout: Duration) -> Vec<SessionId> {
        let mut state = self.lock();
        let now = Instant::now();
        let idle: Vec<SessionId> = state
            .sessions
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &idle {
            remove_session(&mut state, &self.board, *id, DetachReason::Idle);
        }
        idle
    }

    /// Detaches everyone and refuses further attaches.
    pub fn close(&self, reason: DetachReason) {
        let mut state = self.lock();
        self.closed.store(true, Ordering::Release);
        let ids: Vec<SessionId> = state.sessions.keys().copied().collect();
        for id in ids {
            remove_session(&mut state, &self.board, id, reason);
        }
    }
}

fn remove_session(state: &mut HubState, board: &str, id: SessionId, reason: DetachReason) {
    let Some(entry) = state.sessions.remove(&id) else {
        return;
    };
    entry.shared.mark(reason);
    let released = state.arbiter.on_detach(id);
    if reason.is_unexpected() {
        tracing::warn!(board, session = %id, reason = reason.as_str(), released, "session detached");
    } else {
        tracing::info!(board, session = %id, reason = reason.as_str(), released, "session detached");
    }
}

fn detached_error(board: &str, id: SessionId) -> Error {
    Error::new(ErrorKind::NotFound)
        .with_message("session is no longer attached")
        .with_board(board)
        .with_session(id.get())
}

fn take_complete_lines(pending: &mut Vec<u8>) -> Option<Bytes> {
    let cut = pending
        .iter()
        .rposition(|byte| *byte == b'\n' || *byte == b'\r')
        .map(|idx| idx + 1);
    let cut = match cut {
        Some(cut) => cut,
        None if pending.len() >= QUEUED_LINE_LIMIT => pending.len(),
        None => return None,
    };
    let rest = pending.split_off(cut);
    let ready = std::mem::replace(pending, rest);
    Some(Bytes::from(ready))
}

#[cfg(test)]
mod tests {
    use super::{Hub, HubLimits, QUEUED_LINE_LIMIT, take_complete_lines};
    use crate::core::arbiter::{Grant, WritePolicy};
    use crate::core::error::ErrorKind;
    use crate::core::session::{DetachReason, Role};
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn hub(policy: WritePolicy, limits: HubLimits) -> Arc<Hub> {
        let (writes, _rx) = mpsc::channel(8);
        Hub::new("rpi4", policy, limits, writes)
    }

    #[tokio::test]
    async fn sessions_receive_only_chunks_delivered_while_attached() {
        let hub = hub(WritePolicy::Open, HubLimits::default());
        let mut early = hub.attach(Role::Reader, "test").expect("early");
        hub.deliver(&Bytes::from_static(b"one"));
        let mut late = hub.attach(Role::Reader, "test").expect("late");
        hub.deliver(&Bytes::from_static(b"two"));
        hub.detach(early.id(), DetachReason::Client);
        hub.deliver(&Bytes::from_static(b"three"));

        assert_eq!(early.recv().await.expect("one"), "one");
        assert_eq!(early.recv().await.expect("two"), "two");
        assert!(early.recv().await.is_none());
        assert_eq!(early.detach_reason(), Some(DetachReason::Client));

        assert_eq!(late.recv().await.expect("two"), "two");
        assert_eq!(late.recv().await.expect("three"), "three");
    }

    #[tokio::test]
    async fn full_queue_evicts_only_the_slow_session() {
        let limits = HubLimits {
            max_sessions: 4,
            session_buffer: 2,
        };
        let hub = hub(WritePolicy::Open, limits);
        let mut slow = hub.attach(Role::Reader, "slow").expect("slow");
        let mut fast = hub.attach(Role::Reader, "fast").expect("fast");

        let mut evicted = Vec::new();
        for idx in 0..4u8 {
            evicted.extend(hub.deliver(&Bytes::from(vec![idx])));
            assert_eq!(fast.recv().await.expect("fast chunk")[0], idx);
        }
        assert_eq!(evicted, vec![slow.id()]);
        assert_eq!(hub.session_count(), 1);

        assert_eq!(slow.recv().await.expect("buffered")[0], 0);
        assert_eq!(slow.recv().await.expect("buffered")[0], 1);
        assert!(slow.recv().await.is_none());
        assert_eq!(slow.detach_reason(), Some(DetachReason::SlowConsumer));
    }

    #[test]
    fn capacity_is_enforced_and_freed_on_detach() {
        let limits = HubLimits {
            max_sessions: 1,
            session_buffer: 4,
        };
        let hub = hub(WritePolicy::FirstWriterWins, limits);
        let first = hub.attach(Role::Writer, "a").expect("first");
        let err = hub.attach(Role::Reader, "b").err().expect("full");
        assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
        drop(first);
        assert_eq!(hub.session_count(), 0);
        hub.attach(Role::Reader, "c").expect("room again");
    }

    #[test]
    fn holder_detach_releases_lock_without_promotion() {
        let hub = hub(WritePolicy::FirstWriterWins, HubLimits::default());
        let first = hub.attach(Role::Writer, "a").expect("first");
        let second = hub.attach(Role::Writer, "b").expect("second");
        assert_eq!(first.grant(), Grant::Holder);
        assert_eq!(second.grant(), Grant::Downgraded);
        assert_eq!(hub.holder(), Some(first.id()));

        first.detach();
        assert_eq!(hub.holder(), None);
        assert!(!second.can_write());
        second.request_write().expect("request");
        assert_eq!(hub.holder(), Some(second.id()));
    }

    #[test]
    fn queued_submissions_flush_whole_lines() {
        let hub = hub(WritePolicy::Queued, HubLimits::default());
        let session = hub.attach(Role::Writer, "a").expect("attach");
        assert_eq!(hub.submit(session.id(), b"ech").expect("submit"), None);
        let ready = hub.submit(session.id(), b"o hi\nuna").expect("submit");
        assert_eq!(ready.expect("line"), "echo hi\n");
        let ready = hub.submit(session.id(), b"me\r").expect("submit");
        assert_eq!(ready.expect("line"), "uname\r");
    }

    #[test]
    fn long_partial_lines_flush_at_limit() {
        let mut pending = vec![b'x'; QUEUED_LINE_LIMIT];
        let ready = take_complete_lines(&mut pending).expect("flush");
        assert_eq!(ready.len(), QUEUED_LINE_LIMIT);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn device_output_does_not_count_as_activity() {
        let hub = hub(WritePolicy::Open, HubLimits::default());
        let mut quiet = hub.attach(Role::Reader, "quiet").expect("quiet");
        let typing = hub.attach(Role::Writer, "typing").expect("typing");
        tokio::time::sleep(Duration::from_millis(60)).await;
        hub.deliver(&Bytes::from_static(b"chatter"));
        typing.touch();

        let evicted = hub.evict_idle(Duration::from_millis(50));
        assert_eq!(evicted, vec![quiet.id()]);
        assert_eq!(quiet.recv().await.expect("delivered before eviction"), "chatter");
        assert!(quiet.recv().await.is_none());
        assert_eq!(hub.session_count(), 1);
    }

    #[test]
    fn idle_sessions_are_evicted_and_close_refuses_attach() {
        let hub = hub(WritePolicy::Open, HubLimits::default());
        let session = hub.attach(Role::Reader, "a").expect("attach");
        let evicted = hub.evict_idle(Duration::ZERO);
        assert_eq!(evicted, vec![session.id()]);
        assert_eq!(session.detach_reason(), Some(DetachReason::Idle));

        hub.close(DetachReason::ProxyStopped);
        let err = hub.attach(Role::Reader, "b").err().expect("closed");
        assert_eq!(err.kind(), ErrorKind::NotRunning);
    }
}
