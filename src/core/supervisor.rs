//! Purpose: Own every per-board proxy and drive its lifecycle and reconnect state machine.
//! Exports: `Supervisor`, `ProxySettings`, `ReconnectPolicy`, `ProxyHandle`, `ProxyState`,
//!          `ProxyStatus`, `ProxySummary`.
//! Role: The explicit context shared (via `Arc`) by the HTTP API, the CLI and embedders.
//! Invariants: At most one proxy per board; a reservation is taken before the upstream is opened.
//! Invariants: While degraded, sessions stay attached and writes fail with `Connection`.
//! Invariants: A proxy that gives up on its upstream leaves the table and ends every session
//!             with `UpstreamLost`.
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::sync::{Notify, mpsc, watch};
use tokio::task::JoinHandle;

use crate::core::arbiter::WritePolicy;
use crate::core::endpoint::UpstreamEndpoint;
use crate::core::error::{Error, ErrorKind};
use crate::core::hub::{Hub, HubLimits};
use crate::core::listener::{self, ListenConfig};
use crate::core::registry::Registry;
use crate::core::session::{DetachReason, Role, Session, SessionId, SessionInfo, WriteRequest};
use crate::core::session_log::{LoggerStatus, LoggerStatusHandle, SessionLogConfig, SessionLogger};
use crate::core::upstream::{ReadEvent, UpstreamLink};

const READ_CHUNK: usize = 4096;
const WRITE_QUEUE: usize = 64;
const HOUSEKEEPING_TICK: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// `None` retries forever (at `max_delay` once the backoff saturates).
    pub max_attempts: Option<u32>,
    pub grace: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: Some(10),
            grace: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    /// Backoff before attempt `attempt` (1-based): `min(initial * 2^(attempt-1), max)`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProxySettings {
    pub policy: WritePolicy,
    pub limits: HubLimits,
    pub idle_timeout: Option<Duration>,
    pub listen: ListenConfig,
    pub reconnect: ReconnectPolicy,
    /// `None` disables session logging.
    pub session_log: Option<SessionLogConfig>,
    pub sweep_interval: Option<Duration>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Degraded,
    Stopping,
}

impl ProxyState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProxyState::Stopped => "stopped",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Degraded => "degraded",
            ProxyState::Stopping => "stopping",
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProxyStatus {
    pub board: String,
    pub state: ProxyState,
    pub endpoint: UpstreamEndpoint,
    pub policy: WritePolicy,
    pub session_count: usize,
    pub write_holder: Option<SessionId>,
    pub reconnect_attempts: u32,
    pub listen_addr: Option<SocketAddr>,
    pub started_at: OffsetDateTime,
    pub last_error: Option<String>,
    pub log: Option<LoggerStatus>,
}

#[derive(Clone, Debug)]
pub struct ProxySummary {
    pub board: String,
    pub state: ProxyState,
    pub session_count: usize,
}

/// A running proxy as seen by an embedder.
#[derive(Clone)]
pub struct ProxyHandle {
    hub: Arc<Hub>,
    listen_addr: SocketAddr,
}

impl ProxyHandle {
    pub fn board(&self) -> &str {
        self.hub.board()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn attach(&self, role: Role, transport: impl Into<String>) -> Result<Session, Error> {
        self.hub.attach(role, transport)
    }
}

struct Runtime {
    state: ProxyState,
    attempts: u32,
    last_error: Option<String>,
}

struct Proxy {
    board: String,
    endpoint: UpstreamEndpoint,
    hub: Arc<Hub>,
    listen_addr: SocketAddr,
    started_at: OffsetDateTime,
    log_status: Option<LoggerStatusHandle>,
    runtime: Mutex<Runtime>,
    cancel: watch::Sender<bool>,
    reconnect: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Proxy {
    fn runtime(&self) -> MutexGuard<'_, Runtime> {
        self.runtime.lock().unwrap_or_else(|poison| poison.into_inner())
    }

    fn set_state(&self, state: ProxyState) {
        self.runtime().state = state;
    }

    fn state(&self) -> ProxyState {
        self.runtime().state
    }

    fn record_error(&self, err: &Error) {
        self.runtime().last_error = Some(err.to_string());
    }

    fn status(&self) -> ProxyStatus {
        let runtime = self.runtime();
        ProxyStatus {
            board: self.board.clone(),
            state: runtime.state,
            endpoint: self.endpoint.clone(),
            policy: self.hub.policy(),
            session_count: self.hub.session_count(),
            write_holder: self.hub.holder(),
            reconnect_attempts: runtime.attempts,
            listen_addr: Some(self.listen_addr),
            started_at: self.started_at,
            last_error: runtime.last_error.clone(),
            log: self.log_status.as_ref().map(LoggerStatusHandle::get),
        }
    }
}

enum Slot {
    Starting {
        endpoint: UpstreamEndpoint,
        policy: WritePolicy,
        started_at: OffsetDateTime,
    },
    Active(Arc<Proxy>),
}

type Table = Arc<Mutex<HashMap<String, Slot>>>;

fn lock_table(table: &Mutex<HashMap<String, Slot>>) -> MutexGuard<'_, HashMap<String, Slot>> {
    table.lock().unwrap_or_else(|poison| poison.into_inner())
}

/// Removes a `Starting` slot unless the start completed.
struct Reservation {
    table: Table,
    board: String,
    committed: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut table = lock_table(&self.table);
        if matches!(table.get(&self.board), Some(Slot::Starting { .. })) {
            table.remove(&self.board);
        }
    }
}

pub struct Supervisor {
    settings: ProxySettings,
    registry: Arc<dyn Registry>,
    table: Table,
}

impl Supervisor {
    pub fn new(settings: ProxySettings, registry: Arc<dyn Registry>) -> Self {
        Self {
            settings,
            registry,
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    pub async fn start_from_registry(
        &self,
        board: &str,
        policy: Option<WritePolicy>,
    ) -> Result<ProxyHandle, Error> {
        let record = self.registry.lookup(board)?;
        let endpoint = UpstreamEndpoint::from_record(&record).map_err(|err| err.with_board(board))?;
        self.start(board, endpoint, policy).await
    }

    pub async fn start(
        &self,
        board: &str,
        endpoint: UpstreamEndpoint,
        policy: Option<WritePolicy>,
    ) -> Result<ProxyHandle, Error> {
        validate_board_name(board)?;
        let policy = policy.unwrap_or(self.settings.policy);
        let mut reservation = {
            let mut table = lock_table(&self.table);
            if table.contains_key(board) {
                return Err(Error::new(ErrorKind::AlreadyRunning)
                    .with_message("a proxy is already running for this board")
                    .with_hint("Stop it first or attach to the running proxy.")
                    .with_board(board));
            }
            table.insert(
                board.to_string(),
                Slot::Starting {
                    endpoint: endpoint.clone(),
                    policy,
                    started_at: OffsetDateTime::now_utc(),
                },
            );
            Reservation {
                table: Arc::clone(&self.table),
                board: board.to_string(),
                committed: false,
            }
        };
        tracing::info!(board, %endpoint, %policy, "starting proxy");

        let link = UpstreamLink::open(&endpoint)
            .await
            .map_err(|err| err.with_board(board))?;
        let session_listener = listener::bind(&self.settings.listen)
            .await
            .map_err(|err| err.with_board(board))?;
        let listen_addr = session_listener.local_addr().map_err(|err| {
            Error::new(ErrorKind::Io)
                .with_message("failed to read session listener address")
                .with_board(board)
                .with_source(err)
        })?;

        let (writes_tx, writes_rx) = mpsc::channel(WRITE_QUEUE);
        let hub = Hub::new(board, policy, self.settings.limits, writes_tx);
        let logger = self
            .settings
            .session_log
            .clone()
            .map(|config| SessionLogger::start(board, config));
        let (cancel, cancel_rx) = watch::channel(false);
        let proxy = Arc::new(Proxy {
            board: board.to_string(),
            endpoint,
            hub: Arc::clone(&hub),
            listen_addr,
            started_at: OffsetDateTime::now_utc(),
            log_status: logger.as_ref().map(SessionLogger::status_handle),
            runtime: Mutex::new(Runtime {
                state: ProxyState::Running,
                attempts: 0,
                last_error: None,
            }),
            cancel,
            reconnect: Notify::new(),
            tasks: Mutex::new(Vec::new()),
        });

        let listener_task = tokio::spawn(listener::serve(
            session_listener,
            Arc::clone(&hub),
            self.settings.listen.banner,
            cancel_rx.clone(),
        ));
        let link_task = tokio::spawn(
            LinkTask {
                proxy: Arc::clone(&proxy),
                table: Arc::clone(&self.table),
                settings: self.settings.clone(),
                logger,
                writes: writes_rx,
                cancel: cancel_rx,
            }
            .run(link),
        );
        proxy
            .tasks
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
            .extend([listener_task, link_task]);

        lock_table(&self.table).insert(board.to_string(), Slot::Active(Arc::clone(&proxy)));
        reservation.committed = true;
        tracing::info!(board, %listen_addr, "proxy running");
        Ok(ProxyHandle { hub, listen_addr })
    }

    pub async fn stop(&self, board: &str) -> Result<(), Error> {
        let proxy = self.active(board)?;
        {
            let mut runtime = proxy.runtime();
            if matches!(runtime.state, ProxyState::Stopping | ProxyState::Stopped) {
                return Err(not_running(board).with_message("proxy is already stopping"));
            }
            runtime.state = ProxyState::Stopping;
        }
        tracing::info!(board, "stopping proxy");
        proxy.cancel.send_replace(true);
        let tasks: Vec<JoinHandle<()>> = std::mem::take(
            &mut *proxy.tasks.lock().unwrap_or_else(|poison| poison.into_inner()),
        );
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(board, error = %err, "proxy task failed during stop");
            }
        }
        let mut table = lock_table(&self.table);
        if matches!(table.get(board), Some(Slot::Active(current)) if Arc::ptr_eq(current, &proxy)) {
            table.remove(board);
        }
        Ok(())
    }

    pub fn status(&self, board: &str) -> Result<ProxyStatus, Error> {
        let table = lock_table(&self.table);
        match table.get(board) {
            Some(Slot::Active(proxy)) => Ok(proxy.status()),
            Some(Slot::Starting {
                endpoint,
                policy,
                started_at,
            }) => Ok(ProxyStatus {
                board: board.to_string(),
                state: ProxyState::Starting,
                endpoint: endpoint.clone(),
                policy: *policy,
                session_count: 0,
                write_holder: None,
                reconnect_attempts: 0,
                listen_addr: None,
                started_at: *started_at,
                last_error: None,
                log: None,
            }),
            None => Err(not_running(board)),
        }
    }

    pub fn list(&self) -> Vec<ProxySummary> {
        let table = lock_table(&self.table);
        let mut summaries: Vec<ProxySummary> = table
            .iter()
            .map(|(board, slot)| match slot {
                Slot::Active(proxy) => ProxySummary {
                    board: board.clone(),
                    state: proxy.state(),
                    session_count: proxy.hub.session_count(),
                },
                Slot::Starting { .. } => ProxySummary {
                    board: board.clone(),
                    state: ProxyState::Starting,
                    session_count: 0,
                },
            })
            .collect();
        summaries.sort_by(|a, b| a.board.cmp(&b.board));
        summaries
    }

    pub fn list_sessions(&self, board: &str) -> Result<Vec<SessionInfo>, Error> {
        Ok(self.active(board)?.hub.sessions())
    }

    pub fn attach(
        &self,
        board: &str,
        role: Role,
        transport: impl Into<String>,
    ) -> Result<Session, Error> {
        self.active(board)?.hub.attach(role, transport)
    }

    pub fn handle(&self, board: &str) -> Result<ProxyHandle, Error> {
        let proxy = self.active(board)?;
        Ok(ProxyHandle {
            hub: Arc::clone(&proxy.hub),
            listen_addr: proxy.listen_addr,
        })
    }

    /// Operator intervention: restarts the retry sequence of a degraded proxy immediately.
    pub fn reconnect(&self, board: &str) -> Result<ProxyState, Error> {
        let proxy = self.active(board)?;
        let state = proxy.state();
        if state == ProxyState::Degraded {
            tracing::info!(board, "operator requested reconnect");
            proxy.reconnect.notify_one();
        }
        Ok(state)
    }

    pub async fn shutdown(&self) {
        let boards: Vec<String> = lock_table(&self.table).keys().cloned().collect();
        for board in boards {
            match self.stop(&board).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotRunning => {}
                Err(err) => tracing::warn!(board = %board, error = %err, "proxy stop failed"),
            }
        }
    }

    fn active(&self, board: &str) -> Result<Arc<Proxy>, Error> {
        match lock_table(&self.table).get(board) {
            Some(Slot::Active(proxy)) => Ok(Arc::clone(proxy)),
            Some(Slot::Starting { .. }) => Err(not_running(board)
                .with_message("proxy is still starting")
                .with_hint("Retry once the upstream connection is open.")),
            None => Err(not_running(board)),
        }
    }
}

fn not_running(board: &str) -> Error {
    Error::new(ErrorKind::NotRunning)
        .with_message("no proxy is running for this board")
        .with_hint("Start one with `labctl proxy start <board>`.")
        .with_board(board)
}

fn validate_board_name(board: &str) -> Result<(), Error> {
    let valid = !board.is_empty()
        && !board.starts_with('.')
        && board
            .bytes()
            .all(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.'));
    if valid {
        return Ok(());
    }
    Err(Error::new(ErrorKind::Usage)
        .with_message(format!("invalid board name `{board}`"))
        .with_hint("Board names use letters, digits, `-`, `_` and `.`."))
}

/// Consumes a wakeup stored while nobody was waiting, e.g. an operator reconnect that raced a
/// successful reopen; it must not cut short the backoff of the next outage.
async fn discard_pending(notify: &Notify) {
    tokio::select! {
        biased;
        () = notify.notified() => {}
        () = std::future::ready(()) => {}
    }
}

#[derive(Clone, Copy, Debug)]
enum Exit {
    Requested,
    UpstreamLost,
}

struct LinkTask {
    proxy: Arc<Proxy>,
    table: Table,
    settings: ProxySettings,
    logger: Option<SessionLogger>,
    writes: mpsc::Receiver<WriteRequest>,
    cancel: watch::Receiver<bool>,
}

impl LinkTask {
    async fn run(mut self, link: UpstreamLink) {
        let mut housekeeping = tokio::time::interval(self.housekeeping_period());
        housekeeping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_sweep = Instant::now();
        let mut link = Some(link);

        let exit = loop {
            let connected = match link.take() {
                Some(connected) => connected,
                None => match self.reconnect(&mut housekeeping, &mut last_sweep).await {
                    Ok(connected) => connected,
                    Err(exit) => break exit,
                },
            };
            match self
                .pump(connected, &mut housekeeping, &mut last_sweep)
                .await
            {
                Some(exit) => break exit,
                None => {
                    self.proxy.set_state(ProxyState::Degraded);
                    self.proxy.record_error(
                        &Error::new(ErrorKind::Connection)
                            .with_message("upstream disconnected")
                            .with_board(self.proxy.board.clone()),
                    );
                    tracing::warn!(
                        board = %self.proxy.board,
                        endpoint = %self.proxy.endpoint,
                        sessions = self.proxy.hub.session_count(),
                        "upstream lost; proxy degraded"
                    );
                }
            }
        };
        self.finish(exit).await;
    }

    fn housekeeping_period(&self) -> Duration {
        match self.settings.idle_timeout {
            Some(timeout) if !timeout.is_zero() => timeout.min(HOUSEKEEPING_TICK),
            _ => HOUSEKEEPING_TICK,
        }
    }

    /// Moves bytes while connected; `None` means the upstream went away.
    async fn pump(
        &mut self,
        mut link: UpstreamLink,
        housekeeping: &mut tokio::time::Interval,
        last_sweep: &mut Instant,
    ) -> Option<Exit> {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            tokio::select! {
                _ = self.cancel.changed() => {
                    link.close().await;
                    return Some(Exit::Requested);
                }
                event = link.read(&mut buf) => match event {
                    ReadEvent::Data(n) => {
                        let chunk = Bytes::copy_from_slice(&buf[..n]);
                        if let Some(logger) = &self.logger {
                            logger.record(chunk.clone(), OffsetDateTime::now_utc());
                        }
                        for id in self.proxy.hub.deliver(&chunk) {
                            tracing::debug!(board = %self.proxy.board, session = %id, "evicted slow session");
                        }
                    }
                    ReadEvent::Closed => return None,
                },
                Some(request) = self.writes.recv() => {
                    let result = link.write(&request.bytes).await;
                    if let (Ok(()), Some(logger)) = (&result, &self.logger) {
                        logger.record_input(
                            request.session,
                            request.bytes.clone(),
                            OffsetDateTime::now_utc(),
                        );
                    }
                    if let Err(err) = &result {
                        tracing::warn!(
                            board = %self.proxy.board,
                            session = %request.session,
                            error = %err,
                            "upstream write failed"
                        );
                        self.proxy.record_error(err);
                    }
                    let _ = request.reply.send(result.map_err(|err| {
                        err.with_board(self.proxy.board.clone())
                            .with_session(request.session.get())
                    }));
                }
                _ = housekeeping.tick() => self.housekeep(last_sweep),
            }
        }
    }

    /// Retries the upstream with exponential backoff until it opens, the proxy is stopped, or the
    /// retry budget and grace window run out.
    async fn reconnect(
        &mut self,
        housekeeping: &mut tokio::time::Interval,
        last_sweep: &mut Instant,
    ) -> Result<UpstreamLink, Exit> {
        let policy = self.settings.reconnect.clone();
        let mut attempt: u32 = 0;
        loop {
            if policy.max_attempts.is_some_and(|max| attempt >= max) {
                tracing::warn!(
                    board = %self.proxy.board,
                    attempts = attempt,
                    grace_ms = policy.grace.as_millis() as u64,
                    "reconnect attempts exhausted; waiting for operator"
                );
                let deadline = tokio::time::sleep(policy.grace);
                tokio::pin!(deadline);
                loop {
                    tokio::select! {
                        _ = self.cancel.changed() => return Err(Exit::Requested),
                        _ = &mut deadline => return Err(Exit::UpstreamLost),
                        _ = self.proxy.reconnect.notified() => break,
                        Some(request) = self.writes.recv() => self.refuse_write(request),
                        _ = housekeeping.tick() => self.housekeep(last_sweep),
                    }
                }
                attempt = 0;
            }

            attempt += 1;
            self.proxy.runtime().attempts = attempt;
            let delay = policy.delay(attempt);
            tracing::info!(
                board = %self.proxy.board,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "scheduling upstream reconnect"
            );
            let backoff = tokio::time::sleep(delay);
            tokio::pin!(backoff);
            loop {
                tokio::select! {
                    _ = self.cancel.changed() => return Err(Exit::Requested),
                    _ = &mut backoff => break,
                    _ = self.proxy.reconnect.notified() => {
                        attempt = 1;
                        self.proxy.runtime().attempts = attempt;
                        break;
                    }
                    Some(request) = self.writes.recv() => self.refuse_write(request),
                    _ = housekeeping.tick() => self.housekeep(last_sweep),
                }
            }

            let opened = tokio::select! {
                _ = self.cancel.changed() => return Err(Exit::Requested),
                opened = UpstreamLink::open(&self.proxy.endpoint) => opened,
            };
            match opened {
                Ok(link) => {
                    tracing::info!(board = %self.proxy.board, attempt, "upstream reconnected");
                    {
                        let mut runtime = self.proxy.runtime();
                        runtime.state = ProxyState::Running;
                        runtime.attempts = 0;
                    }
                    discard_pending(&self.proxy.reconnect).await;
                    return Ok(link);
                }
                Err(err) => {
                    tracing::warn!(board = %self.proxy.board, attempt, error = %err, "reconnect attempt failed");
                    self.proxy.record_error(&err);
                }
            }
        }
    }

    fn refuse_write(&self, request: WriteRequest) {
        let err = Error::new(ErrorKind::Connection)
            .with_message("upstream disconnected; reconnecting")
            .with_hint("Input is not buffered while the proxy is degraded.")
            .with_board(self.proxy.board.clone())
            .with_session(request.session.get());
        let _ = request.reply.send(Err(err));
    }

    fn housekeep(&self, last_sweep: &mut Instant) {
        if let Some(timeout) = self.settings.idle_timeout {
            for id in self.proxy.hub.evict_idle(timeout) {
                tracing::debug!(board = %self.proxy.board, session = %id, "evicted idle session");
            }
        }
        let Some(logger) = &self.logger else {
            return;
        };
        logger.rotate_expired();
        let Some(interval) = self.settings.sweep_interval else {
            return;
        };
        if last_sweep.elapsed() >= interval {
            *last_sweep = Instant::now();
            logger.sweep();
        }
    }

    async fn finish(mut self, exit: Exit) {
        let reason = match exit {
            Exit::Requested => DetachReason::ProxyStopped,
            Exit::UpstreamLost => DetachReason::UpstreamLost,
        };
        self.proxy.hub.close(reason);
        self.writes.close();
        while let Ok(request) = self.writes.try_recv() {
            let _ = request.reply.send(Err(not_running(&self.proxy.board)));
        }
        if let Some(logger) = self.logger.take() {
            logger.close().await;
        }

        if let Exit::UpstreamLost = exit {
            self.proxy.record_error(
                &Error::new(ErrorKind::Connection)
                    .with_message("upstream lost; reconnect attempts exhausted")
                    .with_board(self.proxy.board.clone()),
            );
            self.proxy.cancel.send_replace(true);
            let mut table = lock_table(&self.table);
            if matches!(
                table.get(&self.proxy.board),
                Some(Slot::Active(current)) if Arc::ptr_eq(current, &self.proxy)
            ) {
                table.remove(&self.proxy.board);
            }
            tracing::error!(board = %self.proxy.board, "proxy stopped: upstream lost");
        }
        self.proxy.set_state(ProxyState::Stopped);
        tracing::info!(board = %self.proxy.board, "proxy stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::{ReconnectPolicy, discard_pending, validate_board_name};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn stale_reconnect_request_is_discarded() {
        let notify = Notify::new();
        notify.notify_one();
        discard_pending(&notify).await;
        let woke = tokio::time::timeout(Duration::from_millis(50), notify.notified()).await;
        assert!(woke.is_err(), "a consumed request must not wake the next wait");

        // Nothing pending: returns immediately.
        tokio::time::timeout(Duration::from_millis(50), discard_pending(&notify))
            .await
            .expect("no wait without a stored request");
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            max_attempts: None,
            grace: Duration::ZERO,
        };
        let delays: Vec<u64> = (1..=6)
            .map(|attempt| policy.delay(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![500, 1000, 2000, 4000, 4000, 4000]);
        assert_eq!(policy.delay(200), Duration::from_secs(4));
    }

    #[test]
    fn board_names_must_be_path_safe() {
        validate_board_name("rpi4").expect("plain");
        validate_board_name("bbb-01.lab").expect("dotted");
        assert!(validate_board_name("").is_err());
        assert!(validate_board_name("../etc").is_err());
        assert!(validate_board_name(".hidden").is_err());
        assert!(validate_board_name("a/b").is_err());
    }
}
