//! Purpose: Define the public Rust API boundary for labctl.
//! Exports: Proxy engine types, the wire views and the HTTP `ControlClient`.
//! Role: Additive-only surface used by the CLI, the daemon and embedders.
//! Invariants: Callers attach sessions through `Supervisor`/`ProxyHandle`, never a bare hub.

mod client;
mod views;

pub use crate::core::arbiter::{Grant, WritePolicy};
pub use crate::core::endpoint::{Parity, SerialSettings, UpstreamEndpoint};
#[doc(hidden)]
pub use crate::core::error::to_exit_code;
pub use crate::core::error::{Error, ErrorKind};
pub use crate::core::hub::HubLimits;
pub use crate::core::listener::{CLOSED_PREFIX, ListenConfig, REFUSED_PREFIX};
pub use crate::core::registry::{BoardRecord, FileRegistry, MemoryRegistry, Registry};
pub use crate::core::session::{
    DetachReason, Role, Session, SessionId, SessionInfo, SessionInput, SessionOutput,
    SubmitOutcome,
};
pub use crate::core::session_log::{
    LogSegment, LoggerStatus, SessionLogConfig, SessionLogger, list_journals, list_segments,
    read_segment,
};
pub use crate::core::supervisor::{
    ProxyHandle, ProxySettings, ProxyState, ProxyStatus, ProxySummary, ReconnectPolicy,
    Supervisor,
};
pub use client::{ControlClient, DEFAULT_SERVER, StartRequest, decode_error_body};
pub use views::{LogView, ProxySummaryView, ProxyView, SessionView, format_time};
