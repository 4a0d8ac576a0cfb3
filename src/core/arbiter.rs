//! Purpose: Decide which session bytes may reach the device under the active write policy.
//! Exports: `WritePolicy`, `WriteArbiter`, `Grant`, `Admission`.
//! Role: Pure decision state owned by the hub and mutated only under the hub lock.
//! Invariants: Under first-writer-wins at most one session holds the lock at any instant.
//! Invariants: The lock is only re-acquired by an explicit request; detach never promotes.
//! Invariants: Read-only sessions are never admitted, under any policy.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::core::error::{Error, ErrorKind};
use crate::core::session::{Role, SessionId};

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WritePolicy {
    #[default]
    FirstWriterWins,
    Open,
    Queued,
}

impl WritePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            WritePolicy::FirstWriterWins => "first-writer-wins",
            WritePolicy::Open => "open",
            WritePolicy::Queued => "queued",
        }
    }
}

impl fmt::Display for WritePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WritePolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "first-writer-wins" | "first" => Ok(WritePolicy::FirstWriterWins),
            "open" | "all" => Ok(WritePolicy::Open),
            "queued" | "queue" => Ok(WritePolicy::Queued),
            other => Err(Error::new(ErrorKind::Usage)
                .with_message(format!("unknown write policy `{other}`"))
                .with_hint("Use first-writer-wins, open, or queued.")),
        }
    }
}

/// What a session was given when it attached.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Grant {
    Holder,
    Writer,
    Downgraded,
    ReadOnly,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Admission {
    Forward,
    Enqueue,
}

#[derive(Debug)]
pub struct WriteArbiter {
    policy: WritePolicy,
    holder: Option<SessionId>,
}

impl WriteArbiter {
    pub fn new(policy: WritePolicy) -> Self {
        Self {
            policy,
            holder: None,
        }
    }

    pub fn policy(&self) -> WritePolicy {
        self.policy
    }

    pub fn holder(&self) -> Option<SessionId> {
        self.holder
    }

    pub fn on_attach(&mut self, id: SessionId, role: Role) -> Grant {
        if role == Role::Reader {
            return Grant::ReadOnly;
        }
        match self.policy {
            WritePolicy::FirstWriterWins => {
                if self.holder.is_none() {
                    self.holder = Some(id);
                    Grant::Holder
                } else {
                    Grant::Downgraded
                }
            }
            WritePolicy::Open | WritePolicy::Queued => Grant::Writer,
        }
    }

    /// Returns true when `id` held the lock and released it.
    pub fn on_detach(&mut self, id: SessionId) -> bool {
        if self.holder == Some(id) {
            self.holder = None;
            return true;
        }
        false
    }

    pub fn can_write(&self, id: SessionId, role: Role) -> bool {
        self.admit(id, role).is_ok()
    }

    pub fn admit(&self, id: SessionId, role: Role) -> Result<Admission, Error> {
        if role == Role::Reader {
            return Err(Error::new(ErrorKind::NotWriteHolder)
                .with_message("session attached read-only")
                .with_session(id.get()));
        }
        match self.policy {
            WritePolicy::Open => Ok(Admission::Forward),
            WritePolicy::Queued => Ok(Admission::Enqueue),
            WritePolicy::FirstWriterWins => match self.holder {
                Some(holder) if holder == id => Ok(Admission::Forward),
                Some(holder) => Err(Error::new(ErrorKind::NotWriteHolder)
                    .with_message(format!("write lock held by {holder}"))
                    .with_session(id.get())),
                None => Err(Error::new(ErrorKind::NotWriteHolder)
                    .with_message("write lock is free but not held by this session")
                    .with_hint("Request the write lock before writing.")
                    .with_session(id.get())),
            },
        }
    }

    pub fn request(&mut self, id: SessionId, role: Role) -> Result<(), Error> {
        if role == Role::Reader {
            return Err(Error::new(ErrorKind::Usage)
                .with_message("read-only sessions cannot request the write lock")
                .with_hint("Attach as a writer to send input.")
                .with_session(id.get()));
        }
        if self.policy != WritePolicy::FirstWriterWins {
            return Ok(());
        }
        match self.holder {
            None => {
                self.holder = Some(id);
                Ok(())
            }
            Some(holder) if holder == id => Ok(()),
            Some(holder) => Err(Error::new(ErrorKind::NotWriteHolder)
                .with_message(format!("write lock held by {holder}"))
                .with_session(id.get())),
        }
    }
}
