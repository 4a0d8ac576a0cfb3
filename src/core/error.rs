//! Purpose: Define the crate-wide error type and its stable kind taxonomy.
//! Exports: `Error`, `ErrorKind`, `to_exit_code`.
//! Role: Single error currency shared by the proxy core, HTTP server, client and CLI.
//! Invariants: Kind names and exit codes are stable; new kinds are additive-only.
//! Invariants: Per-session kinds (`NotWriteHolder`, `CapacityExceeded`) never tear down a proxy.
use std::error::Error as StdError;
use std::fmt;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    Internal,
    Usage,
    NotFound,
    AlreadyRunning,
    NotRunning,
    CapacityExceeded,
    NotWriteHolder,
    Connection,
    Write,
    Logging,
    Io,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Internal => "Internal",
            ErrorKind::Usage => "Usage",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::AlreadyRunning => "AlreadyRunning",
            ErrorKind::NotRunning => "NotRunning",
            ErrorKind::CapacityExceeded => "CapacityExceeded",
            ErrorKind::NotWriteHolder => "NotWriteHolder",
            ErrorKind::Connection => "Connection",
            ErrorKind::Write => "Write",
            ErrorKind::Logging => "Logging",
            ErrorKind::Io => "Io",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let kind = match value {
            "Internal" => ErrorKind::Internal,
            "Usage" => ErrorKind::Usage,
            "NotFound" => ErrorKind::NotFound,
            "AlreadyRunning" => ErrorKind::AlreadyRunning,
            "NotRunning" => ErrorKind::NotRunning,
            "CapacityExceeded" => ErrorKind::CapacityExceeded,
            "NotWriteHolder" => ErrorKind::NotWriteHolder,
            "Connection" => ErrorKind::Connection,
            "Write" => ErrorKind::Write,
            "Logging" => ErrorKind::Logging,
            "Io" => ErrorKind::Io,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: Option<String>,
    hint: Option<String>,
    board: Option<String>,
    session: Option<u64>,
    source: Option<Box<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            message: None,
            hint: None,
            board: None,
            session: None,
            source: None,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn hint(&self) -> Option<&str> {
        self.hint.as_deref()
    }

    pub fn board(&self) -> Option<&str> {
        self.board.as_deref()
    }

    pub fn session(&self) -> Option<u64> {
        self.session
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn with_board(mut self, board: impl Into<String>) -> Self {
        self.board = Some(board.into());
        self
    }

    pub fn with_session(mut self, session: u64) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_source(mut self, source: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.kind.as_str())?;
        if let Some(message) = &self.message {
            write!(f, ": {message}")?;
        }
        if let Some(board) = &self.board {
            write!(f, " (board: {board})")?;
        }
        if let Some(session) = self.session {
            write!(f, " (session: s{session})")?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|source| source.as_ref() as &(dyn StdError + 'static))
    }
}

pub fn to_exit_code(kind: ErrorKind) -> i32 {
    match kind {
        ErrorKind::Internal => 1,
        ErrorKind::Usage => 2,
        ErrorKind::NotFound => 3,
        ErrorKind::AlreadyRunning => 4,
        ErrorKind::NotRunning => 5,
        ErrorKind::CapacityExceeded => 6,
        ErrorKind::NotWriteHolder => 7,
        ErrorKind::Connection => 8,
        ErrorKind::Write => 9,
        ErrorKind::Logging => 10,
        ErrorKind::Io => 11,
    }
}
