//! Purpose: Read-only view of the board registry (board name -> console endpoint data).
//! Exports: `Registry`, `BoardRecord`, `FileRegistry`, `MemoryRegistry`.
//! Role: Boundary to the external resource registry; proxies only read it at start time.
//! Invariants: Lookups never mutate records; a missing board is `ErrorKind::NotFound`.
//! Invariants: `FileRegistry` re-reads the file per lookup so edits apply to the next start.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::endpoint::DEFAULT_BAUD;
use crate::core::error::{Error, ErrorKind};

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BoardRecord {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub serial_device: Option<String>,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub tcp_port: Option<u16>,
}

impl BoardRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            serial_device: None,
            baud: DEFAULT_BAUD,
            host: default_host(),
            tcp_port: None,
        }
    }
}

fn default_baud() -> u32 {
    DEFAULT_BAUD
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

pub trait Registry: Send + Sync {
    fn lookup(&self, board: &str) -> Result<BoardRecord, Error>;
}

#[derive(Debug, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    boards: BTreeMap<String, BoardRecord>,
}

#[derive(Clone, Debug)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<RegistryFile, Error> {
        let text = std::fs::read_to_string(&self.path).map_err(|err| {
            let kind = if err.kind() == std::io::ErrorKind::NotFound {
                ErrorKind::NotFound
            } else {
                ErrorKind::Io
            };
            Error::new(kind)
                .with_message(format!("failed to read registry {}", self.path.display()))
                .with_hint("Point `registry` in the config (or LABCTL_REGISTRY) at a boards file.")
                .with_source(err)
        })?;
        serde_json::from_str(&text).map_err(|err| {
            Error::new(ErrorKind::Usage)
                .with_message(format!("invalid registry {}", self.path.display()))
                .with_source(err)
        })
    }
}

impl Registry for FileRegistry {
    fn lookup(&self, board: &str) -> Result<BoardRecord, Error> {
        let mut file = self.load()?;
        let Some(mut record) = file.boards.remove(board) else {
            return Err(Error::new(ErrorKind::NotFound)
                .with_message("board not found in registry")
                .with_board(board));
        };
        record.name = board.to_string();
        Ok(record)
    }
}

#[derive(Clone, Debug, Default)]
pub struct MemoryRegistry {
    boards: BTreeMap<String, BoardRecord>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_board(mut self, record: BoardRecord) -> Self {
        self.boards.insert(record.name.clone(), record);
        self
    }
}

impl Registry for MemoryRegistry {
    fn lookup(&self, board: &str) -> Result<BoardRecord, Error> {
        self.boards.get(board).cloned().ok_or_else(|| {
            Error::new(ErrorKind::NotFound)
                .with_message("board not found in registry")
                .with_board(board)
        })
    }
}
