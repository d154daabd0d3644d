//! ezlink wire grammar: every message exchanged with the board.
//!
//! These strings ARE the protocol. The board firmware matches on them
//! byte for byte, so a renamed command or a reordered field is a breaking
//! change on the device side.
//!
//! ```text
//! host → board                           board → host
//! UPGRADE:START                          CHUNK_ACK:<index>:<OK|ERROR>:<text>
//! UPGRADE:FILE_START:<path>:<length>     STATUS_* BACKUP_* TEMP_* APPLY_* ...
//! UPGRADE:FILE_DATA:<base64>
//! UPGRADE:FILE_END:<path>
//! UPGRADE:COMMIT | ABORT | ROLLBACK | STATUS
//! UPGRADE:STEP2_BACKUP | STEP3_APPLY | STEP4_CLEANUP
//! ```
//!
//! All fields are `:`-delimited and case-sensitive.

use std::fmt;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Namespace shared by every host-issued upgrade command.
pub const COMMAND_PREFIX: &str = "UPGRADE:";

/// Prefix wrapped around every encoded chunk. Counts against the message limit.
pub const FILE_DATA_PREFIX: &str = "UPGRADE:FILE_DATA:";

/// Prefix of per-chunk acknowledgments sent by the board.
pub const ACK_PREFIX: &str = "CHUNK_ACK:";

/// Largest single message the radio link accepts, in bytes.
pub const MESSAGE_LIMIT: usize = 512;

/// Raw bytes per chunk. 360 → 480 base64 chars → 498-byte message.
pub const CHUNK_SIZE: usize = 360;

/// Directory compiled modules are installed under on the board.
pub const LIB_DIR: &str = "lib/";

/// Inbound prefixes that carry advisory upgrade progress from the board.
pub const STATUS_PREFIXES: &[&str] = &[
    "STATUS_", "BACKUP_", "STEP2_", "STEP3_", "STEP4_", "TEMP_", "APPLY_", "CLEANUP_", "RESTART_",
];

// ── Commands ──────────────────────────────────────────────────────────────────

/// A host → board upgrade command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Switch the board into file-reception mode.
    Start,
    /// Open `path` in the board's staging area and expect `len` bytes.
    FileStart { path: String, len: usize },
    /// One base64-encoded chunk of the currently open file.
    FileData(String),
    /// Close the currently open file.
    FileEnd { path: String },
    /// Install every staged file and restart.
    Commit,
    /// Drop the staging area and leave upgrade mode.
    Abort,
    /// Restore the board's own backup and restart.
    Rollback,
    /// Ask the board to report its staging and backup state.
    Status,
    Step2Backup,
    Step3Apply,
    Step4Cleanup,
}

impl Command {
    /// Parse a command as the board sees it.
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let body = text
            .strip_prefix(COMMAND_PREFIX)
            .ok_or_else(|| WireError::UnknownCommand(text.to_string()))?;
        let (verb, rest) = match body.split_once(':') {
            Some((verb, rest)) => (verb, Some(rest)),
            None => (body, None),
        };

        let command = match (verb, rest) {
            ("START", None) => Command::Start,
            ("FILE_START", Some(rest)) => {
                let (path, len) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| WireError::malformed("FILE_START", text))?;
                let len = len
                    .parse()
                    .map_err(|_| WireError::malformed("FILE_START", text))?;
                if path.is_empty() {
                    return Err(WireError::malformed("FILE_START", text));
                }
                Command::FileStart {
                    path: path.to_string(),
                    len,
                }
            }
            ("FILE_DATA", Some(data)) => Command::FileData(data.to_string()),
            ("FILE_END", Some(path)) if !path.is_empty() => Command::FileEnd {
                path: path.to_string(),
            },
            ("COMMIT", None) => Command::Commit,
            ("ABORT", None) => Command::Abort,
            ("ROLLBACK", None) => Command::Rollback,
            ("STATUS", None) => Command::Status,
            ("STEP2_BACKUP", None) => Command::Step2Backup,
            ("STEP3_APPLY", None) => Command::Step3Apply,
            ("STEP4_CLEANUP", None) => Command::Step4Cleanup,
            _ => return Err(WireError::UnknownCommand(text.to_string())),
        };
        Ok(command)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Start => write!(f, "{COMMAND_PREFIX}START"),
            Command::FileStart { path, len } => write!(f, "{COMMAND_PREFIX}FILE_START:{path}:{len}"),
            Command::FileData(data) => write!(f, "{FILE_DATA_PREFIX}{data}"),
            Command::FileEnd { path } => write!(f, "{COMMAND_PREFIX}FILE_END:{path}"),
            Command::Commit => write!(f, "{COMMAND_PREFIX}COMMIT"),
            Command::Abort => write!(f, "{COMMAND_PREFIX}ABORT"),
            Command::Rollback => write!(f, "{COMMAND_PREFIX}ROLLBACK"),
            Command::Status => write!(f, "{COMMAND_PREFIX}STATUS"),
            Command::Step2Backup => write!(f, "{COMMAND_PREFIX}STEP2_BACKUP"),
            Command::Step3Apply => write!(f, "{COMMAND_PREFIX}STEP3_APPLY"),
            Command::Step4Cleanup => write!(f, "{COMMAND_PREFIX}STEP4_CLEANUP"),
        }
    }
}

// ── Acknowledgments ───────────────────────────────────────────────────────────

/// `CHUNK_ACK:<index>:<OK|ERROR>:<text>`, the board's verdict on one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkAck {
    /// 1-based chunk index within the current file.
    pub chunk_index: u32,
    pub success: bool,
    /// Free text; may itself contain `:`.
    pub message: String,
}

impl ChunkAck {
    pub fn parse(text: &str) -> Result<Self, WireError> {
        let body = text
            .strip_prefix(ACK_PREFIX)
            .ok_or_else(|| WireError::malformed("CHUNK_ACK", text))?;
        let mut fields = body.splitn(3, ':');

        let index = fields.next().unwrap_or_default();
        let status = fields
            .next()
            .ok_or_else(|| WireError::malformed("CHUNK_ACK", text))?;
        let message = fields
            .next()
            .ok_or_else(|| WireError::malformed("CHUNK_ACK", text))?;

        let chunk_index = index
            .parse()
            .map_err(|_| WireError::InvalidChunkIndex(index.to_string()))?;
        let success = match status {
            "OK" => true,
            "ERROR" => false,
            other => return Err(WireError::UnknownAckStatus(other.to_string())),
        };

        Ok(Self {
            chunk_index,
            success,
            message: message.to_string(),
        })
    }
}

impl fmt::Display for ChunkAck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.success { "OK" } else { "ERROR" };
        write!(f, "{ACK_PREFIX}{}:{status}:{}", self.chunk_index, self.message)
    }
}

// ── Inbound classification ────────────────────────────────────────────────────

/// Coarse kind of an inbound message, decided by prefix alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundKind {
    Ack,
    Status,
    Other,
}

impl InboundKind {
    pub fn of(text: &str) -> Self {
        if text.starts_with(ACK_PREFIX) {
            InboundKind::Ack
        } else if STATUS_PREFIXES.iter().any(|p| text.starts_with(p)) {
            InboundKind::Status
        } else {
            InboundKind::Other
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────────────────────

/// Where a queued file lands on the board.
///
/// `.mpy` modules are installed under `lib/` unless already prefixed;
/// everything else keeps its given path.
pub fn target_path(name: &str) -> String {
    if name.ends_with(".mpy") && !name.starts_with(LIB_DIR) {
        format!("{LIB_DIR}{name}")
    } else {
        name.to_string()
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("not an upgrade command: {0:?}")]
    UnknownCommand(String),
    #[error("malformed {kind} message: {text:?}")]
    Malformed { kind: &'static str, text: String },
    #[error("invalid chunk index {0:?}")]
    InvalidChunkIndex(String),
    #[error("unknown ack status {0:?}")]
    UnknownAckStatus(String),
}

impl WireError {
    fn malformed(kind: &'static str, text: &str) -> Self {
        WireError::Malformed {
            kind,
            text: text.to_string(),
        }
    }
}
