//! Transfer session bookkeeping and the single-upload guard.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::frame::Payload;

/// Where the uploader is in the upgrade flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferState {
    #[default]
    Idle,
    EnteringUploadMode,
    /// Index into the session's file list.
    SendingFile(usize),
    AllFilesSent,
    Committed,
    Aborted,
    Failed,
    StagedToTemp,
    BackupRequested,
    Applied,
    CleanedUp,
    RolledBack,
}

impl fmt::Display for TransferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferState::Idle => f.write_str("idle"),
            TransferState::EnteringUploadMode => f.write_str("entering upload mode"),
            TransferState::SendingFile(i) => write!(f, "sending file {}", i + 1),
            TransferState::AllFilesSent => f.write_str("all files sent"),
            TransferState::Committed => f.write_str("committed"),
            TransferState::Aborted => f.write_str("aborted"),
            TransferState::Failed => f.write_str("failed"),
            TransferState::StagedToTemp => f.write_str("staged"),
            TransferState::BackupRequested => f.write_str("backup requested"),
            TransferState::Applied => f.write_str("applied"),
            TransferState::CleanedUp => f.write_str("cleaned up"),
            TransferState::RolledBack => f.write_str("rolled back"),
        }
    }
}

/// Counters for one upload session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub files_completed: usize,
    pub frames_sent: u64,
    pub frames_acked: u64,
    pub bytes_sent: u64,
    pub retransmissions: u64,
}

/// The in-flight upload. Reset when the upload ends, however it ends.
#[derive(Debug, Clone, Default)]
pub struct TransferSession {
    pub files: Vec<Payload>,
    pub current_file: usize,
    /// Sequence of the frame currently in flight; 0 between files.
    pub current_chunk: u32,
    pub total_chunks: usize,
    pub active: bool,
    /// COMMIT has gone out. From here on the upload can no longer be aborted.
    pub commit_sent: bool,
    pub stats: SessionStats,
}

impl TransferSession {
    pub fn begin(files: Vec<Payload>) -> Self {
        Self {
            files,
            active: true,
            ..Self::default()
        }
    }

    pub fn start_file(&mut self, index: usize, total_chunks: usize) {
        self.current_file = index;
        self.current_chunk = 0;
        self.total_chunks = total_chunks;
    }

    pub fn current_path(&self) -> Option<String> {
        self.files.get(self.current_file).map(Payload::target_path)
    }
}

/// Holds the uploading flag for as long as it lives.
///
/// At most one guard exists per flag; dropping it clears the flag on every
/// exit path, panics included.
#[derive(Debug)]
pub struct UploadGuard {
    flag: Arc<AtomicBool>,
}

impl UploadGuard {
    pub fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag: flag.clone() })
    }
}

impl Drop for UploadGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
