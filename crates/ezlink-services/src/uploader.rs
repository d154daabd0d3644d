//! Transfer state machine.
//!
//! Drives the board through an upgrade:
//!
//! ```text
//! Idle → EnteringUploadMode → SendingFile(i) … → AllFilesSent → Committed
//!                                                            ↘ StagedToTemp
//! StagedToTemp → BackupRequested → Applied → CleanedUp
//! ```
//!
//! Every public entry point checks its preconditions before touching the
//! link. Frames go out strictly one at a time, each waiting for its ack.
//! Only one upload or control command runs at a time; the uploading flag
//! is held by an [`UploadGuard`] and released on every exit path.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ezlink_core::config::{EzlinkConfig, UploadConfig};
use ezlink_core::wire::Command;
use tokio::sync::watch;
use tokio::time;

use crate::ack::{AckTracker, RetryPolicy};
use crate::error::TransferError;
use crate::frame::{FrameAssembler, Payload};
use crate::link::Link;
use crate::router::StatusRouter;
use crate::session::{SessionStats, TransferSession, TransferState, UploadGuard};
use crate::status::{StagingAnalysis, StatusReporter};

/// What happens once every file is on the board.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Commit,
    StageOnly,
}

/// Outcome of a completed upload.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UploadReport {
    pub stats: SessionStats,
    pub committed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub struct Uploader {
    link: Link,
    acks: AckTracker,
    router: Arc<StatusRouter>,
    assembler: FrameAssembler,
    policy: RetryPolicy,
    timing: UploadConfig,
    queue: Mutex<Vec<Payload>>,
    session: Mutex<TransferSession>,
    uploading: Arc<AtomicBool>,
    cancelled: AtomicBool,
    progress: watch::Sender<f64>,
    state: watch::Sender<TransferState>,
}

impl Uploader {
    /// Build an uploader on `link` and take over its message handler.
    /// The handler is cleared again when the uploader is dropped.
    ///
    /// Fails if the configured chunk size cannot fit the link's limit.
    pub fn new(
        link: Link,
        config: &EzlinkConfig,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self, TransferError> {
        let assembler = FrameAssembler::new(config.upload.chunk_size, config.link.message_limit)?;
        let acks = AckTracker::new();
        let router = Arc::new(StatusRouter::new(acks.clone(), reporter, &config.router));

        let inbound = router.clone();
        link.on_message(move |payload| {
            inbound.route(&payload);
        });
        let stale = acks.clone();
        link.on_disconnected(move || {
            tracing::warn!("link dropped, clearing pending acks");
            stale.clear();
        });

        let (progress, _) = watch::channel(0.0);
        let (state, _) = watch::channel(TransferState::Idle);

        tracing::debug!(
            chunk_size = assembler.chunk_size(),
            max_retries = config.upload.max_retries,
            "uploader ready"
        );

        Ok(Self {
            link,
            acks,
            router,
            assembler,
            policy: RetryPolicy::from_config(&config.upload),
            timing: config.upload.clone(),
            queue: Mutex::new(Vec::new()),
            session: Mutex::new(TransferSession::default()),
            uploading: Arc::new(AtomicBool::new(false)),
            cancelled: AtomicBool::new(false),
            progress,
            state,
        })
    }

    // ── File queue ────────────────────────────────────────────────────────────

    pub fn add_file(&self, payload: Payload) {
        let frames = self.assembler.frame_count(payload.len());
        tracing::info!(
            name = %payload.name,
            target = %payload.target_path(),
            bytes = payload.len(),
            frames,
            "file queued"
        );
        lock(&self.queue).push(payload);
    }

    pub fn clear_files(&self) {
        lock(&self.queue).clear();
    }

    pub fn queued_files(&self) -> Vec<String> {
        lock(&self.queue).iter().map(|p| p.name.clone()).collect()
    }

    // ── Uploads ───────────────────────────────────────────────────────────────

    /// Send every queued file, then commit.
    pub async fn start_upload(&self) -> Result<UploadReport, TransferError> {
        self.run(Finish::Commit).await
    }

    /// Send every queued file into the board's staging area without
    /// committing. Follow with [`commit`](Self::commit) or the staged steps.
    pub async fn stage_only(&self) -> Result<UploadReport, TransferError> {
        self.run(Finish::StageOnly).await
    }

    async fn run(&self, finish: Finish) -> Result<UploadReport, TransferError> {
        let _guard = UploadGuard::acquire(&self.uploading).ok_or(TransferError::AlreadyUploading)?;
        let files = lock(&self.queue).clone();
        if files.is_empty() {
            return Err(TransferError::NoFiles);
        }
        if !self.link.is_connected() {
            return Err(TransferError::NotConnected);
        }

        self.cancelled.store(false, Ordering::Release);
        self.acks.reset_stats();
        self.progress.send_replace(0.0);
        *lock(&self.session) = TransferSession::begin(files.clone());

        tracing::info!(files = files.len(), ?finish, "upload starting");
        let result = self.transfer(&files, finish).await;

        let stats = self.end_session();
        match &result {
            Ok(()) => tracing::info!(
                files = stats.files_completed,
                frames = stats.frames_acked,
                retransmissions = stats.retransmissions,
                "upload complete"
            ),
            Err(TransferError::Cancelled) => {
                tracing::info!(files = stats.files_completed, "upload cancelled");
                self.set_state(TransferState::Aborted);
            }
            Err(e) => {
                tracing::error!(error = %e, files = stats.files_completed, "upload failed");
                self.set_state(TransferState::Failed);
            }
        }

        result.map(|()| UploadReport {
            stats,
            committed: finish == Finish::Commit,
        })
    }

    async fn transfer(&self, files: &[Payload], finish: Finish) -> Result<(), TransferError> {
        self.set_state(TransferState::EnteringUploadMode);
        time::sleep(self.timing.handler_settle()).await;
        self.send(Command::Start).await?;
        time::sleep(self.timing.upload_mode_settle()).await;

        let total = files.len();
        for (index, file) in files.iter().enumerate() {
            self.check_cancelled()?;
            self.set_state(TransferState::SendingFile(index));
            self.send_file(index, file).await?;

            lock(&self.session).stats.files_completed += 1;
            let percent = (index + 1) as f64 / total as f64 * 100.0;
            self.progress.send_replace(percent);
            tracing::info!(path = %file.target_path(), progress = percent, "file delivered");

            if index + 1 < total {
                time::sleep(self.timing.inter_file_delay()).await;
            }
        }
        self.set_state(TransferState::AllFilesSent);

        match finish {
            Finish::Commit => {
                {
                    // Same lock as cancel(): it sees either the flag or the mark.
                    let mut session = lock(&self.session);
                    self.check_cancelled()?;
                    session.commit_sent = true;
                }
                self.send(Command::Commit).await?;
                time::sleep(self.timing.commit_settle()).await;
                self.set_state(TransferState::Committed);
            }
            Finish::StageOnly => {
                self.check_cancelled()?;
                self.set_state(TransferState::StagedToTemp);
            }
        }
        Ok(())
    }

    async fn send_file(&self, index: usize, file: &Payload) -> Result<(), TransferError> {
        let path = file.target_path();
        let frames = self.assembler.frame_count(file.len());
        let threshold = self.timing.chunk_warning_threshold;
        if threshold > 0 && frames > threshold {
            tracing::warn!(%path, frames, threshold, "file needs more frames than the board reliably accepts");
        }
        tracing::info!(%path, bytes = file.len(), frames, checksum = %file.checksum(), "sending file");
        lock(&self.session).start_file(index, frames);

        self.send(Command::FileStart {
            path: path.clone(),
            len: file.len(),
        })
        .await?;
        time::sleep(self.timing.file_start_delay()).await;

        for frame in self.assembler.frames(file) {
            let frame = frame?;
            self.check_cancelled()?;
            {
                let mut session = lock(&self.session);
                session.current_chunk = frame.sequence;
                session.stats.frames_sent += 1;
            }

            let ack = self
                .acks
                .deliver(&self.link, &frame, &self.policy, &self.cancelled)
                .await?;
            tracing::debug!(%path, chunk_index = frame.sequence, frames, device = %ack.message, "chunk acknowledged");

            {
                let mut session = lock(&self.session);
                session.stats.frames_acked += 1;
                session.stats.bytes_sent += frame.raw.len() as u64;
            }
            if (frame.sequence as usize) < frames {
                time::sleep(self.timing.inter_chunk_delay()).await;
            }
        }

        self.send(Command::FileEnd { path }).await?;
        time::sleep(self.timing.file_end_delay()).await;
        lock(&self.session).current_chunk = 0;
        Ok(())
    }

    fn end_session(&self) -> SessionStats {
        let mut session = lock(&self.session);
        let mut stats = std::mem::take(&mut *session).stats;
        stats.retransmissions = self.acks.retransmissions();
        stats
    }

    // ── Control commands ──────────────────────────────────────────────────────

    /// Install whatever the board has staged. The board restarts.
    pub async fn commit(&self) -> Result<(), TransferError> {
        self.control(Command::Commit, self.timing.commit_settle(), TransferState::Committed)
            .await
    }

    /// Restore the board's own backup. The board restarts.
    pub async fn rollback(&self) -> Result<(), TransferError> {
        self.control(Command::Rollback, self.timing.rollback_settle(), TransferState::RolledBack)
            .await
    }

    /// Staged step 2: back up the files about to be replaced.
    pub async fn backup(&self) -> Result<(), TransferError> {
        self.control(Command::Step2Backup, self.timing.backup_settle(), TransferState::BackupRequested)
            .await
    }

    /// Staged step 3: copy staged files into place.
    pub async fn apply(&self) -> Result<(), TransferError> {
        self.control(Command::Step3Apply, self.timing.apply_settle(), TransferState::Applied)
            .await
    }

    /// Staged step 4: drop the staging area and restart.
    pub async fn cleanup(&self) -> Result<(), TransferError> {
        self.control(Command::Step4Cleanup, self.timing.cleanup_settle(), TransferState::CleanedUp)
            .await
    }

    /// Ask the board for its staging analysis. Replies arrive through the
    /// status reporter and [`last_analysis`](Self::last_analysis).
    pub async fn check_status(&self) -> Result<(), TransferError> {
        if !self.link.is_connected() {
            return Err(TransferError::NotConnected);
        }
        self.send(Command::Status).await
    }

    async fn control(
        &self,
        command: Command,
        settle: Duration,
        next: TransferState,
    ) -> Result<(), TransferError> {
        let _guard = UploadGuard::acquire(&self.uploading).ok_or(TransferError::AlreadyUploading)?;
        if !self.link.is_connected() {
            return Err(TransferError::NotConnected);
        }
        tracing::info!(%command, "sending control command");
        self.send(command).await?;
        time::sleep(settle).await;
        self.set_state(next);
        Ok(())
    }

    /// Stop the running upload after its in-flight frame.
    ///
    /// No-op without an active upload session, so control commands are never
    /// interrupted, and no-op once COMMIT has been sent. The abort command is
    /// best effort; a failure to send it is logged, never returned.
    pub async fn cancel(&self) {
        {
            let mut session = lock(&self.session);
            if !session.active {
                tracing::debug!("cancel requested with no active upload");
                return;
            }
            if session.commit_sent {
                tracing::info!("commit already sent, upload can no longer be cancelled");
                return;
            }
            session.active = false;
            self.cancelled.store(true, Ordering::Release);
        }
        tracing::info!("cancelling upload");

        match self.send(Command::Abort).await {
            Ok(()) => time::sleep(self.timing.abort_settle()).await,
            Err(e) => tracing::warn!(error = %e, "abort command failed"),
        }
        self.set_state(TransferState::Aborted);
    }

    // ── Observation ───────────────────────────────────────────────────────────

    pub fn is_uploading(&self) -> bool {
        self.uploading.load(Ordering::Acquire)
    }

    /// Overall progress in percent, updated after each completed file.
    pub fn progress(&self) -> watch::Receiver<f64> {
        self.progress.subscribe()
    }

    pub fn state(&self) -> watch::Receiver<TransferState> {
        self.state.subscribe()
    }

    pub fn current_state(&self) -> TransferState {
        self.state.borrow().clone()
    }

    pub fn retransmissions(&self) -> u64 {
        self.acks.retransmissions()
    }

    pub fn session_snapshot(&self) -> TransferSession {
        lock(&self.session).clone()
    }

    pub fn last_analysis(&self) -> Option<StagingAnalysis> {
        self.router.last_analysis()
    }

    fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.cancelled.load(Ordering::Acquire) {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn set_state(&self, next: TransferState) {
        tracing::debug!(state = %next, "transfer state");
        self.state.send_replace(next);
    }

    async fn send(&self, command: Command) -> Result<(), TransferError> {
        self.link.send(command.to_string()).await?;
        Ok(())
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        self.link.clear_message_handler();
    }
}
