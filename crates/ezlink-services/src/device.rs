//! In-process stand-in for the board side of the upgrade protocol.
//!
//! Files are received into a staging area with a `CHUNK_ACK` per chunk,
//! installed on commit or apply, and backed up before being replaced.
//! Status and staged-step commands answer with the same advisory lines
//! the firmware sends over the radio. Faults can be injected per chunk
//! index or at random.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ezlink_core::codec;
use ezlink_core::wire::{ChunkAck, Command};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;

use crate::link::{LinkError, LinkSink, Transport};

/// Faults to inject. Chunk indices are per file, starting at 1.
#[derive(Debug, Clone, Default)]
pub struct FaultPlan {
    loss_rate: f64,
    drop_frames: HashMap<u32, u32>,
    reject_frames: HashMap<u32, u32>,
    duplicate_acks: bool,
    seed: u64,
}

impl FaultPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lose each incoming chunk with probability `rate`.
    pub fn loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// Lose the next `times` transmissions of chunk `index` in transit.
    pub fn drop_frame(mut self, index: u32, times: u32) -> Self {
        self.drop_frames.insert(index, times);
        self
    }

    /// Answer the next `times` transmissions of chunk `index` with an
    /// `ERROR` ack.
    pub fn reject_frame(mut self, index: u32, times: u32) -> Self {
        self.reject_frames.insert(index, times);
        self
    }

    /// Deliver every ack twice, as a flaky radio sometimes does.
    pub fn duplicate_acks(mut self) -> Self {
        self.duplicate_acks = true;
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

fn take_one(budget: &mut HashMap<u32, u32>, index: u32) -> bool {
    match budget.get_mut(&index) {
        Some(left) if *left > 0 => {
            *left -= 1;
            true
        }
        _ => false,
    }
}

struct OpenFile {
    path: String,
    expected: usize,
    data: Vec<u8>,
    chunks: u32,
}

struct Board {
    upgrade_mode: bool,
    open: Option<OpenFile>,
    staged: BTreeMap<String, Vec<u8>>,
    installed: BTreeMap<String, Vec<u8>>,
    backup: BTreeMap<String, Vec<u8>>,
    restarts: u32,
    received: Vec<(String, Instant)>,
    faults: FaultPlan,
    rng: StdRng,
}

impl Board {
    fn handle(&mut self, text: &str) -> Vec<String> {
        let command = match Command::parse(text) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(error = %e, "board ignoring message");
                return Vec::new();
            }
        };

        match command {
            Command::Start => {
                self.upgrade_mode = true;
                self.open = None;
                Vec::new()
            }
            Command::FileStart { path, len } => {
                if self.upgrade_mode {
                    self.open = Some(OpenFile {
                        path,
                        expected: len,
                        data: Vec::with_capacity(len),
                        chunks: 0,
                    });
                }
                Vec::new()
            }
            Command::FileData(body) => self.receive_chunk(&body).into_iter().collect(),
            Command::FileEnd { path } => {
                match self.open.take() {
                    Some(file) if file.path == path => {
                        self.staged.insert(file.path, file.data);
                    }
                    other => self.open = other,
                }
                Vec::new()
            }
            Command::Commit => {
                let staged = std::mem::take(&mut self.staged);
                for (path, data) in staged {
                    if let Some(old) = self.installed.insert(path.clone(), data) {
                        self.backup.insert(path, old);
                    }
                }
                self.restart();
                Vec::new()
            }
            Command::Abort => {
                self.staged.clear();
                self.open = None;
                self.upgrade_mode = false;
                Vec::new()
            }
            Command::Rollback => {
                let backup = std::mem::take(&mut self.backup);
                self.installed.extend(backup);
                self.restart();
                Vec::new()
            }
            Command::Status => self.status(),
            Command::Step2Backup => self.step2_backup(),
            Command::Step3Apply => self.step3_apply(),
            Command::Step4Cleanup => self.step4_cleanup(),
        }
    }

    fn receive_chunk(&mut self, body: &str) -> Option<String> {
        let file = self.open.as_mut()?;
        let index = file.chunks + 1;

        if take_one(&mut self.faults.drop_frames, index)
            || (self.faults.loss_rate > 0.0 && self.rng.gen_bool(self.faults.loss_rate))
        {
            tracing::debug!(index, "board lost chunk in transit");
            return None;
        }
        if take_one(&mut self.faults.reject_frames, index) {
            return Some(ack(index, false, "Invalid Base64"));
        }
        let decoded = match codec::decode(body) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::debug!(index, error = %e, "board rejected chunk");
                return Some(ack(index, false, "Invalid Base64"));
            }
        };

        file.chunks = index;
        if file.data.len() >= file.expected {
            return Some(ack(index, true, "DUPLICATE:Already completed"));
        }
        let room = file.expected - file.data.len();
        let take = decoded.len().min(room);
        file.data.extend_from_slice(&decoded[..take]);
        Some(ack(index, true, &format!("OK:{take}")))
    }

    fn status(&self) -> Vec<String> {
        let analysis = match (self.staged.is_empty(), self.backup.is_empty()) {
            (false, false) => "STEP3_READY:temp and backup present, apply can run",
            (false, true) => "STEP2_READY:temp present without backup, backup can run",
            (true, false) => "ROLLBACK_READY:backup only, rollback available",
            (true, true) => "CLEAN:no temp or backup, ready for a new upgrade",
        };
        vec![
            "STATUS_CHECK_START".to_string(),
            listing("TEMP_FILES", &self.staged),
            listing("BACKUP_FILES", &self.backup),
            format!("UPGRADE_MODE:{}", self.upgrade_mode),
            "MEMORY_FREE:98304".to_string(),
            format!("STATUS_ANALYSIS:{analysis}"),
            "STATUS_CHECK_COMPLETE".to_string(),
        ]
    }

    fn step2_backup(&mut self) -> Vec<String> {
        let mut out = vec!["STEP2_BACKUP_START".to_string()];
        if self.staged.is_empty() {
            out.push("STEP2_WARNING:no files to back up".to_string());
            out.push("STEP2_BACKUP_SUCCESS:0 files backed up".to_string());
            return out;
        }

        self.backup.clear();
        let total = self.staged.len();
        out.push(listing("TEMP_FILE_LIST", &self.staged));
        out.push(format!("BACKUP_PHASE:backing up {total} files"));
        let mut saved = 0;
        for (i, path) in self.staged.keys().enumerate() {
            out.push(format!("BACKUP_FILE_START:{}/{total}:{path}", i + 1));
            if let Some(current) = self.installed.get(path) {
                self.backup.insert(path.clone(), current.clone());
                saved += 1;
            }
            out.push(format!("BACKUP_FILE_COMPLETE:{}/{total}:{path}", i + 1));
        }
        out.push(format!("STEP2_BACKUP_COMPLETE:ok:{saved}:failed:0"));
        out.push(format!("STEP2_BACKUP_SUCCESS:{saved} files backed up"));
        out
    }

    fn step3_apply(&mut self) -> Vec<String> {
        let mut out = vec!["STEP3_APPLY_START".to_string()];
        if self.staged.is_empty() {
            out.push("STEP3_WARNING:no files to apply".to_string());
            out.push("STEP3_APPLY_SUCCESS:0 files installed".to_string());
            return out;
        }

        let total = self.staged.len();
        out.push(format!("APPLY_PROGRESS:start:{total} files"));
        for (i, (path, data)) in self.staged.iter().enumerate() {
            self.installed.insert(path.clone(), data.clone());
            out.push(format!("APPLY_PROGRESS:file:{}/{total}:{path}:done", i + 1));
        }
        out.push(format!("STEP3_APPLY_SUCCESS:{total} files installed"));
        out
    }

    fn step4_cleanup(&mut self) -> Vec<String> {
        self.staged.clear();
        self.restart();
        vec![
            "STEP4_CLEANUP_START".to_string(),
            "CLEANUP_PROGRESS:removing staged files".to_string(),
            "STEP4_CLEANUP_SUCCESS:staged files removed".to_string(),
            "STEP4_SUCCESS:all steps complete".to_string(),
            "RESTART_PROGRESS:restarting in 3 seconds".to_string(),
        ]
    }

    fn restart(&mut self) {
        self.upgrade_mode = false;
        self.open = None;
        self.restarts += 1;
        tracing::info!(restarts = self.restarts, "board restarting");
    }
}

fn ack(chunk_index: u32, success: bool, message: &str) -> String {
    ChunkAck {
        chunk_index,
        success,
        message: message.to_string(),
    }
    .to_string()
}

fn listing(tag: &str, files: &BTreeMap<String, Vec<u8>>) -> String {
    let names: Vec<&str> = files.keys().map(String::as_str).collect();
    format!("{tag}:{}:{}", names.len(), names.join(","))
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Simulated board. Starts connected.
pub struct SimulatedDevice {
    board: Mutex<Board>,
    sink: Mutex<Option<LinkSink>>,
    connected: AtomicBool,
}

impl SimulatedDevice {
    pub fn new() -> Arc<Self> {
        Self::with_faults(FaultPlan::default())
    }

    pub fn with_faults(faults: FaultPlan) -> Arc<Self> {
        let rng = StdRng::seed_from_u64(faults.seed);
        Arc::new(Self {
            board: Mutex::new(Board {
                upgrade_mode: false,
                open: None,
                staged: BTreeMap::new(),
                installed: BTreeMap::new(),
                backup: BTreeMap::new(),
                restarts: 0,
                received: Vec::new(),
                faults,
                rng,
            }),
            sink: Mutex::new(None),
            connected: AtomicBool::new(true),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            sink.set_connected(connected);
        }
    }

    /// Place a file on the board as if it shipped with it.
    pub fn install(&self, path: &str, data: Vec<u8>) {
        lock(&self.board).installed.insert(path.to_string(), data);
    }

    /// Every message written to the board, in order.
    pub fn received(&self) -> Vec<String> {
        lock(&self.board)
            .received
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    pub fn received_at(&self) -> Vec<(String, Instant)> {
        lock(&self.board).received.clone()
    }

    /// `FILE_DATA` writes, lost ones included.
    pub fn data_frames_received(&self) -> usize {
        lock(&self.board)
            .received
            .iter()
            .filter(|(m, _)| matches!(Command::parse(m), Ok(Command::FileData(_))))
            .count()
    }

    pub fn staged(&self) -> BTreeMap<String, Vec<u8>> {
        lock(&self.board).staged.clone()
    }

    pub fn installed(&self) -> BTreeMap<String, Vec<u8>> {
        lock(&self.board).installed.clone()
    }

    pub fn backup(&self) -> BTreeMap<String, Vec<u8>> {
        lock(&self.board).backup.clone()
    }

    pub fn restarts(&self) -> u32 {
        lock(&self.board).restarts
    }

    pub fn in_upgrade_mode(&self) -> bool {
        lock(&self.board).upgrade_mode
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn write(&self, message: &str) -> Result<(), LinkError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(LinkError::NotConnected);
        }

        let (replies, duplicate) = {
            let mut board = lock(&self.board);
            board.received.push((message.to_string(), Instant::now()));
            (board.handle(message), board.faults.duplicate_acks)
        };

        let sink = lock(&self.sink).clone();
        if let Some(sink) = sink {
            for reply in replies {
                let repeat = duplicate && reply.starts_with(ezlink_core::wire::ACK_PREFIX);
                sink.deliver(reply.as_str());
                if repeat {
                    sink.deliver(reply);
                }
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn attach(&self, sink: LinkSink) {
        *lock(&self.sink) = Some(sink);
    }
}
