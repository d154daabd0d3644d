//! Status router: classifies every inbound message exactly once.
//!
//! Acks go to the [`AckTracker`], advisory upgrade traffic goes to the
//! [`StatusReporter`], everything else is logged and dropped. Identical
//! texts seen again within a short window are discarded first: the radio
//! occasionally delivers a notification twice.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ezlink_core::config::RouterConfig;
use ezlink_core::wire::{ChunkAck, InboundKind};
use tokio::time::Instant;

use crate::ack::AckTracker;
use crate::link::InboundPayload;
use crate::status::{Severity, StagingAnalysis, StatusReporter};

/// Outcome of routing one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    Ack(u32),
    Status(Severity),
    Duplicate,
    Malformed,
    Ignored,
}

/// Bounded memory of recently routed messages, keyed by content hash.
#[derive(Debug)]
pub struct RecentMessages {
    window: Duration,
    retention: Duration,
    capacity: usize,
    entries: VecDeque<([u8; 32], Instant)>,
}

impl RecentMessages {
    pub fn new(window: Duration, retention: Duration, capacity: usize) -> Self {
        Self {
            window,
            retention,
            capacity: capacity.max(1),
            entries: VecDeque::new(),
        }
    }

    /// True if `text` was accepted less than one window ago. Duplicates do
    /// not refresh the remembered timestamp.
    pub fn is_duplicate(&mut self, text: &str, now: Instant) -> bool {
        self.evict(now);
        let hash = *blake3::hash(text.as_bytes()).as_bytes();

        if let Some(pos) = self.entries.iter().position(|(h, _)| *h == hash) {
            if now.duration_since(self.entries[pos].1) < self.window {
                return true;
            }
            self.entries.remove(pos);
        }

        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((hash, now));
        false
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    // Entries are kept in acceptance order, so the oldest sit at the front.
    fn evict(&mut self, now: Instant) {
        while let Some((_, seen)) = self.entries.front() {
            if now.duration_since(*seen) <= self.retention {
                break;
            }
            self.entries.pop_front();
        }
    }
}

pub struct StatusRouter {
    acks: AckTracker,
    reporter: Arc<dyn StatusReporter>,
    recent: Mutex<RecentMessages>,
    last_analysis: Mutex<Option<StagingAnalysis>>,
}

impl StatusRouter {
    pub fn new(acks: AckTracker, reporter: Arc<dyn StatusReporter>, config: &RouterConfig) -> Self {
        Self {
            acks,
            reporter,
            recent: Mutex::new(RecentMessages::new(
                config.dedup_window(),
                config.dedup_retention(),
                config.dedup_capacity,
            )),
            last_analysis: Mutex::new(None),
        }
    }

    /// Route one inbound message. Never panics on hostile input.
    pub fn route(&self, payload: &InboundPayload) -> Routed {
        let text = payload.to_text();
        let text = text.trim_end_matches(|c: char| c == '\r' || c == '\n');

        let duplicate = self
            .recent
            .lock()
            .map(|mut recent| recent.is_duplicate(text, Instant::now()))
            .unwrap_or(false);
        if duplicate {
            tracing::debug!(message = text, "duplicate inbound message dropped");
            return Routed::Duplicate;
        }

        match InboundKind::of(text) {
            InboundKind::Ack => match ChunkAck::parse(text) {
                Ok(ack) => {
                    let chunk_index = ack.chunk_index;
                    self.acks.record(ack);
                    Routed::Ack(chunk_index)
                }
                Err(e) => {
                    tracing::warn!(message = text, error = %e, "malformed ack dropped");
                    Routed::Malformed
                }
            },
            InboundKind::Status => {
                if let Some(analysis) = StagingAnalysis::parse(text) {
                    tracing::info!(
                        state = analysis.state.as_str(),
                        next = analysis.state.recommendation(),
                        "device staging analysis"
                    );
                    if let Ok(mut last) = self.last_analysis.lock() {
                        *last = Some(analysis);
                    }
                }
                let severity = Severity::of(text);
                self.reporter.report(text, severity);
                Routed::Status(severity)
            }
            InboundKind::Other => {
                if text.contains("CHUNK_ACK") {
                    tracing::warn!(message = text, "misplaced ack tag, dropping");
                } else {
                    tracing::debug!(message = text, "general inbound message");
                }
                Routed::Ignored
            }
        }
    }

    /// Most recent `STATUS_ANALYSIS` the board sent.
    pub fn last_analysis(&self) -> Option<StagingAnalysis> {
        self.last_analysis.lock().ok().and_then(|a| a.clone())
    }
}
