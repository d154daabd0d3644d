//! Acknowledgment tracking: correlates `CHUNK_ACK` replies with chunk sends.
//!
//! Records are keyed by chunk index. A record is consumed by exactly one
//! wait; a second ack for the same index overwrites an unconsumed record
//! rather than queueing behind it. Each pending send owns a [`Notify`],
//! so the receive path wakes the matching waiter directly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use ezlink_core::config::UploadConfig;
use ezlink_core::wire::ChunkAck;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use crate::error::TransferError;
use crate::frame::Frame;
use crate::link::Link;

/// Message carried by the synthetic record a timed-out wait returns.
pub const ACK_TIMEOUT_MESSAGE: &str = "ACK timeout";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckRecord {
    pub chunk_index: u32,
    pub success: bool,
    pub message: String,
    pub observed_at: Instant,
    /// Set only on the synthetic record of an expired wait.
    pub timed_out: bool,
}

impl AckRecord {
    fn observed(ack: ChunkAck) -> Self {
        Self {
            chunk_index: ack.chunk_index,
            success: ack.success,
            message: ack.message,
            observed_at: Instant::now(),
            timed_out: false,
        }
    }

    fn timeout(chunk_index: u32) -> Self {
        Self {
            chunk_index,
            success: false,
            message: ACK_TIMEOUT_MESSAGE.to_string(),
            observed_at: Instant::now(),
            timed_out: true,
        }
    }
}

struct PendingAck {
    sent_at: Instant,
    notify: Arc<Notify>,
}

impl PendingAck {
    fn new() -> Self {
        Self {
            sent_at: Instant::now(),
            notify: Arc::new(Notify::new()),
        }
    }
}

/// How hard to push a single chunk through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Wait after the first send.
    pub ack_timeout: Duration,
    /// Wait after each retransmission.
    pub retry_ack_timeout: Duration,
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(upload: &UploadConfig) -> Self {
        Self {
            ack_timeout: upload.ack_timeout(),
            retry_ack_timeout: upload.retry_ack_timeout(),
            max_retries: upload.max_retries,
            base_delay: upload.retry_base_delay(),
        }
    }

    /// Pause before retransmission `attempt` (1-based). Linear.
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UploadConfig::default())
    }
}

/// Shared ack table. Clone to hand to the receive path.
#[derive(Clone, Default)]
pub struct AckTracker {
    records: Arc<DashMap<u32, AckRecord>>,
    pending: Arc<DashMap<u32, PendingAck>>,
    retransmissions: Arc<AtomicU64>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a send for `chunk_index`, discarding any stale record.
    pub fn expect(&self, chunk_index: u32) {
        self.records.remove(&chunk_index);
        self.pending.insert(chunk_index, PendingAck::new());
    }

    /// Store an observed ack and wake its waiter. Last write wins.
    pub fn record(&self, ack: ChunkAck) {
        let chunk_index = ack.chunk_index;
        let success = ack.success;
        if self
            .records
            .insert(chunk_index, AckRecord::observed(ack))
            .is_some()
        {
            tracing::debug!(chunk_index, "ack replaced an unconsumed record");
        }

        match self.pending.get(&chunk_index) {
            Some(pending) => {
                tracing::debug!(
                    chunk_index,
                    success,
                    rtt_ms = pending.sent_at.elapsed().as_millis() as u64,
                    "ack observed"
                );
                pending.notify.notify_one();
            }
            None => tracing::debug!(chunk_index, "ack with no pending send"),
        }
    }

    /// Suspend until the ack for `chunk_index` arrives or `timeout` elapses.
    ///
    /// Consumes the record. On expiry returns a synthetic failure record
    /// with `timed_out` set.
    pub async fn wait(&self, chunk_index: u32, timeout: Duration) -> AckRecord {
        let deadline = Instant::now() + timeout;
        let notify = self
            .pending
            .entry(chunk_index)
            .or_insert_with(PendingAck::new)
            .notify
            .clone();

        loop {
            if let Some((_, record)) = self.records.remove(&chunk_index) {
                self.pending.remove(&chunk_index);
                return record;
            }
            if time::timeout_at(deadline, notify.notified()).await.is_err() {
                break;
            }
        }

        self.pending.remove(&chunk_index);
        // An ack may have landed right at the deadline.
        if let Some((_, record)) = self.records.remove(&chunk_index) {
            return record;
        }
        tracing::warn!(chunk_index, timeout_ms = timeout.as_millis() as u64, "ack timeout");
        AckRecord::timeout(chunk_index)
    }

    /// Send `frame` and retransmit until acknowledged or retries run out.
    ///
    /// The first wait uses `ack_timeout`; retransmission N is preceded by
    /// `backoff(N)` and waits `retry_ack_timeout`. Link failures abort at
    /// once without retrying. Once `cancelled` is set, the outstanding wait
    /// still runs out but no further retransmission is made.
    pub async fn deliver(
        &self,
        link: &Link,
        frame: &Frame,
        policy: &RetryPolicy,
        cancelled: &AtomicBool,
    ) -> Result<AckRecord, TransferError> {
        let chunk_index = frame.sequence;

        self.expect(chunk_index);
        link.send(frame.encoded.as_str()).await?;
        let mut ack = self.wait(chunk_index, policy.ack_timeout).await;

        let mut attempt = 0;
        while !ack.success {
            if attempt == policy.max_retries {
                tracing::error!(chunk_index, attempts = attempt, reason = %ack.message, "retransmissions exhausted");
                return Err(TransferError::ChunkTransferFailed {
                    chunk_index,
                    attempts: policy.max_retries,
                });
            }
            if cancelled.load(Ordering::Acquire) {
                tracing::info!(chunk_index, "cancelled, not retransmitting");
                return Err(TransferError::Cancelled);
            }
            attempt += 1;
            self.retransmissions.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                chunk_index,
                attempt,
                max_retries = policy.max_retries,
                reason = %ack.message,
                "retransmitting chunk"
            );

            time::sleep(policy.backoff(attempt)).await;
            self.expect(chunk_index);
            link.send(frame.encoded.as_str()).await?;
            ack = self.wait(chunk_index, policy.retry_ack_timeout).await;
        }

        if attempt > 0 {
            tracing::info!(chunk_index, attempt, "chunk recovered after retransmission");
        }
        Ok(ack)
    }

    pub fn is_pending(&self, chunk_index: u32) -> bool {
        self.pending.contains_key(&chunk_index)
    }

    /// Retransmissions since the last [`reset_stats`](Self::reset_stats).
    pub fn retransmissions(&self) -> u64 {
        self.retransmissions.load(Ordering::Relaxed)
    }

    pub fn reset_stats(&self) {
        self.retransmissions.store(0, Ordering::Relaxed);
    }

    /// Forget every record and pending send. Waiters run to their timeout.
    pub fn clear(&self) {
        self.records.clear();
        self.pending.clear();
    }
}
