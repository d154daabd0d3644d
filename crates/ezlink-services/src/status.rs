//! Upgrade status surface: severity classification, the reporter seam and
//! the board's staging-area analysis.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    Progress,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Progress => "progress",
        })
    }
}

impl Severity {
    /// Classify a board status line by its leading tag.
    ///
    /// Only the text before the first `:` is inspected; the free-text tail
    /// never changes the verdict.
    pub fn of(text: &str) -> Self {
        let tag = text.split(':').next().unwrap_or_default();
        if tag.contains("ERROR") {
            Severity::Error
        } else if tag.contains("WARNING") {
            Severity::Warning
        } else if tag.ends_with("_PROGRESS") || tag.ends_with("_PHASE") || tag == "BACKUP_FILE_START" {
            Severity::Progress
        } else if tag.ends_with("_SUCCESS") || tag.ends_with("_COMPLETE") {
            Severity::Success
        } else {
            Severity::Info
        }
    }
}

/// Receives advisory upgrade messages forwarded by the router.
pub trait StatusReporter: Send + Sync {
    fn report(&self, text: &str, severity: Severity);
}

impl<F> StatusReporter for F
where
    F: Fn(&str, Severity) + Send + Sync,
{
    fn report(&self, text: &str, severity: Severity) {
        self(text, severity)
    }
}

/// Default reporter: log and move on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl StatusReporter for TracingReporter {
    fn report(&self, text: &str, severity: Severity) {
        match severity {
            Severity::Error => tracing::error!(%severity, "{text}"),
            Severity::Warning => tracing::warn!(%severity, "{text}"),
            _ => tracing::info!(%severity, "{text}"),
        }
    }
}

// ── Staging analysis ──────────────────────────────────────────────────────────

/// What the board's temp and backup areas allow next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagingState {
    /// Files staged, no backup yet.
    Step2Ready,
    /// Files staged and backed up.
    Step3Ready,
    /// Only a backup remains.
    RollbackReady,
    Clean,
}

impl StagingState {
    fn parse(tag: &str) -> Option<Self> {
        match tag {
            "STEP2_READY" => Some(StagingState::Step2Ready),
            "STEP3_READY" => Some(StagingState::Step3Ready),
            "ROLLBACK_READY" => Some(StagingState::RollbackReady),
            "CLEAN" => Some(StagingState::Clean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StagingState::Step2Ready => "STEP2_READY",
            StagingState::Step3Ready => "STEP3_READY",
            StagingState::RollbackReady => "ROLLBACK_READY",
            StagingState::Clean => "CLEAN",
        }
    }

    /// The operator action this state suggests.
    pub fn recommendation(&self) -> &'static str {
        match self {
            StagingState::Step2Ready => "run the backup step",
            StagingState::Step3Ready => "run the apply step",
            StagingState::RollbackReady => "roll back if the current firmware misbehaves",
            StagingState::Clean => "ready for a new upgrade",
        }
    }
}

/// `STATUS_ANALYSIS:<STATE>:<detail>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingAnalysis {
    pub state: StagingState,
    pub detail: String,
}

impl StagingAnalysis {
    pub const PREFIX: &'static str = "STATUS_ANALYSIS:";

    pub fn parse(text: &str) -> Option<Self> {
        let body = text.strip_prefix(Self::PREFIX)?;
        let (tag, detail) = body.split_once(':').unwrap_or((body, ""));
        Some(Self {
            state: StagingState::parse(tag)?,
            detail: detail.to_string(),
        })
    }
}

impl fmt::Display for StagingAnalysis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}:{}", Self::PREFIX, self.state.as_str(), self.detail)
    }
}
