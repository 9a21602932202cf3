//! Scheduler bookkeeping: loop state, run status, pool config, queue rows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::work::{OutcomeKind, WorkId};
use crate::error::{Error, Result};

/// Hard ceiling on `max_parallelism`.
pub const MAX_POSSIBLE_PARALLELISM: u32 = 100;
/// Above this a warning is logged on submission.
pub const RECOMMENDED_MAX_PARALLELISM: u32 = 50;
pub const DEFAULT_MAX_PARALLELISM: u32 = 10;

// ---------------------------------------------------------------------------
// Scheduler state
// ---------------------------------------------------------------------------

/// The loop's singleton record. Mutated by loop passes inside their
/// transaction; kicks only bump the generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    /// Fencing token. A pass must present the current value to proceed.
    pub generation: i64,
    pub cursors: SegmentCursors,
    pub last_recovery: i64,
    pub running: Vec<RunningEntry>,
    pub report: ReportStats,
}

impl SchedulerState {
    pub fn new(segment: i64, now_ms: i64) -> Self {
        Self {
            generation: 0,
            cursors: SegmentCursors {
                incoming: segment,
                completion: segment,
                cancelation: segment,
            },
            last_recovery: segment,
            running: Vec::new(),
            report: ReportStats::new(now_ms),
        }
    }

    pub fn is_running(&self, work_id: WorkId) -> bool {
        self.running.iter().any(|r| r.work_id == work_id)
    }

    /// Remove a work item from the running list. Returns the entry if present.
    pub fn take_running(&mut self, work_id: WorkId) -> Option<RunningEntry> {
        let idx = self.running.iter().position(|r| r.work_id == work_id)?;
        Some(self.running.swap_remove(idx))
    }
}

/// Low-water marks for the three segment-indexed queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentCursors {
    pub incoming: i64,
    pub completion: i64,
    pub cancelation: i64,
}

/// An execution the loop has launched and not yet seen complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningEntry {
    pub work_id: WorkId,
    /// Identifies the in-process execution task.
    pub handle: Uuid,
    pub started_at: i64,
    /// `WorkItem::attempts` at launch.
    pub attempt: u32,
}

/// Rolling counters for the periodic report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportStats {
    pub completed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub retried: u64,
    pub canceled: u64,
    pub recovered: u64,
    pub last_report_ts: i64,
}

impl ReportStats {
    pub fn new(now_ms: i64) -> Self {
        Self {
            completed: 0,
            succeeded: 0,
            failed: 0,
            retried: 0,
            canceled: 0,
            recovered: 0,
            last_report_ts: now_ms,
        }
    }

    /// Count a terminal outcome.
    pub fn record_terminal(&mut self, outcome: OutcomeKind) {
        self.completed += 1;
        match outcome {
            OutcomeKind::Success => self.succeeded += 1,
            OutcomeKind::Failed => self.failed += 1,
            OutcomeKind::Canceled => self.canceled += 1,
        }
    }

    /// Reset the counters and advance the window by whole intervals so the
    /// report stays anchored to its original phase.
    pub fn roll(&mut self, now_ms: i64, interval_ms: i64) {
        let elapsed = now_ms - self.last_report_ts;
        let whole = if interval_ms > 0 {
            elapsed.div_euclid(interval_ms).max(1)
        } else {
            1
        };
        *self = Self::new(self.last_report_ts + whole * interval_ms);
    }
}

// ---------------------------------------------------------------------------
// Run status
// ---------------------------------------------------------------------------

/// Whether a loop pass is scheduled, running, or not needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunStatus {
    Idle {
        generation: i64,
    },
    Scheduled {
        segment: i64,
        handle: Uuid,
        saturated: bool,
        generation: i64,
    },
    Running,
}

impl RunStatus {
    pub fn label(&self) -> &'static str {
        match self {
            RunStatus::Idle { .. } => "idle",
            RunStatus::Scheduled { .. } => "scheduled",
            RunStatus::Running => "running",
        }
    }
}

// ---------------------------------------------------------------------------
// Pool config
// ---------------------------------------------------------------------------

/// Verbosity of scheduler events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DEBUG" | "TRACE" => Ok(LogLevel::Debug),
            "INFO" | "REPORT" => Ok(LogLevel::Info),
            "WARN" => Ok(LogLevel::Warn),
            "ERROR" => Ok(LogLevel::Error),
            _ => Err(Error::Config(format!("unknown log level: {s}"))),
        }
    }
}

/// Externally mutable pool configuration, persisted as a singleton.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub max_parallelism: u32,
    pub log_level: LogLevel,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            log_level: LogLevel::Info,
        }
    }
}

impl PoolConfig {
    /// Reject out-of-range parallelism. Warns above the recommended ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.max_parallelism < 1 {
            return Err(Error::InvalidConfig(
                "max_parallelism must be at least 1".to_string(),
            ));
        }
        if self.max_parallelism > MAX_POSSIBLE_PARALLELISM {
            return Err(Error::InvalidConfig(format!(
                "max_parallelism must be at most {MAX_POSSIBLE_PARALLELISM}, got {}",
                self.max_parallelism
            )));
        }
        if self.max_parallelism > RECOMMENDED_MAX_PARALLELISM {
            tracing::warn!(
                max_parallelism = self.max_parallelism,
                recommended = RECOMMENDED_MAX_PARALLELISM,
                "max_parallelism above recommended ceiling"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue rows
// ---------------------------------------------------------------------------

/// Intent to begin (or retry) a work item at or after `segment`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStart {
    pub work_id: WorkId,
    pub segment: i64,
}

/// An applied outcome waiting for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCompletion {
    pub work_id: WorkId,
    pub attempt: u32,
    pub outcome: OutcomeKind,
    pub retry: bool,
    /// Applied by recovery for an execution presumed lost.
    pub recovered: bool,
    pub segment: i64,
}

/// A cancellation request waiting for the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingCancelation {
    pub work_id: WorkId,
    pub segment: i64,
}

/// On-demand view of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub waiting: u64,
    pub running: u64,
    pub completing: u64,
    pub canceling: u64,
    pub spare_capacity: u64,
}
