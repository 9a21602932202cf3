//! Work items and the values that flow through their lifecycle.
//!
//! A work item is one deferred call of a registered function. It exists from
//! submission until its terminal outcome (success, exhausted retries, or
//! cancellation) and is deleted at that point.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Work Item
// ---------------------------------------------------------------------------

/// A unit of work tracked by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: WorkId,

    /// Name of the registered function to call.
    pub fn_name: String,

    pub kind: WorkKind,

    /// Arguments passed to the function. Opaque to the scheduler.
    pub args: serde_json::Value,

    /// Optional display name used in events and logs.
    pub name: Option<String>,

    /// Number of attempts whose outcome has been applied.
    pub attempts: u32,

    pub retry: Option<RetryPolicy>,

    pub on_complete: Option<OnComplete>,

    /// Set by the loop once a cancelation has been processed. A canceled
    /// item that is still running finishes but never retries.
    pub canceled: bool,

    /// Submission time in milliseconds since the epoch.
    pub created_at: i64,
}

impl WorkItem {
    /// Name used in logs: the display name if set, else the function name.
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.fn_name)
    }
}

/// Newtype for work item IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(pub Uuid);

impl WorkId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub(crate) fn parse(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| Error::Other(format!("bad work id {s:?}: {e}")))
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::str::FromStr for WorkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Kind
// ---------------------------------------------------------------------------

/// What sort of function a work item calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkKind {
    /// Side-effect free read.
    Query,
    /// Transactional write.
    Mutation,
    /// Long-running call to the outside world.
    Action,
}

impl std::fmt::Display for WorkKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkKind::Query => "query",
            WorkKind::Mutation => "mutation",
            WorkKind::Action => "action",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for WorkKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "query" => Ok(WorkKind::Query),
            "mutation" => Ok(WorkKind::Mutation),
            "action" => Ok(WorkKind::Action),
            _ => Err(Error::Other(format!("unknown work kind: {s}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry
// ---------------------------------------------------------------------------

/// Upper bound on a policy's first backoff: one day.
pub const MAX_INITIAL_BACKOFF_MS: u64 = 24 * 60 * 60 * 1000;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub base: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 250,
            base: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_backoff_ms: u64, base: f64) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms,
            base,
        }
    }

    /// Whether another attempt is allowed after `attempts` completed ones.
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }

    /// Delay before the retry following `attempts` completed attempts:
    /// `initial * base^(attempts - 1) * jitter`, saturating at `i64::MAX`.
    pub fn backoff_ms(&self, attempts: u32, jitter: f64) -> i64 {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay = self.initial_backoff_ms as f64 * self.base.powi(exponent) * jitter;
        if delay.is_nan() || delay <= 0.0 {
            return 0;
        }
        // Float-to-int casts saturate, so an overflowing delay becomes i64::MAX.
        delay.round() as i64
    }

    /// Backoff with jitter drawn uniformly from `[0.5, 1.5)`.
    pub fn jittered_backoff_ms(&self, attempts: u32) -> i64 {
        use rand::Rng;
        let jitter = rand::rng().random_range(0.5..1.5);
        self.backoff_ms(attempts, jitter)
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(Error::InvalidWork("retry max_attempts must be >= 1".to_string()));
        }
        if self.initial_backoff_ms > MAX_INITIAL_BACKOFF_MS {
            return Err(Error::InvalidWork(format!(
                "retry initial_backoff_ms must be <= {MAX_INITIAL_BACKOFF_MS}, got {}",
                self.initial_backoff_ms
            )));
        }
        if !(self.base.is_finite() && self.base >= 1.0) {
            return Err(Error::InvalidWork(format!(
                "retry base must be a finite number >= 1, got {}",
                self.base
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// Callback invoked once with the terminal outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OnComplete {
    /// Name of the registered callback.
    pub function: String,
    /// Opaque context handed back to the callback.
    pub context: serde_json::Value,
}

/// Result of one attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    Success { value: serde_json::Value },
    Failed { error: String },
    Canceled,
}

impl Outcome {
    pub fn success(value: serde_json::Value) -> Self {
        Outcome::Success { value }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Outcome::Failed {
            error: error.into(),
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Success { .. } => OutcomeKind::Success,
            Outcome::Failed { .. } => OutcomeKind::Failed,
            Outcome::Canceled => OutcomeKind::Canceled,
        }
    }
}

/// Outcome with the payload stripped, as kept in the completion queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Failed,
    Canceled,
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Failed => "failed",
            OutcomeKind::Canceled => "canceled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for OutcomeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(OutcomeKind::Success),
            "failed" => Ok(OutcomeKind::Failed),
            "canceled" => Ok(OutcomeKind::Canceled),
            _ => Err(Error::Other(format!("unknown outcome: {s}"))),
        }
    }
}

/// An outcome reported for a specific attempt of a work item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReport {
    pub work_id: WorkId,
    /// The value of `WorkItem::attempts` when the attempt was started.
    pub attempt: u32,
    pub outcome: Outcome,
}

/// Delivered to a completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionEvent {
    pub work_id: WorkId,
    pub context: serde_json::Value,
    pub outcome: Outcome,
}

/// Derived status of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum WorkStatus {
    Pending { previous_attempts: u32 },
    Running { previous_attempts: u32 },
    Finished,
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkStatus::Pending { previous_attempts } => {
                write!(f, "pending (previous attempts: {previous_attempts})")
            }
            WorkStatus::Running { previous_attempts } => {
                write!(f, "running (previous attempts: {previous_attempts})")
            }
            WorkStatus::Finished => write!(f, "finished"),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// When a new work item becomes eligible to start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTime {
    /// As soon as capacity allows.
    Now,
    /// At an absolute time (ms since the epoch).
    At(i64),
    /// After a delay from submission.
    After(std::time::Duration),
}

/// Builder for submitting work. The scheduler's public API for new work.
#[derive(Debug, Clone)]
pub struct NewWork {
    pub(crate) fn_name: String,
    pub(crate) kind: WorkKind,
    pub(crate) args: serde_json::Value,
    pub(crate) name: Option<String>,
    pub(crate) run_time: RunTime,
    pub(crate) retry: Option<RetryPolicy>,
    pub(crate) on_complete: Option<OnComplete>,
}

impl NewWork {
    pub fn new(kind: WorkKind, fn_name: impl Into<String>) -> Self {
        Self {
            fn_name: fn_name.into(),
            kind,
            args: serde_json::Value::Null,
            name: None,
            run_time: RunTime::Now,
            retry: None,
            on_complete: None,
        }
    }

    pub fn action(fn_name: impl Into<String>) -> Self {
        Self::new(WorkKind::Action, fn_name)
    }

    pub fn mutation(fn_name: impl Into<String>) -> Self {
        Self::new(WorkKind::Mutation, fn_name)
    }

    pub fn query(fn_name: impl Into<String>) -> Self {
        Self::new(WorkKind::Query, fn_name)
    }

    pub fn args(mut self, args: serde_json::Value) -> Self {
        self.args = args;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn run_at(mut self, ms: i64) -> Self {
        self.run_time = RunTime::At(ms);
        self
    }

    pub fn run_after(mut self, delay: std::time::Duration) -> Self {
        self.run_time = RunTime::After(delay);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    pub fn on_complete(mut self, function: impl Into<String>, context: serde_json::Value) -> Self {
        self.on_complete = Some(OnComplete {
            function: function.into(),
            context,
        });
        self
    }

    /// Resolve the requested run time against `now`.
    pub(crate) fn run_at_ms(&self, now: i64) -> i64 {
        match self.run_time {
            RunTime::Now => now,
            RunTime::At(ms) => ms,
            RunTime::After(delay) => now.saturating_add(delay.as_millis() as i64),
        }
    }
}
