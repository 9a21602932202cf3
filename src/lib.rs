//! # workpool
//!
//! A durable, parallelism-bounded work scheduler backed by SQLite.
//!
//! Work items name a registered function, carry JSON arguments, and may be
//! delayed, retried with exponential backoff, and canceled. At most
//! `max_parallelism` run at once. All scheduler state lives in the store, so
//! executions lost to a crash are recovered by whichever process resumes the
//! pool.

pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod event;
pub mod model;
pub mod registry;
pub mod segment;
pub mod telemetry;

pub use engine::{CancelAllPage, CancelCursor, PoolOptions, Workpool};
pub use error::{Error, Result};
pub use model::scheduler::{LogLevel, PoolConfig, Snapshot};
pub use model::work::{
    CompletionEvent, CompletionReport, NewWork, Outcome, RetryPolicy, WorkId, WorkKind,
    WorkStatus,
};
pub use registry::{FunctionRegistry, Invocation};
