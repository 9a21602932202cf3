//! Structured events emitted by the scheduler.
//!
//! Every event updates the matching OTel instrument. Events at or above the
//! pool's configured log level are also written as `tracing` events under the
//! `workpool::event` target, with the full payload as JSON, so log pipelines
//! can rebuild lifecycles without parsing messages.

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

use crate::model::scheduler::LogLevel;
use crate::model::work::{OutcomeKind, WorkId, WorkKind};
use crate::telemetry::metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Enqueued {
        id: WorkId,
        function: String,
        kind: WorkKind,
        segment: i64,
    },
    Started {
        id: WorkId,
        function: String,
        attempt: u32,
        /// Time from becoming due to being launched.
        start_lag_ms: i64,
    },
    Completed {
        id: WorkId,
        function: String,
        outcome: OutcomeKind,
        attempts: u32,
        /// Time from submission to the terminal outcome.
        total_ms: i64,
    },
    Retrying {
        id: WorkId,
        function: String,
        attempts: u32,
        backoff_ms: i64,
    },
    Recovered {
        id: WorkId,
        attempt: u32,
        running_ms: i64,
    },
    Report {
        generation: i64,
        running: u64,
        spare_capacity: u64,
        completed: u64,
        succeeded: u64,
        failed: u64,
        retried: u64,
        canceled: u64,
        recovered: u64,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::Enqueued { .. } => "enqueued",
            EventKind::Started { .. } => "started",
            EventKind::Completed { .. } => "completed",
            EventKind::Retrying { .. } => "retrying",
            EventKind::Recovered { .. } => "recovered",
            EventKind::Report { .. } => "report",
        }
    }

    /// Lowest configured level at which this event is logged.
    pub fn level(&self) -> LogLevel {
        match self {
            EventKind::Enqueued { .. } | EventKind::Started { .. } | EventKind::Retrying { .. } => {
                LogLevel::Debug
            }
            EventKind::Completed { .. } | EventKind::Report { .. } => LogLevel::Info,
            EventKind::Recovered { .. } => LogLevel::Warn,
        }
    }
}

/// Tracing target every lifecycle event is logged under.
pub const TARGET: &str = "workpool::event";

/// Record an event's metrics and log it if `configured` allows.
pub fn emit(configured: LogLevel, event: &EventKind) {
    record_metrics(event);

    if event.level() < configured {
        return;
    }
    let payload = serde_json::to_string(event).unwrap_or_default();
    match event.level() {
        LogLevel::Warn | LogLevel::Error => {
            tracing::warn!(target: TARGET, event = event.name(), %payload)
        }
        _ => tracing::info!(target: TARGET, event = event.name(), %payload),
    }
}

fn record_metrics(event: &EventKind) {
    match event {
        EventKind::Enqueued { function, kind, .. } => metrics::work_enqueued().add(
            1,
            &[
                KeyValue::new("function", function.clone()),
                KeyValue::new("kind", kind.to_string()),
            ],
        ),
        EventKind::Started {
            function,
            start_lag_ms,
            ..
        } => {
            metrics::work_started().add(1, &[KeyValue::new("function", function.clone())]);
            metrics::start_lag_ms().record(
                (*start_lag_ms).max(0) as f64,
                &[KeyValue::new("function", function.clone())],
            );
        }
        EventKind::Completed {
            function,
            outcome,
            total_ms,
            ..
        } => {
            let labels = [
                KeyValue::new("function", function.clone()),
                KeyValue::new("outcome", outcome.to_string()),
            ];
            metrics::work_completed().add(1, &labels);
            metrics::work_duration_ms().record((*total_ms).max(0) as f64, &labels);
        }
        EventKind::Retrying { function, .. } => {
            metrics::work_retried().add(1, &[KeyValue::new("function", function.clone())])
        }
        EventKind::Recovered { .. } => metrics::work_recovered().add(1, &[]),
        EventKind::Report { .. } => {}
    }
}
