//! Launching executions.
//!
//! The loop decides what to start inside its transaction; after commit each
//! start becomes two tokio tasks. The inner task runs the user function so a
//! panic surfaces as a `JoinError` instead of unwinding through the pool.
//! The outer task turns the result into a completion report.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::task::AbortHandle;
use tracing::{Instrument, debug, error, warn};
use uuid::Uuid;

use super::Workpool;
use crate::error::Result;
use crate::event::{self, EventKind};
use crate::model::scheduler::RunningEntry;
use crate::model::work::{CompletionReport, Outcome, WorkItem};
use crate::registry::{HandlerResult, Invocation};
use crate::segment;
use crate::telemetry::work::{record_outcome, start_work_span};

/// Tries at recording an outcome before leaving the attempt to recovery.
const REPORT_TRIES: u32 = 5;

/// Delay before the second try; doubles after each failure.
const REPORT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// A start committed by the loop, waiting to be launched.
#[derive(Debug, Clone)]
pub(crate) struct Launch {
    pub item: WorkItem,
    pub entry: RunningEntry,
    /// When the start became due, for the start-lag metric.
    pub due_ms: i64,
}

struct Execution {
    task: AbortHandle,
    reporter: AbortHandle,
}

type Table = HashMap<Uuid, Execution>;

/// Executions launched by this process, keyed by running-entry handle.
#[derive(Clone, Default)]
pub(crate) struct Executions {
    inner: Arc<Mutex<Table>>,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Executions {
    /// Whether the execution is still running or still reporting.
    pub(crate) fn is_alive(&self, handle: Uuid) -> bool {
        lock(&self.inner)
            .get(&handle)
            .is_some_and(|e| !e.reporter.is_finished())
    }

    fn remove(&self, handle: Uuid) {
        lock(&self.inner).remove(&handle);
    }

    pub(crate) fn abort_all(&self) {
        for (_, execution) in lock(&self.inner).drain() {
            execution.task.abort();
            execution.reporter.abort();
        }
    }
}

impl Workpool {
    pub(crate) fn launch(&self, launch: Launch) {
        let Launch {
            item,
            entry,
            due_ms,
        } = launch;
        let handle = entry.handle;
        let attempt = entry.attempt;
        let work_id = item.id;

        let span = start_work_span(&item.fn_name, item.kind, work_id, attempt);
        event::emit(
            self.options.config.log_level,
            &EventKind::Started {
                id: work_id,
                function: item.fn_name.clone(),
                attempt,
                start_lag_ms: entry.started_at - due_ms,
            },
        );

        let invocation = Invocation {
            work_id,
            attempt,
            kind: item.kind,
            args: item.args,
        };
        let handler = self.registry.handler(&item.fn_name).cloned();
        let fn_name = item.fn_name;

        // Held across both spawns so the reporter cannot deregister first.
        let mut table = lock(&self.executions.inner);

        let task: tokio::task::JoinHandle<HandlerResult> = match handler {
            Some(handler) => tokio::spawn(handler(invocation).instrument(span.clone())),
            None => {
                warn!(function = %fn_name, %work_id, "no handler registered");
                let message = format!("no handler registered for {fn_name}");
                tokio::spawn(async move { Err(message) })
            }
        };
        let task_abort = task.abort_handle();

        let pool = self.clone();
        let reporter_span = span.clone();
        let reporter = tokio::spawn(
            async move {
                let started = Instant::now();
                let outcome = match task.await {
                    Ok(Ok(value)) => Outcome::success(value),
                    Ok(Err(message)) => Outcome::failed(message),
                    Err(e) if e.is_panic() => {
                        Outcome::failed(format!("panicked: {}", panic_message(e.into_panic())))
                    }
                    Err(_) => {
                        // Aborted by shutdown; recovery owns this attempt now.
                        debug!(%work_id, "execution aborted");
                        pool.executions.remove(handle);
                        return;
                    }
                };
                record_outcome(
                    &span,
                    outcome.kind(),
                    started.elapsed().as_millis() as u64,
                );

                let report = CompletionReport {
                    work_id,
                    attempt,
                    outcome,
                };
                if let Err(e) = report_outcome(&pool, report).await {
                    error!(%work_id, attempt, "failed to record completion: {e}");
                }
                pool.executions.remove(handle);
            }
            .instrument(reporter_span),
        );

        table.retain(|_, e| !e.reporter.is_finished());
        table.insert(
            handle,
            Execution {
                task: task_abort,
                reporter: reporter.abort_handle(),
            },
        );
        debug!(
            %work_id,
            attempt,
            lag_ms = segment::now_ms() - due_ms,
            "execution launched"
        );
    }
}

/// Record an outcome, retrying store failures with a growing delay. Gives up
/// early once the pool is shut down.
async fn report_outcome(pool: &Workpool, report: CompletionReport) -> Result<()> {
    let mut delay = REPORT_RETRY_DELAY;
    let mut tries = 1;
    loop {
        match pool.complete(vec![report.clone()]).await {
            Ok(()) => return Ok(()),
            Err(e) if tries < REPORT_TRIES && !pool.closed.load(Ordering::SeqCst) => {
                warn!(
                    work_id = %report.work_id,
                    tries,
                    "recording completion failed, retrying: {e}"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                tries += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(super) fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
