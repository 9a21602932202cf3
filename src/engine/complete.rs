//! Applying attempt outcomes.
//!
//! Executions push their outcome here, the loop synthesizes `canceled`
//! outcomes here, and recovery applies `failed("execution lost")` here. The
//! attempt check makes the first application of an attempt win; later ones
//! are dropped.

use tracing::{debug, warn};

use super::Workpool;
use super::kick::{self, KickSource};
use crate::db::{Conn, queues, state, work};
use crate::error::Result;
use crate::event::{self, EventKind};
use crate::model::scheduler::{LogLevel, PendingCompletion, ReportStats};
use crate::model::work::{CompletionEvent, CompletionReport, Outcome, OutcomeKind, WorkId};
use crate::segment;

/// A completion callback to invoke after commit.
#[derive(Debug, Clone)]
pub(crate) struct PendingCallback {
    pub function: String,
    pub event: CompletionEvent,
}

/// What applying one report changed.
#[derive(Debug, Clone)]
pub(crate) struct Applied {
    pub work_id: WorkId,
    pub retry: bool,
    pub callback: Option<PendingCallback>,
}

/// Apply one report inside the caller's transaction.
///
/// Returns `None` when the report is stale: the item is gone or the attempt
/// it names has already been applied. A terminal `canceled` outcome never
/// reaches the completion queue, so the loop passes its `stats` to count it
/// here. `recovered` marks the completion row so the loop counts the
/// recovery when it drains it.
pub(crate) async fn apply_outcome(
    conn: &mut Conn,
    report: &CompletionReport,
    segment: i64,
    log_level: LogLevel,
    stats: Option<&mut ReportStats>,
    recovered: bool,
) -> Result<Option<Applied>> {
    let Some(mut item) = work::get_work(conn, report.work_id).await? else {
        debug!(work_id = %report.work_id, "completion for finished item, ignoring");
        return Ok(None);
    };
    if item.attempts != report.attempt {
        debug!(
            work_id = %report.work_id,
            reported = report.attempt,
            current = item.attempts,
            "completion for stale attempt, ignoring"
        );
        return Ok(None);
    }

    item.attempts += 1;
    let kind = report.outcome.kind();
    let retry = kind == OutcomeKind::Failed
        && item
            .retry
            .is_some_and(|policy| policy.allows_retry(item.attempts));

    let mut callback = None;
    if retry {
        work::set_attempts(conn, item.id, item.attempts).await?;
    } else {
        callback = item.on_complete.as_ref().map(|on_complete| PendingCallback {
            function: on_complete.function.clone(),
            event: CompletionEvent {
                work_id: item.id,
                context: on_complete.context.clone(),
                outcome: report.outcome.clone(),
            },
        });
        work::delete_work(conn, item.id).await?;
        if let (OutcomeKind::Canceled, Some(stats)) = (kind, stats) {
            stats.record_terminal(kind);
        }
        event::emit(
            log_level,
            &EventKind::Completed {
                id: item.id,
                function: item.label().to_string(),
                outcome: kind,
                attempts: item.attempts,
                total_ms: segment::now_ms() - item.created_at,
            },
        );
    }

    if kind != OutcomeKind::Canceled {
        let inserted = queues::insert_completion(
            conn,
            PendingCompletion {
                work_id: item.id,
                attempt: report.attempt,
                outcome: kind,
                retry,
                recovered,
                segment,
            },
        )
        .await?;
        if !inserted {
            warn!(work_id = %item.id, "completion already pending for item");
        }
    }

    Ok(Some(Applied {
        work_id: item.id,
        retry,
        callback,
    }))
}

impl Workpool {
    /// Report attempt outcomes. Reports for finished items or already
    /// applied attempts are ignored, so reporting twice is harmless.
    pub async fn complete(&self, reports: Vec<CompletionReport>) -> Result<()> {
        self.apply_reports(reports, false).await?;
        Ok(())
    }

    /// Apply reports in one transaction, then run their callbacks. Returns
    /// the IDs of the reports that took effect.
    pub(crate) async fn apply_reports(
        &self,
        reports: Vec<CompletionReport>,
        recovered: bool,
    ) -> Result<Vec<WorkId>> {
        if reports.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.db.begin().await?;
        let kick = kick::kick(&mut tx, KickSource::Complete, false).await?;
        let config = state::load_globals(&mut tx).await?;

        let mut applied_ids = Vec::new();
        let mut callbacks = Vec::new();
        for report in &reports {
            let applied =
                apply_outcome(&mut tx, report, kick.segment, config.log_level, None, recovered)
                    .await?;
            if let Some(applied) = applied {
                debug!(work_id = %applied.work_id, retry = applied.retry, "outcome applied");
                applied_ids.push(applied.work_id);
                callbacks.extend(applied.callback);
            }
        }

        tx.commit().await?;

        self.arm(kick);
        self.run_callbacks(callbacks);
        Ok(applied_ids)
    }

    /// Invoke completion callbacks. Each runs in its own task; failures are
    /// logged and dropped.
    pub(crate) fn run_callbacks(&self, callbacks: Vec<PendingCallback>) {
        for pending in callbacks {
            let Some(callback) = self.registry.callback(&pending.function).cloned() else {
                if self.driver {
                    warn!(
                        callback = %pending.function,
                        work_id = %pending.event.work_id,
                        "no callback registered, dropping completion"
                    );
                }
                continue;
            };
            let work_id = pending.event.work_id;
            let function = pending.function;
            tokio::spawn(async move {
                if let Err(e) = callback(pending.event).await {
                    warn!(callback = %function, %work_id, "completion callback failed: {e}");
                }
            });
        }
    }
}

/// Shorthand used by the loop for cooperative cancellation.
pub(crate) fn canceled(work_id: WorkId, attempt: u32) -> CompletionReport {
    CompletionReport {
        work_id,
        attempt,
        outcome: Outcome::Canceled,
    }
}
