//! Reconciling executions presumed lost.
//!
//! The loop hands over running entries older than the recovery threshold.
//! An entry whose execution is still alive in this process is left alone;
//! any other gets a `failed("execution lost")` outcome, which retries or
//! finalizes the item per its policy.

use std::collections::HashMap;

use tracing::{debug, info};

use super::Workpool;
use crate::error::Result;
use crate::event::{self, EventKind};
use crate::model::scheduler::RunningEntry;
use crate::model::work::{CompletionReport, Outcome};
use crate::segment;

pub(crate) const LOST_EXECUTION: &str = "execution lost";

impl Workpool {
    pub(crate) async fn recover(&self, entries: Vec<RunningEntry>) -> Result<()> {
        let mut started_at = HashMap::new();
        let mut reports = Vec::new();
        for entry in entries {
            if self.executions.is_alive(entry.handle) {
                debug!(work_id = %entry.work_id, "execution still alive, not recovering");
                continue;
            }
            started_at.insert(entry.work_id, (entry.attempt, entry.started_at));
            reports.push(CompletionReport {
                work_id: entry.work_id,
                attempt: entry.attempt,
                outcome: Outcome::failed(LOST_EXECUTION),
            });
        }
        if reports.is_empty() {
            return Ok(());
        }

        let applied = self.apply_reports(reports, true).await?;
        let now = segment::now_ms();
        for work_id in &applied {
            if let Some(&(attempt, started)) = started_at.get(work_id) {
                event::emit(
                    self.options.config.log_level,
                    &EventKind::Recovered {
                        id: *work_id,
                        attempt,
                        running_ms: now - started,
                    },
                );
            }
        }
        if !applied.is_empty() {
            info!(recovered = applied.len(), "lost executions reconciled");
        }
        Ok(())
    }
}
