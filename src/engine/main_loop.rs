//! The loop pass.
//!
//! One pass drains everything due up to its segment inside a single
//! transaction: completions, then cancelations, then the recovery sweep, then
//! starts. Side effects on the outside world (launches, callbacks, recovery)
//! run after commit. A second transaction then decides when the next pass
//! runs, or parks the loop as idle.

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::complete::{self, PendingCallback, apply_outcome};
use super::executor::Launch;
use super::{Deferred, Workpool};
use crate::db::queues::{self, Queue};
use crate::db::{Conn, state, work};
use crate::error::Result;
use crate::event::{self, EventKind};
use crate::model::scheduler::{
    PendingStart, PoolConfig, RunStatus, RunningEntry, SchedulerState,
};
use crate::segment;
use crate::telemetry::metrics;

/// Interval between report events.
const REPORT_INTERVAL_MS: i64 = 60_000;

/// Effects gathered by a pass and carried out after commit.
#[derive(Default)]
struct Effects {
    callbacks: Vec<PendingCallback>,
    launches: Vec<Launch>,
    recover: Vec<RunningEntry>,
}

/// When the loop should run next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Wake {
    At { segment: i64, saturated: bool },
    Idle,
}

impl Workpool {
    pub(crate) async fn main_loop(&self, generation: i64, target: i64) -> Result<()> {
        let now = segment::now_ms();
        let upper = target.max(segment::current_segment());

        let mut tx = self.db.begin().await?;
        let mut scheduler = state::load_state(&mut tx).await?;
        if scheduler.generation != generation {
            debug!(
                expected = generation,
                found = scheduler.generation,
                "stale loop pass, skipping"
            );
            metrics::loop_passes().add(1, &[KeyValue::new("result", "stale")]);
            return Ok(());
        }
        scheduler.generation += 1;
        state::save_run_status(&mut tx, &RunStatus::Running).await?;
        let config = state::load_globals(&mut tx).await?;

        let mut effects = Effects::default();
        self.drain_completions(&mut tx, &mut scheduler, &config, upper, now, &mut effects)
            .await?;
        self.drain_cancelations(&mut tx, &mut scheduler, &config, upper, &mut effects)
            .await?;
        self.sweep_running(&mut tx, &mut scheduler, upper, now, &mut effects)
            .await?;
        self.start_due(&mut tx, &mut scheduler, &config, upper, now, &mut effects)
            .await?;

        if now - scheduler.report.last_report_ts >= REPORT_INTERVAL_MS {
            let report = &scheduler.report;
            event::emit(
                config.log_level,
                &EventKind::Report {
                    generation: scheduler.generation,
                    running: scheduler.running.len() as u64,
                    spare_capacity: spare_capacity(&config, &scheduler),
                    completed: report.completed,
                    succeeded: report.succeeded,
                    failed: report.failed,
                    retried: report.retried,
                    canceled: report.canceled,
                    recovered: report.recovered,
                },
            );
            scheduler.report.roll(now, REPORT_INTERVAL_MS);
        }

        state::save_state(&mut tx, &scheduler).await?;
        tx.commit().await?;
        metrics::loop_passes().add(1, &[KeyValue::new("result", "ok")]);

        debug!(
            generation = scheduler.generation,
            segment = upper,
            launched = effects.launches.len(),
            running = scheduler.running.len(),
            "loop pass committed"
        );

        self.run_callbacks(effects.callbacks);
        for launch in effects.launches {
            self.launch(launch);
        }
        if !effects.recover.is_empty() {
            self.schedule(
                Uuid::new_v4(),
                segment::now_ms(),
                Deferred::Recover(effects.recover),
            );
        }

        self.schedule_next(scheduler.generation, upper).await
    }

    /// Completions in range: retry or count each, freeing its running slot.
    async fn drain_completions(
        &self,
        conn: &mut Conn,
        scheduler: &mut SchedulerState,
        config: &PoolConfig,
        upper: i64,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let lo = scheduler.cursors.completion - self.options.cursor_buffer;
        let completions = queues::fetch_completions(conn, lo, upper).await?;
        scheduler.cursors.completion = upper;

        for completion in completions {
            queues::delete(conn, Queue::Completion, completion.work_id).await?;
            if scheduler.take_running(completion.work_id).is_none() {
                debug!(work_id = %completion.work_id, "completion for item not in running list");
            }
            if completion.recovered {
                scheduler.report.recovered += 1;
            }

            if !completion.retry {
                scheduler.report.record_terminal(completion.outcome);
                continue;
            }

            let Some(item) = work::get_work(conn, completion.work_id).await? else {
                warn!(work_id = %completion.work_id, "retrying item no longer exists");
                continue;
            };
            if item.canceled {
                let report = complete::canceled(item.id, item.attempts);
                let applied = apply_outcome(
                    conn,
                    &report,
                    upper,
                    config.log_level,
                    Some(&mut scheduler.report),
                    false,
                )
                .await?;
                if let Some(applied) = applied {
                    effects.callbacks.extend(applied.callback);
                }
                continue;
            }

            let policy = item.retry.unwrap_or_default();
            let backoff_ms = policy.jittered_backoff_ms(item.attempts);
            let due = segment::to_segment(segment::bound_scheduled_time(
                now.saturating_add(backoff_ms),
            ));
            queues::insert_start(
                conn,
                PendingStart {
                    work_id: item.id,
                    segment: due,
                },
            )
            .await?;
            scheduler.report.retried += 1;
            event::emit(
                config.log_level,
                &EventKind::Retrying {
                    id: item.id,
                    function: item.label().to_string(),
                    attempts: item.attempts,
                    backoff_ms,
                },
            );
        }
        Ok(())
    }

    /// Cancelations in range, at most one batch per pass.
    async fn drain_cancelations(
        &self,
        conn: &mut Conn,
        scheduler: &mut SchedulerState,
        config: &PoolConfig,
        upper: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let batch = self.options.cancel_batch_size;
        let lo = scheduler.cursors.cancelation - self.options.cursor_buffer;
        let cancelations = queues::fetch_cancelations(conn, lo, upper, batch).await?;
        let full = cancelations.len() as u32 >= batch;

        for cancelation in &cancelations {
            queues::delete(conn, Queue::Cancelation, cancelation.work_id).await?;
            let Some(item) = work::get_work(conn, cancelation.work_id).await? else {
                continue;
            };
            if !item.canceled {
                work::mark_canceled(conn, item.id).await?;
            }
            queues::delete(conn, Queue::Start, item.id).await?;

            // A running item finishes on its own and is not retried.
            if scheduler.is_running(item.id) {
                continue;
            }
            // Waiting on a retry whose completion is still queued; the
            // completion drain sees the canceled flag.
            if queues::exists(conn, Queue::Completion, item.id).await? {
                continue;
            }
            let report = complete::canceled(item.id, item.attempts);
            let applied = apply_outcome(
                conn,
                &report,
                upper,
                config.log_level,
                Some(&mut scheduler.report),
                false,
            )
            .await?;
            if let Some(applied) = applied {
                effects.callbacks.extend(applied.callback);
            }
        }

        scheduler.cursors.cancelation = match cancelations.last() {
            Some(last) if full => last.segment,
            _ => upper,
        };
        Ok(())
    }

    /// Hand stale running entries to recovery; drop entries whose item is gone.
    async fn sweep_running(
        &self,
        conn: &mut Conn,
        scheduler: &mut SchedulerState,
        upper: i64,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let period = segment::segments_in(self.options.recovery_period.as_millis() as i64);
        if scheduler.running.is_empty() || upper - scheduler.last_recovery < period {
            return Ok(());
        }
        scheduler.last_recovery = upper;

        let threshold = self.options.recovery_threshold.as_millis() as i64;
        let stale: Vec<RunningEntry> = scheduler
            .running
            .iter()
            .filter(|entry| now - entry.started_at >= threshold)
            .cloned()
            .collect();

        for entry in stale {
            match work::get_work(conn, entry.work_id).await? {
                None => {
                    if !queues::exists(conn, Queue::Completion, entry.work_id).await? {
                        debug!(work_id = %entry.work_id, "dropping running entry for finished item");
                        scheduler.take_running(entry.work_id);
                    }
                }
                Some(item) if item.attempts != entry.attempt => {}
                Some(_) => effects.recover.push(entry),
            }
        }
        if !effects.recover.is_empty() {
            info!(candidates = effects.recover.len(), "recovery sweep");
        }
        Ok(())
    }

    /// Fill spare capacity from due starts.
    async fn start_due(
        &self,
        conn: &mut Conn,
        scheduler: &mut SchedulerState,
        config: &PoolConfig,
        upper: i64,
        now: i64,
        effects: &mut Effects,
    ) -> Result<()> {
        let to_schedule = spare_capacity(config, scheduler) as u32;
        if to_schedule == 0 {
            return Ok(());
        }

        let lo = scheduler.cursors.incoming - self.options.cursor_buffer;
        let starts = queues::fetch_starts(conn, lo, upper, to_schedule).await?;
        let full = starts.len() as u32 >= to_schedule;

        for start in &starts {
            queues::delete(conn, Queue::Start, start.work_id).await?;
            let Some(item) = work::get_work(conn, start.work_id).await? else {
                warn!(work_id = %start.work_id, "start for missing item, dropping");
                continue;
            };
            if item.canceled {
                debug!(work_id = %item.id, "start for canceled item, dropping");
                continue;
            }
            if scheduler.is_running(item.id) {
                warn!(work_id = %item.id, "start for item already running, dropping");
                continue;
            }

            let entry = RunningEntry {
                work_id: item.id,
                handle: Uuid::new_v4(),
                started_at: now,
                attempt: item.attempts,
            };
            scheduler.running.push(entry.clone());
            effects.launches.push(Launch {
                item,
                entry,
                due_ms: segment::from_segment(start.segment),
            });
        }

        scheduler.cursors.incoming = match starts.last() {
            Some(last) if full => last.segment,
            _ => upper,
        };
        Ok(())
    }

    /// Decide the next wake in a fresh transaction and arm it.
    async fn schedule_next(&self, generation: i64, upper: i64) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let mut scheduler = state::load_state(&mut tx).await?;
        if scheduler.generation != generation {
            debug!(
                expected = generation,
                found = scheduler.generation,
                "loop rescheduled elsewhere, not scheduling"
            );
            return Ok(());
        }
        let config = state::load_globals(&mut tx).await?;

        let (wake, patched) =
            next_wake(&mut tx, &mut scheduler, &config, &self.options, upper).await?;
        if patched {
            state::save_state(&mut tx, &scheduler).await?;
        }

        let handle = Uuid::new_v4();
        let status = match wake {
            Wake::At { segment: at, saturated } => RunStatus::Scheduled {
                segment: at,
                handle,
                saturated,
                generation,
            },
            Wake::Idle => RunStatus::Idle { generation },
        };
        state::save_run_status(&mut tx, &status).await?;
        tx.commit().await?;

        match wake {
            Wake::At { segment: at, saturated } => {
                debug!(generation, segment = at, saturated, "next pass scheduled");
                self.schedule(
                    handle,
                    segment::from_segment(at),
                    Deferred::MainLoop {
                        generation,
                        segment: at,
                    },
                );
            }
            Wake::Idle => debug!(generation, "loop idle"),
        }
        Ok(())
    }
}

fn spare_capacity(config: &PoolConfig, scheduler: &SchedulerState) -> u64 {
    (config.max_parallelism as u64).saturating_sub(scheduler.running.len() as u64)
}

/// Compute the next wake. Returns whether cursors were patched.
async fn next_wake(
    conn: &mut Conn,
    scheduler: &mut SchedulerState,
    config: &PoolConfig,
    options: &super::PoolOptions,
    upper: i64,
) -> Result<(Wake, bool)> {
    let buffer = options.cursor_buffer;
    let current = segment::current_segment();
    let soon = (upper + 1).max(current);
    let saturated = spare_capacity(config, scheduler) == 0;
    let cursors = scheduler.cursors;

    // Cancelations written below the cursor would never be scanned.
    if let Some(min) =
        queues::min_segment_below(conn, Queue::Cancelation, cursors.cancelation - buffer).await?
    {
        warn!(segment = min, "cancelation below cursor, rewinding");
        scheduler.cursors.cancelation = min;
        return Ok((run_now(current, saturated), true));
    }

    let due_soon = queues::any_in_range(conn, Queue::Completion, cursors.completion - buffer, soon)
        .await?
        || queues::any_in_range(conn, Queue::Cancelation, cursors.cancelation - buffer, soon)
            .await?
        || (!saturated
            && queues::any_in_range(conn, Queue::Start, cursors.incoming - buffer, soon).await?);
    if due_soon {
        return Ok((
            Wake::At {
                segment: soon,
                saturated,
            },
            false,
        ));
    }

    // Out-of-order writes: rows older than the rescan window.
    let late_start = queues::min_segment_below(conn, Queue::Start, cursors.incoming - buffer).await?;
    let late_completion =
        queues::min_segment_below(conn, Queue::Completion, cursors.completion - buffer).await?;
    if late_start.is_some() || late_completion.is_some() {
        if let Some(min) = late_start {
            warn!(segment = min, "start below cursor, rewinding");
            scheduler.cursors.incoming = min;
        }
        if let Some(min) = late_completion {
            warn!(segment = min, "completion below cursor, rewinding");
            scheduler.cursors.completion = min;
        }
        return Ok((run_now(current, saturated), true));
    }

    let mut candidates = vec![
        queues::min_segment_from(conn, Queue::Completion, cursors.completion - buffer).await?,
        queues::min_segment_from(conn, Queue::Cancelation, cursors.cancelation - buffer).await?,
    ];
    if !saturated {
        candidates
            .push(queues::min_segment_from(conn, Queue::Start, cursors.incoming - buffer).await?);
    }
    if !scheduler.running.is_empty() {
        let period = segment::segments_in(options.recovery_period.as_millis() as i64);
        candidates.push(Some(scheduler.last_recovery + period));
    }

    let wake = match candidates.into_iter().flatten().min() {
        Some(next) => Wake::At {
            segment: next.max(soon),
            saturated,
        },
        None => Wake::Idle,
    };
    Ok((wake, false))
}

fn run_now(current: i64, saturated: bool) -> Wake {
    Wake::At {
        segment: current,
        saturated,
    }
}
