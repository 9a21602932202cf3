//! Submission and control API.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::kick::{self, KickSource};
use super::{Deferred, Workpool};
use crate::db::queues::{self, Queue};
use crate::db::{Conn, state, work};
use crate::error::{Error, Result};
use crate::event::{self, EventKind};
use crate::model::scheduler::{PendingCancelation, PendingStart, Snapshot};
use crate::model::work::{NewWork, WorkId, WorkItem, WorkStatus};
use crate::segment;

/// Position in a newest-first scan of work items by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelCursor {
    /// Only items created strictly before this time (or at it, with a
    /// smaller ID) are visited.
    pub before: i64,
    pub before_id: String,
}

impl CancelCursor {
    /// Start a scan of everything created before `before`.
    pub fn before(before: i64) -> Self {
        Self {
            before,
            before_id: String::new(),
        }
    }
}

/// Result of cancelling one page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelAllPage {
    /// Items visited.
    pub scanned: usize,
    /// Cancelation requests written. Items already being canceled are skipped.
    pub requested: usize,
    /// Where the next page starts, or `None` after a short page.
    pub next: Option<CancelCursor>,
}

impl Workpool {
    /// Submit one work item. Returns its ID.
    pub async fn submit(&self, new: NewWork) -> Result<WorkId> {
        let mut ids = self.submit_batch(vec![new]).await?;
        ids.pop()
            .ok_or_else(|| Error::Other("submit produced no work id".to_string()))
    }

    /// Submit several work items atomically, with a single kick.
    pub async fn submit_batch(&self, batch: Vec<NewWork>) -> Result<Vec<WorkId>> {
        self.options.config.validate()?;
        for new in &batch {
            validate(new)?;
        }
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let mut tx = self.db.begin().await?;
        // Client handles leave the config to the process that runs the loop.
        if self.driver {
            state::update_globals(&mut tx, &self.options.config).await?;
        }
        let kick = kick::kick(&mut tx, KickSource::Enqueue, false).await?;

        let now = segment::now_ms();
        let mut events = Vec::with_capacity(batch.len());
        let mut ids = Vec::with_capacity(batch.len());
        for new in batch {
            let run_at = segment::bound_scheduled_time(new.run_at_ms(now));
            let start = segment::to_segment(run_at).max(kick.segment);
            let item = WorkItem {
                id: WorkId::new(),
                fn_name: new.fn_name,
                kind: new.kind,
                args: new.args,
                name: new.name,
                attempts: 0,
                retry: new.retry,
                on_complete: new.on_complete,
                canceled: false,
                created_at: now,
            };
            work::insert_work(&mut tx, &item).await?;
            queues::insert_start(
                &mut tx,
                PendingStart {
                    work_id: item.id,
                    segment: start,
                },
            )
            .await?;

            events.push(EventKind::Enqueued {
                id: item.id,
                function: item.label().to_string(),
                kind: item.kind,
                segment: start,
            });
            ids.push(item.id);
        }
        tx.commit().await?;

        self.arm(kick);
        for e in &events {
            event::emit(self.options.config.log_level, e);
        }
        Ok(ids)
    }

    /// Request cancellation. A no-op for finished items or items already
    /// being canceled. Running executions are not interrupted; they finish
    /// and are never retried.
    pub async fn cancel(&self, id: WorkId) -> Result<()> {
        let mut tx = self.db.begin().await?;
        if work::get_work(&mut tx, id).await?.is_none() {
            debug!(work_id = %id, "cancel for finished item");
            return Ok(());
        }
        if queues::exists(&mut tx, Queue::Cancelation, id).await? {
            return Ok(());
        }

        let kick = kick::kick(&mut tx, KickSource::Cancel, false).await?;
        queues::insert_cancelation(
            &mut tx,
            PendingCancelation {
                work_id: id,
                segment: kick.segment,
            },
        )
        .await?;
        tx.commit().await?;
        self.arm(kick);
        Ok(())
    }

    /// Cancel every item created before `before` (default: now).
    ///
    /// The first page is cancelled before returning. Later pages continue in
    /// the background on a pool that runs the loop, and inline on a client
    /// handle.
    pub async fn cancel_all(&self, before: Option<i64>, page_size: u32) -> Result<CancelAllPage> {
        let cursor = CancelCursor::before(before.unwrap_or_else(|| segment::now_ms() + 1));
        let first = self.cancel_all_page(cursor, page_size).await?;

        if let Some(next) = first.next.clone() {
            if self.driver {
                self.schedule(
                    Uuid::new_v4(),
                    segment::now_ms(),
                    Deferred::CancelAll {
                        cursor: next,
                        page_size,
                    },
                );
            } else {
                self.continue_cancel_all(next, page_size).await?;
            }
        }
        Ok(first)
    }

    /// One background page of a driver's `cancel_all`. Schedules the next
    /// page, or this one again after a delay when the store fails.
    pub(crate) async fn cancel_all_continuation(&self, cursor: CancelCursor, page_size: u32) {
        let (at_ms, cursor) = match self.cancel_all_page(cursor.clone(), page_size).await {
            Ok(CancelAllPage { next: None, .. }) => return,
            Ok(CancelAllPage {
                next: Some(next), ..
            }) => (segment::now_ms(), next),
            Err(e) => {
                error!(before = cursor.before, "cancel_all page failed, retrying: {e}");
                (segment::now_ms() + super::PASS_RETRY_DELAY_MS, cursor)
            }
        };
        self.schedule(Uuid::new_v4(), at_ms, Deferred::CancelAll { cursor, page_size });
    }

    async fn continue_cancel_all(&self, cursor: CancelCursor, page_size: u32) -> Result<()> {
        let mut cursor = cursor;
        loop {
            let page = self.cancel_all_page(cursor, page_size).await?;
            match page.next {
                Some(next) if !self.closed.load(std::sync::atomic::Ordering::SeqCst) => {
                    cursor = next
                }
                _ => return Ok(()),
            }
        }
    }

    /// Request cancellation for one page of items, newest first.
    pub async fn cancel_all_page(&self, cursor: CancelCursor, page_size: u32) -> Result<CancelAllPage> {
        if page_size == 0 {
            return Err(Error::InvalidConfig("page_size must be at least 1".to_string()));
        }

        let mut tx = self.db.begin().await?;
        let items =
            work::list_created_before(&mut tx, cursor.before, &cursor.before_id, page_size).await?;
        let next = match items.last() {
            Some(last) if items.len() as u32 >= page_size => Some(CancelCursor {
                before: last.created_at,
                before_id: last.id.to_string(),
            }),
            _ => None,
        };

        let mut requested = 0;
        if !items.is_empty() {
            let kick = kick::kick(&mut tx, KickSource::Cancel, false).await?;
            for item in &items {
                if item.canceled {
                    continue;
                }
                let inserted = queues::insert_cancelation(
                    &mut tx,
                    PendingCancelation {
                        work_id: item.id,
                        segment: kick.segment,
                    },
                )
                .await?;
                if inserted {
                    requested += 1;
                }
            }
            tx.commit().await?;
            self.arm(kick);
        }

        info!(scanned = items.len(), requested, more = next.is_some(), "cancel_all page");
        Ok(CancelAllPage {
            scanned: items.len(),
            requested,
            next,
        })
    }

    pub async fn status(&self, id: WorkId) -> Result<WorkStatus> {
        let mut conn = self.db.pool().acquire().await?;
        status_of(&mut conn, id).await
    }

    pub async fn status_batch(&self, ids: &[WorkId]) -> Result<Vec<WorkStatus>> {
        let mut conn = self.db.pool().acquire().await?;
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids {
            statuses.push(status_of(&mut conn, *id).await?);
        }
        Ok(statuses)
    }

    /// Queue depths and the running count, read in one transaction.
    pub async fn snapshot(&self) -> Result<Snapshot> {
        let mut tx = self.db.begin().await?;
        let scheduler = state::load_state(&mut tx).await?;
        let config = state::load_globals(&mut tx).await?;
        let snapshot = Snapshot {
            waiting: queues::count(&mut tx, Queue::Start).await?,
            running: scheduler.running.len() as u64,
            completing: queues::count(&mut tx, Queue::Completion).await?,
            canceling: queues::count(&mut tx, Queue::Cancelation).await?,
            spare_capacity: (config.max_parallelism as u64)
                .saturating_sub(scheduler.running.len() as u64),
        };
        tx.commit().await?;
        Ok(snapshot)
    }
}

fn validate(new: &NewWork) -> Result<()> {
    if new.fn_name.trim().is_empty() {
        return Err(Error::InvalidWork("function name must not be empty".to_string()));
    }
    if let Some(retry) = &new.retry {
        retry.validate()?;
    }
    if let Some(on_complete) = &new.on_complete {
        if on_complete.function.trim().is_empty() {
            return Err(Error::InvalidWork(
                "on_complete function name must not be empty".to_string(),
            ));
        }
    }
    Ok(())
}

async fn status_of(conn: &mut Conn, id: WorkId) -> Result<WorkStatus> {
    let Some(item) = work::get_work(conn, id).await? else {
        return Ok(WorkStatus::Finished);
    };
    let previous_attempts = item.attempts;
    if queues::exists(conn, Queue::Start, id).await? {
        return Ok(WorkStatus::Pending { previous_attempts });
    }
    if let Some(completion) = queues::get_completion(conn, id).await? {
        if completion.retry {
            return Ok(WorkStatus::Pending { previous_attempts });
        }
    }
    Ok(WorkStatus::Running { previous_attempts })
}
