//! The three segment-indexed lifecycle queues.
//!
//! Each table holds at most one row per work item (its primary key). Range
//! scans run against the `segment` index.

use super::Conn;
use crate::error::Result;
use crate::model::scheduler::{PendingCancelation, PendingCompletion, PendingStart};
use crate::model::work::WorkId;

/// Which queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Queue {
    Start,
    Completion,
    Cancelation,
}

impl Queue {
    fn table(self) -> &'static str {
        match self {
            Queue::Start => "pending_start",
            Queue::Completion => "pending_completion",
            Queue::Cancelation => "pending_cancelation",
        }
    }
}

impl std::fmt::Display for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.table())
    }
}

// ---------------------------------------------------------------------------
// Shared
// ---------------------------------------------------------------------------

pub async fn exists(conn: &mut Conn, queue: Queue, id: WorkId) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT 1 FROM {} WHERE work_id = ?1",
        queue.table()
    ))
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Delete the row for `id`. Returns whether one existed.
pub async fn delete(conn: &mut Conn, queue: Queue, id: WorkId) -> Result<bool> {
    let rows = sqlx::query(&format!("DELETE FROM {} WHERE work_id = ?1", queue.table()))
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// Whether any row has a segment in `[lo, hi]`.
pub async fn any_in_range(conn: &mut Conn, queue: Queue, lo: i64, hi: i64) -> Result<bool> {
    let found: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT 1 FROM {} WHERE segment >= ?1 AND segment <= ?2 LIMIT 1",
        queue.table()
    ))
    .bind(lo)
    .bind(hi)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(found.is_some())
}

/// Smallest segment at or above `lo`.
pub async fn min_segment_from(conn: &mut Conn, queue: Queue, lo: i64) -> Result<Option<i64>> {
    let min: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT MIN(segment) FROM {} WHERE segment >= ?1",
        queue.table()
    ))
    .bind(lo)
    .fetch_one(&mut *conn)
    .await?;
    Ok(min)
}

/// Smallest segment strictly below `below`: rows a cursor has passed over.
pub async fn min_segment_below(
    conn: &mut Conn,
    queue: Queue,
    below: i64,
) -> Result<Option<i64>> {
    let min: Option<i64> = sqlx::query_scalar(&format!(
        "SELECT MIN(segment) FROM {} WHERE segment < ?1",
        queue.table()
    ))
    .bind(below)
    .fetch_one(&mut *conn)
    .await?;
    Ok(min)
}

pub async fn count(conn: &mut Conn, queue: Queue) -> Result<u64> {
    let n: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", queue.table()))
        .fetch_one(&mut *conn)
        .await?;
    Ok(n as u64)
}

// ---------------------------------------------------------------------------
// Pending start
// ---------------------------------------------------------------------------

/// Insert a start marker. Returns false if one is already outstanding.
pub async fn insert_start(conn: &mut Conn, start: PendingStart) -> Result<bool> {
    let rows = sqlx::query("INSERT OR IGNORE INTO pending_start (work_id, segment) VALUES (?1, ?2)")
        .bind(start.work_id.to_string())
        .bind(start.segment)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// Up to `limit` start markers in `[lo, hi]`, oldest segment first.
pub async fn fetch_starts(conn: &mut Conn, lo: i64, hi: i64, limit: u32) -> Result<Vec<PendingStart>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT work_id, segment FROM pending_start
         WHERE segment >= ?1 AND segment <= ?2
         ORDER BY segment ASC, work_id ASC
         LIMIT ?3",
    )
    .bind(lo)
    .bind(hi)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(work_id, segment)| -> Result<PendingStart> {
            Ok(PendingStart {
                work_id: WorkId::parse(&work_id)?,
                segment,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Pending completion
// ---------------------------------------------------------------------------

/// Insert a completion marker. Returns false if one is already outstanding.
pub async fn insert_completion(conn: &mut Conn, completion: PendingCompletion) -> Result<bool> {
    let rows = sqlx::query(
        "INSERT OR IGNORE INTO pending_completion
             (work_id, attempt, outcome, retry, recovered, segment)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )
    .bind(completion.work_id.to_string())
    .bind(completion.attempt as i64)
    .bind(completion.outcome.to_string())
    .bind(completion.retry as i64)
    .bind(completion.recovered as i64)
    .bind(completion.segment)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

pub async fn get_completion(conn: &mut Conn, id: WorkId) -> Result<Option<PendingCompletion>> {
    let row: Option<CompletionRow> = sqlx::query_as(
        "SELECT work_id, attempt, outcome, retry, recovered, segment
         FROM pending_completion WHERE work_id = ?1",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    row.map(CompletionRow::try_into_completion).transpose()
}

/// All completion markers in `[lo, hi]`, oldest segment first.
pub async fn fetch_completions(conn: &mut Conn, lo: i64, hi: i64) -> Result<Vec<PendingCompletion>> {
    let rows: Vec<CompletionRow> = sqlx::query_as(
        "SELECT work_id, attempt, outcome, retry, recovered, segment FROM pending_completion
         WHERE segment >= ?1 AND segment <= ?2
         ORDER BY segment ASC, work_id ASC",
    )
    .bind(lo)
    .bind(hi)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter()
        .map(CompletionRow::try_into_completion)
        .collect()
}

#[derive(sqlx::FromRow)]
struct CompletionRow {
    work_id: String,
    attempt: i64,
    outcome: String,
    retry: i64,
    recovered: i64,
    segment: i64,
}

impl CompletionRow {
    fn try_into_completion(self) -> Result<PendingCompletion> {
        Ok(PendingCompletion {
            work_id: WorkId::parse(&self.work_id)?,
            attempt: self.attempt as u32,
            outcome: self.outcome.parse()?,
            retry: self.retry != 0,
            recovered: self.recovered != 0,
            segment: self.segment,
        })
    }
}

// ---------------------------------------------------------------------------
// Pending cancelation
// ---------------------------------------------------------------------------

/// Insert a cancelation marker. Returns false if one is already outstanding.
pub async fn insert_cancelation(conn: &mut Conn, cancel: PendingCancelation) -> Result<bool> {
    let rows = sqlx::query(
        "INSERT OR IGNORE INTO pending_cancelation (work_id, segment) VALUES (?1, ?2)",
    )
    .bind(cancel.work_id.to_string())
    .bind(cancel.segment)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Up to `limit` cancelation markers in `[lo, hi]`, oldest segment first.
pub async fn fetch_cancelations(
    conn: &mut Conn,
    lo: i64,
    hi: i64,
    limit: u32,
) -> Result<Vec<PendingCancelation>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT work_id, segment FROM pending_cancelation
         WHERE segment >= ?1 AND segment <= ?2
         ORDER BY segment ASC, work_id ASC
         LIMIT ?3",
    )
    .bind(lo)
    .bind(hi)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|(work_id, segment)| -> Result<PendingCancelation> {
            Ok(PendingCancelation {
                work_id: WorkId::parse(&work_id)?,
                segment,
            })
        })
        .collect()
}
