//! Work item rows: insert, lookup, attempt bookkeeping, paging.

use super::Conn;
use crate::error::Result;
use crate::model::work::*;

const WORK_COLUMNS: &str =
    "id, fn_name, fn_kind, fn_args, name, attempts, retry, on_complete, canceled, created_at";

pub async fn insert_work(conn: &mut Conn, item: &WorkItem) -> Result<()> {
    let retry = item.retry.as_ref().map(serde_json::to_string).transpose()?;
    let on_complete = item
        .on_complete
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;

    sqlx::query(
        "INSERT INTO work (id, fn_name, fn_kind, fn_args, name, attempts, retry, on_complete, canceled, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
    )
    .bind(item.id.to_string())
    .bind(&item.fn_name)
    .bind(item.kind.to_string())
    .bind(serde_json::to_string(&item.args)?)
    .bind(&item.name)
    .bind(item.attempts as i64)
    .bind(retry)
    .bind(on_complete)
    .bind(item.canceled as i64)
    .bind(item.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Get a work item by ID. `None` once the item reached a terminal outcome.
pub async fn get_work(conn: &mut Conn, id: WorkId) -> Result<Option<WorkItem>> {
    let row: Option<WorkRow> =
        sqlx::query_as(&format!("SELECT {WORK_COLUMNS} FROM work WHERE id = ?1"))
            .bind(id.to_string())
            .fetch_optional(&mut *conn)
            .await?;
    row.map(WorkRow::try_into_work_item).transpose()
}

pub async fn set_attempts(conn: &mut Conn, id: WorkId, attempts: u32) -> Result<()> {
    sqlx::query("UPDATE work SET attempts = ?1 WHERE id = ?2")
        .bind(attempts as i64)
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn mark_canceled(conn: &mut Conn, id: WorkId) -> Result<()> {
    sqlx::query("UPDATE work SET canceled = 1 WHERE id = ?1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Delete a work item. Returns whether a row was removed.
pub async fn delete_work(conn: &mut Conn, id: WorkId) -> Result<bool> {
    let rows = sqlx::query("DELETE FROM work WHERE id = ?1")
        .bind(id.to_string())
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(rows > 0)
}

/// One page of work items created before `(before, before_id)`, newest first.
pub async fn list_created_before(
    conn: &mut Conn,
    before: i64,
    before_id: &str,
    limit: u32,
) -> Result<Vec<WorkItem>> {
    let rows: Vec<WorkRow> = sqlx::query_as(&format!(
        "SELECT {WORK_COLUMNS} FROM work
         WHERE created_at < ?1 OR (created_at = ?1 AND id < ?2)
         ORDER BY created_at DESC, id DESC
         LIMIT ?3"
    ))
    .bind(before)
    .bind(before_id)
    .bind(limit as i64)
    .fetch_all(&mut *conn)
    .await?;
    rows.into_iter().map(WorkRow::try_into_work_item).collect()
}

/// Internal row type for sqlx::FromRow.
#[derive(sqlx::FromRow)]
struct WorkRow {
    id: String,
    fn_name: String,
    fn_kind: String,
    fn_args: String,
    name: Option<String>,
    attempts: i64,
    retry: Option<String>,
    on_complete: Option<String>,
    canceled: i64,
    created_at: i64,
}

impl WorkRow {
    fn try_into_work_item(self) -> Result<WorkItem> {
        Ok(WorkItem {
            id: WorkId::parse(&self.id)?,
            fn_name: self.fn_name,
            kind: self.fn_kind.parse()?,
            args: serde_json::from_str(&self.fn_args)?,
            name: self.name,
            attempts: self.attempts as u32,
            retry: self.retry.as_deref().map(serde_json::from_str).transpose()?,
            on_complete: self
                .on_complete
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            canceled: self.canceled != 0,
            created_at: self.created_at,
        })
    }
}
