//! Singleton rows: scheduler state, run status, pool config.
//!
//! Missing singletons are recreated with defaults on first read, so a wiped
//! or fresh database heals itself on the next transaction.

use tracing::debug;

use super::Conn;
use crate::error::Result;
use crate::model::scheduler::{PoolConfig, RunStatus, SchedulerState};
use crate::segment;

/// Load the scheduler state, creating it if absent.
pub async fn load_state(conn: &mut Conn) -> Result<SchedulerState> {
    let raw: Option<String> = sqlx::query_scalar("SELECT state FROM scheduler_state WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => {
            debug!("creating scheduler state");
            let state = SchedulerState::new(segment::current_segment(), segment::now_ms());
            save_state(conn, &state).await?;
            Ok(state)
        }
    }
}

pub async fn save_state(conn: &mut Conn, state: &SchedulerState) -> Result<()> {
    sqlx::query(
        "INSERT INTO scheduler_state (id, state) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET state = excluded.state",
    )
    .bind(serde_json::to_string(state)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Load the run status, creating an idle one if absent.
pub async fn load_run_status(conn: &mut Conn) -> Result<RunStatus> {
    let raw: Option<String> = sqlx::query_scalar("SELECT status FROM run_status WHERE id = 1")
        .fetch_optional(&mut *conn)
        .await?;
    match raw {
        Some(raw) => Ok(serde_json::from_str(&raw)?),
        None => {
            debug!("creating run status");
            let status = RunStatus::Idle { generation: 0 };
            save_run_status(conn, &status).await?;
            Ok(status)
        }
    }
}

pub async fn save_run_status(conn: &mut Conn, status: &RunStatus) -> Result<()> {
    sqlx::query(
        "INSERT INTO run_status (id, status) VALUES (1, ?1)
         ON CONFLICT(id) DO UPDATE SET status = excluded.status",
    )
    .bind(serde_json::to_string(status)?)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Load the pool config, falling back to defaults if never written.
pub async fn load_globals(conn: &mut Conn) -> Result<PoolConfig> {
    let row: Option<(i64, String)> =
        sqlx::query_as("SELECT max_parallelism, log_level FROM globals WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    match row {
        Some((max_parallelism, log_level)) => Ok(PoolConfig {
            max_parallelism: max_parallelism as u32,
            log_level: log_level.parse()?,
        }),
        None => Ok(PoolConfig::default()),
    }
}

/// Write the pool config if it differs from what is stored.
pub async fn update_globals(conn: &mut Conn, config: &PoolConfig) -> Result<()> {
    let current: Option<(i64, String)> =
        sqlx::query_as("SELECT max_parallelism, log_level FROM globals WHERE id = 1")
            .fetch_optional(&mut *conn)
            .await?;
    let wanted = (config.max_parallelism as i64, config.log_level.to_string());
    if current.as_ref() == Some(&wanted) {
        return Ok(());
    }

    sqlx::query(
        "INSERT INTO globals (id, max_parallelism, log_level) VALUES (1, ?1, ?2)
         ON CONFLICT(id) DO UPDATE SET max_parallelism = excluded.max_parallelism,
                                       log_level = excluded.log_level",
    )
    .bind(wanted.0)
    .bind(wanted.1)
    .execute(&mut *conn)
    .await?;
    debug!(
        max_parallelism = config.max_parallelism,
        log_level = %config.log_level,
        "pool config updated"
    );
    Ok(())
}
