//! Waking the loop.
//!
//! A kick runs inside the caller's transaction. It either finds the loop
//! already due soon enough (no-op) or bumps the generation, which fences any
//! pass scheduled earlier, and records a new schedule at the next segment.
//! The timer itself is armed by the caller once its transaction commits.

use tracing::debug;
use uuid::Uuid;

use crate::db::{Conn, state};
use crate::error::Result;
use crate::model::scheduler::RunStatus;
use crate::segment;

/// Who is asking the loop to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KickSource {
    Enqueue,
    Cancel,
    Complete,
    Resume,
    Watchdog,
}

impl std::fmt::Display for KickSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            KickSource::Enqueue => "enqueue",
            KickSource::Cancel => "cancel",
            KickSource::Complete => "complete",
            KickSource::Resume => "resume",
            KickSource::Watchdog => "watchdog",
        };
        write!(f, "{s}")
    }
}

/// Result of a kick. `segment` is the earliest segment the loop will observe
/// writes made in the same transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Kick {
    pub segment: i64,
    pub arm: Option<Arm>,
}

/// A timer to start after commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Arm {
    pub handle: Uuid,
    pub generation: i64,
    pub segment: i64,
    /// Timer of the schedule this kick replaced.
    pub supersedes: Option<Uuid>,
}

pub(crate) async fn kick(conn: &mut Conn, source: KickSource, force: bool) -> Result<Kick> {
    let next = segment::next_segment();
    let status = state::load_run_status(conn).await?;

    if !force {
        let already_due = match status {
            RunStatus::Running => true,
            RunStatus::Scheduled { segment, .. } if segment <= next => true,
            RunStatus::Scheduled {
                saturated: true, ..
            } if source == KickSource::Enqueue => true,
            _ => false,
        };
        if already_due {
            return Ok(Kick {
                segment: next,
                arm: None,
            });
        }
    }

    let mut scheduler = state::load_state(conn).await?;
    scheduler.generation += 1;
    state::save_state(conn, &scheduler).await?;

    let handle = Uuid::new_v4();
    let supersedes = match status {
        RunStatus::Scheduled { handle, .. } => Some(handle),
        _ => None,
    };
    state::save_run_status(
        conn,
        &RunStatus::Scheduled {
            segment: next,
            handle,
            saturated: false,
            generation: scheduler.generation,
        },
    )
    .await?;

    debug!(
        %source,
        force,
        previous = status.label(),
        generation = scheduler.generation,
        segment = next,
        "loop kicked"
    );

    Ok(Kick {
        segment: next,
        arm: Some(Arm {
            handle,
            generation: scheduler.generation,
            segment: next,
            supersedes,
        }),
    })
}
