//! The scheduler engine.
//!
//! [`Workpool`] is the handle applications hold. It owns the store, the
//! function registry, the in-process timers that drive the loop, and the
//! table of executions launched by this process. Every scheduling decision is
//! taken inside a store transaction; the in-process parts only carry out
//! decisions after commit.

mod client;
mod complete;
mod executor;
mod kick;
mod main_loop;
mod recovery;
mod timer;

pub use client::{CancelAllPage, CancelCursor};

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::db::{Db, state};
use crate::error::{Error, Result};
use crate::model::scheduler::{PoolConfig, RunStatus, RunningEntry};
use crate::registry::FunctionRegistry;
use crate::segment;
use crate::telemetry::metrics;
use executor::Executions;
use kick::{Kick, KickSource};
use timer::Timers;

/// Delay before a failed pass is retried with a forced kick.
const PASS_RETRY_DELAY_MS: i64 = 1_000;

/// How late a persisted schedule may be before the watchdog re-arms it.
const WATCHDOG_GRACE_SEGMENTS: i64 = 10;

/// Tuning knobs for a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Persisted by the loop's owner on resume and on every submission.
    pub config: PoolConfig,
    /// A running entry older than this is checked for a lost execution.
    pub recovery_threshold: Duration,
    /// Minimum time between recovery sweeps.
    pub recovery_period: Duration,
    /// Segments re-scanned below each queue cursor.
    pub cursor_buffer: i64,
    /// Cancelations processed per pass.
    pub cancel_batch_size: u32,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            config: PoolConfig::default(),
            recovery_threshold: Duration::from_secs(5 * 60),
            recovery_period: Duration::from_secs(60),
            cursor_buffer: 50,
            cancel_batch_size: 64,
        }
    }
}

/// Work deferred through the timers.
pub(crate) enum Deferred {
    MainLoop { generation: i64, segment: i64 },
    CancelAll { cursor: CancelCursor, page_size: u32 },
    Recover(Vec<RunningEntry>),
    ForceKick,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Handle to a durable work pool. Clones share everything.
#[derive(Clone)]
pub struct Workpool {
    db: Arc<Db>,
    registry: Arc<FunctionRegistry>,
    options: PoolOptions,
    timers: Timers,
    executions: Executions,
    shutdown: Arc<Notify>,
    closed: Arc<AtomicBool>,
    passes_in_flight: Arc<AtomicUsize>,
    /// Whether this handle runs the loop. Client handles only write.
    driver: bool,
}

impl Workpool {
    /// Create a pool that runs the loop and executes work in this process.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` if `options.config` is out of range.
    pub fn new(db: Arc<Db>, registry: Arc<FunctionRegistry>, options: PoolOptions) -> Result<Self> {
        options.config.validate()?;
        Ok(Self::build(db, registry, options, true))
    }

    /// Create a handle that submits, cancels, and inspects work but never
    /// runs the loop. Used by processes that share the store with a server.
    pub fn client(db: Arc<Db>, options: PoolOptions) -> Result<Self> {
        options.config.validate()?;
        Ok(Self::build(db, Arc::new(FunctionRegistry::empty()), options, false))
    }

    fn build(
        db: Arc<Db>,
        registry: Arc<FunctionRegistry>,
        options: PoolOptions,
        driver: bool,
    ) -> Self {
        Self {
            db,
            registry,
            options,
            timers: Timers::default(),
            executions: Executions::default(),
            shutdown: Arc::new(Notify::new()),
            closed: Arc::new(AtomicBool::new(false)),
            passes_in_flight: Arc::new(AtomicUsize::new(0)),
            driver,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    /// Re-arm the loop after a restart. In-process timers do not survive the
    /// process, so a persisted schedule may point at a timer nobody owns.
    ///
    /// Also persists this pool's config, so the loop runs with the owner's
    /// parallelism rather than whatever a client last wrote.
    pub async fn resume(&self) -> Result<()> {
        let mut tx = self.db.begin().await?;
        state::update_globals(&mut tx, &self.options.config).await?;
        let kick = kick::kick(&mut tx, KickSource::Resume, true).await?;
        tx.commit().await?;
        info!(
            segment = kick.segment,
            max_parallelism = self.options.config.max_parallelism,
            "workpool resumed"
        );
        self.arm(kick);
        Ok(())
    }

    /// Watch the persisted schedule until shutdown, re-arming the loop when
    /// its timer was lost (for instance when another process kicked it).
    pub async fn watch(&self, poll_interval: Duration) -> Result<()> {
        let mut stuck_generation: Option<i64> = None;
        loop {
            if self.closed.load(Ordering::SeqCst) {
                return Ok(());
            }
            tokio::select! {
                _ = self.shutdown.notified() => {
                    info!("watchdog shutting down");
                    return Ok(());
                }
                _ = tokio::time::sleep(poll_interval) => {}
            }
            if let Err(e) = self.check_schedule(&mut stuck_generation).await {
                warn!("watchdog check failed: {e}");
            }
        }
    }

    async fn check_schedule(&self, stuck_generation: &mut Option<i64>) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let status = state::load_run_status(&mut tx).await?;
        let generation = state::load_state(&mut tx).await?.generation;

        let lost = match status {
            RunStatus::Scheduled {
                segment: due,
                handle,
                ..
            } => {
                *stuck_generation = None;
                due + WATCHDOG_GRACE_SEGMENTS < segment::current_segment()
                    && !self.timers.is_armed(handle)
            }
            RunStatus::Running if self.passes_in_flight.load(Ordering::SeqCst) == 0 => {
                // Two polls in a row at the same generation with no local pass.
                let stuck = *stuck_generation == Some(generation);
                *stuck_generation = Some(generation);
                stuck
            }
            _ => {
                *stuck_generation = None;
                false
            }
        };
        if !lost {
            return Ok(());
        }

        let kick = kick::kick(&mut tx, KickSource::Watchdog, true).await?;
        tx.commit().await?;
        warn!(
            previous = status.label(),
            generation = kick.arm.map(|a| a.generation),
            "loop schedule lost, re-armed"
        );
        *stuck_generation = None;
        self.arm(kick);
        Ok(())
    }

    /// Stop the loop and abort every in-flight execution and timer.
    ///
    /// Aborted executions stay in the running list and are picked up by
    /// recovery in whichever process resumes the pool.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_one();
        self.timers.abort_all();
        self.executions.abort_all();
        info!("workpool shut down");
    }

    // -----------------------------------------------------------------------
    // Deferred execution
    // -----------------------------------------------------------------------

    /// Start the timer a committed kick asked for.
    pub(crate) fn arm(&self, kick: Kick) {
        let Some(arm) = kick.arm else {
            return;
        };
        if let Some(old) = arm.supersedes {
            self.timers.cancel(old);
        }
        self.schedule(
            arm.handle,
            segment::from_segment(arm.segment),
            Deferred::MainLoop {
                generation: arm.generation,
                segment: arm.segment,
            },
        );
    }

    pub(crate) fn schedule(&self, handle: Uuid, at_ms: i64, job: Deferred) {
        if !self.driver || self.closed.load(Ordering::SeqCst) {
            return;
        }
        let pool = self.clone();
        self.timers.arm(handle, at_ms, async move { pool.dispatch(job).await });
    }

    fn dispatch(&self, job: Deferred) -> Job {
        let pool = self.clone();
        Box::pin(async move {
            match job {
                Deferred::MainLoop {
                    generation,
                    segment: target,
                } => {
                    pool.passes_in_flight.fetch_add(1, Ordering::SeqCst);
                    let pass = pool.clone();
                    let result =
                        run_guarded(async move { pass.main_loop(generation, target).await })
                            .await;
                    pool.passes_in_flight.fetch_sub(1, Ordering::SeqCst);
                    if let Err(e) = result {
                        error!(generation, segment = target, "loop pass failed: {e}");
                        metrics::loop_passes()
                            .add(1, &[opentelemetry::KeyValue::new("result", "error")]);
                        pool.schedule(
                            Uuid::new_v4(),
                            segment::now_ms() + PASS_RETRY_DELAY_MS,
                            Deferred::ForceKick,
                        );
                    }
                }
                Deferred::CancelAll { cursor, page_size } => {
                    pool.cancel_all_continuation(cursor, page_size).await;
                }
                Deferred::Recover(entries) => {
                    if let Err(e) = pool.recover(entries).await {
                        error!("recovery failed: {e}");
                    }
                }
                Deferred::ForceKick => {
                    if let Err(e) = pool.force_kick().await {
                        error!("forced kick failed: {e}");
                        pool.schedule(
                            Uuid::new_v4(),
                            segment::now_ms() + PASS_RETRY_DELAY_MS,
                            Deferred::ForceKick,
                        );
                    }
                }
            }
        })
    }

    async fn force_kick(&self) -> Result<()> {
        let mut tx = self.db.begin().await?;
        let kick = kick::kick(&mut tx, KickSource::Watchdog, true).await?;
        tx.commit().await?;
        debug!(segment = kick.segment, "loop re-armed after failed pass");
        self.arm(kick);
        Ok(())
    }
}

/// Aborts a task when dropped.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Run a loop pass in its own task so a panic comes back as an error.
/// Dropping the returned future (a timer aborted by shutdown) aborts the pass.
async fn run_guarded<F>(pass: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    let task = tokio::spawn(pass);
    let _guard = AbortOnDrop(task.abort_handle());
    match task.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(Error::Other(format!(
            "loop pass panicked: {}",
            executor::panic_message(e.into_panic())
        ))),
        Err(e) => Err(Error::Other(format!("loop pass aborted: {e}"))),
    }
}
