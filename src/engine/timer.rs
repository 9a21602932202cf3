//! In-process deferred execution: run a future at or after a wall-clock time.
//!
//! Each armed timer is a tokio task keyed by a handle. A timer removes itself
//! from the table when it fires, so cancelling a handle only ever aborts a
//! timer that has not started its job.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::segment;

type Table = HashMap<Uuid, JoinHandle<()>>;

#[derive(Clone, Default)]
pub(crate) struct Timers {
    inner: Arc<Mutex<Table>>,
}

fn lock(table: &Mutex<Table>) -> MutexGuard<'_, Table> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Timers {
    /// Run `job` at `at_ms` (ms since the epoch), or immediately if that has
    /// passed.
    pub(crate) fn arm<F>(&self, handle: Uuid, at_ms: i64, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = (at_ms - segment::now_ms()).max(0) as u64;
        let inner = Arc::clone(&self.inner);

        // Held across the spawn so the task cannot deregister before it is
        // registered.
        let mut table = lock(&self.inner);
        let task = tokio::spawn(async move {
            if delay > 0 {
                tokio::time::sleep(Duration::from_millis(delay)).await;
            }
            lock(&inner).remove(&handle);
            job.await;
        });
        table.insert(handle, task);
    }

    /// Abort a timer that has not fired yet. Returns whether one was armed.
    pub(crate) fn cancel(&self, handle: Uuid) -> bool {
        match lock(&self.inner).remove(&handle) {
            Some(task) => {
                task.abort();
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_armed(&self, handle: Uuid) -> bool {
        lock(&self.inner).contains_key(&handle)
    }

    pub(crate) fn abort_all(&self) {
        for (_, task) in lock(&self.inner).drain() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_once_and_deregisters() {
        let timers = Timers::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        timers.arm(handle, segment::now_ms() + 20, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.is_armed(handle));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!timers.is_armed(handle));
        assert!(!timers.cancel(handle));
    }

    #[tokio::test]
    async fn cancelled_timer_never_fires() {
        let timers = Timers::default();
        let fired = Arc::new(AtomicUsize::new(0));
        let handle = Uuid::new_v4();

        let counter = Arc::clone(&fired);
        timers.arm(handle, segment::now_ms() + 50, async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(timers.cancel(handle));

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
