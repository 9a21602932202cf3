//! Integration tests for the scheduler: lifecycle, bounds, retries,
//! cancellation, and idempotent completion.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::Notify;
use workpool::db::queues::{self, Queue};
use workpool::db::{Db, state};
use workpool::model::scheduler::ReportStats;
use workpool::model::work::MAX_INITIAL_BACKOFF_MS;
use workpool::{
    CancelCursor, CompletionEvent, CompletionReport, Error, FunctionRegistry, Invocation, NewWork,
    Outcome, PoolConfig, PoolOptions, RetryPolicy, WorkStatus, Workpool,
};

type Events = Arc<Mutex<Vec<CompletionEvent>>>;

async fn test_db() -> Arc<Db> {
    let db = Db::in_memory().await.expect("in-memory db");
    db.migrate().await.expect("migrations");
    Arc::new(db)
}

fn options(max_parallelism: u32) -> PoolOptions {
    PoolOptions {
        config: PoolConfig {
            max_parallelism,
            ..PoolConfig::default()
        },
        ..PoolOptions::default()
    }
}

/// Registry with a `record` callback that collects completion events.
fn registry_with_recorder(events: &Events) -> FunctionRegistry {
    let mut registry = FunctionRegistry::empty();
    let events = Arc::clone(events);
    registry.register_callback("record", move |event: CompletionEvent| {
        let events = Arc::clone(&events);
        async move {
            events.lock().unwrap().push(event);
            Ok::<(), String>(())
        }
    });
    registry
}

async fn wait_until<F: Fn() -> bool>(what: &str, timeout: Duration, check: F) {
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

async fn report(db: &Db) -> ReportStats {
    let mut conn = db.pool().acquire().await.unwrap();
    state::load_state(&mut conn).await.unwrap().report
}

/// No item may sit in the start queue while it holds a running slot.
async fn assert_starts_and_running_disjoint(db: &Db) {
    let mut tx = db.begin().await.unwrap();
    let scheduler = state::load_state(&mut tx).await.unwrap();
    for entry in &scheduler.running {
        assert!(
            !queues::exists(&mut tx, Queue::Start, entry.work_id)
                .await
                .unwrap(),
            "{} is both running and waiting to start",
            entry.work_id
        );
    }
}

async fn wait_for_status(pool: &Workpool, id: workpool::WorkId, want: fn(&WorkStatus) -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let status = pool.status(id).await.unwrap();
        if want(&status) {
            return;
        }
        assert!(Instant::now() < deadline, "timed out, last status {status}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_work_runs_and_reports_success() {
    let events: Events = Arc::default();
    let mut registry = registry_with_recorder(&events);
    registry.register("double", |inv: Invocation| async move {
        let n = inv.args["n"].as_i64().ok_or_else(|| "missing n".to_string())?;
        Ok::<_, String>(json!(n * 2))
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(4)).unwrap();

    let id = pool
        .submit(
            NewWork::action("double")
                .args(json!({"n": 21}))
                .on_complete("record", json!({"tag": "a"})),
        )
        .await
        .unwrap();

    wait_until("callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;

    let event = events.lock().unwrap()[0].clone();
    assert_eq!(event.work_id, id);
    assert_eq!(event.context, json!({"tag": "a"}));
    assert_eq!(event.outcome, Outcome::success(json!(42)));
    assert_eq!(pool.status(id).await.unwrap(), WorkStatus::Finished);
    pool.shutdown();
}

#[tokio::test]
async fn delayed_work_is_pending_until_due() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = FunctionRegistry::empty();
    let counter = Arc::clone(&calls);
    registry.register("tick", move |_inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(json!(null))
        }
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(4)).unwrap();

    let submitted = Instant::now();
    let id = pool
        .submit(NewWork::action("tick").run_after(Duration::from_millis(400)))
        .await
        .unwrap();
    assert_eq!(
        pool.status(id).await.unwrap(),
        WorkStatus::Pending {
            previous_attempts: 0
        }
    );
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.waiting, 1);
    assert_eq!(snapshot.running, 0);

    wait_until("delayed run", Duration::from_secs(10), || {
        calls.load(Ordering::SeqCst) == 1
    })
    .await;
    // One segment of slack for quantization.
    assert!(submitted.elapsed() >= Duration::from_millis(300));
    wait_for_status(&pool, id, |s| *s == WorkStatus::Finished).await;
    pool.shutdown();
}

#[tokio::test]
async fn invalid_parallelism_is_rejected() {
    let db = test_db().await;
    let registry = Arc::new(FunctionRegistry::empty());

    let err = Workpool::new(Arc::clone(&db), Arc::clone(&registry), options(0)).err();
    assert!(matches!(err, Some(Error::InvalidConfig(_))));
    let err = Workpool::new(Arc::clone(&db), Arc::clone(&registry), options(101)).err();
    assert!(matches!(err, Some(Error::InvalidConfig(_))));
    assert!(Workpool::new(db, registry, options(60)).is_ok());
}

#[tokio::test]
async fn driver_parallelism_wins_over_clients() {
    let db = test_db().await;
    let driver = Workpool::new(
        Arc::clone(&db),
        Arc::new(FunctionRegistry::empty()),
        options(3),
    )
    .unwrap();
    driver.resume().await.unwrap();
    assert_eq!(driver.snapshot().await.unwrap().spare_capacity, 3);

    let client = Workpool::client(Arc::clone(&db), options(10)).unwrap();
    client
        .submit(NewWork::action("later").run_after(Duration::from_secs(3600)))
        .await
        .unwrap();

    let mut conn = db.pool().acquire().await.unwrap();
    assert_eq!(state::load_globals(&mut conn).await.unwrap().max_parallelism, 3);
    drop(conn);
    assert_eq!(client.snapshot().await.unwrap().spare_capacity, 3);
    driver.shutdown();
}

#[tokio::test]
async fn invalid_retry_policy_is_rejected_at_submission() {
    let pool = Workpool::new(
        test_db().await,
        Arc::new(FunctionRegistry::empty()),
        options(2),
    )
    .unwrap();

    let err = pool
        .submit(NewWork::action("f").retry(RetryPolicy::new(0, 10, 2.0)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWork(_)), "got {err:?}");
    assert_eq!(pool.snapshot().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn unknown_function_fails_its_attempt() {
    let events: Events = Arc::default();
    let registry = registry_with_recorder(&events);
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(2)).unwrap();

    pool.submit(NewWork::action("nobody").on_complete("record", json!(null)))
        .await
        .unwrap();

    wait_until("callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    match &events.lock().unwrap()[0].outcome {
        Outcome::Failed { error } => assert!(error.contains("no handler registered for nobody")),
        other => panic!("expected failure, got {other:?}"),
    }
    pool.shutdown();
}

#[tokio::test]
async fn panicking_handler_becomes_a_failure() {
    let events: Events = Arc::default();
    let mut registry = registry_with_recorder(&events);
    registry.register("explode", |_inv: Invocation| async move {
        if true {
            panic!("boom");
        }
        Ok::<_, String>(json!(null))
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(2)).unwrap();

    pool.submit(NewWork::action("explode").on_complete("record", json!(null)))
        .await
        .unwrap();

    wait_until("callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    match &events.lock().unwrap()[0].outcome {
        Outcome::Failed { error } => assert!(error.contains("boom"), "got {error}"),
        other => panic!("expected failure, got {other:?}"),
    }
    pool.shutdown();
}

// ---------------------------------------------------------------------------
// Retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_work_retries_then_fails_terminally() {
    let events: Events = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry_with_recorder(&events);
    let counter = Arc::clone(&calls);
    registry.register("always_fails", move |inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(format!("attempt {} failed", inv.attempt))
        }
    });
    let db = test_db().await;
    let pool = Workpool::new(Arc::clone(&db), Arc::new(registry), options(4)).unwrap();

    let id = pool
        .submit(
            NewWork::action("always_fails")
                .retry(RetryPolicy::new(3, 100, 2.0))
                .on_complete("record", json!({"job": "A"})),
        )
        .await
        .unwrap();

    wait_until("terminal callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    let event = events.lock().unwrap()[0].clone();
    assert_eq!(event.work_id, id);
    assert_eq!(event.outcome, Outcome::failed("attempt 2 failed"));
    assert_eq!(pool.status(id).await.unwrap(), WorkStatus::Finished);

    // No further attempts after the terminal outcome.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(events.lock().unwrap().len(), 1);

    // Two retry-flagged completions, then one terminal failure.
    let deadline = Instant::now() + Duration::from_secs(10);
    let stats = loop {
        let stats = report(&db).await;
        if stats.failed == 1 {
            break stats;
        }
        assert!(Instant::now() < deadline, "terminal failure never counted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(stats.retried, 2);
    assert_eq!(stats.succeeded, 0);
    pool.shutdown();
}

#[tokio::test]
async fn failure_without_policy_is_terminal() {
    let events: Events = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry_with_recorder(&events);
    let counter = Arc::clone(&calls);
    registry.register("fails_once", move |_inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<serde_json::Value, _>("nope".to_string())
        }
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(4)).unwrap();

    pool.submit(NewWork::action("fails_once").on_complete("record", json!(null)))
        .await
        .unwrap();
    wait_until("callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    pool.shutdown();
}

#[tokio::test]
async fn extreme_backoff_does_not_stall_other_work() {
    let events: Events = Arc::default();
    let mut registry = registry_with_recorder(&events);
    registry.register("fails", |_inv: Invocation| async move {
        Err::<serde_json::Value, _>("nope".to_string())
    });
    registry.register("ok", |_inv: Invocation| async move { Ok::<_, String>(json!("ok")) });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(4)).unwrap();

    let err = pool
        .submit(NewWork::action("fails").retry(RetryPolicy::new(3, u64::MAX, 2.0)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWork(_)), "got {err:?}");

    let slow = pool
        .submit(NewWork::action("fails").retry(RetryPolicy::new(3, MAX_INITIAL_BACKOFF_MS, 1e300)))
        .await
        .unwrap();
    wait_for_status(&pool, slow, |s| {
        matches!(s, WorkStatus::Pending { previous_attempts: 1 })
    })
    .await;

    pool.submit(NewWork::action("ok").on_complete("record", json!("unrelated")))
        .await
        .unwrap();
    wait_until("unrelated callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(events.lock().unwrap()[0].outcome, Outcome::success(json!("ok")));
    assert!(matches!(
        pool.status(slow).await.unwrap(),
        WorkStatus::Pending { previous_attempts: 1 }
    ));
    pool.shutdown();
}

// ---------------------------------------------------------------------------
// Parallelism bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn running_count_never_exceeds_max_parallelism() {
    let events: Events = Arc::default();
    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let mut registry = registry_with_recorder(&events);
    let (cur, pk) = (Arc::clone(&current), Arc::clone(&peak));
    registry.register("slow", move |_inv: Invocation| {
        let (cur, pk) = (Arc::clone(&cur), Arc::clone(&pk));
        async move {
            let now = cur.fetch_add(1, Ordering::SeqCst) + 1;
            pk.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            cur.fetch_sub(1, Ordering::SeqCst);
            Ok::<_, String>(json!(null))
        }
    });
    let db = test_db().await;
    let pool = Workpool::new(Arc::clone(&db), Arc::new(registry), options(2)).unwrap();

    let batch = (0..5)
        .map(|i| {
            NewWork::action("slow")
                .args(json!({"i": i}))
                .on_complete("record", json!(i))
        })
        .collect();
    let ids = pool.submit_batch(batch).await.unwrap();
    assert_eq!(ids.len(), 5);

    let deadline = Instant::now() + Duration::from_secs(10);
    while events.lock().unwrap().len() < 5 {
        let snapshot = pool.snapshot().await.unwrap();
        assert!(snapshot.running <= 2, "running {} > 2", snapshot.running);
        assert_starts_and_running_disjoint(&db).await;
        assert!(Instant::now() < deadline, "timed out");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    let statuses = pool.status_batch(&ids).await.unwrap();
    assert!(statuses.iter().all(|s| *s == WorkStatus::Finished));
    pool.shutdown();
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn canceled_work_never_starts() {
    let events: Events = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry_with_recorder(&events);
    let counter = Arc::clone(&calls);
    registry.register("later", move |_inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(json!(null))
        }
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(2)).unwrap();

    let id = pool
        .submit(
            NewWork::action("later")
                .run_after(Duration::from_secs(10))
                .on_complete("record", json!(null)),
        )
        .await
        .unwrap();
    pool.cancel(id).await.unwrap();
    // A second request is a no-op.
    pool.cancel(id).await.unwrap();

    wait_for_status(&pool, id, |s| *s == WorkStatus::Finished).await;
    wait_until("cancel callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(events.lock().unwrap()[0].outcome, Outcome::Canceled);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // Cancelling a finished item is a no-op too.
    pool.cancel(id).await.unwrap();
    pool.shutdown();
}

#[tokio::test]
async fn canceled_running_work_is_not_retried() {
    let events: Events = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let release = Arc::new(Notify::new());
    let mut registry = registry_with_recorder(&events);
    let (counter, gate) = (Arc::clone(&calls), Arc::clone(&release));
    registry.register("gated", move |_inv: Invocation| {
        let (counter, gate) = (Arc::clone(&counter), Arc::clone(&gate));
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            gate.notified().await;
            Err::<serde_json::Value, _>("failed after cancel".to_string())
        }
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(2)).unwrap();

    let id = pool
        .submit(
            NewWork::action("gated")
                .retry(RetryPolicy::new(5, 10, 2.0))
                .on_complete("record", json!(null)),
        )
        .await
        .unwrap();
    wait_until("start", Duration::from_secs(10), || {
        calls.load(Ordering::SeqCst) == 1
    })
    .await;
    wait_for_status(&pool, id, |s| matches!(s, WorkStatus::Running { .. })).await;

    pool.cancel(id).await.unwrap();
    // Let the loop process the cancelation before the attempt finishes.
    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.snapshot().await.unwrap().canceling > 0 {
        assert!(Instant::now() < deadline, "cancelation never processed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    release.notify_one();

    wait_until("callback", Duration::from_secs(10), || {
        events.lock().unwrap().len() == 1
    })
    .await;
    assert_eq!(events.lock().unwrap()[0].outcome, Outcome::Canceled);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(pool.status(id).await.unwrap(), WorkStatus::Finished);
    pool.shutdown();
}

#[tokio::test]
async fn cancel_all_pages_through_every_item() {
    let events: Events = Arc::default();
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = registry_with_recorder(&events);
    let counter = Arc::clone(&calls);
    registry.register("hourly", move |_inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>(json!(null))
        }
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(10)).unwrap();

    let batch = (0..150)
        .map(|i| {
            NewWork::action("hourly")
                .run_after(Duration::from_secs(3600))
                .on_complete("record", json!(i))
        })
        .collect();
    let ids = pool.submit_batch(batch).await.unwrap();

    let mut cursor = CancelCursor::before(workpool::segment::now_ms() + 1);
    let mut pages = Vec::new();
    loop {
        let page = pool.cancel_all_page(cursor, 64).await.unwrap();
        pages.push(page.scanned);
        assert_eq!(page.requested, page.scanned);
        match page.next {
            Some(next) => cursor = next,
            None => break,
        }
    }
    assert_eq!(pages, vec![64, 64, 22]);

    wait_until("all cancel callbacks", Duration::from_secs(15), || {
        events.lock().unwrap().len() == 150
    })
    .await;
    assert!(
        events
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.outcome == Outcome::Canceled)
    );
    let statuses = pool.status_batch(&ids).await.unwrap();
    assert!(statuses.iter().all(|s| *s == WorkStatus::Finished));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    pool.shutdown();
}

#[tokio::test]
async fn cancel_all_continues_in_the_background() {
    let events: Events = Arc::default();
    let registry = registry_with_recorder(&events);
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(10)).unwrap();

    let batch = (0..100)
        .map(|_| {
            NewWork::action("never")
                .run_after(Duration::from_secs(3600))
                .on_complete("record", json!(null))
        })
        .collect();
    pool.submit_batch(batch).await.unwrap();

    let first = pool.cancel_all(None, 30).await.unwrap();
    assert_eq!(first.scanned, 30);
    assert!(first.next.is_some());

    wait_until("all cancel callbacks", Duration::from_secs(15), || {
        events.lock().unwrap().len() == 100
    })
    .await;
    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.waiting, 0);
    assert_eq!(snapshot.canceling, 0);
    pool.shutdown();
}

// ---------------------------------------------------------------------------
// Idempotent completion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn duplicate_completion_applies_once() {
    let events: Events = Arc::default();
    let mut registry = registry_with_recorder(&events);
    registry.register("external", |_inv: Invocation| async move {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok::<_, String>(json!(null))
    });
    let pool = Workpool::new(test_db().await, Arc::new(registry), options(2)).unwrap();

    let id = pool
        .submit(
            NewWork::action("external")
                .retry(RetryPolicy::default())
                .on_complete("record", json!(null)),
        )
        .await
        .unwrap();
    wait_for_status(&pool, id, |s| matches!(s, WorkStatus::Running { .. })).await;

    let report = CompletionReport {
        work_id: id,
        attempt: 0,
        outcome: Outcome::success(json!("external")),
    };
    pool.complete(vec![report.clone()]).await.unwrap();
    pool.complete(vec![report.clone(), report]).await.unwrap();
    // A stale attempt number is ignored as well.
    pool.complete(vec![CompletionReport {
        work_id: id,
        attempt: 7,
        outcome: Outcome::failed("late"),
    }])
    .await
    .unwrap();

    assert_eq!(pool.status(id).await.unwrap(), WorkStatus::Finished);
    wait_until("callback", Duration::from_secs(10), || {
        !events.lock().unwrap().is_empty()
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].outcome, Outcome::success(json!("external")));
    drop(events);

    let deadline = Instant::now() + Duration::from_secs(10);
    while pool.snapshot().await.unwrap().running > 0 {
        assert!(Instant::now() < deadline, "running entry never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    pool.shutdown();
}
