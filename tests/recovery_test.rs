//! Crash recovery: an execution lost with its process is retried by the
//! next process that resumes the pool on the same database file.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;
use workpool::db::{Db, state};
use workpool::model::scheduler::ReportStats;
use workpool::{
    CompletionEvent, FunctionRegistry, Invocation, NewWork, Outcome, PoolOptions, RetryPolicy,
    WorkStatus, Workpool,
};

type Events = Arc<Mutex<Vec<CompletionEvent>>>;

/// `flaky` hangs on its first attempt and succeeds afterwards.
fn registry(calls: &Arc<AtomicUsize>, events: &Events) -> FunctionRegistry {
    let mut registry = FunctionRegistry::empty();
    let counter = Arc::clone(calls);
    registry.register("flaky", move |inv: Invocation| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if inv.attempt == 0 {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok::<_, String>(json!({"attempt": inv.attempt}))
        }
    });
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

async fn open(url: &str) -> Arc<Db> {
    let db = Db::connect(url).await.expect("connect");
    db.migrate().await.expect("migrations");
    Arc::new(db)
}

async fn report(db: &Db) -> ReportStats {
    let mut conn = db.pool().acquire().await.unwrap();
    state::load_state(&mut conn).await.unwrap().report
}

/// Submit `new` in a first process and stop that process while the attempt
/// is still in flight.
async fn crash_mid_attempt(
    url: &str,
    calls: &Arc<AtomicUsize>,
    events: &Events,
    new: NewWork,
) -> workpool::WorkId {
    let db = open(url).await;
    let first = Workpool::new(
        Arc::clone(&db),
        Arc::new(registry(calls, events)),
        PoolOptions::default(),
    )
    .unwrap();
    let id = first.submit(new).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "first attempt never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    first.shutdown();
    db.close().await;
    drop(first);

    // Let the lost attempt age past the recovery threshold.
    tokio::time::sleep(Duration::from_millis(300)).await;
    id
}

/// Resume the pool in a second process with an aggressive recovery policy.
async fn restart(url: &str, calls: &Arc<AtomicUsize>, events: &Events) -> (Arc<Db>, Workpool) {
    let db = open(url).await;
    let pool = Workpool::new(
        Arc::clone(&db),
        Arc::new(registry(calls, events)),
        PoolOptions {
            recovery_threshold: Duration::from_millis(200),
            recovery_period: Duration::from_millis(200),
            ..PoolOptions::default()
        },
    )
    .unwrap();
    pool.resume().await.unwrap();
    (db, pool)
}

async fn wait_for_callback(events: &Events) -> CompletionEvent {
    let deadline = Instant::now() + Duration::from_secs(15);
    while events.lock().unwrap().is_empty() {
        assert!(Instant::now() < deadline, "recovered work never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    events.lock().unwrap()[0].clone()
}

#[tokio::test]
async fn lost_execution_is_retried_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("pool.db").display());
    let calls = Arc::new(AtomicUsize::new(0));
    let events: Events = Arc::default();

    let id = crash_mid_attempt(
        &url,
        &calls,
        &events,
        NewWork::action("flaky")
            .retry(RetryPolicy::new(3, 50, 2.0))
            .on_complete("record", json!("recovered")),
    )
    .await;

    let db = open(&url).await;
    assert!(matches!(
        Workpool::client(Arc::clone(&db), PoolOptions::default())
            .unwrap()
            .status(id)
            .await
            .unwrap(),
        WorkStatus::Running { .. }
    ));
    db.close().await;

    let (db, second) = restart(&url, &calls, &events).await;
    let event = wait_for_callback(&events).await;

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(event.work_id, id);
    assert_eq!(event.context, json!("recovered"));
    assert_eq!(event.outcome, Outcome::success(json!({"attempt": 1})));
    assert_eq!(second.status(id).await.unwrap(), WorkStatus::Finished);

    // The lost attempt was reconciled exactly once.
    let stats = report(&db).await;
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.retried, 1);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(report(&db).await.recovered, 1);

    second.shutdown();
    db.close().await;
}

#[tokio::test]
async fn lost_execution_without_policy_fails_terminally() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("pool.db").display());
    let calls = Arc::new(AtomicUsize::new(0));
    let events: Events = Arc::default();

    let id = crash_mid_attempt(
        &url,
        &calls,
        &events,
        NewWork::action("flaky").on_complete("record", json!("lost")),
    )
    .await;

    let (db, second) = restart(&url, &calls, &events).await;
    let event = wait_for_callback(&events).await;

    assert_eq!(event.work_id, id);
    assert_eq!(event.context, json!("lost"));
    assert_eq!(event.outcome, Outcome::failed("execution lost"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(second.status(id).await.unwrap(), WorkStatus::Finished);

    // The loop counts the terminal failure when it drains the completion.
    let deadline = Instant::now() + Duration::from_secs(10);
    let stats = loop {
        let stats = report(&db).await;
        if stats.failed == 1 {
            break stats;
        }
        assert!(Instant::now() < deadline, "terminal failure never counted");
        tokio::time::sleep(Duration::from_millis(20)).await;
    };
    assert_eq!(stats.recovered, 1);
    assert_eq!(stats.retried, 0);

    second.shutdown();
    db.close().await;
}

#[tokio::test]
async fn resume_on_an_empty_store_is_harmless() {
    let db = Db::in_memory().await.unwrap();
    db.migrate().await.unwrap();
    let pool = Workpool::new(
        Arc::new(db),
        Arc::new(FunctionRegistry::empty()),
        PoolOptions::default(),
    )
    .unwrap();

    pool.resume().await.unwrap();
    pool.resume().await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.running, 0);
    assert_eq!(snapshot.waiting, 0);
    pool.shutdown();
}
