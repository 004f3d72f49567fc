use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use duelbook_server::error::{EngineError, EngineResult};
use duelbook_server::lock::{with_lock, DistributedLock, MemoryLock};
use duelbook_server::queue::worker::JobOutcome;
use duelbook_server::queue::{
    Job, JobOptions, JobProcessor, JobQueue, MemoryQueue, RepeatSpec, RetryPolicy, Worker,
    WorkerPool,
};
use serde_json::json;

/// Fails the first `failures` calls, then succeeds.
struct Flaky {
    failures: usize,
    calls: AtomicUsize,
}

impl Flaky {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Flaky {
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobProcessor for Flaky {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        match job.name.as_str() {
            "missing" => Err(EngineError::not_found("thing", "x")),
            "done" => Err(EngineError::AlreadyDone("earlier run".into())),
            _ if n < self.failures => Err(EngineError::unexpected("backend down")),
            _ => Ok(()),
        }
    }
}

fn worker(queue: &Arc<MemoryQueue>, processor: Arc<Flaky>, max_attempts: u32) -> Worker {
    Worker::new(
        queue.clone(),
        "test",
        2,
        RetryPolicy::new(Duration::from_millis(1), max_attempts),
        processor,
    )
}

#[tokio::test]
async fn dedup_key_coalesces_until_the_job_finishes() {
    let queue = Arc::new(MemoryQueue::new());
    let a = queue
        .enqueue("test", "job", json!({"n": 1}), JobOptions::dedup("k"))
        .await
        .unwrap();
    let b = queue
        .enqueue("test", "job", json!({"n": 2}), JobOptions::dedup("k"))
        .await
        .unwrap();
    assert_eq!(a.id, b.id);
    assert!(!a.deduplicated && b.deduplicated);
    assert_eq!(queue.pending("test").len(), 1);

    let w = worker(&queue, Flaky::new(0), 3);
    assert_eq!(w.drain().await.unwrap(), 1);

    let c = queue
        .enqueue("test", "job", json!({}), JobOptions::dedup("k"))
        .await
        .unwrap();
    assert_ne!(c.id, a.id);
}

#[tokio::test]
async fn higher_priority_is_served_first() {
    let queue = Arc::new(MemoryQueue::new());
    queue.enqueue("test", "low", json!({}), JobOptions::default()).await.unwrap();
    queue
        .enqueue("test", "high", json!({}), JobOptions::default().with_priority(5))
        .await
        .unwrap();

    let first = queue.reserve("test", Duration::from_secs(5)).await.unwrap().unwrap();
    assert_eq!(first.name, "high");
    assert_eq!(first.attempts, 1);
}

#[tokio::test]
async fn delayed_jobs_wait() {
    let queue = Arc::new(MemoryQueue::new());
    queue
        .enqueue(
            "test",
            "later",
            json!({}),
            JobOptions::default().delayed(Duration::from_secs(3600)),
        )
        .await
        .unwrap();
    assert!(queue.reserve("test", Duration::from_secs(5)).await.unwrap().is_none());
    assert_eq!(queue.counts("test").await.unwrap().delayed, 1);

    assert_eq!(queue.promote_delayed("test"), 1);
    assert!(queue.reserve("test", Duration::from_secs(5)).await.unwrap().is_some());
}

#[tokio::test]
async fn failures_retry_with_backoff_then_dead_letter() {
    let queue = Arc::new(MemoryQueue::new());
    let processor = Flaky::new(usize::MAX);
    let w = worker(&queue, processor.clone(), 2);
    let handle = queue
        .enqueue("test", "job", json!({}), JobOptions::dedup("only"))
        .await
        .unwrap();

    let first = w.run_once().await.unwrap();
    assert!(matches!(first, Some(JobOutcome::Retried(_))));
    assert_eq!(queue.counts("test").await.unwrap().delayed, 1);

    queue.promote_delayed("test");
    assert_eq!(w.run_once().await.unwrap(), Some(JobOutcome::Dead));
    assert_eq!(processor.calls(), 2);

    let dead = queue.dead_letters("test").await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].id, handle.id);
    assert!(dead[0].failed_at.is_some());
    assert!(dead[0].last_error.as_deref().unwrap().contains("backend down"));

    // the dedup key is free again once the job is dead
    let fresh = queue
        .enqueue("test", "job", json!({}), JobOptions::dedup("only"))
        .await
        .unwrap();
    assert!(!fresh.deduplicated);
}

#[tokio::test]
async fn replayed_dead_job_gets_a_fresh_budget() {
    let queue = Arc::new(MemoryQueue::new());
    let w = worker(&queue, Flaky::new(1), 1);
    let handle = queue.enqueue("test", "job", json!({}), JobOptions::default()).await.unwrap();

    assert_eq!(w.run_once().await.unwrap(), Some(JobOutcome::Dead));
    let replayed = queue.replay_dead_letter("test", &handle.id).await.unwrap();
    assert_eq!(replayed.map(|h| h.id), Some(handle.id.clone()));
    assert!(queue.replay_dead_letter("test", &handle.id).await.unwrap().is_none());

    assert_eq!(w.run_once().await.unwrap(), Some(JobOutcome::Completed));
    let counts = queue.counts("test").await.unwrap();
    assert_eq!((counts.waiting, counts.dead), (0, 0));
}

#[tokio::test]
async fn missing_rows_fail_fast_and_already_done_counts_as_success() {
    let queue = Arc::new(MemoryQueue::new());
    let processor = Flaky::new(0);
    let w = worker(&queue, processor.clone(), 5);
    queue.enqueue("test", "missing", json!({}), JobOptions::default()).await.unwrap();
    queue.enqueue("test", "done", json!({}), JobOptions::default()).await.unwrap();

    let mut outcomes = vec![
        w.run_once().await.unwrap().unwrap(),
        w.run_once().await.unwrap().unwrap(),
    ];
    outcomes.sort_by_key(|o| o.as_str());
    assert_eq!(outcomes, vec![JobOutcome::Completed, JobOutcome::Dead]);
    assert_eq!(processor.calls(), 2);
}

#[tokio::test]
async fn repeat_jobs_are_enqueued_once_per_slot() {
    let queue = Arc::new(MemoryQueue::new());
    let every = Duration::from_secs(60);
    let now = Utc::now();

    let first = queue.schedule_repeat("test", "tick", json!({}), every, now).await.unwrap();
    let same_slot = queue.schedule_repeat("test", "tick", json!({}), every, now).await.unwrap();
    assert!(first.is_some());
    assert!(same_slot.is_none());
    assert_eq!(queue.pending_named("test", "tick").len(), 1);
}

#[tokio::test]
async fn pool_runs_jobs_and_shuts_down_cleanly() {
    let queue = Arc::new(MemoryQueue::new());
    let processor = Flaky::new(0);
    for i in 0..5 {
        queue.enqueue("test", "job", json!({ "i": i }), JobOptions::default()).await.unwrap();
    }

    let mut pool = WorkerPool::new();
    pool.spawn(worker(&queue, processor.clone(), 3).with_poll_interval(Duration::from_millis(5)));
    pool.spawn_scheduler(
        queue.clone(),
        vec![RepeatSpec::new("test", "tick", Duration::from_secs(3600))],
        Duration::from_millis(5),
    );
    assert_eq!(pool.len(), 2);

    tokio::time::sleep(Duration::from_millis(200)).await;
    pool.shutdown().await;

    // five jobs plus one scheduled tick
    assert_eq!(processor.calls(), 6);
    assert!(queue.pending("test").is_empty());
}

#[tokio::test]
async fn with_lock_runs_only_when_the_lock_is_free() {
    let lock = MemoryLock::new();
    let ran = with_lock(&lock, "lock:test", Duration::from_secs(5), || async {
        Ok::<_, EngineError>(7)
    })
    .await
    .unwrap();
    assert_eq!(ran, Some(7));
    assert!(!lock.is_held("lock:test"), "released after the closure");

    let token = lock.try_acquire("lock:test", Duration::from_secs(5)).await.unwrap().unwrap();
    let skipped = with_lock(&lock, "lock:test", Duration::from_secs(5), || async {
        Ok::<_, EngineError>(7)
    })
    .await
    .unwrap();
    assert_eq!(skipped, None);
    assert!(lock.release("lock:test", &token).await.unwrap());
}
