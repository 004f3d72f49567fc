//! Durable job queue with dedup keys, delayed and repeating jobs, retries and
//! a dead-letter set.
//!
//! Two backends implement [`JobQueue`]: [`RedisQueue`] for production and
//! [`MemoryQueue`] for tests and single-process dev runs. Workers never talk
//! to a backend directly; they receive an `Arc<dyn JobQueue>` at start-up.

pub mod memory;
pub mod redis;
pub mod worker;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::{serde_as, DurationMilliSeconds};

use crate::error::EngineResult;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;
pub use self::worker::{JobProcessor, RepeatSpec, RetryPolicy, Worker, WorkerPool};

// ---- queue names ----------------------------------------------------------
pub const SETTLEMENT: &str = "settlement";
pub const MATCHMAKING: &str = "matchmaking";
pub const STANDINGS: &str = "standings";
pub const LEADERBOARD: &str = "leaderboard";
pub const SEASON: &str = "season";

/// Job names, grouped by the queue that carries them.
pub mod jobs {
    pub const CHECK_SETTLEMENT: &str = "check-settlement";
    pub const SETTLE_MATCH: &str = "settle-match";
    pub const VOID_MATCH: &str = "void-match";
    pub const POSTPONEMENT_SCAN: &str = "postponement-scan";

    pub const MATCHMAKING_RUN: &str = "matchmaking";

    pub const UPDATE_STANDINGS: &str = "update-standings";

    pub const REBUILD: &str = "rebuild";
    pub const WEEKLY_RESET: &str = "weekly-reset";

    pub const DAILY_DECAY: &str = "daily-decay";
    pub const SEASON_END_CHECK: &str = "season-end-check";
    pub const END_SEASON: &str = "end-season";
    pub const FINALIZE_RANKINGS: &str = "finalize-rankings";
    pub const DISTRIBUTE_REWARDS: &str = "distribute-rewards";
}

/// One unit of queued work as persisted by a backend.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub dedup_key: Option<String>,
    pub payload: Value,
    #[serde(default)]
    pub priority: u8,
    /// Starts so far, including the current one.
    #[serde(default)]
    pub attempts: u32,
    /// Overrides the worker's [`RetryPolicy::max_attempts`].
    pub max_attempts: Option<u32>,
    pub enqueued_at: DateTime<Utc>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    #[serde(default)]
    pub delay: Option<Duration>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(queue: &str, name: &str, payload: Value, opts: &JobOptions) -> Self {
        Job {
            id: uuid::Uuid::new_v4().to_string(),
            queue: queue.to_owned(),
            name: name.to_owned(),
            dedup_key: opts.dedup_key.clone(),
            payload,
            priority: opts.priority,
            attempts: 0,
            max_attempts: opts.max_attempts,
            enqueued_at: Utc::now(),
            delay: opts.delay.filter(|d| !d.is_zero()),
            last_error: None,
            failed_at: None,
        }
    }

    /// Decode the payload into its typed form.
    pub fn payload<T: DeserializeOwned>(&self) -> EngineResult<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Sort key inside the waiting set: higher priority first, then FIFO.
    pub(crate) fn wait_score(&self, now_ms: i64) -> f64 {
        f64::from(u8::MAX - self.priority) * 1e13 + now_ms as f64
    }
}

#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    /// At most one pending, delayed or active job per key.
    pub dedup_key: Option<String>,
    pub delay: Option<Duration>,
    /// Higher values are served first.
    pub priority: u8,
    pub max_attempts: Option<u32>,
}

impl JobOptions {
    pub fn dedup(key: impl Into<String>) -> Self {
        JobOptions {
            dedup_key: Some(key.into()),
            ..Default::default()
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobHandle {
    pub id: String,
    /// `true` when the call coalesced with an existing job.
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: usize,
    pub delayed: usize,
    pub active: usize,
    pub dead: usize,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> EngineResult<JobHandle>;

    /// Take the next runnable job and lease it for `lease`. Due delayed jobs
    /// are promoted and stalled leases recovered first.
    async fn reserve(&self, queue: &str, lease: Duration) -> EngineResult<Option<Job>>;

    /// Remove a finished job and release its dedup key.
    async fn complete(&self, job: &Job) -> EngineResult<()>;

    /// Put a failed job back as delayed. The dedup key stays held.
    async fn retry_later(&self, job: &Job, delay: Duration, error: &str) -> EngineResult<()>;

    /// Park a job in the dead-letter set and release its dedup key.
    async fn dead_letter(&self, job: &Job, error: &str) -> EngineResult<()>;

    async fn dead_letters(&self, queue: &str) -> EngineResult<Vec<Job>>;

    /// Move a dead job back to waiting with a fresh attempt budget. `None`
    /// when no such dead job exists.
    async fn replay_dead_letter(&self, queue: &str, job_id: &str)
        -> EngineResult<Option<JobHandle>>;

    /// Enqueue at most one job per `every`-wide slot across all processes.
    async fn schedule_repeat(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        every: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<JobHandle>>;

    async fn counts(&self, queue: &str) -> EngineResult<QueueCounts>;
}

/// Serialize `payload` and enqueue it.
pub async fn enqueue_json<T: Serialize>(
    queue: &dyn JobQueue,
    queue_name: &str,
    name: &str,
    payload: &T,
    opts: JobOptions,
) -> EngineResult<JobHandle> {
    let value = serde_json::to_value(payload)?;
    queue.enqueue(queue_name, name, value, opts).await
}

/// Fire-and-forget enqueue: failures are logged, never returned.
pub async fn enqueue_best_effort<T: Serialize>(
    queue: &dyn JobQueue,
    queue_name: &str,
    name: &str,
    payload: &T,
    opts: JobOptions,
) -> Option<JobHandle> {
    match enqueue_json(queue, queue_name, name, payload, opts).await {
        Ok(handle) => Some(handle),
        Err(e) => {
            log::warn!("could not enqueue {queue_name}/{name}: {e}");
            None
        }
    }
}

/// Slot index used by [`JobQueue::schedule_repeat`].
pub(crate) fn repeat_slot(every: Duration, now: DateTime<Utc>) -> i64 {
    let every_ms = (every.as_millis() as i64).max(1);
    now.timestamp_millis().div_euclid(every_ms)
}
