//! Bounded-concurrency workers, retry policy and the repeat scheduler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use rand::Rng;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use super::{Job, JobQueue};
use crate::error::{EngineError, EngineResult};
use crate::metrics;

/// Handles every job of one queue.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> EngineResult<()>;
}

/// Exponential backoff: `base · 2^(attempt-1)` plus up to 10% jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        RetryPolicy {
            base_delay,
            max_attempts,
        }
    }

    /// Delay before the retry that follows `attempt`, without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(1u32 << exp)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = backoff.as_millis() as u64 / 10;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn attempts_for(&self, job: &Job) -> u32 {
        job.max_attempts.unwrap_or(self.max_attempts).max(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried(Duration),
    Dead,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => "completed",
            JobOutcome::Retried(_) => "retried",
            JobOutcome::Dead => "dead",
        }
    }
}

/// Run one reserved job and settle its fate in the queue.
async fn execute(
    queue: &dyn JobQueue,
    processor: &dyn JobProcessor,
    policy: &RetryPolicy,
    job: Job,
) -> JobOutcome {
    let started = Instant::now();
    let max_attempts = policy.attempts_for(&job);

    let outcome = match processor.process(&job).await {
        Ok(()) => JobOutcome::Completed,
        Err(EngineError::AlreadyDone(what)) => {
            log::debug!("{}/{} {}: already done ({what})", job.queue, job.name, job.id);
            JobOutcome::Completed
        }
        Err(e) if !e.is_retryable() => {
            tracing::error!(queue = %job.queue, job = %job.name, id = %job.id, error = %e,
                "job failed permanently");
            if let Err(err) = queue.dead_letter(&job, &e.to_string()).await {
                log::error!("dead-lettering {} failed: {err}", job.id);
            }
            JobOutcome::Dead
        }
        Err(e) if job.attempts < max_attempts => {
            let delay = policy.delay_for(job.attempts);
            tracing::warn!(queue = %job.queue, job = %job.name, id = %job.id,
                attempt = job.attempts, kind = e.kind(), error = %e,
                "job failed, retrying in {:?}", delay);
            if let Err(err) = queue.retry_later(&job, delay, &e.to_string()).await {
                log::error!("rescheduling {} failed: {err}", job.id);
            }
            JobOutcome::Retried(delay)
        }
        Err(e) => {
            tracing::error!(queue = %job.queue, job = %job.name, id = %job.id,
                attempt = job.attempts, kind = e.kind(), error = %e,
                "job exhausted retries, moved to dead letters");
            if let Err(err) = queue.dead_letter(&job, &e.to_string()).await {
                log::error!("dead-lettering {} failed: {err}", job.id);
            }
            JobOutcome::Dead
        }
    };

    if outcome == JobOutcome::Completed {
        if let Err(err) = queue.complete(&job).await {
            log::error!("completing {} failed: {err}", job.id);
        }
        tracing::info!(queue = %job.queue, job = %job.name, id = %job.id,
            attempt = job.attempts, "job completed");
    }

    metrics::record_job(&job.queue, outcome.as_str(), started.elapsed().as_secs_f64());
    outcome
}

/// Pulls jobs from one queue and runs up to `concurrency` at a time.
pub struct Worker {
    queue: Arc<dyn JobQueue>,
    queue_name: String,
    concurrency: usize,
    policy: RetryPolicy,
    processor: Arc<dyn JobProcessor>,
    lease: Duration,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        queue_name: &str,
        concurrency: usize,
        policy: RetryPolicy,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        Worker {
            queue,
            queue_name: queue_name.to_owned(),
            concurrency: concurrency.max(1),
            policy,
            processor,
            lease: Duration::from_secs(60),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Reserve and run a single job inline. `None` when the queue is empty.
    pub async fn run_once(&self) -> EngineResult<Option<JobOutcome>> {
        let Some(job) = self.queue.reserve(&self.queue_name, self.lease).await? else {
            return Ok(None);
        };
        Ok(Some(
            execute(&*self.queue, &*self.processor, &self.policy, job).await,
        ))
    }

    /// Run until the queue is empty, returning how many jobs were executed.
    pub async fn drain(&self) -> EngineResult<usize> {
        let mut n = 0;
        while self.run_once().await?.is_some() {
            n += 1;
        }
        Ok(n)
    }

    /// Start the pull loop. Once `shutdown` flips to `true` the loop stops
    /// reserving and waits for in-flight jobs before returning.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = Arc::new(self);
        tokio::spawn(async move {
            let permits = Arc::new(Semaphore::new(worker.concurrency));
            log::info!(
                "worker for '{}' started (concurrency {})",
                worker.queue_name,
                worker.concurrency
            );

            loop {
                if *shutdown.borrow() {
                    break;
                }
                let permit = tokio::select! {
                    p = permits.clone().acquire_owned() => match p {
                        Ok(p) => p,
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                };

                let mut idle = worker.poll_interval;
                match worker.queue.reserve(&worker.queue_name, worker.lease).await {
                    Ok(Some(job)) => {
                        let w = worker.clone();
                        tokio::spawn(async move {
                            execute(&*w.queue, &*w.processor, &w.policy, job).await;
                            drop(permit);
                        });
                        continue;
                    }
                    Ok(None) => drop(permit),
                    Err(e) => {
                        drop(permit);
                        tracing::error!(queue = %worker.queue_name, error = %e, "reserve failed");
                        idle *= 4;
                    }
                }

                let mut closed = false;
                tokio::select! {
                    _ = sleep(idle) => {}
                    res = shutdown.changed() => closed = res.is_err(),
                }
                if closed {
                    break;
                }
            }

            let _ = permits.acquire_many(worker.concurrency as u32).await;
            log::info!("worker for '{}' drained", worker.queue_name);
        })
    }
}

/// A job enqueued once per `every` by the scheduler.
#[derive(Debug, Clone)]
pub struct RepeatSpec {
    pub queue: String,
    pub name: String,
    pub payload: Value,
    pub every: Duration,
}

impl RepeatSpec {
    pub fn new(queue: &str, name: &str, every: Duration) -> Self {
        RepeatSpec {
            queue: queue.to_owned(),
            name: name.to_owned(),
            payload: Value::Null,
            every,
        }
    }
}

/// Owns every worker task and the shared shutdown signal.
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        WorkerPool {
            shutdown,
            handles: Vec::new(),
        }
    }

    pub fn spawn(&mut self, worker: Worker) {
        let rx = self.shutdown.subscribe();
        self.handles.push(worker.spawn(rx));
    }

    /// Every `tick`, try to claim the current slot of each repeat spec.
    pub fn spawn_scheduler(
        &mut self,
        queue: Arc<dyn JobQueue>,
        specs: Vec<RepeatSpec>,
        tick: Duration,
    ) {
        let mut rx = self.shutdown.subscribe();
        self.handles.push(tokio::spawn(async move {
            loop {
                let now = Utc::now();
                for spec in &specs {
                    match queue
                        .schedule_repeat(&spec.queue, &spec.name, spec.payload.clone(), spec.every, now)
                        .await
                    {
                        Ok(Some(handle)) => {
                            log::debug!("scheduled {}/{} as {}", spec.queue, spec.name, handle.id)
                        }
                        Ok(None) => {}
                        Err(e) => log::warn!("scheduling {}/{} failed: {e}", spec.queue, spec.name),
                    }
                }

                let mut closed = false;
                tokio::select! {
                    _ = sleep(tick) => {}
                    res = rx.changed() => closed = res.is_err(),
                }
                if closed || *rx.borrow() {
                    break;
                }
            }
        }));
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop reserving, let in-flight jobs finish and join every task.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for res in join_all(self.handles).await {
            if let Err(e) = res {
                log::error!("worker task ended abnormally: {e}");
            }
        }
    }
}
