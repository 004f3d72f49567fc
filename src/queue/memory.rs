//! Process-local [`JobQueue`] used by tests and `STORE_BACKEND=memory` runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{repeat_slot, Job, JobHandle, JobOptions, JobQueue, QueueCounts};
use crate::error::EngineResult;

#[derive(Default)]
struct QueueState {
    jobs: HashMap<String, Job>,
    /// (priority rank, sequence) → id
    waiting: BTreeMap<(u8, u64), String>,
    delayed: HashMap<String, DateTime<Utc>>,
    active: HashMap<String, DateTime<Utc>>,
    dead: Vec<String>,
    dedup: HashMap<String, String>,
}

impl QueueState {
    fn push_waiting(&mut self, seq: u64, job_id: &str) {
        let Some(job) = self.jobs.get(job_id) else {
            return;
        };
        self.waiting
            .insert((u8::MAX - job.priority, seq), job_id.to_owned());
    }

    fn release_dedup(&mut self, job: &Job) {
        if let Some(key) = &job.dedup_key {
            if self.dedup.get(key) == Some(&job.id) {
                self.dedup.remove(key);
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    queues: HashMap<String, QueueState>,
    /// Last slot enqueued per `queue:name`.
    repeat_slots: HashMap<String, i64>,
    seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }
}

#[derive(Default)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Waiting and delayed jobs of `queue`, oldest first.
    pub fn pending(&self, queue: &str) -> Vec<Job> {
        let inner = self.lock();
        let Some(q) = inner.queues.get(queue) else {
            return Vec::new();
        };
        let mut out: Vec<Job> = q
            .waiting
            .values()
            .chain(q.delayed.keys())
            .filter_map(|id| q.jobs.get(id).cloned())
            .collect();
        out.sort_by_key(|j| j.enqueued_at);
        out
    }

    /// Pending jobs of `queue` with the given name.
    pub fn pending_named(&self, queue: &str, name: &str) -> Vec<Job> {
        self.pending(queue)
            .into_iter()
            .filter(|j| j.name == name)
            .collect()
    }

    /// Make every delayed job of `queue` runnable now.
    pub fn promote_delayed(&self, queue: &str) -> usize {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let Some(q) = inner.queues.get_mut(queue) else {
            return 0;
        };
        let ids: Vec<String> = q.delayed.drain().map(|(id, _)| id).collect();
        for (i, id) in ids.iter().enumerate() {
            q.push_waiting(seq * 1_000 + i as u64, id);
        }
        ids.len()
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> EngineResult<JobHandle> {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let q = inner.queues.entry(queue.to_owned()).or_default();

        if let Some(key) = &opts.dedup_key {
            if let Some(existing) = q.dedup.get(key) {
                if q.jobs.contains_key(existing) && !q.dead.contains(existing) {
                    return Ok(JobHandle {
                        id: existing.clone(),
                        deduplicated: true,
                    });
                }
            }
        }

        let job = Job::new(queue, name, payload, &opts);
        let id = job.id.clone();
        if let Some(key) = &job.dedup_key {
            q.dedup.insert(key.clone(), id.clone());
        }
        let ready_at = job
            .delay
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        q.jobs.insert(id.clone(), job);
        match ready_at {
            Some(at) => {
                q.delayed.insert(id.clone(), at);
            }
            None => q.push_waiting(seq, &id),
        }
        Ok(JobHandle {
            id,
            deduplicated: false,
        })
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> EngineResult<Option<Job>> {
        let now = Utc::now();
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };

        let due: Vec<String> = q
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(id, _)| id.clone())
            .collect();
        let stalled: Vec<String> = q
            .active
            .iter()
            .filter(|(_, until)| **until <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for (i, id) in due.iter().chain(stalled.iter()).enumerate() {
            q.delayed.remove(id);
            q.active.remove(id);
            q.push_waiting(seq * 1_000 + i as u64, id);
        }

        let Some((_, id)) = q.waiting.pop_first() else {
            return Ok(None);
        };
        let lease_until = now + chrono::Duration::from_std(lease).unwrap_or_default();
        q.active.insert(id.clone(), lease_until);
        Ok(q.jobs.get_mut(&id).map(|job| {
            job.attempts += 1;
            job.clone()
        }))
    }

    async fn complete(&self, job: &Job) -> EngineResult<()> {
        let mut inner = self.lock();
        if let Some(q) = inner.queues.get_mut(&job.queue) {
            q.active.remove(&job.id);
            q.jobs.remove(&job.id);
            q.release_dedup(job);
        }
        Ok(())
    }

    async fn retry_later(&self, job: &Job, delay: Duration, error: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        if let Some(q) = inner.queues.get_mut(&job.queue) {
            q.active.remove(&job.id);
            let mut stored = job.clone();
            stored.last_error = Some(error.to_owned());
            q.jobs.insert(job.id.clone(), stored);
            let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default();
            q.delayed.insert(job.id.clone(), at);
        }
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> EngineResult<()> {
        let mut inner = self.lock();
        let q = inner.queues.entry(job.queue.clone()).or_default();
        q.active.remove(&job.id);
        let mut stored = job.clone();
        stored.last_error = Some(error.to_owned());
        stored.failed_at = Some(Utc::now());
        q.jobs.insert(job.id.clone(), stored);
        if !q.dead.contains(&job.id) {
            q.dead.push(job.id.clone());
        }
        q.release_dedup(job);
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> EngineResult<Vec<Job>> {
        let inner = self.lock();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| q.dead.iter().filter_map(|id| q.jobs.get(id).cloned()).collect())
            .unwrap_or_default())
    }

    async fn replay_dead_letter(
        &self,
        queue: &str,
        job_id: &str,
    ) -> EngineResult<Option<JobHandle>> {
        let mut inner = self.lock();
        let seq = inner.next_seq();
        let Some(q) = inner.queues.get_mut(queue) else {
            return Ok(None);
        };
        let Some(pos) = q.dead.iter().position(|id| id == job_id) else {
            return Ok(None);
        };
        q.dead.remove(pos);
        let Some(job) = q.jobs.get_mut(job_id) else {
            return Ok(None);
        };
        job.attempts = 0;
        job.failed_at = None;
        if let Some(key) = job.dedup_key.clone() {
            q.dedup.entry(key).or_insert_with(|| job_id.to_owned());
        }
        q.push_waiting(seq, job_id);
        Ok(Some(JobHandle {
            id: job_id.to_owned(),
            deduplicated: false,
        }))
    }

    async fn schedule_repeat(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        every: Duration,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<JobHandle>> {
        let slot = repeat_slot(every, now);
        {
            let mut inner = self.lock();
            let last = inner.repeat_slots.entry(format!("{queue}:{name}")).or_insert(i64::MIN);
            if *last >= slot {
                return Ok(None);
            }
            *last = slot;
        }
        let opts = JobOptions::dedup(format!("repeat-{name}"));
        self.enqueue(queue, name, payload, opts).await.map(Some)
    }

    async fn counts(&self, queue: &str) -> EngineResult<QueueCounts> {
        let inner = self.lock();
        Ok(inner
            .queues
            .get(queue)
            .map(|q| QueueCounts {
                waiting: q.waiting.len(),
                delayed: q.delayed.len(),
                active: q.active.len(),
                dead: q.dead.len(),
            })
            .unwrap_or_default())
    }
}
