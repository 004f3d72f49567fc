//! Redis-backed [`JobQueue`].
//
//  Redis keys (per queue)
//  ----------------------
//  q:<queue>:jobs      – HASH  id → job JSON
//  q:<queue>:attempts  – HASH  id → starts so far
//  q:<queue>:wait      – ZSET  id, score = priority rank · 1e13 + enqueue ms
//  q:<queue>:delayed   – ZSET  id, score = ready-at ms
//  q:<queue>:active    – ZSET  id, score = lease deadline ms
//  q:<queue>:dead      – ZSET  id, score = failed-at ms
//  q:<queue>:dedup     – HASH  dedup key → id
//  q:<queue>:prio      – HASH  id → priority rank (255 − priority)
//  q:<queue>:repeat:<name>:<slot> – STRING, SET NX PX claim for one repeat slot

use std::time::Duration;

use ::redis::{AsyncCommands, Client as RedisClient, Script};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use serde_json::Value;

use super::{repeat_slot, Job, JobHandle, JobOptions, JobQueue, QueueCounts};
use crate::error::EngineResult;

static ENQUEUE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: jobs wait delayed dedup dead prio
        -- ARGV: id json dedup_key wait_score ready_ms priority_rank
        if ARGV[3] ~= '' then
            local existing = redis.call('HGET', KEYS[4], ARGV[3])
            if existing and redis.call('HEXISTS', KEYS[1], existing) == 1
               and not redis.call('ZSCORE', KEYS[5], existing) then
                return {existing, 1}
            end
            redis.call('HSET', KEYS[4], ARGV[3], ARGV[1])
        end
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('HSET', KEYS[6], ARGV[1], ARGV[6])
        if tonumber(ARGV[5]) > 0 then
            redis.call('ZADD', KEYS[3], ARGV[5], ARGV[1])
        else
            redis.call('ZADD', KEYS[2], ARGV[4], ARGV[1])
        end
        return {ARGV[1], 0}
        "#,
    )
});

static RESERVE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: jobs wait delayed active attempts prio
        -- ARGV: now_ms lease_until_ms
        local now = tonumber(ARGV[1])
        for _, set in ipairs({KEYS[3], KEYS[4]}) do
            local due = redis.call('ZRANGEBYSCORE', set, '-inf', ARGV[1])
            for _, id in ipairs(due) do
                local rank = tonumber(redis.call('HGET', KEYS[6], id) or '255')
                redis.call('ZREM', set, id)
                redis.call('ZADD', KEYS[2], string.format('%.0f', rank * 1e13 + now), id)
            end
        end
        local head = redis.call('ZRANGE', KEYS[2], 0, 0)
        if #head == 0 then
            return false
        end
        local id = head[1]
        redis.call('ZREM', KEYS[2], id)
        local json = redis.call('HGET', KEYS[1], id)
        if not json then
            return false
        end
        redis.call('ZADD', KEYS[4], ARGV[2], id)
        local attempts = redis.call('HINCRBY', KEYS[5], id, 1)
        return {json, attempts}
        "#,
    )
});

static COMPLETE: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: jobs active attempts dedup prio
        -- ARGV: id dedup_key
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HDEL', KEYS[1], ARGV[1])
        redis.call('HDEL', KEYS[3], ARGV[1])
        redis.call('HDEL', KEYS[5], ARGV[1])
        if ARGV[2] ~= '' and redis.call('HGET', KEYS[4], ARGV[2]) == ARGV[1] then
            redis.call('HDEL', KEYS[4], ARGV[2])
        end
        return 1
        "#,
    )
});

static RETRY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: jobs active delayed
        -- ARGV: id json ready_ms
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
        return 1
        "#,
    )
});

static DEAD_LETTER: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: jobs active dead dedup
        -- ARGV: id json failed_ms dedup_key
        redis.call('ZREM', KEYS[2], ARGV[1])
        redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
        redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
        if ARGV[4] ~= '' and redis.call('HGET', KEYS[4], ARGV[4]) == ARGV[1] then
            redis.call('HDEL', KEYS[4], ARGV[4])
        end
        return 1
        "#,
    )
});

static REPLAY: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        -- KEYS: dead wait attempts dedup jobs
        -- ARGV: id wait_score dedup_key
        if redis.call('ZREM', KEYS[1], ARGV[1]) == 0 then
            return 0
        end
        if redis.call('HEXISTS', KEYS[5], ARGV[1]) == 0 then
            return 0
        end
        redis.call('HDEL', KEYS[3], ARGV[1])
        if ARGV[3] ~= '' then
            redis.call('HSETNX', KEYS[4], ARGV[3], ARGV[1])
        end
        redis.call('ZADD', KEYS[2], ARGV[2], ARGV[1])
        return 1
        "#,
    )
});

struct Keys {
    jobs: String,
    attempts: String,
    wait: String,
    delayed: String,
    active: String,
    dead: String,
    dedup: String,
    prio: String,
}

impl Keys {
    fn new(queue: &str) -> Self {
        let k = |suffix: &str| format!("q:{queue}:{suffix}");
        Keys {
            jobs: k("jobs"),
            attempts: k("attempts"),
            wait: k("wait"),
            delayed: k("delayed"),
            active: k("active"),
            dead: k("dead"),
            dedup: k("dedup"),
            prio: k("prio"),
        }
    }
}

pub struct RedisQueue {
    client: RedisClient,
}

impl RedisQueue {
    pub fn new(client: RedisClient) -> Self {
        RedisQueue { client }
    }
}

fn ms_after(now: DateTime<Utc>, d: Duration) -> i64 {
    now.timestamp_millis() + d.as_millis() as i64
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> EngineResult<JobHandle> {
        let job = Job::new(queue, name, payload, &opts);
        let keys = Keys::new(queue);
        let now = Utc::now();
        let ready_ms = job.delay.map(|d| ms_after(now, d)).unwrap_or(0);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (id, dedup): (String, i64) = ENQUEUE
            .key(&keys.jobs)
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.dedup)
            .key(&keys.dead)
            .key(&keys.prio)
            .arg(&job.id)
            .arg(serde_json::to_string(&job)?)
            .arg(job.dedup_key.as_deref().unwrap_or(""))
            .arg(job.wait_score(now.timestamp_millis()))
            .arg(ready_ms)
            .arg(i64::from(u8::MAX - job.priority))
            .invoke_async(&mut conn)
            .await?;
        Ok(JobHandle {
            id,
            deduplicated: dedup == 1,
        })
    }

    async fn reserve(&self, queue: &str, lease: Duration) -> EngineResult<Option<Job>> {
        let keys = Keys::new(queue);
        let now = Utc::now();
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let reserved: Option<(String, u32)> = RESERVE
            .key(&keys.jobs)
            .key(&keys.wait)
            .key(&keys.delayed)
            .key(&keys.active)
            .key(&keys.attempts)
            .key(&keys.prio)
            .arg(now.timestamp_millis())
            .arg(ms_after(now, lease))
            .invoke_async(&mut conn)
            .await?;

        match reserved {
            Some((json, attempts)) => {
                let mut job: Job = serde_json::from_str(&json)?;
                job.attempts = attempts;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    async fn complete(&self, job: &Job) -> EngineResult<()> {
        let keys = Keys::new(&job.queue);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = COMPLETE
            .key(&keys.jobs)
            .key(&keys.active)
            .key(&keys.attempts)
            .key(&keys.dedup)
            .key(&keys.prio)
            .arg(&job.id)
            .arg(job.dedup_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn retry_later(&self, job: &Job, delay: Duration, error: &str) -> EngineResult<()> {
        let keys = Keys::new(&job.queue);
        let mut stored = job.clone();
        stored.last_error = Some(error.to_owned());

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = RETRY
            .key(&keys.jobs)
            .key(&keys.active)
            .key(&keys.delayed)
            .arg(&job.id)
            .arg(serde_json::to_string(&stored)?)
            .arg(ms_after(Utc::now(), delay))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> EngineResult<()> {
        let keys = Keys::new(&job.queue);
        let now = Utc::now();
        let mut stored = job.clone();
        stored.last_error = Some(error.to_owned());
        stored.failed_at = Some(now);

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: i64 = DEAD_LETTER
            .key(&keys.jobs)
            .key(&keys.active)
            .key(&keys.dead)
            .key(&keys.dedup)
            .arg(&job.id)
            .arg(serde_json::to_string(&stored)?)
            .arg(now.timestamp_millis())
            .arg(job.dedup_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn dead_letters(&self, queue: &str) -> EngineResult<Vec<Job>> {
        let keys = Keys::new(queue);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let ids: Vec<String> = conn.zrange(&keys.dead, 0, -1).await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let raw: Vec<Option<String>> = ::redis::cmd("HMGET")
            .arg(&keys.jobs)
            .arg(&ids)
            .query_async(&mut conn)
            .await?;
        let mut out = Vec::with_capacity(raw.len());
        for json in raw.into_iter().flatten() {
            out.push(serde_json::from_str(&json)?);
        }
        Ok(out)
    }

    async fn replay_dead_letter(
        &self,
        queue: &str,
        job_id: &str,
    ) -> EngineResult<Option<JobHandle>> {
        let keys = Keys::new(queue);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let json: Option<String> = conn.hget(&keys.jobs, job_id).await?;
        let Some(json) = json else {
            return Ok(None);
        };
        let job: Job = serde_json::from_str(&json)?;

        let replayed: i64 = REPLAY
            .key(&keys.dead)
            .key(&keys.wait)
            .key(&keys.attempts)
            .key(&keys.dedup)
            .key(&keys.jobs)
            .arg(job_id)
            .arg(job.wait_score(Utc::now().timestamp_millis()))
            .arg(job.dedup_key.as_deref().unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok((replayed == 1).then(|| JobHandle {
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
        let slot_key = format!("q:{queue}:repeat:{name}:{}", repeat_slot(every, now));
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let claimed: Option<String> = ::redis::cmd("SET")
            .arg(&slot_key)
            .arg(1)
            .arg("NX")
            .arg("PX")
            .arg((every.as_millis() as u64).saturating_mul(2).max(1))
            .query_async(&mut conn)
            .await?;
        if claimed.is_none() {
            return Ok(None);
        }
        let opts = JobOptions::dedup(format!("repeat-{name}"));
        self.enqueue(queue, name, payload, opts).await.map(Some)
    }

    async fn counts(&self, queue: &str) -> EngineResult<QueueCounts> {
        let keys = Keys::new(queue);
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (waiting, delayed, active, dead): (usize, usize, usize, usize) = ::redis::pipe()
            .zcard(&keys.wait)
            .zcard(&keys.delayed)
            .zcard(&keys.active)
            .zcard(&keys.dead)
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            dead,
        })
    }
}
