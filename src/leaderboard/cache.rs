//! Bounded top-N view of a leaderboard.
//
//  Redis keys
//  ----------
//  lb:<leaderboard_id>:rank   – ZSET  member = <user_id>, score = composite
//  lb:<leaderboard_id>:fields – HASH  <user_id> → RankedEntry (JSON)
//
//  Both keys carry the same TTL. A missing key is a cold cache.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{AsyncCommands, Client as RedisClient};
use uuid::Uuid;

use super::ranking;
use crate::db::models::RankedEntry;
use crate::error::{EngineError, EngineResult};

#[async_trait]
pub trait RankingCache: Send + Sync {
    /// Replace the cached view with `entries`, already in rank order.
    async fn store_top(
        &self,
        leaderboard_id: Uuid,
        entries: &[RankedEntry],
        ttl: Duration,
    ) -> EngineResult<()>;

    /// Zero-based inclusive range. `None` on a cold cache.
    async fn range(
        &self,
        leaderboard_id: Uuid,
        start: usize,
        end: usize,
    ) -> EngineResult<Option<Vec<RankedEntry>>>;

    async fn invalidate(&self, leaderboard_id: Uuid) -> EngineResult<()>;
}

fn rank_key(id: Uuid) -> String {
    format!("lb:{id}:rank")
}

fn fields_key(id: Uuid) -> String {
    format!("lb:{id}:fields")
}

pub struct RedisRankingCache {
    client: RedisClient,
}

impl RedisRankingCache {
    pub fn new(client: RedisClient) -> Self {
        RedisRankingCache { client }
    }
}

#[async_trait]
impl RankingCache for RedisRankingCache {
    async fn store_top(
        &self,
        leaderboard_id: Uuid,
        entries: &[RankedEntry],
        ttl: Duration,
    ) -> EngineResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let (rank, fields) = (rank_key(leaderboard_id), fields_key(leaderboard_id));
        let ttl_secs = ttl.as_secs().max(1) as i64;

        let mut pipe = redis::pipe();
        pipe.atomic().del(&rank).ignore().del(&fields).ignore();
        for e in entries {
            let member = e.user_id.to_string();
            let composite = ranking::composite_score(e.score, e.win_rate, e.matches_played);
            pipe.zadd(&rank, &member, composite)
                .ignore()
                .hset(&fields, &member, serde_json::to_string(e)?)
                .ignore();
        }
        if !entries.is_empty() {
            pipe.expire(&rank, ttl_secs)
                .ignore()
                .expire(&fields, ttl_secs)
                .ignore();
        }
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn range(
        &self,
        leaderboard_id: Uuid,
        start: usize,
        end: usize,
    ) -> EngineResult<Option<Vec<RankedEntry>>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let rank = rank_key(leaderboard_id);
        let exists: bool = conn.exists(&rank).await?;
        if !exists {
            return Ok(None);
        }

        let members: Vec<String> = conn.zrevrange(&rank, start as isize, end as isize).await?;
        if members.is_empty() {
            return Ok(Some(Vec::new()));
        }
        let raw: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(fields_key(leaderboard_id))
            .arg(&members)
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(raw.len());
        for (i, json) in raw.into_iter().enumerate() {
            // Fields expired underneath the ZSET: treat as cold.
            let Some(json) = json else {
                return Ok(None);
            };
            let mut entry: RankedEntry = serde_json::from_str(&json)?;
            entry.rank = (start + i + 1) as i64;
            out.push(entry);
        }
        Ok(Some(out))
    }

    async fn invalidate(&self, leaderboard_id: Uuid) -> EngineResult<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: () = conn
            .del(vec![rank_key(leaderboard_id), fields_key(leaderboard_id)])
            .await?;
        Ok(())
    }
}

/// Process-local cache with TTL expiry and a switch to simulate an outage.
#[derive(Default)]
pub struct MemoryRankingCache {
    views: DashMap<Uuid, (Vec<RankedEntry>, Instant)>,
    unavailable: AtomicBool,
}

impl MemoryRankingCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }

    pub fn is_warm(&self, leaderboard_id: Uuid) -> bool {
        self.views
            .get(&leaderboard_id)
            .is_some_and(|v| v.1 > Instant::now())
    }

    fn check(&self) -> EngineResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::unexpected("ranking cache unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl RankingCache for MemoryRankingCache {
    async fn store_top(
        &self,
        leaderboard_id: Uuid,
        entries: &[RankedEntry],
        ttl: Duration,
    ) -> EngineResult<()> {
        self.check()?;
        self.views
            .insert(leaderboard_id, (entries.to_vec(), Instant::now() + ttl));
        Ok(())
    }

    async fn range(
        &self,
        leaderboard_id: Uuid,
        start: usize,
        end: usize,
    ) -> EngineResult<Option<Vec<RankedEntry>>> {
        self.check()?;
        let Some(view) = self.views.get(&leaderboard_id) else {
            return Ok(None);
        };
        if view.1 <= Instant::now() {
            return Ok(None);
        }
        Ok(Some(
            view.0
                .iter()
                .skip(start)
                .take(end.saturating_sub(start) + 1)
                .cloned()
                .collect(),
        ))
    }

    async fn invalidate(&self, leaderboard_id: Uuid) -> EngineResult<()> {
        self.check()?;
        self.views.remove(&leaderboard_id);
        Ok(())
    }
}
