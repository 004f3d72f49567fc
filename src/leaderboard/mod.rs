//! Leaderboard reads, cache rebuilds and the weekly period rollover.
//!
//! Reads inside the top-N bound are served from [`RankingCache`]; anything
//! else (cold cache, range past the bound, cache outage) goes to the live
//! ranked query. Both paths order entries with [`ranking::compare`].

pub mod cache;
pub mod ranking;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::models::{Leaderboard, LeaderboardKind, RankedEntry};
use crate::db::store::Store;
use crate::error::{EngineError, EngineResult};
use crate::lock::{with_lock, DistributedLock};
use crate::queue::{jobs, Job, JobProcessor};
use crate::season::rank::utc_day_start;

pub use cache::{MemoryRankingCache, RankingCache, RedisRankingCache};

const WEEKLY_RESET_LOCK: &str = "lock:leaderboard:weekly-reset";
const WEEKLY_RESET_TTL: Duration = Duration::from_secs(60);

/// Monday 00:00 UTC of the ISO week containing `now`, and the Monday after.
pub fn week_bounds(now: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
    let back = i64::from(now.weekday().num_days_from_monday());
    let start = utc_day_start(now) - chrono::Duration::days(back);
    (start, start + chrono::Duration::days(7))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageSource {
    Cache,
    Live,
}

#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub leaderboard_id: Uuid,
    pub source: PageSource,
    pub start: usize,
    pub entries: Vec<RankedEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebuildLeaderboard {
    pub leaderboard_id: Uuid,
}

pub struct LeaderboardService {
    store: Arc<dyn Store>,
    cache: Arc<dyn RankingCache>,
    lock: Arc<dyn DistributedLock>,
    settings: Settings,
}

impl LeaderboardService {
    pub fn new(
        store: Arc<dyn Store>,
        cache: Arc<dyn RankingCache>,
        lock: Arc<dyn DistributedLock>,
        settings: Settings,
    ) -> Self {
        LeaderboardService {
            store,
            cache,
            lock,
            settings,
        }
    }

    async fn board(&self, leaderboard_id: Uuid) -> EngineResult<Leaderboard> {
        self.store
            .get_leaderboard(leaderboard_id)
            .await?
            .ok_or_else(|| EngineError::not_found("leaderboard", leaderboard_id))
    }

    /// Replace the cached top-N with a fresh read of the committed entries.
    pub async fn rebuild(&self, leaderboard_id: Uuid) -> EngineResult<usize> {
        self.board(leaderboard_id).await?;
        let top = self
            .store
            .ranked_entries(leaderboard_id, 0, self.settings.leaderboard_top_n as i64)
            .await?;
        self.cache
            .store_top(leaderboard_id, &top, self.settings.leaderboard_cache_ttl)
            .await?;
        log::debug!("leaderboard {leaderboard_id} cache rebuilt ({} rows)", top.len());
        Ok(top.len())
    }

    /// Cached slice `[start, end]`. `None` when the cache is cold or the
    /// range leaves the top-N bound.
    pub async fn get_top_n(
        &self,
        leaderboard_id: Uuid,
        start: usize,
        end: usize,
    ) -> EngineResult<Option<Vec<RankedEntry>>> {
        if start > end || end >= self.settings.leaderboard_top_n {
            return Ok(None);
        }
        self.cache.range(leaderboard_id, start, end).await
    }

    /// Ranked page `[start, end]`, from the cache when possible.
    pub async fn page(&self, leaderboard_id: Uuid, start: usize, end: usize) -> EngineResult<Page> {
        self.board(leaderboard_id).await?;
        let end = end.max(start);

        match self.get_top_n(leaderboard_id, start, end).await {
            Ok(Some(entries)) => {
                return Ok(Page {
                    leaderboard_id,
                    source: PageSource::Cache,
                    start,
                    entries,
                })
            }
            Ok(None) => {}
            Err(e) => log::warn!("leaderboard cache read failed, using live query: {e}"),
        }

        let entries = self
            .store
            .ranked_entries(leaderboard_id, start as i64, (end - start + 1) as i64)
            .await?;
        Ok(Page {
            leaderboard_id,
            source: PageSource::Live,
            start,
            entries,
        })
    }

    /// Roll the weekly board over once its period has ended. Returns the new
    /// board, or `None` when nothing was due or another worker holds the lock.
    pub async fn weekly_reset(&self, now: DateTime<Utc>) -> EngineResult<Option<Leaderboard>> {
        let rotated = with_lock(&*self.lock, WEEKLY_RESET_LOCK, WEEKLY_RESET_TTL, || {
            self.rotate_if_due(now)
        })
        .await?;
        Ok(rotated.flatten())
    }

    async fn rotate_if_due(&self, now: DateTime<Utc>) -> EngineResult<Option<Leaderboard>> {
        let boards = self.store.current_leaderboards(now).await?;
        let Some(weekly) = boards.iter().find(|b| b.kind == LeaderboardKind::Weekly) else {
            return Ok(None);
        };
        if weekly.period_end.is_some_and(|end| end > now) {
            return Ok(None);
        }
        let global = boards
            .iter()
            .find(|b| b.kind == LeaderboardKind::Global)
            .map(|b| b.id);

        let (start, end) = week_bounds(now);
        let next = self.store.rotate_weekly(weekly.id, global, start, end).await?;
        if let Err(e) = self.cache.invalidate(weekly.id).await {
            log::warn!("could not invalidate leaderboard {} cache: {e}", weekly.id);
        }
        log::info!("weekly leaderboard rolled over to {} ({start})", next.id);
        Ok(Some(next))
    }
}

#[async_trait]
impl JobProcessor for LeaderboardService {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        match job.name.as_str() {
            jobs::REBUILD => {
                let p: RebuildLeaderboard = job.payload()?;
                self.rebuild(p.leaderboard_id).await.map(|_| ())
            }
            jobs::WEEKLY_RESET => self.weekly_reset(Utc::now()).await.map(|_| ()),
            other => Err(EngineError::not_found("leaderboard job", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    #[test]
    fn weeks_start_on_monday_midnight() {
        let thu = Utc.with_ymd_and_hms(2025, 3, 13, 15, 0, 0).unwrap();
        let (start, end) = week_bounds(thu);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap());
        assert_eq!(start.weekday(), Weekday::Mon);
        assert_eq!(end - start, chrono::Duration::days(7));

        let (again, _) = week_bounds(start);
        assert_eq!(again, start);
    }
}
