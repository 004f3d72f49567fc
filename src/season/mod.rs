//! Season lifecycle jobs.
//!
//! `daily-decay`, `end-season`, `finalize-rankings` and `distribute-rewards`
//! each run under a lock scoped to the season and stage. A held lock means
//! another worker owns the stage, so the job completes without doing work.

pub mod rank;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::models::{RankTier, Season, SeasonStatus};
use crate::db::store::Store;
use crate::error::{EngineError, EngineResult};
use crate::idempotency::dedup;
use crate::lock::{with_lock, DistributedLock};
use crate::notify::{self, EventSink};
use crate::protocol::OutboundEvent;
use crate::queue::{self, jobs, Job, JobOptions, JobProcessor, JobQueue};

pub fn lock_key(season_id: Uuid, stage: &str) -> String {
    format!("lock:season:{season_id}:{stage}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeasonJob {
    pub season_id: Uuid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecayReport {
    pub decayed: usize,
    /// Entries that moved underneath the decay write.
    pub conflicts: usize,
    /// Seasons skipped because another worker held the lock.
    pub locked_out: usize,
}

pub struct SeasonProgression {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    lock: Arc<dyn DistributedLock>,
    sink: Arc<dyn EventSink>,
    settings: Settings,
}

impl SeasonProgression {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        lock: Arc<dyn DistributedLock>,
        sink: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        SeasonProgression {
            store,
            queue,
            lock,
            sink,
            settings,
        }
    }

    async fn season(&self, id: Uuid) -> EngineResult<Season> {
        self.store
            .get_season(id)
            .await?
            .ok_or_else(|| EngineError::not_found("season", id))
    }

    fn ttl(&self) -> Duration {
        self.settings.season_lock_ttl
    }

    // ---- daily decay -----------------------------------------------------

    pub async fn daily_decay(&self, now: DateTime<Utc>) -> EngineResult<DecayReport> {
        let mut report = DecayReport::default();
        for season in self.store.seasons_by_status(SeasonStatus::Active).await? {
            let id = season.id;
            let key = lock_key(id, "daily-decay");
            match with_lock(&*self.lock, &key, self.ttl(), move || self.decay_season(id, now))
                .await?
            {
                Some((decayed, conflicts)) => {
                    report.decayed += decayed;
                    report.conflicts += conflicts;
                }
                None => report.locked_out += 1,
            }
        }
        if report.decayed > 0 || report.conflicts > 0 {
            log::info!(
                "daily decay: {} entries decayed, {} skipped on conflict",
                report.decayed,
                report.conflicts
            );
        }
        Ok(report)
    }

    async fn decay_season(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<(usize, usize)> {
        let days = self.settings.decay_inactive_days;
        let inactive_before = now - chrono::Duration::days(days);
        let candidates = self
            .store
            .decay_candidates(season_id, inactive_before, rank::utc_day_start(now))
            .await?;

        let (mut decayed, mut conflicts) = (0, 0);
        for entry in candidates {
            if !rank::is_decay_due(&entry, now, days) {
                continue;
            }
            let points = rank::apply_delta(entry.rank_points, -self.settings.decay_points);
            let tier = RankTier::for_points(points);
            if self
                .store
                .apply_decay(entry.id, entry.version, points, tier, now)
                .await?
            {
                decayed += 1;
            } else {
                log::debug!("decay skipped for entry {}: version moved", entry.id);
                conflicts += 1;
            }
        }
        Ok((decayed, conflicts))
    }

    // ---- season end ------------------------------------------------------

    /// Queue `end-season` for every active season past its end date. When no
    /// season is active, open the earliest upcoming season that has started.
    pub async fn season_end_check(&self, now: DateTime<Utc>) -> EngineResult<usize> {
        let active = self.store.seasons_by_status(SeasonStatus::Active).await?;
        let mut queued = 0;
        for season in active.iter().filter(|s| s.ends_at <= now) {
            queue::enqueue_json(
                &*self.queue,
                queue::SEASON,
                jobs::END_SEASON,
                &SeasonJob {
                    season_id: season.id,
                },
                JobOptions::dedup(dedup::end_season(season.id)),
            )
            .await?;
            queued += 1;
        }

        let still_running = active.iter().any(|s| s.ends_at > now);
        if !still_running {
            let upcoming = self.store.seasons_by_status(SeasonStatus::Upcoming).await?;
            if let Some(next) = upcoming.iter().find(|s| s.starts_at <= now) {
                let id = next.id;
                let key = lock_key(id, "activate");
                let activated = with_lock(&*self.lock, &key, self.ttl(), move || {
                    self.store.activate_season(id, now)
                })
                .await?;
                if activated == Some(true) {
                    log::info!("season {} ({}) is now active", next.name, id);
                }
            }
        }
        Ok(queued)
    }

    /// `ACTIVE → ENDED`, then `finalize-rankings` after the grace period.
    pub async fn end_season(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let key = lock_key(season_id, "end");
        with_lock(&*self.lock, &key, self.ttl(), move || self.end_season_locked(season_id, now))
            .await
            .map(|_| ())
    }

    async fn end_season_locked(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let grace = self.settings.season_grace;
        if self.store.end_season(season_id, now).await? {
            log::info!("season {season_id} ended, finalizing in {grace:?}");
            return self.schedule_finalize(season_id, grace).await;
        }

        // Already ended by an earlier run: make sure finalization is queued.
        let season = self.season(season_id).await?;
        if season.status == SeasonStatus::Ended && season.finalized_at.is_none() {
            let ended_at = season.ended_at.unwrap_or(now);
            let elapsed = (now - ended_at).to_std().unwrap_or_default();
            self.schedule_finalize(season_id, grace.saturating_sub(elapsed))
                .await?;
        }
        Ok(())
    }

    async fn schedule_finalize(&self, season_id: Uuid, delay: Duration) -> EngineResult<()> {
        queue::enqueue_json(
            &*self.queue,
            queue::SEASON,
            jobs::FINALIZE_RANKINGS,
            &SeasonJob { season_id },
            JobOptions::dedup(dedup::finalize(season_id)).delayed(delay),
        )
        .await
        .map(|_| ())
    }

    // ---- finalize & rewards ----------------------------------------------

    pub async fn finalize_rankings(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let key = lock_key(season_id, "finalize");
        with_lock(&*self.lock, &key, self.ttl(), move || {
            self.finalize_locked(season_id, now)
        })
        .await
        .map(|_| ())
    }

    async fn finalize_locked(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        match self.store.finalize_season(season_id, now).await? {
            Some(n) => log::info!("season {season_id} finalized: {n} entries ranked"),
            None => {
                let season = self.season(season_id).await?;
                if season.rewards_distributed_at.is_some() {
                    return Ok(());
                }
            }
        }
        queue::enqueue_json(
            &*self.queue,
            queue::SEASON,
            jobs::DISTRIBUTE_REWARDS,
            &SeasonJob { season_id },
            JobOptions::dedup(dedup::rewards(season_id)),
        )
        .await
        .map(|_| ())
    }

    pub async fn distribute_rewards(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let key = lock_key(season_id, "rewards");
        with_lock(&*self.lock, &key, self.ttl(), move || {
            self.distribute_locked(season_id, now)
        })
        .await
        .map(|_| ())
    }

    async fn distribute_locked(&self, season_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let Some(paid) = self
            .store
            .distribute_rewards(season_id, rank::reward_for, now)
            .await?
        else {
            log::debug!("season {season_id} rewards already distributed");
            return Ok(());
        };

        let total: i64 = paid.iter().map(|(_, amount)| amount).sum();
        log::info!(
            "season {season_id}: {} rewards credited, {} total",
            paid.len(),
            total
        );
        for (user_id, amount) in paid {
            notify::emit(
                self.sink.clone(),
                user_id,
                OutboundEvent::SeasonReward { season_id, amount },
            );
        }
        Ok(())
    }
}

#[async_trait]
impl JobProcessor for SeasonProgression {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        let now = Utc::now();
        match job.name.as_str() {
            jobs::DAILY_DECAY => self.daily_decay(now).await.map(|_| ()),
            jobs::SEASON_END_CHECK => self.season_end_check(now).await.map(|_| ()),
            jobs::END_SEASON => {
                let p: SeasonJob = job.payload()?;
                self.end_season(p.season_id, now).await
            }
            jobs::FINALIZE_RANKINGS => {
                let p: SeasonJob = job.payload()?;
                self.finalize_rankings(p.season_id, now).await
            }
            jobs::DISTRIBUTE_REWARDS => {
                let p: SeasonJob = job.payload()?;
                self.distribute_rewards(p.season_id, now).await
            }
            other => Err(EngineError::not_found("season job", other)),
        }
    }
}
