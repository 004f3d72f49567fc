//! Applies a settled match to season and leaderboard standings.
//!
//! Each participant's update is keyed `standings-{match}-{user}`, so a
//! replayed job changes nothing. Cache rebuilds are queued afterwards and
//! never block the update.

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::models::SeasonStatus;
use crate::db::store::{StandingsUpdate, Store};
use crate::error::{retry_on_conflict, EngineError, EngineResult};
use crate::idempotency::{self, dedup};
use crate::leaderboard::RebuildLeaderboard;
use crate::queue::{self, jobs, Job, JobOptions, JobProcessor, JobQueue};
use crate::settlement::SettlementResult;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StandingsReport {
    /// Participants whose rows changed (0 on a replay).
    pub applied: usize,
    pub leaderboards: Vec<Uuid>,
}

pub struct StandingsProcessor {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
}

impl StandingsProcessor {
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn JobQueue>) -> Self {
        StandingsProcessor { store, queue }
    }

    pub async fn apply(&self, result: &SettlementResult) -> EngineResult<StandingsReport> {
        let season_id = self
            .store
            .seasons_by_status(SeasonStatus::Active)
            .await?
            .first()
            .map(|s| s.id);
        let boards = self.store.current_leaderboards(result.settled_at).await?;
        let leaderboard_ids: Vec<Uuid> = boards.iter().map(|b| b.id).collect();

        let mut report = StandingsReport {
            applied: 0,
            leaderboards: leaderboard_ids.clone(),
        };
        for user_id in result.participants() {
            let outcome = result.outcome_for(user_id).ok_or_else(|| {
                EngineError::unexpected(format!("{user_id} is not in match {}", result.match_id))
            })?;
            let update = StandingsUpdate {
                idempotency_key: idempotency::standings_key(result.match_id, user_id),
                user_id,
                match_id: result.match_id,
                outcome,
                played_at: result.settled_at,
                season_id,
                leaderboard_ids: leaderboard_ids.clone(),
            };
            if retry_on_conflict(|| self.store.apply_standings(&update)).await? {
                report.applied += 1;
            } else {
                log::debug!("standings for {user_id} in match {} already applied", result.match_id);
            }
        }

        for id in &leaderboard_ids {
            queue::enqueue_best_effort(
                &*self.queue,
                queue::LEADERBOARD,
                jobs::REBUILD,
                &RebuildLeaderboard { leaderboard_id: *id },
                JobOptions::dedup(dedup::rebuild(*id)),
            )
            .await;
        }
        Ok(report)
    }
}

#[async_trait]
impl JobProcessor for StandingsProcessor {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        match job.name.as_str() {
            jobs::UPDATE_STANDINGS => {
                let result: SettlementResult = job.payload()?;
                self.apply(&result).await.map(|_| ())
            }
            other => Err(EngineError::not_found("standings job", other)),
        }
    }
}
