//! Periodic job that pairs waiting slips and notifies both players.
//
//  Runs on the `matchmaking` queue at concurrency 1, so at most one process
//  claims entries at a time. Claims expire on their own; a crashed run leaves
//  nothing to sweep.

pub mod pairing;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Settings;
use crate::db::models::MatchmakingQueueEntry;
use crate::db::store::Store;
use crate::error::{EngineError, EngineResult};
use crate::notify::{self, EventSink};
use crate::protocol::OutboundEvent;
use crate::queue::{jobs, Job, JobProcessor};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MatchmakingReport {
    pub claimed: usize,
    pub paired: usize,
    /// Pairs abandoned because a claim was lost to another worker.
    pub lost: usize,
    pub released: usize,
}

pub struct MatchmakingProcessor {
    store: Arc<dyn Store>,
    sink: Arc<dyn EventSink>,
    settings: Settings,
    worker_id: String,
}

impl MatchmakingProcessor {
    pub fn new(store: Arc<dyn Store>, sink: Arc<dyn EventSink>, settings: Settings) -> Self {
        MatchmakingProcessor {
            store,
            sink,
            settings,
            worker_id: format!("mm-{}", Uuid::new_v4()),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// One pass: claim a batch, pair compatible entries, release the rest.
    pub async fn run_once(&self, now: DateTime<Utc>) -> EngineResult<MatchmakingReport> {
        let claim_until = now
            + chrono::Duration::from_std(self.settings.matchmaking_claim_ttl)
                .map_err(EngineError::unexpected)?;
        let claimed = self
            .store
            .claim_queue_entries(&self.worker_id, now, claim_until, self.settings.matchmaking_batch)
            .await?;
        let mut report = MatchmakingReport {
            claimed: claimed.len(),
            ..Default::default()
        };
        if claimed.is_empty() {
            return Ok(report);
        }

        let (pairs, leftovers) =
            pairing::pair_entries(claimed, self.settings.matchmaking_skill_band);

        for pair in pairs {
            match self
                .store
                .create_match_from_pair(&pair.creator, &pair.opponent, &self.worker_id, now)
                .await
            {
                Ok(m) => {
                    report.paired += 1;
                    log::info!(
                        "paired {} vs {} for {} (match {})",
                        m.creator_id,
                        m.opponent_id,
                        m.stake_amount,
                        m.id
                    );
                    for (user, opponent) in [(m.creator_id, m.opponent_id), (m.opponent_id, m.creator_id)] {
                        notify::emit(
                            self.sink.clone(),
                            user,
                            OutboundEvent::MatchCreated {
                                match_id: m.id,
                                opponent_id: opponent,
                                stake_amount: m.stake_amount,
                            },
                        );
                    }
                }
                Err(e) => {
                    if e.is_conflict() {
                        report.lost += 1;
                        log::info!("claim lost while pairing: {e}");
                    } else {
                        log::warn!(
                            "could not pair {} with {}: {e}",
                            pair.creator.id,
                            pair.opponent.id
                        );
                    }
                    report.released += self.release(&[pair.creator, pair.opponent]).await;
                }
            }
        }

        report.released += self.release(&leftovers).await;
        Ok(report)
    }

    /// Release whatever claims this worker still holds. Returns how many.
    async fn release(&self, entries: &[MatchmakingQueueEntry]) -> usize {
        let mut released = 0;
        for e in entries {
            match self.store.release_claim(e.id, &self.worker_id).await {
                Ok(true) => released += 1,
                Ok(false) => {}
                Err(err) => log::warn!("releasing claim on {} failed: {err}", e.id),
            }
        }
        released
    }
}

#[async_trait]
impl JobProcessor for MatchmakingProcessor {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        match job.name.as_str() {
            jobs::MATCHMAKING_RUN => {
                let report = self.run_once(Utc::now()).await?;
                if report.paired > 0 || report.lost > 0 {
                    log::debug!("matchmaking run: {report:?}");
                }
                Ok(())
            }
            other => Err(EngineError::not_found("matchmaking job", other)),
        }
    }
}
