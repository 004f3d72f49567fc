//! Job-level glue around [`SettlementService`]: score-feed ingestion,
//! settlement checks, settle/void jobs, the postponement scan and the
//! fan-out that follows a committed settlement.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::service::{
    NotReadyReason, SettleOutcome, SettlementResult, SettlementService, VoidOutcome, VoidResult,
};
use crate::config::Settings;
use crate::db::models::{EventUpdate, MatchStatus};
use crate::db::store::Store;
use crate::error::{retry_on_conflict, EngineError, EngineResult};
use crate::idempotency::{dedup, TtlSet};
use crate::notify::{self, EventSink};
use crate::protocol::OutboundEvent;
use crate::queue::{self, jobs, Job, JobHandle, JobOptions, JobProcessor, JobQueue};

pub const REASON_CANCELLED: &str = "events_cancelled";
pub const REASON_POSTPONED: &str = "postponement_timeout";
pub const REASON_ADMIN: &str = "admin";

/// Matches examined per postponement scan.
const SCAN_LIMIT: i64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSettlement {
    pub match_id: Uuid,
    #[serde(default)]
    pub event_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleMatch {
    pub match_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoidMatch {
    pub match_id: Uuid,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    /// Same update seen inside the dedup window.
    Duplicate,
    Applied { event_id: Uuid, checks: usize },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub examined: usize,
    pub rechecked: usize,
    pub voided: usize,
}

pub struct SettlementOrchestrator {
    store: Arc<dyn Store>,
    queue: Arc<dyn JobQueue>,
    service: Arc<SettlementService>,
    sink: Arc<dyn EventSink>,
    live_dedup: TtlSet,
    settings: Settings,
}

impl SettlementOrchestrator {
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn JobQueue>,
        service: Arc<SettlementService>,
        sink: Arc<dyn EventSink>,
        settings: Settings,
    ) -> Self {
        SettlementOrchestrator {
            store,
            queue,
            service,
            sink,
            live_dedup: TtlSet::new(settings.live_score_dedup),
            settings,
        }
    }

    /// Score-feed entry point. Upserts the event and queues a settlement
    /// check for every open match that references it.
    ///
    /// The dedup key is released again when the update fails to apply, so a
    /// resend inside the window is not dropped.
    pub async fn ingest_event(
        &self,
        update: &EventUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<Ingested> {
        let key = feed_key(update);
        if !self.live_dedup.insert(&key) {
            log::debug!("dropping duplicate feed update {key}");
            return Ok(Ingested::Duplicate);
        }

        match self.apply_update(update, now).await {
            Ok(applied) => Ok(applied),
            Err(e) => {
                self.live_dedup.remove(&key);
                Err(e)
            }
        }
    }

    async fn apply_update(
        &self,
        update: &EventUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<Ingested> {
        let event = self.store.upsert_event(update, now).await?;
        let matches = self.store.open_matches_for_event(event.id).await?;
        for match_id in &matches {
            queue::enqueue_json(
                &*self.queue,
                queue::SETTLEMENT,
                jobs::CHECK_SETTLEMENT,
                &CheckSettlement {
                    match_id: *match_id,
                    event_id: Some(event.id),
                },
                JobOptions::dedup(dedup::check(*match_id, event.id)),
            )
            .await?;
        }
        Ok(Ingested::Applied {
            event_id: event.id,
            checks: matches.len(),
        })
    }

    /// Activate a locked match once play has started and queue the settle
    /// job when every referenced event is resolved.
    pub async fn check(&self, match_id: Uuid, now: DateTime<Utc>) -> EngineResult<()> {
        let snap = self.service.snapshot_by_id(match_id).await?;
        if snap.m.status.is_terminal() {
            return Ok(());
        }

        if snap.all_cancelled() {
            self.enqueue_void(match_id, REASON_CANCELLED).await?;
            return Ok(());
        }

        if snap.m.status == MatchStatus::Locked {
            if !snap.any_started() {
                return Ok(());
            }
            retry_on_conflict(|| self.service.activate(match_id, now)).await?;
        }

        if snap.all_resolved() {
            queue::enqueue_json(
                &*self.queue,
                queue::SETTLEMENT,
                jobs::SETTLE_MATCH,
                &SettleMatch { match_id },
                JobOptions::dedup(dedup::settle(match_id)),
            )
            .await?;
        }
        Ok(())
    }

    /// Settle through the service, retrying version conflicts locally, and
    /// fan out on success.
    pub async fn settle(&self, match_id: Uuid) -> EngineResult<SettleOutcome> {
        let outcome = retry_on_conflict(|| self.service.settle(match_id, Utc::now())).await?;
        match &outcome {
            SettleOutcome::Settled(result) => self.fan_out(result).await,
            SettleOutcome::AlreadyFinal(status) => {
                log::debug!("match {match_id} already {status}")
            }
            SettleOutcome::NotReady(NotReadyReason::AllCancelled) => {
                self.enqueue_void(match_id, REASON_CANCELLED).await?;
            }
            SettleOutcome::NotReady(reason) => {
                log::info!("match {match_id} not ready to settle: {reason:?}")
            }
        }
        Ok(outcome)
    }

    pub async fn void(&self, match_id: Uuid, reason: &str) -> EngineResult<VoidOutcome> {
        let outcome =
            retry_on_conflict(|| self.service.void(match_id, reason, Utc::now())).await?;
        if let VoidOutcome::Voided(v) = &outcome {
            self.announce_void(v);
        }
        Ok(outcome)
    }

    /// Deal with matches stuck `active` past the postponement timeout.
    pub async fn postponement_scan(&self, now: DateTime<Utc>) -> EngineResult<ScanReport> {
        let cutoff = now - self.settings.postponement_timeout;
        let stale = self.store.stale_active_matches(cutoff, SCAN_LIMIT).await?;
        let mut report = ScanReport {
            examined: stale.len(),
            ..Default::default()
        };

        for m in stale {
            let match_id = m.id;
            let snap = match self.service.snapshot(m).await {
                Ok(s) => s,
                Err(e) => {
                    log::warn!("postponement scan skipped match {match_id}: {e}");
                    continue;
                }
            };
            let queued = if snap.all_resolved() || snap.resolvable() {
                report.rechecked += 1;
                queue::enqueue_json(
                    &*self.queue,
                    queue::SETTLEMENT,
                    jobs::CHECK_SETTLEMENT,
                    &CheckSettlement {
                        match_id,
                        event_id: None,
                    },
                    JobOptions::dedup(dedup::check_match(match_id)),
                )
                .await
            } else {
                report.voided += 1;
                self.enqueue_void(match_id, REASON_POSTPONED).await
            };
            if let Err(e) = queued {
                log::warn!("postponement scan could not queue work for {match_id}: {e}");
            }
        }

        if report.examined > 0 {
            log::info!(
                "postponement scan: {} stale, {} re-checked, {} voided",
                report.examined,
                report.rechecked,
                report.voided
            );
        }
        Ok(report)
    }

    // ---- admin entry points ----------------------------------------------

    pub async fn force_settle(&self, match_id: Uuid) -> EngineResult<SettleOutcome> {
        log::info!("admin settle requested for match {match_id}");
        self.settle(match_id).await
    }

    pub async fn force_void(&self, match_id: Uuid, reason: Option<&str>) -> EngineResult<VoidOutcome> {
        log::info!("admin void requested for match {match_id}");
        self.void(match_id, reason.unwrap_or(REASON_ADMIN)).await
    }

    /// Queue a fresh settlement check for `match_id`.
    pub async fn retry(&self, match_id: Uuid) -> EngineResult<JobHandle> {
        if self.store.get_match(match_id).await?.is_none() {
            return Err(EngineError::match_not_found(match_id));
        }
        queue::enqueue_json(
            &*self.queue,
            queue::SETTLEMENT,
            jobs::CHECK_SETTLEMENT,
            &CheckSettlement {
                match_id,
                event_id: None,
            },
            JobOptions::dedup(dedup::check_match(match_id)),
        )
        .await
    }

    // ---- fan-out ---------------------------------------------------------

    async fn enqueue_void(&self, match_id: Uuid, reason: &str) -> EngineResult<JobHandle> {
        queue::enqueue_json(
            &*self.queue,
            queue::SETTLEMENT,
            jobs::VOID_MATCH,
            &VoidMatch {
                match_id,
                reason: reason.to_owned(),
            },
            JobOptions::dedup(dedup::void(match_id)),
        )
        .await
    }

    /// Notifications and the standings job. Never fails the settlement.
    async fn fan_out(&self, result: &SettlementResult) {
        for user_id in result.participants() {
            notify::emit(
                self.sink.clone(),
                user_id,
                OutboundEvent::MatchSettled(result.clone()),
            );
        }
        queue::enqueue_best_effort(
            &*self.queue,
            queue::STANDINGS,
            jobs::UPDATE_STANDINGS,
            result,
            JobOptions::dedup(dedup::standings(result.match_id)),
        )
        .await;
    }

    fn announce_void(&self, v: &VoidResult) {
        for user_id in [v.creator_id, v.opponent_id] {
            notify::emit(
                self.sink.clone(),
                user_id,
                OutboundEvent::MatchVoided {
                    match_id: v.match_id,
                    reason: v.reason.clone(),
                },
            );
        }
    }
}

/// Live-score dedup key; covers every field the upsert can change.
fn feed_key(update: &EventUpdate) -> String {
    let score = |s: Option<i32>| s.map_or_else(|| "-".to_owned(), |s| s.to_string());
    format!(
        "{}:{}:{}-{}:{}:{}",
        update.external_event_id,
        update.status,
        score(update.home_score),
        score(update.away_score),
        update.starts_at.timestamp(),
        update
            .rescheduled_to
            .map_or_else(|| "-".to_owned(), |t| t.timestamp().to_string()),
    )
}

#[async_trait]
impl JobProcessor for SettlementOrchestrator {
    async fn process(&self, job: &Job) -> EngineResult<()> {
        match job.name.as_str() {
            jobs::CHECK_SETTLEMENT => {
                let p: CheckSettlement = job.payload()?;
                self.check(p.match_id, Utc::now()).await
            }
            jobs::SETTLE_MATCH => {
                let p: SettleMatch = job.payload()?;
                self.settle(p.match_id).await.map(|_| ())
            }
            jobs::VOID_MATCH => {
                let p: VoidMatch = job.payload()?;
                self.void(p.match_id, &p.reason).await.map(|_| ())
            }
            jobs::POSTPONEMENT_SCAN => self.postponement_scan(Utc::now()).await.map(|_| ()),
            other => Err(EngineError::not_found("settlement job", other)),
        }
    }
}
