//! Match state machine and the atomic financial commit.
//!
//! ```text
//! locked --(first event starts)--> active
//! active --(all resolved, one side ahead)--> settled
//! active --(all resolved, level)--> draw
//! locked|active --(cancelled, postponement timeout, admin)--> voided
//! ```
//!
//! Expected non-success outcomes come back as [`SettleOutcome`] /
//! [`VoidOutcome`] values. Only conflicts, missing rows and genuinely
//! unexpected failures are returned as errors.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::picks::PicksEvaluator;
use crate::db::models::{EventStatus, Match, MatchStatus, Pick, SportEvent, TransactionType};
use crate::db::store::{MatchOutcome, SettlementCommit, Store, WalletCredit};
use crate::error::{EngineError, EngineResult};
use crate::idempotency;

pub const REASON_POINTS: &str = "points";
pub const REASON_DRAW: &str = "draw";

/// What a committed settlement looks like to the rest of the system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettlementResult {
    pub match_id: Uuid,
    pub creator_id: Uuid,
    pub opponent_id: Uuid,
    pub winner_id: Option<Uuid>,
    pub is_draw: bool,
    pub creator_points: i32,
    pub opponent_points: i32,
    pub settled_at: DateTime<Utc>,
    pub reason: String,
}

impl SettlementResult {
    /// Win, loss or draw from `user_id`'s point of view.
    pub fn outcome_for(&self, user_id: Uuid) -> Option<MatchOutcome> {
        if user_id != self.creator_id && user_id != self.opponent_id {
            return None;
        }
        Some(match self.winner_id {
            None => MatchOutcome::Draw,
            Some(w) if w == user_id => MatchOutcome::Win,
            Some(_) => MatchOutcome::Loss,
        })
    }

    pub fn participants(&self) -> [Uuid; 2] {
        [self.creator_id, self.opponent_id]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotReadyReason {
    NotActive(MatchStatus),
    /// Number of referenced events not yet resolved.
    EventsPending(usize),
    /// Every referenced event was cancelled; the match should be voided.
    AllCancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SettleOutcome {
    Settled(SettlementResult),
    AlreadyFinal(MatchStatus),
    NotReady(NotReadyReason),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoidResult {
    pub match_id: Uuid,
    pub creator_id: Uuid,
    pub opponent_id: Uuid,
    pub reason: String,
    pub voided_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum VoidOutcome {
    Voided(VoidResult),
    AlreadyFinal(MatchStatus),
}

/// A match together with the picks and events it depends on.
#[derive(Debug, Clone)]
pub struct MatchSnapshot {
    pub m: Match,
    pub picks: Vec<Pick>,
    pub events: HashMap<Uuid, SportEvent>,
}

impl MatchSnapshot {
    pub fn event_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.picks.iter().map(|p| p.event_id).collect();
        ids.sort();
        ids.dedup();
        ids
    }

    /// Referenced events that are missing or not yet resolved.
    pub fn unresolved(&self) -> Vec<Uuid> {
        self.event_ids()
            .into_iter()
            .filter(|id| !self.events.get(id).is_some_and(|e| e.status.is_resolved()))
            .collect()
    }

    pub fn all_resolved(&self) -> bool {
        self.unresolved().is_empty()
    }

    pub fn all_cancelled(&self) -> bool {
        let ids = self.event_ids();
        !ids.is_empty()
            && ids.iter().all(|id| {
                self.events
                    .get(id)
                    .is_some_and(|e| e.status == EventStatus::Cancelled)
            })
    }

    pub fn any_started(&self) -> bool {
        self.events.values().any(|e| e.status.has_started())
    }

    /// Whether every unresolved event still has a path to resolution: it is
    /// scheduled, live, or postponed to a known date.
    pub fn resolvable(&self) -> bool {
        self.unresolved().iter().all(|id| {
            self.events.get(id).is_some_and(|e| match e.status {
                EventStatus::Scheduled | EventStatus::Live => true,
                EventStatus::Postponed => e.rescheduled_to.is_some(),
                EventStatus::Completed | EventStatus::Cancelled => false,
            })
        })
    }

    fn picks_of(&self, slip_id: Uuid) -> Vec<Pick> {
        self.picks
            .iter()
            .filter(|p| p.slip_id == slip_id)
            .cloned()
            .collect()
    }
}

pub struct SettlementService {
    store: Arc<dyn Store>,
    evaluator: Arc<dyn PicksEvaluator>,
}

impl SettlementService {
    pub fn new(store: Arc<dyn Store>, evaluator: Arc<dyn PicksEvaluator>) -> Self {
        SettlementService { store, evaluator }
    }

    async fn load(&self, match_id: Uuid) -> EngineResult<Match> {
        self.store
            .get_match(match_id)
            .await?
            .ok_or_else(|| EngineError::match_not_found(match_id))
    }

    pub async fn snapshot(&self, m: Match) -> EngineResult<MatchSnapshot> {
        let picks = self
            .store
            .picks_for_slips(&[m.creator_slip_id, m.opponent_slip_id])
            .await?;
        let mut ids: Vec<Uuid> = picks.iter().map(|p| p.event_id).collect();
        ids.sort();
        ids.dedup();
        let events = self
            .store
            .events_by_ids(&ids)
            .await?
            .into_iter()
            .map(|e| (e.id, e))
            .collect();
        Ok(MatchSnapshot { m, picks, events })
    }

    pub async fn snapshot_by_id(&self, match_id: Uuid) -> EngineResult<MatchSnapshot> {
        let m = self.load(match_id).await?;
        self.snapshot(m).await
    }

    /// `locked → active`. `Ok(false)` when the match is no longer locked.
    pub async fn activate(&self, match_id: Uuid, now: DateTime<Utc>) -> EngineResult<bool> {
        let m = self.load(match_id).await?;
        if m.status != MatchStatus::Locked {
            return Ok(false);
        }
        if self.store.activate_match(m.id, m.version, now).await? {
            log::info!("match {match_id} is active");
            return Ok(true);
        }
        match self.load(match_id).await?.status {
            MatchStatus::Locked => Err(EngineError::conflict("match", match_id)),
            _ => Ok(false),
        }
    }

    pub async fn settle(&self, match_id: Uuid, now: DateTime<Utc>) -> EngineResult<SettleOutcome> {
        let m = self.load(match_id).await?;
        if m.status.is_terminal() {
            return Ok(SettleOutcome::AlreadyFinal(m.status));
        }
        if m.status != MatchStatus::Active {
            return Ok(SettleOutcome::NotReady(NotReadyReason::NotActive(m.status)));
        }

        let snap = self.snapshot(m).await?;
        let pending = snap.unresolved().len();
        if pending > 0 {
            return Ok(SettleOutcome::NotReady(NotReadyReason::EventsPending(pending)));
        }
        if snap.all_cancelled() {
            return Ok(SettleOutcome::NotReady(NotReadyReason::AllCancelled));
        }

        let m = &snap.m;
        let score = |slip_id: Uuid| {
            self.evaluator
                .evaluate(&snap.picks_of(slip_id), &snap.events)
                .map_err(|e| {
                    EngineError::Unexpected(
                        anyhow!(e).context(format!("match {match_id} needs manual review")),
                    )
                })
        };
        let creator_points = score(m.creator_slip_id)?;
        let opponent_points = score(m.opponent_slip_id)?;

        let (status, winner_id, reason) = match creator_points.cmp(&opponent_points) {
            std::cmp::Ordering::Greater => (MatchStatus::Settled, Some(m.creator_id), REASON_POINTS),
            std::cmp::Ordering::Less => (MatchStatus::Settled, Some(m.opponent_id), REASON_POINTS),
            std::cmp::Ordering::Equal => (MatchStatus::Draw, None, REASON_DRAW),
        };

        let credits = match winner_id {
            Some(winner) => vec![WalletCredit {
                user_id: winner,
                amount: m.stake_amount * 2,
                tx_type: TransactionType::MatchWin,
                idempotency_key: idempotency::settle_key(m.id),
                reference_id: Some(m.id),
                to_bonus: false,
            }],
            None => m
                .participants()
                .into_iter()
                .map(|user_id| WalletCredit {
                    user_id,
                    amount: m.stake_amount,
                    tx_type: TransactionType::MatchRefund,
                    idempotency_key: idempotency::draw_refund_key(m.id, user_id),
                    reference_id: Some(m.id),
                    to_bonus: false,
                })
                .collect(),
        };

        self.store
            .commit_settlement(&SettlementCommit {
                match_id: m.id,
                expected_version: m.version,
                status,
                winner_id,
                creator_points,
                opponent_points,
                reason: reason.to_owned(),
                settled_at: now,
                credits,
            })
            .await?;

        log::info!(
            "match {} {} ({}:{})",
            m.id,
            status,
            creator_points,
            opponent_points
        );
        Ok(SettleOutcome::Settled(SettlementResult {
            match_id: m.id,
            creator_id: m.creator_id,
            opponent_id: m.opponent_id,
            winner_id,
            is_draw: winner_id.is_none(),
            creator_points,
            opponent_points,
            settled_at: now,
            reason: reason.to_owned(),
        }))
    }

    /// Cancel a non-terminal match and refund both stakes.
    pub async fn void(
        &self,
        match_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<VoidOutcome> {
        let m = self.load(match_id).await?;
        if m.status.is_terminal() {
            return Ok(VoidOutcome::AlreadyFinal(m.status));
        }

        let credits = m
            .participants()
            .into_iter()
            .map(|user_id| WalletCredit {
                user_id,
                amount: m.stake_amount,
                tx_type: TransactionType::MatchRefund,
                idempotency_key: idempotency::void_refund_key(m.id, user_id),
                reference_id: Some(m.id),
                to_bonus: false,
            })
            .collect();

        self.store
            .commit_settlement(&SettlementCommit {
                match_id: m.id,
                expected_version: m.version,
                status: MatchStatus::Voided,
                winner_id: None,
                creator_points: m.creator_points,
                opponent_points: m.opponent_points,
                reason: reason.to_owned(),
                settled_at: now,
                credits,
            })
            .await?;

        log::info!("match {} voided ({reason})", m.id);
        Ok(VoidOutcome::Voided(VoidResult {
            match_id: m.id,
            creator_id: m.creator_id,
            opponent_id: m.opponent_id,
            reason: reason.to_owned(),
            voided_at: now,
        }))
    }
}
