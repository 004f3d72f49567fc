//! Storage seams used by the services.
//!
//! Every write to a contended row (match, wallet, season entry, queue entry)
//! is version-qualified; implementations return `Ok(false)` or
//! [`EngineError::Conflict`](crate::error::EngineError::Conflict) when the
//! row moved underneath the caller, never a silent overwrite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::models::{
    EventUpdate, Leaderboard, LeaderboardEntry, Match, MatchStatus, MatchmakingQueueEntry, Pick,
    RankTier, RankedEntry, Season, SeasonEntry, SeasonStatus, SportEvent, TransactionType, Wallet,
    WalletTransaction,
};
use crate::error::EngineResult;

/// Wallet credit applied inside a larger atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletCredit {
    pub user_id: Uuid,
    pub amount: i64,
    pub tx_type: TransactionType,
    /// Unique per financial side effect; a second insert is a no-op.
    pub idempotency_key: String,
    pub reference_id: Option<Uuid>,
    /// Credit the bonus balance instead of the paid balance.
    pub to_bonus: bool,
}

/// One terminal transition of a match plus its wallet credits, committed
/// atomically.
#[derive(Debug, Clone)]
pub struct SettlementCommit {
    pub match_id: Uuid,
    pub expected_version: i32,
    pub status: MatchStatus,
    pub winner_id: Option<Uuid>,
    pub creator_points: i32,
    pub opponent_points: i32,
    pub reason: String,
    pub settled_at: DateTime<Utc>,
    pub credits: Vec<WalletCredit>,
}

/// A queue-join request; the stake is debited in the same transaction.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
    pub user_id: Uuid,
    pub slip_id: Uuid,
    pub stake_amount: i64,
    pub skill_rating: i32,
    pub region: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchOutcome {
    Win,
    Loss,
    Draw,
}

/// One settled match applied to one participant's standings.
#[derive(Debug, Clone)]
pub struct StandingsUpdate {
    pub idempotency_key: String,
    pub user_id: Uuid,
    pub match_id: Uuid,
    pub outcome: MatchOutcome,
    pub played_at: DateTime<Utc>,
    pub season_id: Option<Uuid>,
    pub leaderboard_ids: Vec<Uuid>,
}

#[async_trait]
pub trait MatchStore: Send + Sync {
    async fn get_match(&self, id: Uuid) -> EngineResult<Option<Match>>;

    /// `locked → active`, conditional on `expected_version`.
    async fn activate_match(
        &self,
        id: Uuid,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    async fn picks_for_slips(&self, slip_ids: &[Uuid]) -> EngineResult<Vec<Pick>>;

    async fn events_by_ids(&self, ids: &[Uuid]) -> EngineResult<Vec<SportEvent>>;

    /// Insert or update an event. A resolved event never regresses.
    async fn upsert_event(&self, update: &EventUpdate, now: DateTime<Utc>)
        -> EngineResult<SportEvent>;

    /// Ids of `locked`/`active` matches with a pick on `event_id`.
    async fn open_matches_for_event(&self, event_id: Uuid) -> EngineResult<Vec<Uuid>>;

    /// `active` matches activated before `active_before`.
    async fn stale_active_matches(
        &self,
        active_before: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<Match>>;

    /// Apply a terminal transition and its credits in one transaction.
    /// Zero rows on the version-qualified match update yields `Conflict`.
    async fn commit_settlement(&self, commit: &SettlementCommit) -> EngineResult<()>;
}

#[async_trait]
pub trait WalletStore: Send + Sync {
    async fn wallet_for_user(&self, user_id: Uuid) -> EngineResult<Option<Wallet>>;

    async fn wallet_transactions(&self, wallet_id: Uuid) -> EngineResult<Vec<WalletTransaction>>;
}

#[async_trait]
pub trait MatchmakingStore: Send + Sync {
    /// Debit the stake (`MATCH_ENTRY`) and insert the queue entry.
    async fn join_queue(
        &self,
        entry: &NewQueueEntry,
        now: DateTime<Utc>,
    ) -> EngineResult<MatchmakingQueueEntry>;

    /// Claim up to `limit` entries that are unclaimed or whose claim expired.
    async fn claim_queue_entries(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<MatchmakingQueueEntry>>;

    async fn release_claim(&self, entry_id: Uuid, worker_id: &str) -> EngineResult<bool>;

    /// Remove both entries (each must still be claimed by `worker_id`) and
    /// create a `locked` match. A lost claim yields `Conflict`.
    async fn create_match_from_pair(
        &self,
        creator: &MatchmakingQueueEntry,
        opponent: &MatchmakingQueueEntry,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Match>;
}

#[async_trait]
pub trait LeaderboardStore: Send + Sync {
    /// Current global and weekly boards, creating them on first use.
    async fn current_leaderboards(&self, now: DateTime<Utc>) -> EngineResult<Vec<Leaderboard>>;

    async fn get_leaderboard(&self, id: Uuid) -> EngineResult<Option<Leaderboard>>;

    async fn leaderboard_entry(
        &self,
        leaderboard_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<LeaderboardEntry>>;

    /// Live ranked query, ordered by
    /// [`ranking::compare`](crate::leaderboard::ranking::compare).
    async fn ranked_entries(
        &self,
        leaderboard_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RankedEntry>>;

    /// Snapshot `previous_rank` on the expiring weekly board and the global
    /// board, retire the weekly board and open the next period.
    async fn rotate_weekly(
        &self,
        expiring_id: Uuid,
        global_id: Option<Uuid>,
        next_start: DateTime<Utc>,
        next_end: DateTime<Utc>,
    ) -> EngineResult<Leaderboard>;
}

#[async_trait]
pub trait StandingsStore: Send + Sync {
    /// Apply one match to one user's season and leaderboard entries.
    /// Returns `false` when the idempotency key was already consumed.
    async fn apply_standings(&self, update: &StandingsUpdate) -> EngineResult<bool>;
}

#[async_trait]
pub trait SeasonStore: Send + Sync {
    async fn get_season(&self, id: Uuid) -> EngineResult<Option<Season>>;

    async fn seasons_by_status(&self, status: SeasonStatus) -> EngineResult<Vec<Season>>;

    /// `UPCOMING → ACTIVE`, conditional.
    async fn activate_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<bool>;

    async fn season_entry(&self, season_id: Uuid, user_id: Uuid)
        -> EngineResult<Option<SeasonEntry>>;

    async fn season_entries(&self, season_id: Uuid) -> EngineResult<Vec<SeasonEntry>>;

    /// Entries with points whose last match is older than `inactive_before`
    /// and which have not decayed since `day_start`.
    async fn decay_candidates(
        &self,
        season_id: Uuid,
        inactive_before: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> EngineResult<Vec<SeasonEntry>>;

    /// Version-qualified decay write.
    async fn apply_decay(
        &self,
        entry_id: Uuid,
        expected_version: i32,
        rank_points: i32,
        tier: RankTier,
        now: DateTime<Utc>,
    ) -> EngineResult<bool>;

    /// `ACTIVE → ENDED`, conditional.
    async fn end_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<bool>;

    /// Freeze final ranks. `None` when already finalized.
    async fn finalize_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<usize>>;

    /// Mark rewards distributed (only if still unset) and credit each placed
    /// entry according to `reward_for`. `None` when already distributed.
    async fn distribute_rewards(
        &self,
        id: Uuid,
        reward_for: fn(RankTier) -> i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Vec<(Uuid, i64)>>>;
}

/// Everything the engine needs from persistence.
pub trait Store:
    MatchStore + WalletStore + MatchmakingStore + LeaderboardStore + StandingsStore + SeasonStore
{
}

impl<T> Store for T where
    T: MatchStore + WalletStore + MatchmakingStore + LeaderboardStore + StandingsStore + SeasonStore
{
}
