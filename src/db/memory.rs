//! In-memory [`Store`](super::store::Store) used by the test-suite and by
//! `STORE_BACKEND=memory` dev runs.
//!
//! One mutex guards the whole state, so every trait method is atomic the same
//! way a single Postgres transaction is.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    EventStatus, EventUpdate, Leaderboard, LeaderboardEntry, LeaderboardKind, Match, MatchStatus,
    MatchmakingQueueEntry, Pick, PickSelection, RankTier, RankedEntry, Season, SeasonEntry,
    SeasonStatus, SportEvent, TransactionType, Wallet, WalletTransaction,
};
use crate::db::store::{
    LeaderboardStore, MatchStore, MatchmakingStore, NewQueueEntry, SeasonStore, SettlementCommit,
    StandingsStore, StandingsUpdate, WalletCredit, WalletStore,
};
use crate::error::{EngineError, EngineResult};
use crate::idempotency;
use crate::leaderboard::{ranking, week_bounds};
use crate::season::rank;

#[derive(Default)]
struct MemoryState {
    matches: HashMap<Uuid, Match>,
    wallets: HashMap<Uuid, Wallet>,
    wallet_by_user: HashMap<Uuid, Uuid>,
    transactions: Vec<WalletTransaction>,
    tx_keys: HashSet<String>,
    idempotency_keys: HashSet<String>,
    events: HashMap<Uuid, SportEvent>,
    event_by_external: HashMap<String, Uuid>,
    picks: Vec<Pick>,
    queue: HashMap<Uuid, MatchmakingQueueEntry>,
    leaderboards: HashMap<Uuid, Leaderboard>,
    lb_entries: HashMap<(Uuid, Uuid), LeaderboardEntry>,
    seasons: HashMap<Uuid, Season>,
    season_entries: HashMap<Uuid, SeasonEntry>,
}

impl MemoryState {
    fn wallet_mut(&mut self, user_id: Uuid) -> EngineResult<&mut Wallet> {
        let wallet_id = *self
            .wallet_by_user
            .get(&user_id)
            .ok_or_else(|| EngineError::not_found("wallet", user_id))?;
        self.wallets
            .get_mut(&wallet_id)
            .ok_or_else(|| EngineError::not_found("wallet", wallet_id))
    }

    /// Apply a credit unless its key was already consumed. `Ok(false)` means
    /// the key existed.
    fn apply_credit(&mut self, credit: &WalletCredit, now: DateTime<Utc>) -> EngineResult<bool> {
        if self.tx_keys.contains(&credit.idempotency_key) {
            return Ok(false);
        }
        let wallet = self.wallet_mut(credit.user_id)?;
        let before = wallet.total();
        if credit.to_bonus {
            wallet.bonus_balance += credit.amount;
        } else {
            wallet.paid_balance += credit.amount;
        }
        wallet.version += 1;
        wallet.updated_at = now;
        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            tx_type: credit.tx_type,
            amount: credit.amount,
            balance_before: before,
            balance_after: wallet.total(),
            idempotency_key: credit.idempotency_key.clone(),
            reference_id: credit.reference_id,
            completed_at: now,
        };
        self.tx_keys.insert(tx.idempotency_key.clone());
        self.transactions.push(tx);
        Ok(true)
    }

    fn ensure_board(&mut self, kind: LeaderboardKind, now: DateTime<Utc>) -> Leaderboard {
        if let Some(lb) = self
            .leaderboards
            .values()
            .find(|lb| lb.kind == kind && lb.is_current)
        {
            return lb.clone();
        }
        let (period_start, period_end) = match kind {
            LeaderboardKind::Global => (DateTime::<Utc>::UNIX_EPOCH, None),
            LeaderboardKind::Weekly => {
                let (s, e) = week_bounds(now);
                (s, Some(e))
            }
        };
        let lb = Leaderboard {
            id: Uuid::new_v4(),
            kind,
            period_start,
            period_end,
            is_current: true,
        };
        self.leaderboards.insert(lb.id, lb.clone());
        lb
    }

    fn ranked(&self, leaderboard_id: Uuid) -> Vec<RankedEntry> {
        let entries = self
            .lb_entries
            .values()
            .filter(|e| e.leaderboard_id == leaderboard_id)
            .cloned()
            .collect();
        ranking::rank_entries(entries)
    }

    fn snapshot_previous_ranks(&mut self, leaderboard_id: Uuid) {
        for r in self.ranked(leaderboard_id) {
            if let Some(e) = self.lb_entries.get_mut(&(leaderboard_id, r.user_id)) {
                e.previous_rank = Some(r.rank as i32);
                e.rank = Some(r.rank as i32);
            }
        }
    }
}

/// Process-local store backed by hash maps.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    // ---- seeding helpers -------------------------------------------------

    pub fn create_wallet(&self, user_id: Uuid, paid_balance: i64) -> Wallet {
        let wallet = Wallet {
            id: Uuid::new_v4(),
            user_id,
            paid_balance,
            bonus_balance: 0,
            version: 0,
            updated_at: Utc::now(),
        };
        let mut st = self.lock();
        st.wallet_by_user.insert(user_id, wallet.id);
        st.wallets.insert(wallet.id, wallet.clone());
        wallet
    }

    pub fn insert_event(&self, event: SportEvent) {
        let mut st = self.lock();
        st.event_by_external
            .insert(event.external_event_id.clone(), event.id);
        st.events.insert(event.id, event);
    }

    pub fn insert_pick(
        &self,
        slip_id: Uuid,
        user_id: Uuid,
        event_id: Uuid,
        selection: PickSelection,
    ) -> Pick {
        let pick = Pick {
            id: Uuid::new_v4(),
            slip_id,
            user_id,
            event_id,
            selection,
        };
        self.lock().picks.push(pick.clone());
        pick
    }

    pub fn insert_match(&self, m: Match) {
        self.lock().matches.insert(m.id, m);
    }

    pub fn insert_season(&self, season: Season) {
        self.lock().seasons.insert(season.id, season);
    }

    pub fn insert_season_entry(&self, entry: SeasonEntry) {
        self.lock().season_entries.insert(entry.id, entry);
    }

    pub fn insert_leaderboard(&self, lb: Leaderboard) {
        self.lock().leaderboards.insert(lb.id, lb);
    }

    pub fn insert_leaderboard_entry(&self, entry: LeaderboardEntry) {
        self.lock()
            .lb_entries
            .insert((entry.leaderboard_id, entry.user_id), entry);
    }

    pub fn transactions(&self) -> Vec<WalletTransaction> {
        self.lock().transactions.clone()
    }

    pub fn queue_entries(&self) -> Vec<MatchmakingQueueEntry> {
        let mut entries: Vec<_> = self.lock().queue.values().cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub fn matches(&self) -> Vec<Match> {
        self.lock().matches.values().cloned().collect()
    }

    /// Simulate another writer bumping a match row.
    pub fn bump_match_version(&self, id: Uuid) {
        if let Some(m) = self.lock().matches.get_mut(&id) {
            m.version += 1;
        }
    }

    /// Simulate another worker stealing a queue claim.
    pub fn steal_claim(&self, entry_id: Uuid, thief: &str) {
        if let Some(e) = self.lock().queue.get_mut(&entry_id) {
            e.claimed_by = Some(thief.to_owned());
            e.version += 1;
        }
    }
}

#[async_trait]
impl MatchStore for MemoryStore {
    async fn get_match(&self, id: Uuid) -> EngineResult<Option<Match>> {
        Ok(self.lock().matches.get(&id).cloned())
    }

    async fn activate_match(
        &self,
        id: Uuid,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut st = self.lock();
        match st.matches.get_mut(&id) {
            Some(m) if m.version == expected_version && m.status == MatchStatus::Locked => {
                m.status = MatchStatus::Active;
                m.activated_at = Some(now);
                m.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::match_not_found(id)),
        }
    }

    async fn picks_for_slips(&self, slip_ids: &[Uuid]) -> EngineResult<Vec<Pick>> {
        Ok(self
            .lock()
            .picks
            .iter()
            .filter(|p| slip_ids.contains(&p.slip_id))
            .cloned()
            .collect())
    }

    async fn events_by_ids(&self, ids: &[Uuid]) -> EngineResult<Vec<SportEvent>> {
        let st = self.lock();
        Ok(ids.iter().filter_map(|id| st.events.get(id).cloned()).collect())
    }

    async fn upsert_event(
        &self,
        update: &EventUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<SportEvent> {
        let mut st = self.lock();
        if let Some(id) = st.event_by_external.get(&update.external_event_id).copied() {
            let ev = st
                .events
                .get_mut(&id)
                .ok_or_else(|| EngineError::not_found("event", id))?;
            if !ev.status.is_resolved() {
                ev.status = update.status;
                ev.home_score = update.home_score;
                ev.away_score = update.away_score;
                ev.starts_at = update.starts_at;
                ev.rescheduled_to = update.rescheduled_to;
                ev.updated_at = now;
            }
            return Ok(ev.clone());
        }
        let ev = SportEvent {
            id: Uuid::new_v4(),
            external_event_id: update.external_event_id.clone(),
            status: update.status,
            home_score: update.home_score,
            away_score: update.away_score,
            starts_at: update.starts_at,
            rescheduled_to: update.rescheduled_to,
            updated_at: now,
        };
        st.event_by_external
            .insert(ev.external_event_id.clone(), ev.id);
        st.events.insert(ev.id, ev.clone());
        Ok(ev)
    }

    async fn open_matches_for_event(&self, event_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let st = self.lock();
        let slips: HashSet<Uuid> = st
            .picks
            .iter()
            .filter(|p| p.event_id == event_id)
            .map(|p| p.slip_id)
            .collect();
        let mut ids: Vec<Uuid> = st
            .matches
            .values()
            .filter(|m| !m.status.is_terminal())
            .filter(|m| slips.contains(&m.creator_slip_id) || slips.contains(&m.opponent_slip_id))
            .map(|m| m.id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn stale_active_matches(
        &self,
        active_before: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<Match>> {
        let st = self.lock();
        let mut out: Vec<Match> = st
            .matches
            .values()
            .filter(|m| m.status == MatchStatus::Active)
            .filter(|m| m.activated_at.unwrap_or(m.created_at) < active_before)
            .cloned()
            .collect();
        out.sort_by_key(|m| m.activated_at.unwrap_or(m.created_at));
        out.truncate(limit.max(0) as usize);
        Ok(out)
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> EngineResult<()> {
        let mut st = self.lock();
        let m = st
            .matches
            .get(&commit.match_id)
            .ok_or_else(|| EngineError::match_not_found(commit.match_id))?;
        if m.version != commit.expected_version || !m.status.can_transition_to(commit.status) {
            return Err(EngineError::conflict("match", commit.match_id));
        }
        // Validate every wallet before mutating anything.
        for c in &commit.credits {
            if !st.wallet_by_user.contains_key(&c.user_id) {
                return Err(EngineError::not_found("wallet", c.user_id));
            }
        }

        if let Some(m) = st.matches.get_mut(&commit.match_id) {
            m.status = commit.status;
            m.winner_id = commit.winner_id;
            m.creator_points = commit.creator_points;
            m.opponent_points = commit.opponent_points;
            m.settlement_reason = Some(commit.reason.clone());
            m.settled_at = Some(commit.settled_at);
            m.version += 1;
        }
        for c in &commit.credits {
            st.apply_credit(c, commit.settled_at)?;
        }
        Ok(())
    }
}

#[async_trait]
impl WalletStore for MemoryStore {
    async fn wallet_for_user(&self, user_id: Uuid) -> EngineResult<Option<Wallet>> {
        let st = self.lock();
        Ok(st
            .wallet_by_user
            .get(&user_id)
            .and_then(|id| st.wallets.get(id))
            .cloned())
    }

    async fn wallet_transactions(&self, wallet_id: Uuid) -> EngineResult<Vec<WalletTransaction>> {
        Ok(self
            .lock()
            .transactions
            .iter()
            .filter(|t| t.wallet_id == wallet_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl MatchmakingStore for MemoryStore {
    async fn join_queue(
        &self,
        entry: &NewQueueEntry,
        now: DateTime<Utc>,
    ) -> EngineResult<MatchmakingQueueEntry> {
        let mut st = self.lock();
        let key = idempotency::entry_key(entry.slip_id);
        if st.tx_keys.contains(&key) {
            return Err(EngineError::AlreadyDone(format!("slip {} queued", entry.slip_id)));
        }
        let wallet = st.wallet_mut(entry.user_id)?;
        if wallet.paid_balance < entry.stake_amount {
            return Err(EngineError::unexpected(format!(
                "insufficient balance for user {}",
                entry.user_id
            )));
        }
        let before = wallet.total();
        wallet.paid_balance -= entry.stake_amount;
        wallet.version += 1;
        wallet.updated_at = now;
        let tx = WalletTransaction {
            id: Uuid::new_v4(),
            wallet_id: wallet.id,
            tx_type: TransactionType::MatchEntry,
            amount: -entry.stake_amount,
            balance_before: before,
            balance_after: wallet.total(),
            idempotency_key: key.clone(),
            reference_id: Some(entry.slip_id),
            completed_at: now,
        };
        st.tx_keys.insert(key);
        st.transactions.push(tx);

        let row = MatchmakingQueueEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            slip_id: entry.slip_id,
            stake_amount: entry.stake_amount,
            skill_rating: entry.skill_rating,
            region: entry.region.clone(),
            claimed_by: None,
            claim_expires_at: None,
            version: 0,
            created_at: now,
        };
        st.queue.insert(row.id, row.clone());
        Ok(row)
    }

    async fn claim_queue_entries(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<MatchmakingQueueEntry>> {
        let mut st = self.lock();
        let mut claimable: Vec<&mut MatchmakingQueueEntry> = st
            .queue
            .values_mut()
            .filter(|e| e.claimed_by.is_none() || e.claim_expires_at.map_or(true, |t| t < now))
            .collect();
        claimable.sort_by_key(|e| (e.created_at, e.id));
        Ok(claimable
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|e| {
                e.claimed_by = Some(worker_id.to_owned());
                e.claim_expires_at = Some(claim_until);
                e.version += 1;
                e.clone()
            })
            .collect())
    }

    async fn release_claim(&self, entry_id: Uuid, worker_id: &str) -> EngineResult<bool> {
        let mut st = self.lock();
        match st.queue.get_mut(&entry_id) {
            Some(e) if e.claimed_by.as_deref() == Some(worker_id) => {
                e.claimed_by = None;
                e.claim_expires_at = None;
                e.version += 1;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_match_from_pair(
        &self,
        creator: &MatchmakingQueueEntry,
        opponent: &MatchmakingQueueEntry,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Match> {
        let mut st = self.lock();
        for claimed in [creator, opponent] {
            let still_ours = st.queue.get(&claimed.id).is_some_and(|e| {
                e.claimed_by.as_deref() == Some(worker_id) && e.version == claimed.version
            });
            if !still_ours {
                return Err(EngineError::conflict("matchmaking_queue", claimed.id));
            }
        }
        st.queue.remove(&creator.id);
        st.queue.remove(&opponent.id);

        let m = Match {
            id: Uuid::new_v4(),
            creator_id: creator.user_id,
            opponent_id: opponent.user_id,
            creator_slip_id: creator.slip_id,
            opponent_slip_id: opponent.slip_id,
            stake_amount: creator.stake_amount,
            status: MatchStatus::Locked,
            winner_id: None,
            version: 1,
            creator_points: 0,
            opponent_points: 0,
            settlement_reason: None,
            created_at: now,
            activated_at: None,
            settled_at: None,
        };
        st.matches.insert(m.id, m.clone());
        Ok(m)
    }
}

#[async_trait]
impl LeaderboardStore for MemoryStore {
    async fn current_leaderboards(&self, now: DateTime<Utc>) -> EngineResult<Vec<Leaderboard>> {
        let mut st = self.lock();
        Ok(vec![
            st.ensure_board(LeaderboardKind::Global, now),
            st.ensure_board(LeaderboardKind::Weekly, now),
        ])
    }

    async fn get_leaderboard(&self, id: Uuid) -> EngineResult<Option<Leaderboard>> {
        Ok(self.lock().leaderboards.get(&id).cloned())
    }

    async fn leaderboard_entry(
        &self,
        leaderboard_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<LeaderboardEntry>> {
        Ok(self.lock().lb_entries.get(&(leaderboard_id, user_id)).cloned())
    }

    async fn ranked_entries(
        &self,
        leaderboard_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RankedEntry>> {
        Ok(self
            .lock()
            .ranked(leaderboard_id)
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn rotate_weekly(
        &self,
        expiring_id: Uuid,
        global_id: Option<Uuid>,
        next_start: DateTime<Utc>,
        next_end: DateTime<Utc>,
    ) -> EngineResult<Leaderboard> {
        let mut st = self.lock();
        if let Some(existing) = st
            .leaderboards
            .values()
            .find(|lb| lb.kind == LeaderboardKind::Weekly && lb.period_start == next_start)
        {
            return Ok(existing.clone());
        }
        st.snapshot_previous_ranks(expiring_id);
        if let Some(global) = global_id {
            st.snapshot_previous_ranks(global);
        }
        if let Some(lb) = st.leaderboards.get_mut(&expiring_id) {
            lb.is_current = false;
        }
        let next = Leaderboard {
            id: Uuid::new_v4(),
            kind: LeaderboardKind::Weekly,
            period_start: next_start,
            period_end: Some(next_end),
            is_current: true,
        };
        st.leaderboards.insert(next.id, next.clone());
        Ok(next)
    }
}

#[async_trait]
impl StandingsStore for MemoryStore {
    async fn apply_standings(&self, update: &StandingsUpdate) -> EngineResult<bool> {
        let mut st = self.lock();
        if st.idempotency_keys.contains(&update.idempotency_key) {
            return Ok(false);
        }

        if let Some(season_id) = update.season_id {
            let existing = st
                .season_entries
                .values()
                .find(|e| e.season_id == season_id && e.user_id == update.user_id)
                .map(|e| e.id);
            let mut entry = match existing {
                Some(id) => st.season_entries[&id].clone(),
                None => SeasonEntry::new(season_id, update.user_id),
            };
            rank::record_match(&mut entry, update.outcome, update.played_at);
            entry.version += 1;
            st.season_entries.insert(entry.id, entry);
        }

        for &lb_id in &update.leaderboard_ids {
            let entry = st
                .lb_entries
                .entry((lb_id, update.user_id))
                .or_insert_with(|| LeaderboardEntry::new(lb_id, update.user_id, update.played_at));
            ranking::record_match(entry, update.outcome, update.played_at);
        }

        st.idempotency_keys.insert(update.idempotency_key.clone());
        Ok(true)
    }
}

#[async_trait]
impl SeasonStore for MemoryStore {
    async fn get_season(&self, id: Uuid) -> EngineResult<Option<Season>> {
        Ok(self.lock().seasons.get(&id).cloned())
    }

    async fn seasons_by_status(&self, status: SeasonStatus) -> EngineResult<Vec<Season>> {
        let mut out: Vec<Season> = self
            .lock()
            .seasons
            .values()
            .filter(|s| s.status == status)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.starts_at);
        Ok(out)
    }

    async fn activate_season(&self, id: Uuid, _now: DateTime<Utc>) -> EngineResult<bool> {
        let mut st = self.lock();
        match st.seasons.get_mut(&id) {
            Some(s) if s.status == SeasonStatus::Upcoming => {
                s.status = SeasonStatus::Active;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found("season", id)),
        }
    }

    async fn season_entry(
        &self,
        season_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<SeasonEntry>> {
        Ok(self
            .lock()
            .season_entries
            .values()
            .find(|e| e.season_id == season_id && e.user_id == user_id)
            .cloned())
    }

    async fn season_entries(&self, season_id: Uuid) -> EngineResult<Vec<SeasonEntry>> {
        let mut out: Vec<SeasonEntry> = self
            .lock()
            .season_entries
            .values()
            .filter(|e| e.season_id == season_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.rank_points.cmp(&a.rank_points).then(a.user_id.cmp(&b.user_id)));
        Ok(out)
    }

    async fn decay_candidates(
        &self,
        season_id: Uuid,
        inactive_before: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> EngineResult<Vec<SeasonEntry>> {
        Ok(self
            .lock()
            .season_entries
            .values()
            .filter(|e| e.season_id == season_id && e.rank_points > 0)
            .filter(|e| e.last_match_at.map_or(true, |t| t < inactive_before))
            .filter(|e| e.last_decay_at.map_or(true, |t| t < day_start))
            .cloned()
            .collect())
    }

    async fn apply_decay(
        &self,
        entry_id: Uuid,
        expected_version: i32,
        rank_points: i32,
        tier: RankTier,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let mut st = self.lock();
        match st.season_entries.get_mut(&entry_id) {
            Some(e) if e.version == expected_version => {
                e.rank_points = rank_points;
                e.current_rank = tier;
                e.last_decay_at = Some(now);
                e.version += 1;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found("season_entry", entry_id)),
        }
    }

    async fn end_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<bool> {
        let mut st = self.lock();
        match st.seasons.get_mut(&id) {
            Some(s) if s.status == SeasonStatus::Active => {
                s.status = SeasonStatus::Ended;
                s.ended_at = Some(now);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(EngineError::not_found("season", id)),
        }
    }

    async fn finalize_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<usize>> {
        let mut st = self.lock();
        let season = st
            .seasons
            .get(&id)
            .ok_or_else(|| EngineError::not_found("season", id))?;
        if season.finalized_at.is_some() {
            return Ok(None);
        }
        if season.status != SeasonStatus::Ended {
            return Err(EngineError::NotReady(format!("season {id} has not ended")));
        }

        let mut order: Vec<(Uuid, i32, Uuid)> = st
            .season_entries
            .values()
            .filter(|e| e.season_id == id)
            .map(|e| (e.id, e.rank_points, e.user_id))
            .collect();
        order.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
        let points: Vec<i32> = order.iter().map(|o| o.1).collect();
        let positions = rank::dense_positions(&points);

        for ((entry_id, _, _), position) in order.iter().zip(positions) {
            if let Some(e) = st.season_entries.get_mut(entry_id) {
                e.final_rank = Some(e.current_rank.as_str().to_owned());
                e.final_rank_points = Some(e.rank_points);
                e.rank_position = Some(position);
                e.version += 1;
            }
        }
        if let Some(s) = st.seasons.get_mut(&id) {
            s.finalized_at = Some(now);
        }
        Ok(Some(order.len()))
    }

    async fn distribute_rewards(
        &self,
        id: Uuid,
        reward_for: fn(RankTier) -> i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Vec<(Uuid, i64)>>> {
        let mut st = self.lock();
        let season = st
            .seasons
            .get(&id)
            .ok_or_else(|| EngineError::not_found("season", id))?;
        if season.rewards_distributed_at.is_some() {
            return Ok(None);
        }
        if season.finalized_at.is_none() {
            return Err(EngineError::NotReady(format!("season {id} not finalized")));
        }

        let credits: Vec<WalletCredit> = st
            .season_entries
            .values()
            .filter(|e| e.season_id == id && e.is_placed)
            .filter_map(|e| {
                let tier: RankTier = e.final_rank.as_deref()?.parse().ok()?;
                let amount = reward_for(tier);
                (amount > 0).then(|| WalletCredit {
                    user_id: e.user_id,
                    amount,
                    tx_type: TransactionType::SeasonReward,
                    idempotency_key: idempotency::season_reward_key(id, e.user_id),
                    reference_id: Some(id),
                    to_bonus: true,
                })
            })
            .collect();

        let mut paid = Vec::with_capacity(credits.len());
        for c in &credits {
            match st.apply_credit(c, now) {
                Ok(true) => paid.push((c.user_id, c.amount)),
                Ok(false) => {}
                Err(EngineError::NotFound { .. }) => {
                    log::warn!("season {id}: no wallet for {}, reward skipped", c.user_id);
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(s) = st.seasons.get_mut(&id) {
            s.rewards_distributed_at = Some(now);
        }
        Ok(Some(paid))
    }
}

/// Seed an event directly, bypassing the feed.
pub fn sport_event(external_id: &str, status: EventStatus, starts_at: DateTime<Utc>) -> SportEvent {
    SportEvent {
        id: Uuid::new_v4(),
        external_event_id: external_id.to_owned(),
        status,
        home_score: None,
        away_score: None,
        starts_at,
        rescheduled_to: None,
        updated_at: starts_at,
    }
}
