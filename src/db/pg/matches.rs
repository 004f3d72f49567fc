use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::wallets::apply_credit;
use super::PgStore;
use crate::db::models::{EventUpdate, Match, MatchStatus, Pick, SportEvent};
use crate::db::store::{MatchStore, SettlementCommit};
use crate::error::{EngineError, EngineResult};

const ALL_STATUSES: [MatchStatus; 5] = [
    MatchStatus::Locked,
    MatchStatus::Active,
    MatchStatus::Settled,
    MatchStatus::Draw,
    MatchStatus::Voided,
];

impl PgStore {
    async fn match_exists(&self, id: Uuid) -> EngineResult<bool> {
        let row: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row.is_some())
    }

    async fn commit_settlement_tx(&self, commit: &SettlementCommit) -> EngineResult<()> {
        let from: Vec<&'static str> = ALL_STATUSES
            .iter()
            .filter(|s| s.can_transition_to(commit.status))
            .map(|s| s.as_str())
            .collect();

        let mut tx = self.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE matches
               SET status = $3, winner_id = $4, creator_points = $5, opponent_points = $6,
                   settlement_reason = $7, settled_at = $8, version = version + 1
             WHERE id = $1 AND version = $2 AND status = ANY($9)
            "#,
        )
        .bind(commit.match_id)
        .bind(commit.expected_version)
        .bind(commit.status.as_str())
        .bind(commit.winner_id)
        .bind(commit.creator_points)
        .bind(commit.opponent_points)
        .bind(&commit.reason)
        .bind(commit.settled_at)
        .bind(from)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await.ok();
            if !self.match_exists(commit.match_id).await? {
                return Err(EngineError::match_not_found(commit.match_id));
            }
            return Err(EngineError::conflict("match", commit.match_id));
        }

        for credit in &commit.credits {
            if !apply_credit(&mut *tx, credit, commit.settled_at).await? {
                log::info!(
                    "credit {} already applied, skipping",
                    credit.idempotency_key
                );
            }
        }

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl MatchStore for PgStore {
    async fn get_match(&self, id: Uuid) -> EngineResult<Option<Match>> {
        let m = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await
            .context("fetching match")?;
        Ok(m)
    }

    async fn activate_match(
        &self,
        id: Uuid,
        expected_version: i32,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let updated = sqlx::query(
            r#"
            UPDATE matches
               SET status = 'active', activated_at = $3, version = version + 1
             WHERE id = $1 AND version = $2 AND status = 'locked'
            "#,
        )
        .bind(id)
        .bind(expected_version)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();

        if updated == 0 && !self.match_exists(id).await? {
            return Err(EngineError::match_not_found(id));
        }
        Ok(updated == 1)
    }

    async fn picks_for_slips(&self, slip_ids: &[Uuid]) -> EngineResult<Vec<Pick>> {
        let picks = sqlx::query_as::<_, Pick>(
            "SELECT id, slip_id, user_id, event_id, selection FROM picks WHERE slip_id = ANY($1)",
        )
        .bind(slip_ids)
        .fetch_all(self.pool())
        .await
        .context("loading picks")?;
        Ok(picks)
    }

    async fn events_by_ids(&self, ids: &[Uuid]) -> EngineResult<Vec<SportEvent>> {
        let events = sqlx::query_as::<_, SportEvent>("SELECT * FROM sport_events WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(self.pool())
            .await
            .context("loading events")?;
        Ok(events)
    }

    async fn upsert_event(
        &self,
        update: &EventUpdate,
        now: DateTime<Utc>,
    ) -> EngineResult<SportEvent> {
        // Resolved events are frozen: the conflict branch only fires while
        // the stored row is still open.
        let written = sqlx::query_as::<_, SportEvent>(
            r#"
            INSERT INTO sport_events
                (id, external_event_id, status, home_score, away_score, starts_at,
                 rescheduled_to, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (external_event_id) DO UPDATE
               SET status = EXCLUDED.status,
                   home_score = EXCLUDED.home_score,
                   away_score = EXCLUDED.away_score,
                   starts_at = EXCLUDED.starts_at,
                   rescheduled_to = EXCLUDED.rescheduled_to,
                   updated_at = EXCLUDED.updated_at
             WHERE sport_events.status NOT IN ('COMPLETED', 'CANCELLED')
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&update.external_event_id)
        .bind(update.status.as_str())
        .bind(update.home_score)
        .bind(update.away_score)
        .bind(update.starts_at)
        .bind(update.rescheduled_to)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .context("upserting sport event")?;

        match written {
            Some(ev) => Ok(ev),
            None => {
                let ev = sqlx::query_as::<_, SportEvent>(
                    "SELECT * FROM sport_events WHERE external_event_id = $1",
                )
                .bind(&update.external_event_id)
                .fetch_one(self.pool())
                .await?;
                Ok(ev)
            }
        }
    }

    async fn open_matches_for_event(&self, event_id: Uuid) -> EngineResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT m.id
              FROM matches m
             WHERE m.status IN ('locked', 'active')
               AND EXISTS (
                   SELECT 1 FROM picks p
                    WHERE p.event_id = $1
                      AND p.slip_id IN (m.creator_slip_id, m.opponent_slip_id))
             ORDER BY m.id
            "#,
        )
        .bind(event_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn stale_active_matches(
        &self,
        active_before: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<Match>> {
        let rows = sqlx::query_as::<_, Match>(
            r#"
            SELECT * FROM matches
             WHERE status = 'active' AND COALESCE(activated_at, created_at) < $1
             ORDER BY COALESCE(activated_at, created_at)
             LIMIT $2
            "#,
        )
        .bind(active_before)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn commit_settlement(&self, commit: &SettlementCommit) -> EngineResult<()> {
        tokio::time::timeout(self.tx_timeout, self.commit_settlement_tx(commit)).await?
    }
}
