use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::{PgStore, RANK_ORDER};
use crate::db::models::{Leaderboard, LeaderboardEntry, LeaderboardKind, RankedEntry, SeasonEntry};
use crate::db::store::{LeaderboardStore, StandingsStore, StandingsUpdate};
use crate::error::{EngineError, EngineResult};
use crate::leaderboard::{ranking, week_bounds};
use crate::season::rank;

impl PgStore {
    async fn ensure_current(
        &self,
        kind: LeaderboardKind,
        period_start: DateTime<Utc>,
        period_end: Option<DateTime<Utc>>,
    ) -> EngineResult<Leaderboard> {
        let select = "SELECT * FROM leaderboards WHERE kind = $1 AND is_current";
        if let Some(lb) = sqlx::query_as::<_, Leaderboard>(select)
            .bind(kind.as_str())
            .fetch_optional(self.pool())
            .await?
        {
            return Ok(lb);
        }

        sqlx::query(
            r#"
            INSERT INTO leaderboards (id, kind, period_start, period_end, is_current)
            VALUES ($1, $2, $3, $4, TRUE)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(kind.as_str())
        .bind(period_start)
        .bind(period_end)
        .execute(self.pool())
        .await?;

        let lb = sqlx::query_as::<_, Leaderboard>(select)
            .bind(kind.as_str())
            .fetch_one(self.pool())
            .await
            .context("creating current leaderboard")?;
        Ok(lb)
    }
}

/// Write `previous_rank` (and the cached `rank`) from the live ordering.
async fn snapshot_ranks(conn: &mut PgConnection, leaderboard_id: Uuid) -> EngineResult<u64> {
    let stmt = format!(
        r#"
        UPDATE leaderboard_entries le
           SET previous_rank = r.pos, rank = r.pos
          FROM (SELECT user_id, (ROW_NUMBER() OVER (ORDER BY {RANK_ORDER}))::INT AS pos
                  FROM leaderboard_entries
                 WHERE leaderboard_id = $1) r
         WHERE le.leaderboard_id = $1 AND le.user_id = r.user_id
        "#
    );
    let n = sqlx::query(&stmt)
        .bind(leaderboard_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
    Ok(n)
}

#[async_trait]
impl LeaderboardStore for PgStore {
    async fn current_leaderboards(&self, now: DateTime<Utc>) -> EngineResult<Vec<Leaderboard>> {
        let global = self
            .ensure_current(LeaderboardKind::Global, DateTime::<Utc>::UNIX_EPOCH, None)
            .await?;
        let (start, end) = week_bounds(now);
        let weekly = self
            .ensure_current(LeaderboardKind::Weekly, start, Some(end))
            .await?;
        Ok(vec![global, weekly])
    }

    async fn get_leaderboard(&self, id: Uuid) -> EngineResult<Option<Leaderboard>> {
        let lb = sqlx::query_as::<_, Leaderboard>("SELECT * FROM leaderboards WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(lb)
    }

    async fn leaderboard_entry(
        &self,
        leaderboard_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<LeaderboardEntry>> {
        let e = sqlx::query_as::<_, LeaderboardEntry>(
            "SELECT * FROM leaderboard_entries WHERE leaderboard_id = $1 AND user_id = $2",
        )
        .bind(leaderboard_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(e)
    }

    async fn ranked_entries(
        &self,
        leaderboard_id: Uuid,
        offset: i64,
        limit: i64,
    ) -> EngineResult<Vec<RankedEntry>> {
        let stmt = format!(
            "SELECT * FROM leaderboard_entries WHERE leaderboard_id = $1 \
             ORDER BY {RANK_ORDER} OFFSET $2 LIMIT $3"
        );
        let rows = sqlx::query_as::<_, LeaderboardEntry>(&stmt)
            .bind(leaderboard_id)
            .bind(offset.max(0))
            .bind(limit.max(0))
            .fetch_all(self.pool())
            .await
            .context("live ranked query")?;
        Ok(rows
            .iter()
            .enumerate()
            .map(|(i, e)| RankedEntry::from_entry(offset.max(0) + i as i64 + 1, e))
            .collect())
    }

    async fn rotate_weekly(
        &self,
        expiring_id: Uuid,
        global_id: Option<Uuid>,
        next_start: DateTime<Utc>,
        next_end: DateTime<Utc>,
    ) -> EngineResult<Leaderboard> {
        let mut tx = self.begin().await?;

        let existing = sqlx::query_as::<_, Leaderboard>(
            "SELECT * FROM leaderboards WHERE kind = 'WEEKLY' AND period_start = $1",
        )
        .bind(next_start)
        .fetch_optional(&mut *tx)
        .await?;
        if let Some(lb) = existing {
            tx.rollback().await.ok();
            return Ok(lb);
        }

        snapshot_ranks(&mut *tx, expiring_id).await?;
        if let Some(global) = global_id {
            snapshot_ranks(&mut *tx, global).await?;
        }

        sqlx::query("UPDATE leaderboards SET is_current = FALSE WHERE id = $1")
            .bind(expiring_id)
            .execute(&mut *tx)
            .await?;

        let next = sqlx::query_as::<_, Leaderboard>(
            r#"
            INSERT INTO leaderboards (id, kind, period_start, period_end, is_current)
            VALUES ($1, 'WEEKLY', $2, $3, TRUE)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(next_start)
        .bind(next_end)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl StandingsStore for PgStore {
    async fn apply_standings(&self, update: &StandingsUpdate) -> EngineResult<bool> {
        let mut tx = self.begin().await?;

        let claimed = sqlx::query(
            "INSERT INTO idempotency_keys (key, created_at) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(&update.idempotency_key)
        .bind(update.played_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if claimed == 0 {
            tx.rollback().await.ok();
            return Ok(false);
        }

        if let Some(season_id) = update.season_id {
            let fresh = SeasonEntry::new(season_id, update.user_id);
            sqlx::query(
                r#"
                INSERT INTO season_entries (id, user_id, season_id)
                VALUES ($1, $2, $3)
                ON CONFLICT (season_id, user_id) DO NOTHING
                "#,
            )
            .bind(fresh.id)
            .bind(update.user_id)
            .bind(season_id)
            .execute(&mut *tx)
            .await?;

            let mut entry = sqlx::query_as::<_, SeasonEntry>(
                "SELECT * FROM season_entries WHERE season_id = $1 AND user_id = $2",
            )
            .bind(season_id)
            .bind(update.user_id)
            .fetch_one(&mut *tx)
            .await?;
            let expected = entry.version;
            rank::record_match(&mut entry, update.outcome, update.played_at);

            let written = sqlx::query(
                r#"
                UPDATE season_entries
                   SET rank_points = $3, current_rank = $4, is_placed = $5,
                       matches_played = $6, wins = $7, losses = $8, draws = $9,
                       last_match_at = $10, version = version + 1
                 WHERE id = $1 AND version = $2
                "#,
            )
            .bind(entry.id)
            .bind(expected)
            .bind(entry.rank_points)
            .bind(entry.current_rank.as_str())
            .bind(entry.is_placed)
            .bind(entry.matches_played)
            .bind(entry.wins)
            .bind(entry.losses)
            .bind(entry.draws)
            .bind(entry.last_match_at)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if written == 0 {
                tx.rollback().await.ok();
                return Err(EngineError::conflict("season_entry", entry.id));
            }
        }

        for &lb_id in &update.leaderboard_ids {
            sqlx::query(
                r#"
                INSERT INTO leaderboard_entries (leaderboard_id, user_id, updated_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (leaderboard_id, user_id) DO NOTHING
                "#,
            )
            .bind(lb_id)
            .bind(update.user_id)
            .bind(update.played_at)
            .execute(&mut *tx)
            .await?;

            let mut entry = sqlx::query_as::<_, LeaderboardEntry>(
                "SELECT * FROM leaderboard_entries \
                 WHERE leaderboard_id = $1 AND user_id = $2 FOR UPDATE",
            )
            .bind(lb_id)
            .bind(update.user_id)
            .fetch_one(&mut *tx)
            .await?;
            ranking::record_match(&mut entry, update.outcome, update.played_at);

            sqlx::query(
                r#"
                UPDATE leaderboard_entries
                   SET score = $3, wins = $4, losses = $5, draws = $6, matches_played = $7,
                       win_rate = $8, current_streak = $9, best_streak = $10, updated_at = $11
                 WHERE leaderboard_id = $1 AND user_id = $2
                "#,
            )
            .bind(lb_id)
            .bind(update.user_id)
            .bind(entry.score)
            .bind(entry.wins)
            .bind(entry.losses)
            .bind(entry.draws)
            .bind(entry.matches_played)
            .bind(entry.win_rate)
            .bind(entry.current_streak)
            .bind(entry.best_streak)
            .bind(entry.updated_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}
