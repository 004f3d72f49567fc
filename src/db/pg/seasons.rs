use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::wallets::apply_credit;
use super::PgStore;
use crate::db::models::{RankTier, Season, SeasonEntry, SeasonStatus, TransactionType};
use crate::db::store::{SeasonStore, WalletCredit};
use crate::error::{EngineError, EngineResult};
use crate::idempotency;

#[async_trait]
impl SeasonStore for PgStore {
    async fn get_season(&self, id: Uuid) -> EngineResult<Option<Season>> {
        let s = sqlx::query_as::<_, Season>("SELECT * FROM seasons WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(s)
    }

    async fn seasons_by_status(&self, status: SeasonStatus) -> EngineResult<Vec<Season>> {
        let rows = sqlx::query_as::<_, Season>(
            "SELECT * FROM seasons WHERE status = $1 ORDER BY starts_at",
        )
        .bind(status.as_str())
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn activate_season(&self, id: Uuid, _now: DateTime<Utc>) -> EngineResult<bool> {
        let n = sqlx::query("UPDATE seasons SET status = 'ACTIVE' WHERE id = $1 AND status = 'UPCOMING'")
            .bind(id)
            .execute(self.pool())
            .await?
            .rows_affected();
        if n == 0 && self.get_season(id).await?.is_none() {
            return Err(EngineError::not_found("season", id));
        }
        Ok(n == 1)
    }

    async fn season_entry(
        &self,
        season_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<Option<SeasonEntry>> {
        let e = sqlx::query_as::<_, SeasonEntry>(
            "SELECT * FROM season_entries WHERE season_id = $1 AND user_id = $2",
        )
        .bind(season_id)
        .bind(user_id)
        .fetch_optional(self.pool())
        .await?;
        Ok(e)
    }

    async fn season_entries(&self, season_id: Uuid) -> EngineResult<Vec<SeasonEntry>> {
        let rows = sqlx::query_as::<_, SeasonEntry>(
            "SELECT * FROM season_entries WHERE season_id = $1 ORDER BY rank_points DESC, user_id",
        )
        .bind(season_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn decay_candidates(
        &self,
        season_id: Uuid,
        inactive_before: DateTime<Utc>,
        day_start: DateTime<Utc>,
    ) -> EngineResult<Vec<SeasonEntry>> {
        let rows = sqlx::query_as::<_, SeasonEntry>(
            r#"
            SELECT * FROM season_entries
             WHERE season_id = $1
               AND rank_points > 0
               AND (last_match_at IS NULL OR last_match_at < $2)
               AND (last_decay_at IS NULL OR last_decay_at < $3)
            "#,
        )
        .bind(season_id)
        .bind(inactive_before)
        .bind(day_start)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    async fn apply_decay(
        &self,
        entry_id: Uuid,
        expected_version: i32,
        rank_points: i32,
        tier: RankTier,
        now: DateTime<Utc>,
    ) -> EngineResult<bool> {
        let n = sqlx::query(
            r#"
            UPDATE season_entries
               SET rank_points = $3, current_rank = $4, last_decay_at = $5, version = version + 1
             WHERE id = $1 AND version = $2
            "#,
        )
        .bind(entry_id)
        .bind(expected_version)
        .bind(rank_points)
        .bind(tier.as_str())
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(n == 1)
    }

    async fn end_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<bool> {
        let n = sqlx::query(
            "UPDATE seasons SET status = 'ENDED', ended_at = $2 WHERE id = $1 AND status = 'ACTIVE'",
        )
        .bind(id)
        .bind(now)
        .execute(self.pool())
        .await?
        .rows_affected();
        if n == 0 && self.get_season(id).await?.is_none() {
            return Err(EngineError::not_found("season", id));
        }
        Ok(n == 1)
    }

    async fn finalize_season(&self, id: Uuid, now: DateTime<Utc>) -> EngineResult<Option<usize>> {
        let mut tx = self.begin().await?;

        let season = sqlx::query_as::<_, Season>("SELECT * FROM seasons WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found("season", id))?;
        if season.finalized_at.is_some() {
            tx.rollback().await.ok();
            return Ok(None);
        }
        if season.status != SeasonStatus::Ended {
            tx.rollback().await.ok();
            return Err(EngineError::NotReady(format!("season {id} has not ended")));
        }

        let frozen = sqlx::query(
            r#"
            UPDATE season_entries se
               SET final_rank = se.current_rank,
                   final_rank_points = se.rank_points,
                   rank_position = r.pos,
                   version = se.version + 1
              FROM (SELECT id, (DENSE_RANK() OVER (ORDER BY rank_points DESC))::INT AS pos
                      FROM season_entries
                     WHERE season_id = $1) r
             WHERE se.id = r.id
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query("UPDATE seasons SET finalized_at = $2 WHERE id = $1 AND finalized_at IS NULL")
            .bind(id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(frozen as usize))
    }

    async fn distribute_rewards(
        &self,
        id: Uuid,
        reward_for: fn(RankTier) -> i64,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<Vec<(Uuid, i64)>>> {
        let mut tx = self.begin().await?;

        let marked = sqlx::query(
            r#"
            UPDATE seasons SET rewards_distributed_at = $2
             WHERE id = $1 AND finalized_at IS NOT NULL AND rewards_distributed_at IS NULL
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if marked == 0 {
            tx.rollback().await.ok();
            return match self.get_season(id).await? {
                None => Err(EngineError::not_found("season", id)),
                Some(s) if s.finalized_at.is_none() => {
                    Err(EngineError::NotReady(format!("season {id} not finalized")))
                }
                Some(_) => Ok(None),
            };
        }

        let placed = sqlx::query_as::<_, SeasonEntry>(
            "SELECT * FROM season_entries WHERE season_id = $1 AND is_placed AND final_rank IS NOT NULL",
        )
        .bind(id)
        .fetch_all(&mut *tx)
        .await?;

        let mut paid = Vec::with_capacity(placed.len());
        for entry in placed {
            let Some(tier) = entry.final_rank.as_deref().and_then(|r| r.parse::<RankTier>().ok())
            else {
                continue;
            };
            let amount = reward_for(tier);
            if amount <= 0 {
                continue;
            }
            let credit = WalletCredit {
                user_id: entry.user_id,
                amount,
                tx_type: TransactionType::SeasonReward,
                idempotency_key: idempotency::season_reward_key(id, entry.user_id),
                reference_id: Some(id),
                to_bonus: true,
            };
            match apply_credit(&mut *tx, &credit, now).await {
                Ok(true) => paid.push((entry.user_id, amount)),
                Ok(false) => {}
                Err(EngineError::NotFound { .. }) => {
                    log::warn!("season {id}: no wallet for {}, reward skipped", entry.user_id);
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(Some(paid))
    }
}
