use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::PgStore;
use crate::db::models::{Match, MatchmakingQueueEntry, TransactionType, Wallet};
use crate::db::store::{MatchmakingStore, NewQueueEntry};
use crate::error::{EngineError, EngineResult};
use crate::idempotency;

#[async_trait]
impl MatchmakingStore for PgStore {
    async fn join_queue(
        &self,
        entry: &NewQueueEntry,
        now: DateTime<Utc>,
    ) -> EngineResult<MatchmakingQueueEntry> {
        let key = idempotency::entry_key(entry.slip_id);
        let mut tx = self.begin().await?;

        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
            .bind(entry.user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| EngineError::not_found("wallet", entry.user_id))?;
        if wallet.paid_balance < entry.stake_amount {
            tx.rollback().await.ok();
            return Err(EngineError::unexpected(format!(
                "insufficient balance for user {}",
                entry.user_id
            )));
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO transactions
                (id, wallet_id, tx_type, amount, balance_before, balance_after,
                 idempotency_key, reference_id, completed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (idempotency_key) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(wallet.id)
        .bind(TransactionType::MatchEntry.as_str())
        .bind(-entry.stake_amount)
        .bind(wallet.total())
        .bind(wallet.total() - entry.stake_amount)
        .bind(&key)
        .bind(entry.slip_id)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if inserted == 0 {
            tx.rollback().await.ok();
            return Err(EngineError::AlreadyDone(format!("slip {} queued", entry.slip_id)));
        }

        let debited = sqlx::query(
            r#"
            UPDATE wallets
               SET paid_balance = paid_balance - $3, version = version + 1, updated_at = $4
             WHERE id = $1 AND version = $2
            "#,
        )
        .bind(wallet.id)
        .bind(wallet.version)
        .bind(entry.stake_amount)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if debited == 0 {
            tx.rollback().await.ok();
            return Err(EngineError::conflict("wallet", wallet.id));
        }

        let row = sqlx::query_as::<_, MatchmakingQueueEntry>(
            r#"
            INSERT INTO matchmaking_queue
                (id, user_id, slip_id, stake_amount, skill_rating, region, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.slip_id)
        .bind(entry.stake_amount)
        .bind(entry.skill_rating)
        .bind(&entry.region)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn claim_queue_entries(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
        claim_until: DateTime<Utc>,
        limit: i64,
    ) -> EngineResult<Vec<MatchmakingQueueEntry>> {
        let mut rows = sqlx::query_as::<_, MatchmakingQueueEntry>(
            r#"
            UPDATE matchmaking_queue
               SET claimed_by = $1, claim_expires_at = $3, version = version + 1
             WHERE id IN (
                   SELECT id FROM matchmaking_queue
                    WHERE claimed_by IS NULL OR claim_expires_at < $2
                    ORDER BY created_at, id
                    LIMIT $4
                    FOR UPDATE SKIP LOCKED)
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(claim_until)
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        rows.sort_by_key(|e| (e.created_at, e.id));
        Ok(rows)
    }

    async fn release_claim(&self, entry_id: Uuid, worker_id: &str) -> EngineResult<bool> {
        let released = sqlx::query(
            r#"
            UPDATE matchmaking_queue
               SET claimed_by = NULL, claim_expires_at = NULL, version = version + 1
             WHERE id = $1 AND claimed_by = $2
            "#,
        )
        .bind(entry_id)
        .bind(worker_id)
        .execute(self.pool())
        .await?
        .rows_affected();
        Ok(released == 1)
    }

    async fn create_match_from_pair(
        &self,
        creator: &MatchmakingQueueEntry,
        opponent: &MatchmakingQueueEntry,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> EngineResult<Match> {
        let mut tx = self.begin().await?;

        for claimed in [creator, opponent] {
            let removed = sqlx::query(
                "DELETE FROM matchmaking_queue WHERE id = $1 AND claimed_by = $2 AND version = $3",
            )
            .bind(claimed.id)
            .bind(worker_id)
            .bind(claimed.version)
            .execute(&mut *tx)
            .await?
            .rows_affected();
            if removed == 0 {
                tx.rollback().await.ok();
                return Err(EngineError::conflict("matchmaking_queue", claimed.id));
            }
        }

        let m = sqlx::query_as::<_, Match>(
            r#"
            INSERT INTO matches
                (id, creator_id, opponent_id, creator_slip_id, opponent_slip_id,
                 stake_amount, status, version, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, 'locked', 1, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(creator.user_id)
        .bind(opponent.user_id)
        .bind(creator.slip_id)
        .bind(opponent.slip_id)
        .bind(creator.stake_amount)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(m)
    }
}
