use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use uuid::Uuid;

use super::PgStore;
use crate::db::models::{Wallet, WalletTransaction};
use crate::db::store::{WalletCredit, WalletStore};
use crate::error::{EngineError, EngineResult};

/// Apply one keyed credit on an open transaction. `Ok(false)` means the key
/// was already consumed and nothing changed.
pub(super) async fn apply_credit(
    conn: &mut PgConnection,
    credit: &WalletCredit,
    now: DateTime<Utc>,
) -> EngineResult<bool> {
    let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1 FOR UPDATE")
        .bind(credit.user_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| EngineError::not_found("wallet", credit.user_id))?;

    let (paid, bonus) = if credit.to_bonus {
        (wallet.paid_balance, wallet.bonus_balance + credit.amount)
    } else {
        (wallet.paid_balance + credit.amount, wallet.bonus_balance)
    };

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
    .bind(credit.tx_type.as_str())
    .bind(credit.amount)
    .bind(wallet.total())
    .bind(paid + bonus)
    .bind(&credit.idempotency_key)
    .bind(credit.reference_id)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if inserted == 0 {
        return Ok(false);
    }

    let updated = sqlx::query(
        r#"
        UPDATE wallets
           SET paid_balance = $3, bonus_balance = $4, version = version + 1, updated_at = $5
         WHERE id = $1 AND version = $2
        "#,
    )
    .bind(wallet.id)
    .bind(wallet.version)
    .bind(paid)
    .bind(bonus)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(EngineError::conflict("wallet", wallet.id));
    }
    Ok(true)
}

#[async_trait]
impl WalletStore for PgStore {
    async fn wallet_for_user(&self, user_id: Uuid) -> EngineResult<Option<Wallet>> {
        let wallet = sqlx::query_as::<_, Wallet>("SELECT * FROM wallets WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await
            .context("fetching wallet")?;
        Ok(wallet)
    }

    async fn wallet_transactions(&self, wallet_id: Uuid) -> EngineResult<Vec<WalletTransaction>> {
        let rows = sqlx::query_as::<_, WalletTransaction>(
            "SELECT * FROM transactions WHERE wallet_id = $1 ORDER BY completed_at, id",
        )
        .bind(wallet_id)
        .fetch_all(self.pool())
        .await
        .context("listing wallet transactions")?;
        Ok(rows)
    }
}
