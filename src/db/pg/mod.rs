//! Postgres-backed [`Store`](super::store::Store).
//!
//! All queries are runtime-checked (`sqlx::query` / `query_as` + `bind`), so
//! the crate builds without a live database. Multi-row writes run inside one
//! transaction with a `statement_timeout`, and the whole commit is further
//! bounded by a tokio timeout.

mod leaderboards;
mod matches;
mod matchmaking;
mod seasons;
mod wallets;

use std::time::Duration;

use sqlx::{PgPool, Postgres, Transaction};

use crate::error::EngineResult;

pub struct PgStore {
    pool: PgPool,
    tx_timeout: Duration,
}

impl PgStore {
    pub fn new(pool: PgPool, tx_timeout: Duration) -> Self {
        PgStore { pool, tx_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction whose statements are cut off after `tx_timeout`.
    async fn begin(&self) -> EngineResult<Transaction<'static, Postgres>> {
        let mut tx = self.pool.begin().await?;
        let stmt = format!(
            "SET LOCAL statement_timeout = {}",
            self.tx_timeout.as_millis()
        );
        sqlx::query(&stmt).execute(&mut *tx).await?;
        Ok(tx)
    }
}

/// Order used by the live ranked query. Must agree with
/// [`ranking::compare`](crate::leaderboard::ranking::compare).
const RANK_ORDER: &str = "score DESC, ROUND(win_rate * 10) DESC, \
                          LEAST(matches_played, 999) DESC, user_id DESC";
