// Runs against a real Postgres: `DATABASE_URL=... cargo test -- --ignored`

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dotenvy::dotenv;
use duelbook_server::db::models::{EventStatus, EventUpdate, MatchStatus, TransactionType};
use duelbook_server::db::store::{MatchStore, WalletStore};
use duelbook_server::db::PgStore;
use duelbook_server::settlement::{CorrectPickEvaluator, SettleOutcome, SettlementService};
use sqlx::PgPool;
use uuid::Uuid;

async fn pool() -> PgPool {
    dotenv().ok();
    let database_url =
        std::env::var("DATABASE_URL").expect("DATABASE_URL must be set in .env for tests");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("DB connection failed");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("migrations");
    pool
}

async fn wallet(pool: &PgPool, user: Uuid, balance: i64) {
    sqlx::query("INSERT INTO wallets (id, user_id, paid_balance) VALUES ($1, $2, $3)")
        .bind(Uuid::new_v4())
        .bind(user)
        .bind(balance)
        .execute(pool)
        .await
        .expect("insert wallet");
}

#[tokio::test]
#[ignore]
async fn settlement_commits_match_and_wallet_together() {
    let pool = pool().await;
    let store = Arc::new(PgStore::new(pool.clone(), Duration::from_secs(5)));
    let service = SettlementService::new(store.clone(), Arc::new(CorrectPickEvaluator));

    let (creator, opponent) = (Uuid::new_v4(), Uuid::new_v4());
    wallet(&pool, creator, 500).await;
    wallet(&pool, opponent, 500).await;

    let external = format!("pg-{}", Uuid::new_v4().simple());
    let event = store
        .upsert_event(
            &EventUpdate {
                external_event_id: external,
                status: EventStatus::Completed,
                home_score: Some(0),
                away_score: Some(2),
                starts_at: Utc::now(),
                rescheduled_to: None,
            },
            Utc::now(),
        )
        .await
        .expect("upsert event");

    let (creator_slip, opponent_slip) = (Uuid::new_v4(), Uuid::new_v4());
    for (slip, user, selection) in [
        (creator_slip, creator, "HOME"),
        (opponent_slip, opponent, "AWAY"),
    ] {
        sqlx::query(
            "INSERT INTO picks (id, slip_id, user_id, event_id, selection) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(Uuid::new_v4())
        .bind(slip)
        .bind(user)
        .bind(event.id)
        .bind(selection)
        .execute(&pool)
        .await
        .expect("insert pick");
    }

    let match_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO matches (id, creator_id, opponent_id, creator_slip_id, opponent_slip_id, stake_amount, status, activated_at) \
         VALUES ($1, $2, $3, $4, $5, 50, 'active', now())",
    )
    .bind(match_id)
    .bind(creator)
    .bind(opponent)
    .bind(creator_slip)
    .bind(opponent_slip)
    .execute(&pool)
    .await
    .expect("insert match");

    let outcome = service.settle(match_id, Utc::now()).await.expect("settle");
    assert!(matches!(outcome, SettleOutcome::Settled(ref r) if r.winner_id == Some(opponent)));
    let again = service.settle(match_id, Utc::now()).await.expect("settle again");
    assert_eq!(again, SettleOutcome::AlreadyFinal(MatchStatus::Settled));

    let m = store.get_match(match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Settled);
    assert_eq!(m.version, 2);

    let w = store.wallet_for_user(opponent).await.unwrap().unwrap();
    assert_eq!(w.paid_balance, 600);
    let txs = store.wallet_transactions(w.id).await.unwrap();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].tx_type, TransactionType::MatchWin);
}
