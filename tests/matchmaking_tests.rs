mod common;

use chrono::Duration;
use common::*;
use duelbook_server::db::models::{MatchStatus, TransactionType};
use duelbook_server::db::store::{MatchmakingStore, NewQueueEntry, WalletStore};
use duelbook_server::error::EngineError;
use duelbook_server::protocol::OutboundEvent;
use uuid::Uuid;

fn entry(user_id: Uuid, stake: i64, rating: i32, region: &str) -> NewQueueEntry {
    NewQueueEntry {
        user_id,
        slip_id: Uuid::new_v4(),
        stake_amount: stake,
        skill_rating: rating,
        region: region.to_owned(),
    }
}

#[tokio::test]
async fn compatible_entries_become_a_locked_match() {
    let (engine, mem) = engine();
    let (alice, bob) = (Uuid::new_v4(), Uuid::new_v4());
    mem.store.create_wallet(alice, 1_000);
    mem.store.create_wallet(bob, 1_000);

    let first = engine
        .store
        .join_queue(&entry(alice, 250, 1210, "eu"), t0())
        .await
        .unwrap();
    engine
        .store
        .join_queue(&entry(bob, 250, 1290, "eu"), t0() + Duration::seconds(5))
        .await
        .unwrap();

    let report = engine.matchmaking.run_once(t0() + Duration::seconds(10)).await.unwrap();
    assert_eq!(report.claimed, 2);
    assert_eq!(report.paired, 1);
    assert_eq!(report.released, 0);
    assert!(mem.store.queue_entries().is_empty());

    let matches = mem.store.matches();
    assert_eq!(matches.len(), 1);
    let m = &matches[0];
    assert_eq!(m.status, MatchStatus::Locked);
    assert_eq!(m.creator_id, alice, "the longer-waiting entry creates");
    assert_eq!(m.creator_slip_id, first.slip_id);
    assert_eq!(m.stake_amount, 250);

    let wallet = engine.store.wallet_for_user(bob).await.unwrap().unwrap();
    assert_eq!(wallet.paid_balance, 750);
    let entries: Vec<_> = mem
        .store
        .transactions()
        .into_iter()
        .filter(|t| t.tx_type == TransactionType::MatchEntry)
        .collect();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|t| t.amount == -250));

    settle_notifications().await;
    assert_eq!(
        mem.sink.sent_to(alice),
        vec![OutboundEvent::MatchCreated {
            match_id: m.id,
            opponent_id: bob,
            stake_amount: 250,
        }]
    );
    assert_eq!(mem.sink.sent_to(bob).len(), 1);
}

#[tokio::test]
async fn incompatible_entries_are_released_for_the_next_run() {
    let (engine, mem) = engine();
    let users: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
    for u in &users {
        mem.store.create_wallet(*u, 1_000);
    }
    // different stake, different region, different skill band
    engine.store.join_queue(&entry(users[0], 100, 1000, "eu"), t0()).await.unwrap();
    engine.store.join_queue(&entry(users[1], 200, 1000, "eu"), t0()).await.unwrap();
    engine.store.join_queue(&entry(users[2], 100, 1000, "us"), t0()).await.unwrap();

    let report = engine.matchmaking.run_once(t0()).await.unwrap();
    assert_eq!(report.paired, 0);
    assert_eq!(report.released, 3);
    assert!(mem.store.matches().is_empty());
    assert!(mem
        .store
        .queue_entries()
        .iter()
        .all(|e| e.claimed_by.is_none()));
}

#[tokio::test]
async fn one_player_is_never_matched_against_themself() {
    let (engine, mem) = engine();
    let solo = Uuid::new_v4();
    mem.store.create_wallet(solo, 1_000);
    engine.store.join_queue(&entry(solo, 100, 1000, "eu"), t0()).await.unwrap();
    engine.store.join_queue(&entry(solo, 100, 1000, "eu"), t0()).await.unwrap();

    let report = engine.matchmaking.run_once(t0()).await.unwrap();
    assert_eq!(report.paired, 0);
    assert_eq!(mem.store.queue_entries().len(), 2);
}

#[tokio::test]
async fn entries_claimed_elsewhere_wait_for_the_claim_to_expire() {
    let (engine, mem) = engine();
    for _ in 0..2 {
        let u = Uuid::new_v4();
        mem.store.create_wallet(u, 1_000);
        engine.store.join_queue(&entry(u, 100, 1000, "eu"), t0()).await.unwrap();
    }
    let other = engine
        .store
        .claim_queue_entries("other-worker", t0(), t0() + Duration::seconds(30), 10)
        .await
        .unwrap();
    assert_eq!(other.len(), 2);

    let blocked = engine.matchmaking.run_once(t0() + Duration::seconds(5)).await.unwrap();
    assert_eq!(blocked.claimed, 0);

    let after = engine.matchmaking.run_once(t0() + Duration::seconds(31)).await.unwrap();
    assert_eq!(after.paired, 1);
}

#[tokio::test]
async fn a_stolen_claim_aborts_the_pair() {
    let (engine, mem) = engine();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    mem.store.create_wallet(a, 1_000);
    mem.store.create_wallet(b, 1_000);
    engine.store.join_queue(&entry(a, 100, 1000, "eu"), t0()).await.unwrap();
    engine.store.join_queue(&entry(b, 100, 1000, "eu"), t0()).await.unwrap();

    let claimed = engine
        .store
        .claim_queue_entries("w1", t0(), t0() + Duration::seconds(30), 10)
        .await
        .unwrap();
    mem.store.steal_claim(claimed[1].id, "w2");

    let err = engine
        .store
        .create_match_from_pair(&claimed[0], &claimed[1], "w1", t0())
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert!(mem.store.matches().is_empty());
    assert_eq!(mem.store.queue_entries().len(), 2);
}

#[tokio::test]
async fn joining_twice_with_one_slip_debits_once() {
    let (engine, mem) = engine();
    let u = Uuid::new_v4();
    mem.store.create_wallet(u, 1_000);
    let req = entry(u, 300, 1000, "eu");

    engine.store.join_queue(&req, t0()).await.unwrap();
    let err = engine.store.join_queue(&req, t0()).await.unwrap_err();
    assert!(matches!(err, EngineError::AlreadyDone(_)));

    let wallet = engine.store.wallet_for_user(u).await.unwrap().unwrap();
    assert_eq!(wallet.paid_balance, 700);
    assert_eq!(mem.store.queue_entries().len(), 1);
}

#[tokio::test]
async fn stake_above_balance_is_refused() {
    let (engine, mem) = engine();
    let u = Uuid::new_v4();
    mem.store.create_wallet(u, 50);

    let err = engine
        .store
        .join_queue(&entry(u, 100, 1000, "eu"), t0())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "unexpected");
    assert!(mem.store.queue_entries().is_empty());
    assert!(mem.store.transactions().is_empty());
}
