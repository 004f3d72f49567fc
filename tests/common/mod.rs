//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use duelbook_server::app::{Engine, MemoryBackends};
use duelbook_server::config::{Backend, Settings};
use duelbook_server::db::memory::sport_event;
use duelbook_server::db::models::{
    EventStatus, EventUpdate, Match, MatchStatus, PickSelection,
};
use duelbook_server::db::store::{MatchStore, WalletStore};
use duelbook_server::db::MemoryStore;
use uuid::Uuid;

pub const STAKE: i64 = 100;
/// Wallet balance after the entry debit.
pub const OPENING_BALANCE: i64 = 900;

pub fn settings() -> Settings {
    Settings {
        backend: Backend::Memory,
        worker_poll_interval: Duration::from_millis(10),
        ..Settings::default()
    }
}

pub fn engine() -> (Engine, MemoryBackends) {
    Engine::in_memory(settings())
}

/// Thursday 13 March 2025, 15:00 UTC.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 13, 15, 0, 0).unwrap()
}

/// Notifications are published on detached tasks.
pub async fn settle_notifications() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

/// A seeded two-player match.
pub struct Duel {
    pub match_id: Uuid,
    pub creator: Uuid,
    pub opponent: Uuid,
    /// External ids of the events both slips pick on.
    pub events: Vec<String>,
}

/// Seed a `locked` match over `n_events` scheduled events. The creator picks
/// HOME on every event, the opponent AWAY.
pub fn seed_duel(store: &MemoryStore, n_events: usize) -> Duel {
    let creator = Uuid::new_v4();
    let opponent = Uuid::new_v4();
    store.create_wallet(creator, OPENING_BALANCE);
    store.create_wallet(opponent, OPENING_BALANCE);

    let creator_slip = Uuid::new_v4();
    let opponent_slip = Uuid::new_v4();
    let mut events = Vec::new();
    for i in 0..n_events {
        let external = format!("evt-{}-{i}", Uuid::new_v4().simple());
        let ev = sport_event(&external, EventStatus::Scheduled, t0());
        store.insert_pick(creator_slip, creator, ev.id, PickSelection::Home);
        store.insert_pick(opponent_slip, opponent, ev.id, PickSelection::Away);
        store.insert_event(ev);
        events.push(external);
    }

    let m = Match {
        id: Uuid::new_v4(),
        creator_id: creator,
        opponent_id: opponent,
        creator_slip_id: creator_slip,
        opponent_slip_id: opponent_slip,
        stake_amount: STAKE,
        status: MatchStatus::Locked,
        winner_id: None,
        version: 1,
        creator_points: 0,
        opponent_points: 0,
        settlement_reason: None,
        created_at: t0() - chrono::Duration::hours(1),
        activated_at: None,
        settled_at: None,
    };
    let match_id = m.id;
    store.insert_match(m);

    Duel {
        match_id,
        creator,
        opponent,
        events,
    }
}

pub fn final_score(external: &str, home: i32, away: i32) -> EventUpdate {
    EventUpdate {
        external_event_id: external.to_owned(),
        status: EventStatus::Completed,
        home_score: Some(home),
        away_score: Some(away),
        starts_at: t0(),
        rescheduled_to: None,
    }
}

pub fn status_update(external: &str, status: EventStatus) -> EventUpdate {
    EventUpdate {
        external_event_id: external.to_owned(),
        status,
        home_score: None,
        away_score: None,
        starts_at: t0(),
        rescheduled_to: None,
    }
}

pub async fn balance(engine: &Engine, user: Uuid) -> i64 {
    engine
        .store
        .wallet_for_user(user)
        .await
        .unwrap()
        .expect("wallet")
        .paid_balance
}

pub async fn status_of(engine: &Engine, match_id: Uuid) -> MatchStatus {
    engine
        .store
        .get_match(match_id)
        .await
        .unwrap()
        .expect("match")
        .status
}

/// Run every job currently queued on `queue`, following up jobs it enqueues.
pub async fn drain(engine: &Engine, queue: &str) -> usize {
    engine
        .worker(queue)
        .expect("known queue")
        .drain()
        .await
        .unwrap()
}
