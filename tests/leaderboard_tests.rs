mod common;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use common::*;
use duelbook_server::db::models::{
    Leaderboard, LeaderboardEntry, LeaderboardKind, MatchStatus, SeasonStatus,
};
use duelbook_server::db::store::{LeaderboardStore, SeasonStore};
use duelbook_server::leaderboard::{week_bounds, PageSource};
use duelbook_server::queue::{self, jobs};
use duelbook_server::settlement::SettlementResult;
use uuid::Uuid;

fn board(kind: LeaderboardKind, now: DateTime<Utc>) -> Leaderboard {
    let (start, end) = week_bounds(now);
    Leaderboard {
        id: Uuid::new_v4(),
        kind,
        period_start: start,
        period_end: (kind == LeaderboardKind::Weekly).then_some(end),
        is_current: true,
    }
}

fn ranked_entry(board: Uuid, score: i64, wins: i32, played: i32) -> LeaderboardEntry {
    let mut e = LeaderboardEntry::new(board, Uuid::new_v4(), t0());
    e.score = score;
    e.wins = wins;
    e.losses = played - wins;
    e.matches_played = played;
    e.win_rate = duelbook_server::leaderboard::ranking::win_rate(wins, played);
    e
}

fn settled(creator: Uuid, opponent: Uuid, winner: Option<Uuid>) -> SettlementResult {
    SettlementResult {
        match_id: Uuid::new_v4(),
        creator_id: creator,
        opponent_id: opponent,
        winner_id: winner,
        is_draw: winner.is_none(),
        creator_points: 0,
        opponent_points: 0,
        settled_at: t0(),
        reason: "points".into(),
    }
}

#[tokio::test]
async fn standings_apply_once_per_participant() {
    let (engine, mem) = engine();
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
    let result = settled(a, b, Some(a));

    let report = engine.standings.apply(&result).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.leaderboards.len(), 2);

    let replay = engine.standings.apply(&result).await.unwrap();
    assert_eq!(replay.applied, 0);

    for lb in &report.leaderboards {
        let winner = engine.store.leaderboard_entry(*lb, a).await.unwrap().unwrap();
        assert_eq!((winner.score, winner.wins, winner.matches_played), (3, 1, 1));
        assert_eq!(winner.current_streak, 1);
        let loser = engine.store.leaderboard_entry(*lb, b).await.unwrap().unwrap();
        assert_eq!((loser.score, loser.losses), (0, 1));
    }

    // one dedup'd rebuild per board
    assert_eq!(mem.queue.pending_named(queue::LEADERBOARD, jobs::REBUILD).len(), 2);
}

#[tokio::test]
async fn standings_feed_the_active_season() {
    let (engine, mem) = engine();
    let season = duelbook_server::db::models::Season {
        id: Uuid::new_v4(),
        name: "S1".into(),
        status: SeasonStatus::Active,
        starts_at: t0() - Duration::days(10),
        ends_at: t0() + Duration::days(20),
        ended_at: None,
        finalized_at: None,
        rewards_distributed_at: None,
    };
    mem.store.insert_season(season.clone());
    let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

    engine.standings.apply(&settled(a, b, None)).await.unwrap();

    let entry = engine.store.season_entry(season.id, a).await.unwrap().unwrap();
    assert_eq!(entry.draws, 1);
    assert_eq!(entry.rank_points, 5);
    assert_eq!(entry.last_match_at, Some(t0()));
}

#[tokio::test]
async fn settlement_flows_through_to_a_cached_page() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 4, 1), t0())
        .await
        .unwrap();

    drain(&engine, queue::SETTLEMENT).await;
    assert_eq!(status_of(&engine, duel.match_id).await, MatchStatus::Settled);
    assert_eq!(drain(&engine, queue::STANDINGS).await, 1);
    assert_eq!(drain(&engine, queue::LEADERBOARD).await, 2);

    let boards = engine.store.current_leaderboards(Utc::now()).await.unwrap();
    let global = boards
        .iter()
        .find(|b| b.kind == LeaderboardKind::Global)
        .unwrap();
    assert!(mem.cache.is_warm(global.id));

    let page = engine.leaderboards.page(global.id, 0, 9).await.unwrap();
    assert_eq!(page.source, PageSource::Cache);
    assert_eq!(page.entries.len(), 2);
    assert_eq!(page.entries[0].user_id, duel.creator);
    assert_eq!(page.entries[0].rank, 1);
    assert_eq!(page.entries[1].user_id, duel.opponent);
}

#[tokio::test]
async fn ties_break_on_win_rate_then_volume() {
    let (engine, mem) = engine();
    let lb = board(LeaderboardKind::Global, t0());
    mem.store.insert_leaderboard(lb.clone());

    let volume = ranked_entry(lb.id, 6, 2, 4); // 50%, 4 played
    let rate = ranked_entry(lb.id, 6, 2, 2); // 100%
    let small = ranked_entry(lb.id, 6, 1, 2); // 50%, 2 played
    let top = ranked_entry(lb.id, 9, 3, 9);
    for e in [&volume, &rate, &small, &top] {
        mem.store.insert_leaderboard_entry(e.clone());
    }

    let live = engine.leaderboards.page(lb.id, 0, 9).await.unwrap();
    assert_eq!(live.source, PageSource::Live);
    let order: Vec<Uuid> = live.entries.iter().map(|e| e.user_id).collect();
    assert_eq!(order, vec![top.user_id, rate.user_id, volume.user_id, small.user_id]);

    engine.leaderboards.rebuild(lb.id).await.unwrap();
    let cached = engine.leaderboards.page(lb.id, 0, 9).await.unwrap();
    assert_eq!(cached.source, PageSource::Cache);
    assert_eq!(cached.entries, live.entries);

    let tail = engine.leaderboards.page(lb.id, 2, 3).await.unwrap();
    assert_eq!(tail.entries.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![3, 4]);
}

#[tokio::test]
async fn reads_fall_back_to_the_live_query() {
    let (engine, mem) = engine();
    let lb = board(LeaderboardKind::Global, t0());
    mem.store.insert_leaderboard(lb.clone());
    for i in 0..3 {
        mem.store.insert_leaderboard_entry(ranked_entry(lb.id, 3 * i, i as i32, 3));
    }
    engine.leaderboards.rebuild(lb.id).await.unwrap();

    // past the cached bound
    let top_n = engine.settings.leaderboard_top_n;
    let deep = engine.leaderboards.page(lb.id, top_n, top_n + 10).await.unwrap();
    assert_eq!(deep.source, PageSource::Live);
    assert!(deep.entries.is_empty());

    // cache outage
    mem.cache.set_unavailable(true);
    let page = engine.leaderboards.page(lb.id, 0, 2).await.unwrap();
    assert_eq!(page.source, PageSource::Live);
    assert_eq!(page.entries.len(), 3);
    assert!(engine.leaderboards.rebuild(lb.id).await.is_err());
}

#[tokio::test]
async fn unknown_board_is_not_found() {
    let (engine, _mem) = engine();
    let err = engine.leaderboards.page(Uuid::new_v4(), 0, 9).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn weekly_board_rolls_over_once_its_week_ends() {
    let (engine, mem) = engine();
    let weekly = board(LeaderboardKind::Weekly, t0());
    let global = board(LeaderboardKind::Global, t0());
    mem.store.insert_leaderboard(weekly.clone());
    mem.store.insert_leaderboard(global.clone());
    let leader = ranked_entry(weekly.id, 12, 4, 4);
    mem.store.insert_leaderboard_entry(leader.clone());
    mem.store.insert_leaderboard_entry(ranked_entry(weekly.id, 3, 1, 4));

    assert!(engine.leaderboards.weekly_reset(t0()).await.unwrap().is_none());

    let next_week = t0() + Duration::days(7);
    let next = engine
        .leaderboards
        .weekly_reset(next_week)
        .await
        .unwrap()
        .expect("rolled over");
    assert_eq!(next.kind, LeaderboardKind::Weekly);
    assert_eq!(next.period_start, week_bounds(next_week).0);
    assert!(next.is_current);

    let old = engine.store.get_leaderboard(weekly.id).await.unwrap().unwrap();
    assert!(!old.is_current);
    let snap = engine
        .store
        .leaderboard_entry(weekly.id, leader.user_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(snap.previous_rank, Some(1));

    // a second run in the same week finds nothing due
    assert!(engine.leaderboards.weekly_reset(next_week).await.unwrap().is_none());
}

#[tokio::test]
async fn weekly_reset_skips_while_another_worker_holds_the_lock() {
    let (engine, mem) = engine();
    let weekly = board(LeaderboardKind::Weekly, t0());
    mem.store.insert_leaderboard(weekly.clone());
    mem.lock
        .hold("lock:leaderboard:weekly-reset", StdDuration::from_secs(60));

    let rolled = engine
        .leaderboards
        .weekly_reset(t0() + Duration::days(7))
        .await
        .unwrap();
    assert!(rolled.is_none());
    let still = engine.store.get_leaderboard(weekly.id).await.unwrap().unwrap();
    assert!(still.is_current);
}
