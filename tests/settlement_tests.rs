mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use common::*;
use duelbook_server::app::{Backends, Engine, MemoryBackends};
use duelbook_server::db::models::{EventStatus, EventUpdate, MatchStatus, TransactionType};
use duelbook_server::db::store::{MatchStore, SettlementCommit};
use duelbook_server::error::{EngineError, EngineResult};
use duelbook_server::protocol::OutboundEvent;
use duelbook_server::queue::{
    self, jobs, Job, JobHandle, JobOptions, JobQueue, MemoryQueue, QueueCounts,
};
use duelbook_server::settlement::orchestrator::{REASON_CANCELLED, REASON_POSTPONED};
use duelbook_server::settlement::{Ingested, NotReadyReason, SettleOutcome, VoidOutcome};
use futures::future::join_all;
use serde_json::Value;
use uuid::Uuid;

/// Memory queue whose next enqueue fails once `fail_next` is set.
struct UnreliableQueue {
    inner: Arc<MemoryQueue>,
    fail_next: AtomicBool,
}

#[async_trait]
impl JobQueue for UnreliableQueue {
    async fn enqueue(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        opts: JobOptions,
    ) -> EngineResult<JobHandle> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(EngineError::unexpected("redis down"));
        }
        self.inner.enqueue(queue, name, payload, opts).await
    }

    async fn reserve(&self, queue: &str, lease: StdDuration) -> EngineResult<Option<Job>> {
        self.inner.reserve(queue, lease).await
    }

    async fn complete(&self, job: &Job) -> EngineResult<()> {
        self.inner.complete(job).await
    }

    async fn retry_later(&self, job: &Job, delay: StdDuration, error: &str) -> EngineResult<()> {
        self.inner.retry_later(job, delay, error).await
    }

    async fn dead_letter(&self, job: &Job, error: &str) -> EngineResult<()> {
        self.inner.dead_letter(job, error).await
    }

    async fn dead_letters(&self, queue: &str) -> EngineResult<Vec<Job>> {
        self.inner.dead_letters(queue).await
    }

    async fn replay_dead_letter(
        &self,
        queue: &str,
        job_id: &str,
    ) -> EngineResult<Option<JobHandle>> {
        self.inner.replay_dead_letter(queue, job_id).await
    }

    async fn schedule_repeat(
        &self,
        queue: &str,
        name: &str,
        payload: Value,
        every: StdDuration,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<JobHandle>> {
        self.inner.schedule_repeat(queue, name, payload, every, now).await
    }

    async fn counts(&self, queue: &str) -> EngineResult<QueueCounts> {
        self.inner.counts(queue).await
    }
}

/// A duel whose single event is final (HOME wins) and whose match is active,
/// with nothing queued.
async fn ready_duel(engine: &Engine, mem: &MemoryBackends) -> Duel {
    let duel = seed_duel(&mem.store, 1);
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 3, 0), t0())
        .await
        .unwrap();
    assert!(engine.settlement.activate(duel.match_id, t0()).await.unwrap());
    duel
}

#[tokio::test]
async fn creator_with_more_correct_picks_takes_the_pot() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 2);

    for ext in &duel.events {
        let ingested = engine
            .orchestrator
            .ingest_event(&final_score(ext, 2, 1), t0())
            .await
            .unwrap();
        assert!(matches!(ingested, Ingested::Applied { checks: 1, .. }));
    }
    drain(&engine, queue::SETTLEMENT).await;

    let m = engine.store.get_match(duel.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Settled);
    assert_eq!(m.winner_id, Some(duel.creator));
    assert_eq!((m.creator_points, m.opponent_points), (2, 0));
    assert_eq!(m.settlement_reason.as_deref(), Some("points"));

    assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + 2 * STAKE);
    assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE);

    let txs = mem.store.transactions();
    assert_eq!(txs.len(), 1);
    assert_eq!(txs[0].tx_type, TransactionType::MatchWin);
    assert_eq!(txs[0].amount, 2 * STAKE);
    assert_eq!(txs[0].balance_after - txs[0].balance_before, 2 * STAKE);

    // standings follow as a separate job
    assert_eq!(
        mem.queue
            .pending_named(queue::STANDINGS, jobs::UPDATE_STANDINGS)
            .len(),
        1
    );

    settle_notifications().await;
    for user in [duel.creator, duel.opponent] {
        let sent = mem.sink.sent_to(user);
        assert!(
            sent.iter()
                .any(|e| matches!(e, OutboundEvent::MatchSettled(r) if r.match_id == duel.match_id)),
            "no settlement notice for {user}"
        );
    }
}

#[tokio::test]
async fn level_points_refund_both_stakes() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);

    // 1-1: neither HOME nor AWAY is right
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 1, 1), t0())
        .await
        .unwrap();
    drain(&engine, queue::SETTLEMENT).await;

    let m = engine.store.get_match(duel.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Draw);
    assert_eq!(m.winner_id, None);
    assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + STAKE);
    assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE + STAKE);

    let refunds: Vec<_> = mem
        .store
        .transactions()
        .into_iter()
        .filter(|t| t.tx_type == TransactionType::MatchRefund)
        .collect();
    assert_eq!(refunds.len(), 2);
}

#[tokio::test]
async fn settling_twice_changes_nothing() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 0, 3), t0())
        .await
        .unwrap();
    drain(&engine, queue::SETTLEMENT).await;
    assert_eq!(status_of(&engine, duel.match_id).await, MatchStatus::Settled);
    let before = mem.store.transactions().len();

    let again = engine.orchestrator.settle(duel.match_id).await.unwrap();
    assert_eq!(again, SettleOutcome::AlreadyFinal(MatchStatus::Settled));
    let voided = engine.orchestrator.void(duel.match_id, "late").await.unwrap();
    assert_eq!(voided, VoidOutcome::AlreadyFinal(MatchStatus::Settled));

    assert_eq!(mem.store.transactions().len(), before);
    assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE + 2 * STAKE);
    assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE);
}

#[tokio::test]
async fn settle_reports_why_a_match_is_not_ready() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 2);

    let locked = engine.orchestrator.settle(duel.match_id).await.unwrap();
    assert_eq!(
        locked,
        SettleOutcome::NotReady(NotReadyReason::NotActive(MatchStatus::Locked))
    );

    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 2, 0), t0())
        .await
        .unwrap();
    drain(&engine, queue::SETTLEMENT).await;
    assert_eq!(status_of(&engine, duel.match_id).await, MatchStatus::Active);

    let pending = engine.orchestrator.settle(duel.match_id).await.unwrap();
    assert_eq!(pending, SettleOutcome::NotReady(NotReadyReason::EventsPending(1)));
    assert!(mem.store.transactions().is_empty());
}

#[tokio::test]
async fn live_event_activates_without_settling() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);

    engine
        .orchestrator
        .ingest_event(&status_update(&duel.events[0], EventStatus::Live), t0())
        .await
        .unwrap();
    drain(&engine, queue::SETTLEMENT).await;

    let m = engine.store.get_match(duel.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Active);
    assert!(m.activated_at.is_some());
    assert!(mem.queue.pending(queue::SETTLEMENT).is_empty());
}

#[tokio::test]
async fn all_events_cancelled_voids_and_refunds() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 2);

    for ext in &duel.events {
        engine
            .orchestrator
            .ingest_event(&status_update(ext, EventStatus::Cancelled), t0())
            .await
            .unwrap();
    }
    drain(&engine, queue::SETTLEMENT).await;

    let m = engine.store.get_match(duel.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Voided);
    assert_eq!(m.settlement_reason.as_deref(), Some(REASON_CANCELLED));
    assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + STAKE);
    assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE + STAKE);
    assert!(mem.queue.pending(queue::STANDINGS).is_empty());

    settle_notifications().await;
    assert!(mem
        .sink
        .sent_to(duel.opponent)
        .iter()
        .any(|e| matches!(e, OutboundEvent::MatchVoided { reason, .. } if reason == REASON_CANCELLED)));
}

#[tokio::test]
async fn cancelled_events_score_nothing_when_others_complete() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 2);

    engine
        .orchestrator
        .ingest_event(&status_update(&duel.events[0], EventStatus::Cancelled), t0())
        .await
        .unwrap();
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[1], 3, 0), t0())
        .await
        .unwrap();
    drain(&engine, queue::SETTLEMENT).await;

    let m = engine.store.get_match(duel.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Settled);
    assert_eq!((m.creator_points, m.opponent_points), (1, 0));
}

#[tokio::test]
async fn duplicate_feed_updates_are_dropped() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    let update = final_score(&duel.events[0], 1, 0);

    let first = engine.orchestrator.ingest_event(&update, t0()).await.unwrap();
    let second = engine.orchestrator.ingest_event(&update, t0()).await.unwrap();
    assert!(matches!(first, Ingested::Applied { .. }));
    assert_eq!(second, Ingested::Duplicate);
    assert_eq!(
        mem.queue
            .pending_named(queue::SETTLEMENT, jobs::CHECK_SETTLEMENT)
            .len(),
        1
    );
}

#[tokio::test]
async fn resolved_events_never_regress() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    engine
        .orchestrator
        .ingest_event(&final_score(&duel.events[0], 2, 2), t0())
        .await
        .unwrap();
    let late = EventUpdate {
        status: EventStatus::Live,
        ..final_score(&duel.events[0], 0, 0)
    };
    engine.orchestrator.ingest_event(&late, t0()).await.unwrap();

    let snap = engine.settlement.snapshot_by_id(duel.match_id).await.unwrap();
    let ev = snap.events.values().next().unwrap();
    assert_eq!(ev.status, EventStatus::Completed);
    assert_eq!((ev.home_score, ev.away_score), (Some(2), Some(2)));
}

#[tokio::test]
async fn stale_version_commit_is_a_conflict_and_moves_no_money() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    mem.store.bump_match_version(duel.match_id);

    let err = engine
        .store
        .commit_settlement(&SettlementCommit {
            match_id: duel.match_id,
            expected_version: 1,
            status: MatchStatus::Voided,
            winner_id: None,
            creator_points: 0,
            opponent_points: 0,
            reason: "test".into(),
            settled_at: t0(),
            credits: Vec::new(),
        })
        .await
        .unwrap_err();
    assert!(err.is_conflict());
    assert_eq!(status_of(&engine, duel.match_id).await, MatchStatus::Locked);
    assert!(mem.store.transactions().is_empty());
}

#[tokio::test]
async fn completed_event_without_score_ends_in_dead_letters() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    let no_score = EventUpdate {
        home_score: None,
        away_score: None,
        ..final_score(&duel.events[0], 0, 0)
    };
    engine.orchestrator.ingest_event(&no_score, t0()).await.unwrap();

    drain(&engine, queue::SETTLEMENT).await;
    for _ in 0..engine.settings.job_max_attempts {
        mem.queue.promote_delayed(queue::SETTLEMENT);
        drain(&engine, queue::SETTLEMENT).await;
    }

    let dead = engine.queue.dead_letters(queue::SETTLEMENT).await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].name, jobs::SETTLE_MATCH);
    assert!(dead[0]
        .last_error
        .as_deref()
        .is_some_and(|e| e.contains("manual review")));
    assert_eq!(status_of(&engine, duel.match_id).await, MatchStatus::Active);
    assert!(mem.store.transactions().is_empty());
}

#[tokio::test]
async fn postponement_scan_voids_stuck_matches_and_rechecks_rescheduled_ones() {
    let (engine, mem) = engine();
    let stuck = seed_duel(&mem.store, 1);
    let rescheduled = seed_duel(&mem.store, 1);
    let long_ago = t0() - Duration::hours(72);

    for duel in [&stuck, &rescheduled] {
        assert!(engine.settlement.activate(duel.match_id, long_ago).await.unwrap());
    }
    engine
        .orchestrator
        .ingest_event(&status_update(&stuck.events[0], EventStatus::Postponed), t0())
        .await
        .unwrap();
    let later = EventUpdate {
        rescheduled_to: Some(t0() + Duration::days(3)),
        ..status_update(&rescheduled.events[0], EventStatus::Postponed)
    };
    engine.orchestrator.ingest_event(&later, t0()).await.unwrap();

    let report = engine.orchestrator.postponement_scan(t0()).await.unwrap();
    assert_eq!(report.examined, 2);
    assert_eq!(report.voided, 1);
    assert_eq!(report.rechecked, 1);

    drain(&engine, queue::SETTLEMENT).await;
    let m = engine.store.get_match(stuck.match_id).await.unwrap().unwrap();
    assert_eq!(m.status, MatchStatus::Voided);
    assert_eq!(m.settlement_reason.as_deref(), Some(REASON_POSTPONED));
    assert_eq!(status_of(&engine, rescheduled.match_id).await, MatchStatus::Active);
}

#[tokio::test]
async fn admin_void_uses_default_reason_and_retry_needs_a_match() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);

    let outcome = engine.orchestrator.force_void(duel.match_id, None).await.unwrap();
    match outcome {
        VoidOutcome::Voided(v) => assert_eq!(v.reason, "admin"),
        other => panic!("expected a void, got {other:?}"),
    }

    let err = engine.orchestrator.retry(Uuid::new_v4()).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    let handle = engine.orchestrator.retry(duel.match_id).await.unwrap();
    let again = engine.orchestrator.retry(duel.match_id).await.unwrap();
    assert_eq!(handle.id, again.id);
    assert!(again.deduplicated);
}

#[tokio::test]
async fn failed_ingest_does_not_swallow_the_resend() {
    let mem = MemoryBackends::new();
    let duel = seed_duel(&mem.store, 1);
    let queue = Arc::new(UnreliableQueue {
        inner: mem.queue.clone(),
        fail_next: AtomicBool::new(true),
    });
    let engine = Engine::new(
        settings(),
        Backends {
            store: mem.store.clone(),
            queue,
            lock: mem.lock.clone(),
            cache: mem.cache.clone(),
            sink: mem.sink.clone(),
        },
    );
    let update = final_score(&duel.events[0], 2, 0);

    let first = engine.orchestrator.ingest_event(&update, t0()).await;
    assert_eq!(first.unwrap_err().kind(), "unexpected");

    let resend = engine.orchestrator.ingest_event(&update, t0()).await.unwrap();
    assert!(matches!(resend, Ingested::Applied { checks: 1, .. }));
    assert_eq!(
        mem.queue
            .pending_named(queue::SETTLEMENT, jobs::CHECK_SETTLEMENT)
            .len(),
        1
    );

    // once applied, the window holds again
    let third = engine.orchestrator.ingest_event(&update, t0()).await.unwrap();
    assert_eq!(third, Ingested::Duplicate);
}

#[tokio::test]
async fn reschedule_of_a_postponed_event_is_not_a_duplicate() {
    let (engine, mem) = engine();
    let duel = seed_duel(&mem.store, 1);
    let postponed = status_update(&duel.events[0], EventStatus::Postponed);
    let new_date = t0() + Duration::days(2);
    let rescheduled = EventUpdate {
        rescheduled_to: Some(new_date),
        ..postponed.clone()
    };

    let first = engine.orchestrator.ingest_event(&postponed, t0()).await.unwrap();
    let second = engine.orchestrator.ingest_event(&rescheduled, t0()).await.unwrap();
    assert!(matches!(first, Ingested::Applied { .. }));
    assert!(matches!(second, Ingested::Applied { .. }));

    let snap = engine.settlement.snapshot_by_id(duel.match_id).await.unwrap();
    let ev = snap.events.values().next().unwrap();
    assert_eq!(ev.rescheduled_to, Some(new_date));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_settles_credit_the_winner_once() {
    let (engine, mem) = engine();
    let duel = ready_duel(&engine, &mem).await;

    let match_id = duel.match_id;
    let attempts = (0..8).map(|_| {
        let settlement = engine.settlement.clone();
        tokio::spawn(async move { settlement.settle(match_id, Utc::now()).await })
    });
    let results: Vec<_> = join_all(attempts)
        .await
        .into_iter()
        .map(|joined| joined.unwrap())
        .collect();

    let settled = results
        .iter()
        .filter(|r| matches!(r, Ok(SettleOutcome::Settled(_))))
        .count();
    assert_eq!(settled, 1);
    for r in &results {
        match r {
            Ok(SettleOutcome::Settled(_)) => {}
            Ok(SettleOutcome::AlreadyFinal(status)) => assert_eq!(*status, MatchStatus::Settled),
            Err(e) => assert!(e.is_conflict(), "unexpected error {e}"),
            Ok(other) => panic!("unexpected outcome {other:?}"),
        }
    }

    let wins: Vec<_> = mem
        .store
        .transactions()
        .into_iter()
        .filter(|t| t.tx_type == TransactionType::MatchWin)
        .collect();
    assert_eq!(wins.len(), 1);
    assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + 2 * STAKE);
    assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn settle_racing_void_commits_exactly_one_of_them() {
    let (engine, mem) = engine();
    let duel = ready_duel(&engine, &mem).await;

    let mut attempts = Vec::new();
    for i in 0..8 {
        let settlement = engine.settlement.clone();
        let match_id = duel.match_id;
        attempts.push(tokio::spawn(async move {
            if i % 2 == 0 {
                settlement
                    .settle(match_id, Utc::now())
                    .await
                    .map(|o| matches!(o, SettleOutcome::Settled(_)))
            } else {
                settlement
                    .void(match_id, "race", Utc::now())
                    .await
                    .map(|o| matches!(o, VoidOutcome::Voided(_)))
            }
        }));
    }
    let mut committed = 0;
    for joined in join_all(attempts).await {
        match joined.unwrap() {
            Ok(true) => committed += 1,
            Ok(false) => {}
            Err(e) => assert!(e.is_conflict(), "unexpected error {e}"),
        }
    }
    assert_eq!(committed, 1);

    let txs = mem.store.transactions();
    let wins = txs.iter().filter(|t| t.tx_type == TransactionType::MatchWin).count();
    let refunds = txs.iter().filter(|t| t.tx_type == TransactionType::MatchRefund).count();
    match status_of(&engine, duel.match_id).await {
        MatchStatus::Settled => {
            assert_eq!((wins, refunds), (1, 0));
            assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + 2 * STAKE);
        }
        MatchStatus::Voided => {
            assert_eq!((wins, refunds), (0, 2));
            assert_eq!(balance(&engine, duel.creator).await, OPENING_BALANCE + STAKE);
            assert_eq!(balance(&engine, duel.opponent).await, OPENING_BALANCE + STAKE);
        }
        other => panic!("match left {other}"),
    }
}
