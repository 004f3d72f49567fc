//! Idempotency keys and the short-window dedup set.
//!
//! Financial side effects are keyed by a string that is unique per effect
//! and persisted with the ledger row; a second insert with the same key is a
//! no-op. Non-financial, high-frequency streams (score-feed updates) go
//! through [`TtlSet`] instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

/// Winner credit for a settled match.
pub fn settle_key(match_id: Uuid) -> String {
    format!("settle-{match_id}")
}

/// Stake refund to one participant after a draw.
pub fn draw_refund_key(match_id: Uuid, user_id: Uuid) -> String {
    format!("draw-{match_id}-{user_id}")
}

/// Stake refund to one participant after a void.
pub fn void_refund_key(match_id: Uuid, user_id: Uuid) -> String {
    format!("void-{match_id}-{user_id}")
}

/// Stake debit when a slip joins the matchmaking queue.
pub fn entry_key(slip_id: Uuid) -> String {
    format!("entry-{slip_id}")
}

pub fn standings_key(match_id: Uuid, user_id: Uuid) -> String {
    format!("standings-{match_id}-{user_id}")
}

pub fn season_reward_key(season_id: Uuid, user_id: Uuid) -> String {
    format!("season-reward-{season_id}-{user_id}")
}

/// Job dedup keys. One pending/active job per key.
pub mod dedup {
    use uuid::Uuid;

    pub fn check(match_id: Uuid, event_id: Uuid) -> String {
        format!("check-{match_id}-{event_id}")
    }

    /// Check not tied to one event (admin retry, postponement scan).
    pub fn check_match(match_id: Uuid) -> String {
        format!("check-{match_id}")
    }

    pub fn settle(match_id: Uuid) -> String {
        format!("settle-{match_id}")
    }

    pub fn void(match_id: Uuid) -> String {
        format!("void-{match_id}")
    }

    pub fn standings(match_id: Uuid) -> String {
        format!("standings-{match_id}")
    }

    pub fn rebuild(leaderboard_id: Uuid) -> String {
        format!("rebuild-{leaderboard_id}")
    }

    pub fn end_season(season_id: Uuid) -> String {
        format!("end-season-{season_id}")
    }

    pub fn finalize(season_id: Uuid) -> String {
        format!("finalize-{season_id}")
    }

    pub fn rewards(season_id: Uuid) -> String {
        format!("rewards-{season_id}")
    }
}

/// Sweep expired keys every this many inserts.
const SWEEP_EVERY: u64 = 256;

/// A set whose members expire `ttl` after insertion.
///
/// Expired members are invisible immediately and physically removed by a
/// sweep every [`SWEEP_EVERY`] inserts, so memory stays bounded by the number
/// of distinct keys seen within one window.
pub struct TtlSet {
    ttl: Duration,
    entries: DashMap<String, Instant>,
    inserts: AtomicU64,
}

impl TtlSet {
    pub fn new(ttl: Duration) -> Self {
        TtlSet {
            ttl,
            entries: DashMap::new(),
            inserts: AtomicU64::new(0),
        }
    }

    /// Insert `key`; `true` if it was absent (or expired).
    pub fn insert(&self, key: &str) -> bool {
        self.insert_at(key, Instant::now())
    }

    pub fn insert_at(&self, key: &str, now: Instant) -> bool {
        if self.inserts.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.purge_expired(now);
        }

        let expires_at = now + self.ttl;
        match self.entries.entry(key.to_owned()) {
            Entry::Occupied(mut slot) => {
                if *slot.get() <= now {
                    slot.insert(expires_at);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(expires_at);
                true
            }
        }
    }

    /// Forget `key` so the next insert is accepted.
    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn contains_at(&self, key: &str, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|exp| *exp > now)
    }

    /// Drop every expired member; returns how many were removed.
    pub fn purge_expired(&self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, exp| *exp > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_inside_window_is_rejected() {
        let set = TtlSet::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(set.insert_at("evt-1:LIVE:1-0", t0));
        assert!(!set.insert_at("evt-1:LIVE:1-0", t0 + Duration::from_secs(10)));
        assert!(set.insert_at("evt-1:LIVE:2-0", t0 + Duration::from_secs(10)));
    }

    #[test]
    fn key_is_accepted_again_after_expiry() {
        let set = TtlSet::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(set.insert_at("k", t0));
        assert!(!set.contains_at("k", t0 + Duration::from_secs(31)));
        assert!(set.insert_at("k", t0 + Duration::from_secs(31)));
    }

    #[test]
    fn removed_key_is_accepted_inside_the_window() {
        let set = TtlSet::new(Duration::from_secs(30));
        let t0 = Instant::now();
        assert!(set.insert_at("k", t0));
        assert!(set.remove("k"));
        assert!(set.insert_at("k", t0 + Duration::from_secs(1)));
        assert!(!set.remove("missing"));
    }

    #[test]
    fn purge_removes_only_expired() {
        let set = TtlSet::new(Duration::from_secs(5));
        let t0 = Instant::now();
        set.insert_at("old", t0);
        set.insert_at("new", t0 + Duration::from_secs(4));
        assert_eq!(set.purge_expired(t0 + Duration::from_secs(6)), 1);
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn keys_are_namespaced_per_effect() {
        let m = Uuid::new_v4();
        let u = Uuid::new_v4();
        assert_ne!(draw_refund_key(m, u), void_refund_key(m, u));
        assert_eq!(settle_key(m), format!("settle-{m}"));
    }
}
