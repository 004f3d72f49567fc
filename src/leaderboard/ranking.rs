//! Deterministic leaderboard ordering.
//!
//! True rank is always `(score desc, win_rate desc, matches_played desc)`,
//! with `user_id` descending as the final tie-break so that the Redis sorted
//! set (ZREVRANGE orders equal scores by member descending) and the SQL live
//! query agree on every fixture.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::db::models::{LeaderboardEntry, RankedEntry};
use crate::db::store::MatchOutcome;

pub const WIN_SCORE: i64 = 3;
pub const DRAW_SCORE: i64 = 1;
pub const LOSS_SCORE: i64 = 0;

/// Cap applied to `matches_played` inside the composite score.
pub const MATCHES_CAP: i32 = 999;

/// Win percentage rounded to one decimal place.
pub fn win_rate(wins: i32, played: i32) -> f64 {
    if played <= 0 {
        return 0.0;
    }
    (f64::from(wins) * 1000.0 / f64::from(played)).round() / 10.0
}

/// Single sortable key encoding the three tie-break levels.
pub fn composite_score(score: i64, win_rate: f64, matches_played: i32) -> f64 {
    let rate_tenths = (win_rate * 10.0).round().clamp(0.0, 1000.0);
    let played = matches_played.clamp(0, MATCHES_CAP);
    score as f64 * 1e7 + rate_tenths * 1e3 + f64::from(played)
}

pub fn entry_composite(e: &LeaderboardEntry) -> f64 {
    composite_score(e.score, e.win_rate, e.matches_played)
}

/// Ordering used by every read path. `Less` means "ranks higher".
pub fn compare(a: &LeaderboardEntry, b: &LeaderboardEntry) -> Ordering {
    entry_composite(b)
        .total_cmp(&entry_composite(a))
        .then_with(|| b.user_id.cmp(&a.user_id))
}

/// Sort and number entries starting at rank 1.
pub fn rank_entries(mut entries: Vec<LeaderboardEntry>) -> Vec<RankedEntry> {
    entries.sort_by(compare);
    entries
        .iter()
        .enumerate()
        .map(|(i, e)| RankedEntry::from_entry(i as i64 + 1, e))
        .collect()
}

/// Fold one settled match into a leaderboard entry.
pub fn record_match(entry: &mut LeaderboardEntry, outcome: MatchOutcome, now: DateTime<Utc>) {
    entry.matches_played += 1;
    match outcome {
        MatchOutcome::Win => {
            entry.wins += 1;
            entry.score += WIN_SCORE;
            entry.current_streak += 1;
        }
        MatchOutcome::Draw => {
            entry.draws += 1;
            entry.score += DRAW_SCORE;
            entry.current_streak = 0;
        }
        MatchOutcome::Loss => {
            entry.losses += 1;
            entry.score += LOSS_SCORE;
            entry.current_streak = 0;
        }
    }
    entry.best_streak = entry.best_streak.max(entry.current_streak);
    entry.win_rate = win_rate(entry.wins, entry.matches_played);
    entry.updated_at = now;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn entry(score: i64, wins: i32, played: i32) -> LeaderboardEntry {
        let mut e = LeaderboardEntry::new(Uuid::nil(), Uuid::new_v4(), Utc::now());
        e.score = score;
        e.wins = wins;
        e.matches_played = played;
        e.win_rate = win_rate(wins, played);
        e
    }

    #[test]
    fn win_rate_rounds_to_one_decimal() {
        assert_eq!(win_rate(1, 3), 33.3);
        assert_eq!(win_rate(2, 3), 66.7);
        assert_eq!(win_rate(0, 0), 0.0);
    }

    #[test]
    fn score_dominates_win_rate_and_volume() {
        let high_score = entry(10, 1, 10);
        let better_rate = entry(9, 999, 999);
        assert!(entry_composite(&high_score) > entry_composite(&better_rate));
        assert_eq!(compare(&high_score, &better_rate), Ordering::Less);
    }

    #[test]
    fn win_rate_then_matches_break_ties() {
        let a = entry(6, 2, 2); // 100%
        let b = entry(6, 2, 4); // 50%
        assert_eq!(compare(&a, &b), Ordering::Less);

        let c = entry(6, 2, 4);
        let d = entry(6, 4, 8); // same 50%, more matches
        assert_eq!(compare(&d, &c), Ordering::Less);
    }

    #[test]
    fn streaks_reset_on_draw_and_loss() {
        let mut e = entry(0, 0, 0);
        let now = Utc::now();
        record_match(&mut e, MatchOutcome::Win, now);
        record_match(&mut e, MatchOutcome::Win, now);
        record_match(&mut e, MatchOutcome::Draw, now);
        record_match(&mut e, MatchOutcome::Win, now);
        assert_eq!(e.current_streak, 1);
        assert_eq!(e.best_streak, 2);
        assert_eq!(e.score, 3 * WIN_SCORE + DRAW_SCORE);
        assert_eq!(e.win_rate, 75.0);
    }
}
