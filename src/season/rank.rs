//! Season rank-point arithmetic.

use chrono::{DateTime, Duration, Utc};

use crate::db::models::{RankTier, SeasonEntry};
use crate::db::store::MatchOutcome;

pub const WIN_POINTS: i32 = 25;
pub const LOSS_POINTS: i32 = -20;
pub const DRAW_POINTS: i32 = 5;

/// Ranked matches before an entry counts as placed.
pub const PLACEMENT_MATCHES: i32 = 5;

/// Add `delta` to `points`, never going below zero.
pub fn apply_delta(points: i32, delta: i32) -> i32 {
    points.saturating_add(delta).max(0)
}

pub fn outcome_delta(outcome: MatchOutcome) -> i32 {
    match outcome {
        MatchOutcome::Win => WIN_POINTS,
        MatchOutcome::Loss => LOSS_POINTS,
        MatchOutcome::Draw => DRAW_POINTS,
    }
}

/// Fold one settled match into a season entry. The caller persists it with a
/// version-qualified write.
pub fn record_match(entry: &mut SeasonEntry, outcome: MatchOutcome, played_at: DateTime<Utc>) {
    entry.rank_points = apply_delta(entry.rank_points, outcome_delta(outcome));
    entry.current_rank = RankTier::for_points(entry.rank_points);
    entry.matches_played += 1;
    match outcome {
        MatchOutcome::Win => entry.wins += 1,
        MatchOutcome::Loss => entry.losses += 1,
        MatchOutcome::Draw => entry.draws += 1,
    }
    entry.is_placed = entry.is_placed || entry.matches_played >= PLACEMENT_MATCHES;
    if entry.last_match_at.map_or(true, |t| t < played_at) {
        entry.last_match_at = Some(played_at);
    }
}

/// Midnight UTC of the calendar day containing `now`.
pub fn utc_day_start(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .and_hms_opt(0, 0, 0)
        .map(|d| d.and_utc())
        .unwrap_or(now)
}

/// Whether `entry` should lose points in today's decay run.
///
/// At most one application per UTC calendar day, and only for entries
/// inactive for longer than `inactive_days`.
pub fn is_decay_due(entry: &SeasonEntry, now: DateTime<Utc>, inactive_days: i64) -> bool {
    if entry.rank_points <= 0 {
        return false;
    }
    let inactive_before = now - Duration::days(inactive_days);
    let inactive = entry.last_match_at.map_or(true, |t| t < inactive_before);
    let decayed_today = entry
        .last_decay_at
        .is_some_and(|t| t >= utc_day_start(now));
    inactive && !decayed_today
}

/// Bonus credited at season end for a final tier.
pub fn reward_for(tier: RankTier) -> i64 {
    match tier {
        RankTier::Diamond => 1000,
        RankTier::Platinum => 500,
        RankTier::Gold => 250,
        RankTier::Silver => 100,
        RankTier::Bronze => 0,
    }
}

/// Dense positions for points already sorted descending: equal points share
/// a position and the next distinct value takes the next integer.
pub fn dense_positions(sorted_points: &[i32]) -> Vec<i32> {
    let mut out = Vec::with_capacity(sorted_points.len());
    let mut position = 0;
    let mut last = None;
    for &p in sorted_points {
        if last != Some(p) {
            position += 1;
            last = Some(p);
        }
        out.push(position);
    }
    out
}
