use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Implements `as_str`, `Display`, `FromStr` and `TryFrom<String>` for a
/// C-like enum persisted as TEXT.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} value: {other}", stringify!($name))),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = String;

            fn try_from(s: String) -> Result<Self, Self::Error> {
                s.parse()
            }
        }
    };
}

/// Match life-cycle.
///
/// `locked → active → settled | draw`, and `locked | active → voided`.
/// The three terminal states never change again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Locked,
    Active,
    Settled,
    Draw,
    Voided,
}

text_enum!(MatchStatus {
    Locked => "locked",
    Active => "active",
    Settled => "settled",
    Draw => "draw",
    Voided => "voided",
});

impl MatchStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MatchStatus::Settled | MatchStatus::Draw | MatchStatus::Voided)
    }

    pub fn can_transition_to(&self, next: MatchStatus) -> bool {
        use MatchStatus::*;
        matches!(
            (self, next),
            (Locked, Active)
                | (Active, Settled)
                | (Active, Draw)
                | (Locked, Voided)
                | (Active, Voided)
        )
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Match {
    pub id: Uuid,
    pub creator_id: Uuid,
    pub opponent_id: Uuid,
    pub creator_slip_id: Uuid,
    pub opponent_slip_id: Uuid,
    pub stake_amount: i64,
    #[sqlx(try_from = "String")]
    pub status: MatchStatus,
    pub winner_id: Option<Uuid>,
    pub version: i32,
    pub creator_points: i32,
    pub opponent_points: i32,
    pub settlement_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Match {
    pub fn participants(&self) -> [Uuid; 2] {
        [self.creator_id, self.opponent_id]
    }

    pub fn slip_of(&self, user_id: Uuid) -> Option<Uuid> {
        if user_id == self.creator_id {
            Some(self.creator_slip_id)
        } else if user_id == self.opponent_id {
            Some(self.opponent_slip_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Wallet {
    pub id: Uuid,
    pub user_id: Uuid,
    pub paid_balance: i64,
    pub bonus_balance: i64,
    pub version: i32,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    pub fn total(&self) -> i64 {
        self.paid_balance + self.bonus_balance
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionType {
    MatchEntry,
    MatchWin,
    MatchRefund,
    SeasonReward,
}

text_enum!(TransactionType {
    MatchEntry => "MATCH_ENTRY",
    MatchWin => "MATCH_WIN",
    MatchRefund => "MATCH_REFUND",
    SeasonReward => "SEASON_REWARD",
});

/// One immutable ledger line.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct WalletTransaction {
    pub id: Uuid,
    pub wallet_id: Uuid,
    #[sqlx(try_from = "String")]
    pub tx_type: TransactionType,
    pub amount: i64,
    pub balance_before: i64,
    pub balance_after: i64,
    pub idempotency_key: String,
    pub reference_id: Option<Uuid>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeasonStatus {
    Upcoming,
    Active,
    Ended,
}

text_enum!(SeasonStatus {
    Upcoming => "UPCOMING",
    Active => "ACTIVE",
    Ended => "ENDED",
});

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Season {
    pub id: Uuid,
    pub name: String,
    #[sqlx(try_from = "String")]
    pub status: SeasonStatus,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub finalized_at: Option<DateTime<Utc>>,
    pub rewards_distributed_at: Option<DateTime<Utc>>,
}

/// Rank tier derived from season rank points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RankTier {
    Bronze,
    Silver,
    Gold,
    Platinum,
    Diamond,
}

text_enum!(RankTier {
    Bronze => "BRONZE",
    Silver => "SILVER",
    Gold => "GOLD",
    Platinum => "PLATINUM",
    Diamond => "DIAMOND",
});

impl RankTier {
    pub fn for_points(points: i32) -> Self {
        match points {
            p if p >= 1500 => RankTier::Diamond,
            p if p >= 1000 => RankTier::Platinum,
            p if p >= 600 => RankTier::Gold,
            p if p >= 300 => RankTier::Silver,
            _ => RankTier::Bronze,
        }
    }
}

/// A user's standing within one season.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SeasonEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub season_id: Uuid,
    pub rank_points: i32,
    #[sqlx(try_from = "String")]
    pub current_rank: RankTier,
    pub is_placed: bool,
    pub matches_played: i32,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
    pub last_match_at: Option<DateTime<Utc>>,
    pub last_decay_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub final_rank: Option<String>,
    pub final_rank_points: Option<i32>,
    pub rank_position: Option<i32>,
}

impl SeasonEntry {
    pub fn new(season_id: Uuid, user_id: Uuid) -> Self {
        SeasonEntry {
            id: Uuid::new_v4(),
            user_id,
            season_id,
            rank_points: 0,
            current_rank: RankTier::Bronze,
            is_placed: false,
            matches_played: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            last_match_at: None,
            last_decay_at: None,
            version: 0,
            final_rank: None,
            final_rank_points: None,
            rank_position: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeaderboardKind {
    Global,
    Weekly,
}

text_enum!(LeaderboardKind {
    Global => "GLOBAL",
    Weekly => "WEEKLY",
});

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Leaderboard {
    pub id: Uuid,
    #[sqlx(try_from = "String")]
    pub kind: LeaderboardKind,
    pub period_start: DateTime<Utc>,
    pub period_end: Option<DateTime<Utc>>,
    pub is_current: bool,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LeaderboardEntry {
    pub leaderboard_id: Uuid,
    pub user_id: Uuid,
    pub score: i64,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
    pub matches_played: i32,
    pub win_rate: f64,
    pub current_streak: i32,
    pub best_streak: i32,
    pub previous_rank: Option<i32>,
    pub rank: Option<i32>,
    pub updated_at: DateTime<Utc>,
}

impl LeaderboardEntry {
    pub fn new(leaderboard_id: Uuid, user_id: Uuid, now: DateTime<Utc>) -> Self {
        LeaderboardEntry {
            leaderboard_id,
            user_id,
            score: 0,
            wins: 0,
            losses: 0,
            draws: 0,
            matches_played: 0,
            win_rate: 0.0,
            current_streak: 0,
            best_streak: 0,
            previous_rank: None,
            rank: None,
            updated_at: now,
        }
    }
}

/// A leaderboard row with its computed position, as served to readers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedEntry {
    pub rank: i64,
    pub user_id: Uuid,
    pub score: i64,
    pub wins: i32,
    pub losses: i32,
    pub draws: i32,
    pub matches_played: i32,
    pub win_rate: f64,
    pub current_streak: i32,
    pub best_streak: i32,
    pub previous_rank: Option<i32>,
}

impl RankedEntry {
    pub fn from_entry(rank: i64, e: &LeaderboardEntry) -> Self {
        RankedEntry {
            rank,
            user_id: e.user_id,
            score: e.score,
            wins: e.wins,
            losses: e.losses,
            draws: e.draws,
            matches_played: e.matches_played,
            win_rate: e.win_rate,
            current_streak: e.current_streak,
            best_streak: e.best_streak,
            previous_rank: e.previous_rank,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Scheduled,
    Live,
    Completed,
    Postponed,
    Cancelled,
}

text_enum!(EventStatus {
    Scheduled => "SCHEDULED",
    Live => "LIVE",
    Completed => "COMPLETED",
    Postponed => "POSTPONED",
    Cancelled => "CANCELLED",
});

impl EventStatus {
    /// COMPLETED and CANCELLED never change again.
    pub fn is_resolved(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Cancelled)
    }

    pub fn has_started(&self) -> bool {
        matches!(self, EventStatus::Live | EventStatus::Completed)
    }
}

/// A sporting event as last reported by the score feed.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct SportEvent {
    pub id: Uuid,
    pub external_event_id: String,
    #[sqlx(try_from = "String")]
    pub status: EventStatus,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub starts_at: DateTime<Utc>,
    pub rescheduled_to: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Normalised update delivered by the score feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventUpdate {
    pub external_event_id: String,
    pub status: EventStatus,
    pub home_score: Option<i32>,
    pub away_score: Option<i32>,
    pub starts_at: DateTime<Utc>,
    #[serde(default)]
    pub rescheduled_to: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PickSelection {
    Home,
    Away,
    Draw,
}

text_enum!(PickSelection {
    Home => "HOME",
    Away => "AWAY",
    Draw => "DRAW",
});

/// One prediction on one event, part of a player's slip.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Pick {
    pub id: Uuid,
    pub slip_id: Uuid,
    pub user_id: Uuid,
    pub event_id: Uuid,
    #[sqlx(try_from = "String")]
    pub selection: PickSelection,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct MatchmakingQueueEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub slip_id: Uuid,
    pub stake_amount: i64,
    pub skill_rating: i32,
    pub region: String,
    pub claimed_by: Option<String>,
    pub claim_expires_at: Option<DateTime<Utc>>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
}
