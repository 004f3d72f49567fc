//! Messages published to a player's private channel.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::settlement::SettlementResult;

// ---------- server → player ----------
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    MatchCreated {
        match_id: Uuid,
        opponent_id: Uuid,
        stake_amount: i64,
    },
    MatchSettled(SettlementResult),
    MatchVoided {
        match_id: Uuid,
        reason: String,
    },
    SeasonReward {
        season_id: Uuid,
        amount: i64,
    },
}

impl OutboundEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::MatchCreated { .. } => "MatchCreated",
            OutboundEvent::MatchSettled(_) => "MatchSettled",
            OutboundEvent::MatchVoided { .. } => "MatchVoided",
            OutboundEvent::SeasonReward { .. } => "SeasonReward",
        }
    }
}
