//! Scoring of a slip against resolved events.

use std::collections::HashMap;
use std::fmt;

use uuid::Uuid;

use crate::db::models::{EventStatus, Pick, PickSelection, SportEvent};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickError {
    /// The pick references an event that is not resolved, or is resolved
    /// without enough information to decide it.
    Ambiguous { pick_id: Uuid, event_id: Uuid },
}

impl fmt::Display for PickError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PickError::Ambiguous { pick_id, event_id } => {
                write!(f, "pick {} on event {} is ambiguous", pick_id, event_id)
            }
        }
    }
}

impl std::error::Error for PickError {}

/// Pure, deterministic points function over one side's picks.
pub trait PicksEvaluator: Send + Sync {
    fn evaluate(
        &self,
        picks: &[Pick],
        events: &HashMap<Uuid, SportEvent>,
    ) -> Result<i32, PickError>;
}

/// One point per correct HOME / AWAY / DRAW call. Cancelled events score zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorrectPickEvaluator;

impl CorrectPickEvaluator {
    fn outcome(event: &SportEvent) -> Option<PickSelection> {
        let (home, away) = (event.home_score?, event.away_score?);
        Some(match home.cmp(&away) {
            std::cmp::Ordering::Greater => PickSelection::Home,
            std::cmp::Ordering::Less => PickSelection::Away,
            std::cmp::Ordering::Equal => PickSelection::Draw,
        })
    }
}

impl PicksEvaluator for CorrectPickEvaluator {
    fn evaluate(
        &self,
        picks: &[Pick],
        events: &HashMap<Uuid, SportEvent>,
    ) -> Result<i32, PickError> {
        let mut points = 0;
        for pick in picks {
            let ambiguous = PickError::Ambiguous {
                pick_id: pick.id,
                event_id: pick.event_id,
            };
            let event = events.get(&pick.event_id).ok_or(ambiguous.clone())?;
            match event.status {
                EventStatus::Cancelled => {}
                EventStatus::Completed => {
                    let outcome = Self::outcome(event).ok_or(ambiguous)?;
                    if outcome == pick.selection {
                        points += 1;
                    }
                }
                _ => return Err(ambiguous),
            }
        }
        Ok(points)
    }
}
