//! Grouping of claimed queue entries into compatible pairs.

use std::collections::BTreeMap;

use crate::db::models::MatchmakingQueueEntry;

/// Entries with equal keys may be paired.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CompatKey {
    pub stake_amount: i64,
    pub skill_band: i32,
    pub region: String,
}

impl CompatKey {
    pub fn of(entry: &MatchmakingQueueEntry, band_width: i32) -> Self {
        CompatKey {
            stake_amount: entry.stake_amount,
            skill_band: entry.skill_rating.div_euclid(band_width.max(1)),
            region: entry.region.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Pair {
    /// The entry that waited longer.
    pub creator: MatchmakingQueueEntry,
    pub opponent: MatchmakingQueueEntry,
}

/// Pair entries two at a time inside each compatibility group, oldest first.
/// Two entries of the same user are never paired. Returns the pairs and the
/// entries left over.
pub fn pair_entries(
    entries: Vec<MatchmakingQueueEntry>,
    band_width: i32,
) -> (Vec<Pair>, Vec<MatchmakingQueueEntry>) {
    let mut groups: BTreeMap<CompatKey, Vec<MatchmakingQueueEntry>> = BTreeMap::new();
    for e in entries {
        groups.entry(CompatKey::of(&e, band_width)).or_default().push(e);
    }

    let mut pairs = Vec::new();
    let mut leftovers = Vec::new();
    for (_, mut group) in groups {
        group.sort_by_key(|e| (e.created_at, e.id));
        let mut slots: Vec<Option<MatchmakingQueueEntry>> = group.into_iter().map(Some).collect();

        for i in 0..slots.len() {
            let Some(user) = slots[i].as_ref().map(|e| e.user_id) else {
                continue;
            };
            let partner = (i + 1..slots.len())
                .find(|&j| slots[j].as_ref().is_some_and(|e| e.user_id != user));
            if let Some(j) = partner {
                if let (Some(creator), Some(opponent)) = (slots[i].take(), slots[j].take()) {
                    pairs.push(Pair { creator, opponent });
                }
            }
        }
        leftovers.extend(slots.into_iter().flatten());
    }
    (pairs, leftovers)
}
