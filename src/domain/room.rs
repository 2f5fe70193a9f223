//! Room context: the single mutable aggregate owned by the round engine

use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use tracing::debug;

use super::round::{FifoLimits, RoomId, Round, RoundId, NO_ROUND};

/// Token under discussion in a room
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topic {
    pub symbol: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub image_url: Option<String>,
}

impl Topic {
    /// Short human label used in prompts
    pub fn label(&self) -> String {
        if self.name.is_empty() || self.name == self.symbol {
            self.symbol.clone()
        } else {
            format!("{} ({})", self.symbol, self.name)
        }
    }
}

/// Bounded map of round id to round. When full, inserting an unknown id
/// evicts the lowest round id first.
#[derive(Debug)]
pub struct RoundCache {
    rounds: BTreeMap<RoundId, Round>,
    capacity: usize,
}

impl RoundCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            rounds: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Insert or replace a round. Returns the id of the evicted round, if any.
    pub fn insert(&mut self, round: Round) -> Option<RoundId> {
        let mut evicted = None;
        if !self.rounds.contains_key(&round.id) && self.rounds.len() >= self.capacity {
            if let Some((id, _)) = self.rounds.pop_first() {
                debug!(round_id = id, "Evicting oldest round from cache");
                evicted = Some(id);
            }
        }
        self.rounds.insert(round.id, round);
        evicted
    }

    pub fn get(&self, id: RoundId) -> Option<&Round> {
        self.rounds.get(&id)
    }

    pub fn get_mut(&mut self, id: RoundId) -> Option<&mut Round> {
        self.rounds.get_mut(&id)
    }

    pub fn contains(&self, id: RoundId) -> bool {
        self.rounds.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<RoundId> {
        self.rounds.keys().copied().collect()
    }

    pub fn latest_id(&self) -> Option<RoundId> {
        self.rounds.keys().next_back().copied()
    }

    pub fn len(&self) -> usize {
        self.rounds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.is_empty()
    }
}

impl Serialize for RoundCache {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.rounds.iter())
    }
}

/// Room/round/topic state of one agent.
///
/// `current_round_id` names a cached round once any round is known and is
/// `NO_ROUND` before bootstrap.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomContext {
    pub room_id: RoomId,
    pub current_round_id: RoundId,
    pub topic: Topic,
    pub chain_id: u64,
    pub rounds: RoundCache,
    #[serde(skip)]
    pub limits: FifoLimits,
}

impl RoomContext {
    pub fn new(room_id: RoomId, round_capacity: usize, limits: FifoLimits) -> Self {
        Self {
            room_id,
            current_round_id: NO_ROUND,
            topic: Topic::default(),
            chain_id: 0,
            rounds: RoundCache::new(round_capacity),
            limits,
        }
    }

    pub fn current_round(&self) -> Option<&Round> {
        self.rounds.get(self.current_round_id)
    }

    /// Insert a round and make it the current one
    pub fn install_round(&mut self, round: Round) -> Option<RoundId> {
        let id = round.id;
        let evicted = self.rounds.insert(round);
        self.current_round_id = id;
        evicted
    }

    /// Insert or refresh a round without moving the current pointer, unless
    /// the current round was evicted to make room.
    pub fn upsert_round(&mut self, round: Round) -> Option<RoundId> {
        let evicted = self.rounds.insert(round);
        if self.current_round_id == NO_ROUND || !self.rounds.contains(self.current_round_id) {
            self.current_round_id = self.rounds.latest_id().unwrap_or(NO_ROUND);
        }
        evicted
    }
}
