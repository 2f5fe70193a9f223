use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;

use crate::error::RoundError;

pub type AgentId = i64;
pub type RoomId = i64;
pub type RoundId = i64;

/// Sentinel round id used before any round is known
pub const NO_ROUND: RoundId = 0;

/// Round lifecycle status. Authority is external; the engine only records
/// the latest value it has observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoundStatus {
    None,
    Starting,
    Open,
    Closing,
    Closed,
    Cancelled,
}

impl RoundStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::None => "NONE",
            RoundStatus::Starting => "STARTING",
            RoundStatus::Open => "OPEN",
            RoundStatus::Closing => "CLOSING",
            RoundStatus::Closed => "CLOSED",
            RoundStatus::Cancelled => "CANCELLED",
        }
    }

    /// In-flight generation for a round in a terminal status is abandoned
    pub fn is_terminal(&self) -> bool {
        match self {
            RoundStatus::Closed | RoundStatus::Cancelled => true,
            RoundStatus::None | RoundStatus::Starting | RoundStatus::Open | RoundStatus::Closing => {
                false
            }
        }
    }

    pub fn accepts_messages(&self) -> bool {
        match self {
            RoundStatus::Open => true,
            RoundStatus::None
            | RoundStatus::Starting
            | RoundStatus::Closing
            | RoundStatus::Closed
            | RoundStatus::Cancelled => false,
        }
    }

    /// Whether an agent coming online should join the discussion right away
    pub fn is_joinable(&self) -> bool {
        matches!(self, RoundStatus::Open | RoundStatus::Starting)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RoundStatus {
    type Err = RoundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" => Ok(RoundStatus::None),
            "STARTING" => Ok(RoundStatus::Starting),
            "OPEN" => Ok(RoundStatus::Open),
            "CLOSING" => Ok(RoundStatus::Closing),
            "CLOSED" => Ok(RoundStatus::Closed),
            "CANCELLED" => Ok(RoundStatus::Cancelled),
            other => Err(RoundError::UnknownStatus(other.to_string())),
        }
    }
}

/// End-of-round trade verdict. Wire form is the integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Decision {
    Buy = 1,
    Hold = 2,
    Sell = 3,
}

impl Decision {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Buy => "BUY",
            Decision::Hold => "HOLD",
            Decision::Sell => "SELL",
        }
    }
}

impl From<Decision> for u8 {
    fn from(decision: Decision) -> Self {
        decision.code()
    }
}

impl TryFrom<u8> for Decision {
    type Error = String;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Decision::Buy),
            2 => Ok(Decision::Hold),
            3 => Ok(Decision::Sell),
            other => Err(format!("invalid decision code {other}")),
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of one agent in a round, as delivered by the upstream feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutcome {
    pub decision: Decision,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub fabricated: bool,
}

/// Read-only subset of a participant profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub display_name: String,
    pub wallet_address: String,
    #[serde(default)]
    pub single_sentence_summary: Option<String>,
}

/// One admitted message kept in a round's conversational context
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub timestamp: i64,
    pub agent_id: AgentId,
    pub agent_name: String,
    pub text: String,
}

/// FIFO that never holds more than `capacity` items; pushing past capacity
/// drops the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedFifo<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedFifo<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an item, returning the evicted oldest item if any
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(item);
        }
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    /// Up to `k` most recent items, oldest first
    pub fn last(&self, k: usize) -> impl Iterator<Item = &T> {
        self.items.iter().skip(self.items.len().saturating_sub(k))
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Replace the contents, keeping only the most recent `capacity` items
    pub fn replace_with(&mut self, items: impl IntoIterator<Item = T>) {
        self.items.clear();
        for item in items {
            self.push(item);
        }
    }
}

impl<T: Serialize> Serialize for BoundedFifo<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.items.iter())
    }
}

/// FIFO capacities applied to every round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoLimits {
    pub max_observations: usize,
    pub max_messages: usize,
}

impl Default for FifoLimits {
    fn default() -> Self {
        Self {
            max_observations: 30,
            max_messages: 10,
        }
    }
}

/// Locally cached state of one round
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Round {
    pub id: RoundId,
    pub room_id: RoomId,
    pub status: RoundStatus,
    pub started_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub agents: BTreeMap<AgentId, AgentSummary>,
    pub decisions: BTreeMap<AgentId, AgentOutcome>,
    pub observations: BoundedFifo<String>,
    pub messages: BoundedFifo<MessageRecord>,
    #[serde(skip)]
    status_tx: watch::Sender<RoundStatus>,
}

impl Round {
    pub fn new(
        id: RoundId,
        room_id: RoomId,
        status: RoundStatus,
        started_at: DateTime<Utc>,
        agents: BTreeMap<AgentId, AgentSummary>,
        limits: FifoLimits,
    ) -> Self {
        let (status_tx, _) = watch::channel(status);
        Self {
            id,
            room_id,
            status,
            started_at,
            ends_at: None,
            agents,
            decisions: BTreeMap::new(),
            observations: BoundedFifo::new(limits.max_observations),
            messages: BoundedFifo::new(limits.max_messages),
            status_tx,
        }
    }

    pub fn with_ends_at(mut self, ends_at: Option<DateTime<Utc>>) -> Self {
        self.ends_at = ends_at;
        self
    }

    /// Record a new status and wake anything waiting on this round
    pub fn set_status(&mut self, status: RoundStatus) {
        self.status = status;
        self.status_tx.send_replace(status);
    }

    /// Status updates for this round. The receiver errors once the round is
    /// dropped from the cache.
    pub fn subscribe_status(&self) -> watch::Receiver<RoundStatus> {
        self.status_tx.subscribe()
    }

    pub fn is_participant(&self, agent_id: AgentId) -> bool {
        self.agents.contains_key(&agent_id)
    }

    pub fn agent_name(&self, agent_id: AgentId) -> String {
        self.agents
            .get(&agent_id)
            .map(|a| a.display_name.clone())
            .unwrap_or_else(|| format!("agent-{agent_id}"))
    }
}
