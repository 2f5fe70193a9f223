//! Persistent storage of rooms, rounds and round participants

pub mod change_feed;
mod postgres;

pub use change_feed::{parse_notification, ChangeFeed};
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use crate::domain::{AgentId, AgentOutcome, AgentSummary, RoomId, RoundId, RoundStatus, Topic};
use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct RoomRecord {
    pub id: RoomId,
    pub active: bool,
    pub chain_id: u64,
    pub topic: Topic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RoundRecord {
    pub id: RoundId,
    pub room_id: RoomId,
    pub status: RoundStatus,
    pub created_at: DateTime<Utc>,
    pub ends_at: Option<DateTime<Utc>>,
    pub agents: BTreeMap<AgentId, AgentSummary>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoundStore: Send + Sync {
    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>>;

    /// Most recently created round of the room, whatever its status
    async fn fetch_latest_round(&self, room_id: RoomId) -> Result<Option<RoundRecord>>;

    /// Rounds of the room with the given ids, newest first
    async fn fetch_rounds(&self, room_id: RoomId, round_ids: Vec<RoundId>) -> Result<Vec<RoundRecord>>;

    async fn fetch_round_roster(&self, round_id: RoundId) -> Result<BTreeMap<AgentId, AgentSummary>>;

    /// Up to `limit` most recent observations, oldest first, as JSON strings
    async fn fetch_observations(&self, round_id: RoundId, limit: usize) -> Result<Vec<String>>;

    /// Wallet addresses registered for the agent across rooms
    async fn fetch_agent_wallets(&self, agent_id: AgentId) -> Result<Vec<String>>;

    async fn record_outcome(
        &self,
        round_id: RoundId,
        agent_id: AgentId,
        outcome: AgentOutcome,
    ) -> Result<()>;
}
