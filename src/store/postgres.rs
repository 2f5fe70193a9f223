use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::BTreeMap;
use tracing::{debug, info, instrument};

use super::{RoomRecord, RoundRecord, RoundStore};
use crate::domain::{AgentId, AgentOutcome, AgentSummary, RoomId, RoundId, RoundStatus, Topic};
use crate::error::{Result, RoundError};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn round_from_row(row: &PgRow, agents: BTreeMap<AgentId, AgentSummary>) -> Result<RoundRecord> {
        let status: String = row.try_get("status")?;
        Ok(RoundRecord {
            id: row.try_get("id")?,
            room_id: row.try_get("room_id")?,
            status: status.parse::<RoundStatus>()?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            ends_at: row.try_get::<Option<DateTime<Utc>>, _>("ends_at")?,
            agents,
        })
    }
}

#[async_trait]
impl RoundStore for PostgresStore {
    #[instrument(skip(self))]
    async fn fetch_room(&self, room_id: RoomId) -> Result<Option<RoomRecord>> {
        let row = sqlx::query(
            r#"
            SELECT r.id, r.active, r.chain_id, r.image_url,
                   t.symbol, t.name, t.address
            FROM rooms r
            LEFT JOIN tokens t ON t.id = r.token_id
            WHERE r.id = $1
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let chain_id: i64 = r.try_get("chain_id")?;
        let topic = Topic {
            symbol: r
                .try_get::<Option<String>, _>("symbol")?
                .unwrap_or_else(|| "ETH".to_string()),
            name: r.try_get::<Option<String>, _>("name")?.unwrap_or_default(),
            address: r.try_get::<Option<String>, _>("address")?.unwrap_or_default(),
            image_url: r.try_get("image_url")?,
        };

        Ok(Some(RoomRecord {
            id: r.try_get("id")?,
            active: r.try_get("active")?,
            chain_id: u64::try_from(chain_id)
                .map_err(|_| RoundError::Validation(format!("negative chain id {}", chain_id)))?,
            topic,
        }))
    }

    #[instrument(skip(self))]
    async fn fetch_latest_round(&self, room_id: RoomId) -> Result<Option<RoundRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, room_id, status, created_at, ends_at
            FROM rounds
            WHERE room_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(room_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(r) => {
                let id: RoundId = r.try_get("id")?;
                let agents = self.fetch_round_roster(id).await?;
                Ok(Some(Self::round_from_row(&r, agents)?))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self))]
    async fn fetch_rounds(&self, room_id: RoomId, round_ids: Vec<RoundId>) -> Result<Vec<RoundRecord>> {
        if round_ids.is_empty() {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT id, room_id, status, created_at, ends_at
            FROM rounds
            WHERE room_id = $1 AND id = ANY($2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(room_id)
        .bind(&round_ids)
        .fetch_all(&self.pool)
        .await?;

        let mut rounds = Vec::with_capacity(rows.len());
        for r in &rows {
            let id: RoundId = r.try_get("id")?;
            let agents = self.fetch_round_roster(id).await?;
            rounds.push(Self::round_from_row(r, agents)?);
        }
        debug!(requested = round_ids.len(), found = rounds.len(), "Fetched rounds");
        Ok(rounds)
    }

    #[instrument(skip(self))]
    async fn fetch_round_roster(&self, round_id: RoundId) -> Result<BTreeMap<AgentId, AgentSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT a.id, a.display_name, a.single_sentence_summary,
                   COALESCE(ra.wallet_address, '') AS wallet_address
            FROM round_agents rda
            JOIN agents a ON a.id = rda.agent_id
            JOIN rounds rd ON rd.id = rda.round_id
            LEFT JOIN room_agents ra ON ra.agent_id = a.id AND ra.room_id = rd.room_id
            WHERE rda.round_id = $1
            "#,
        )
        .bind(round_id)
        .fetch_all(&self.pool)
        .await?;

        let mut roster = BTreeMap::new();
        for r in rows {
            let summary = AgentSummary {
                id: r.try_get("id")?,
                display_name: r.try_get("display_name")?,
                wallet_address: r.try_get("wallet_address")?,
                single_sentence_summary: r.try_get("single_sentence_summary")?,
            };
            roster.insert(summary.id, summary);
        }
        Ok(roster)
    }

    #[instrument(skip(self))]
    async fn fetch_observations(&self, round_id: RoundId, limit: usize) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT row_to_json(o)::text AS body
            FROM round_observations o
            WHERE o.round_id = $1
            ORDER BY o.created_at DESC
            LIMIT $2
            "#,
        )
        .bind(round_id)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        let mut observations = rows
            .iter()
            .map(|r| r.try_get::<String, _>("body"))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        observations.reverse();
        Ok(observations)
    }

    #[instrument(skip(self))]
    async fn fetch_agent_wallets(&self, agent_id: AgentId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT wallet_address FROM room_agents
            WHERE agent_id = $1 AND wallet_address IS NOT NULL
            "#,
        )
        .bind(agent_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| r.try_get::<String, _>("wallet_address").map_err(RoundError::from))
            .collect()
    }

    #[instrument(skip(self, outcome))]
    async fn record_outcome(
        &self,
        round_id: RoundId,
        agent_id: AgentId,
        outcome: AgentOutcome,
    ) -> Result<()> {
        let body = serde_json::to_string(&outcome)?;
        let result = sqlx::query(
            r#"
            UPDATE round_agents SET outcome = $3::jsonb
            WHERE round_id = $1 AND agent_id = $2
            "#,
        )
        .bind(round_id)
        .bind(agent_id)
        .bind(body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RoundError::RoundNotFound(round_id));
        }
        debug!(round_id, agent_id, "Recorded outcome");
        Ok(())
    }
}
