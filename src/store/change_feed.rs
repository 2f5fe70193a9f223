//! Round change feed over Postgres LISTEN/NOTIFY.
//!
//! Each notification payload is a JSON object
//! `{"table": "rounds" | "round_agents", "type": "INSERT" | "UPDATE", "record": {...}}`.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Deserialize;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::domain::{AgentOutcome, RoundStatus};
use crate::engine::LifecycleEvent;
use crate::error::{Result, RoundError};

#[derive(Debug, Deserialize)]
struct ChangeNotification {
    table: String,
    #[serde(rename = "type")]
    kind: String,
    record: Value,
}

#[derive(Debug, Deserialize)]
struct RoundRow {
    id: i64,
    room_id: i64,
    status: String,
    #[serde(default)]
    created_at: Option<Value>,
    #[serde(default)]
    ends_at: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RoundAgentRow {
    round_id: i64,
    agent_id: i64,
    #[serde(default)]
    outcome: Option<Value>,
}

/// Accepts RFC 3339, naive `YYYY-MM-DDTHH:MM:SS[.f]` (taken as UTC), or
/// epoch milliseconds.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .ok()
                    .map(|naive| Utc.from_utc_datetime(&naive))
            }),
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

/// Translate one notification payload. `Ok(None)` for tables and change
/// kinds the engine does not track.
pub fn parse_notification(payload: &str) -> Result<Option<LifecycleEvent>> {
    let notification: ChangeNotification = serde_json::from_str(payload)?;

    match (notification.table.as_str(), notification.kind.as_str()) {
        ("rounds", kind @ ("INSERT" | "UPDATE")) => {
            let row: RoundRow = serde_json::from_value(notification.record)?;
            let status: RoundStatus = row.status.parse()?;
            if kind == "INSERT" {
                let created_at = row
                    .created_at
                    .as_ref()
                    .and_then(parse_timestamp)
                    .unwrap_or_else(Utc::now);
                Ok(Some(LifecycleEvent::RoundInsert {
                    round_id: row.id,
                    room_id: row.room_id,
                    status,
                    created_at,
                    ends_at: row.ends_at.as_ref().and_then(parse_timestamp),
                }))
            } else {
                Ok(Some(LifecycleEvent::RoundUpdate {
                    round_id: row.id,
                    room_id: row.room_id,
                    status,
                }))
            }
        }
        ("round_agents", "INSERT" | "UPDATE") => {
            let row: RoundAgentRow = serde_json::from_value(notification.record)?;
            match row.outcome {
                Some(Value::Null) | None => Ok(None),
                Some(raw) => {
                    let outcome: AgentOutcome = serde_json::from_value(raw).map_err(|e| {
                        RoundError::Validation(format!(
                            "bad outcome for round {} agent {}: {}",
                            row.round_id, row.agent_id, e
                        ))
                    })?;
                    Ok(Some(LifecycleEvent::RoundAgentOutcome {
                        round_id: row.round_id,
                        agent_id: row.agent_id,
                        outcome,
                    }))
                }
            }
        }
        (table, kind) => {
            debug!(table, kind, "Skipping untracked change");
            Ok(None)
        }
    }
}

/// Listens on a NOTIFY channel and forwards parsed lifecycle events
pub struct ChangeFeed {
    pool: PgPool,
    channel: String,
}

impl ChangeFeed {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }

    /// Runs until the receiving side of `events` is dropped. Malformed
    /// payloads are logged and skipped.
    pub async fn run(self, events: mpsc::Sender<LifecycleEvent>) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!(channel = %self.channel, "Listening for round changes");

        loop {
            let notification = listener.recv().await?;
            match parse_notification(notification.payload()) {
                Ok(Some(event)) => {
                    debug!(kind = event.kind(), round_id = event.round_id(), "Change feed event");
                    if events.send(event).await.is_err() {
                        info!("Lifecycle consumer gone, stopping change feed");
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Malformed change notification skipped"),
            }
        }
    }
}
