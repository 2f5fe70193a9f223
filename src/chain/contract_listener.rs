//! Polls the round contract for `RoundStarted(uint256,uint256,uint256)` logs
//! and turns each into a round insert for the configured room.

use chrono::{DateTime, TimeZone, Utc};
use ethers::providers::{Http, Middleware, Provider};
use ethers::types::{Address, BlockNumber, Filter, Log, H256, U256, U64};
use ethers::utils::keccak256;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ContractConfig;
use crate::domain::{RoomId, RoundStatus};
use crate::engine::LifecycleEvent;
use crate::error::{Result, RoundError};

pub const ROUND_STARTED_SIGNATURE: &str = "RoundStarted(uint256,uint256,uint256)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundStarted {
    pub round_id: i64,
    pub start_ts: i64,
    pub end_ts: i64,
}

impl RoundStarted {
    pub fn into_event(self, room_id: RoomId) -> Option<LifecycleEvent> {
        let created_at = seconds_to_datetime(self.start_ts)?;
        Some(LifecycleEvent::RoundInsert {
            round_id: self.round_id,
            room_id,
            status: RoundStatus::Open,
            created_at,
            ends_at: seconds_to_datetime(self.end_ts),
        })
    }
}

fn seconds_to_datetime(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

pub fn round_started_topic() -> H256 {
    H256::from(keccak256(ROUND_STARTED_SIGNATURE.as_bytes()))
}

fn word_to_i64(word: &[u8]) -> Result<i64> {
    let value = U256::from_big_endian(word);
    if value > U256::from(i64::MAX as u64) {
        return Err(RoundError::Validation(format!("value {} exceeds i64", value)));
    }
    Ok(value.as_u64() as i64)
}

/// Decode the event fields. `roundId` may be indexed (second topic) or be
/// the first data word.
pub fn decode_round_started(topics: &[H256], data: &[u8]) -> Result<RoundStarted> {
    let words: Vec<&[u8]> = data.chunks(32).filter(|w| w.len() == 32).collect();

    match (topics.len(), words.as_slice()) {
        (_, [round, start, end, ..]) => Ok(RoundStarted {
            round_id: word_to_i64(round)?,
            start_ts: word_to_i64(start)?,
            end_ts: word_to_i64(end)?,
        }),
        (n, [start, end]) if n >= 2 => Ok(RoundStarted {
            round_id: word_to_i64(topics[1].as_bytes())?,
            start_ts: word_to_i64(start)?,
            end_ts: word_to_i64(end)?,
        }),
        _ => Err(RoundError::Validation(format!(
            "RoundStarted log has {} topics and {} data bytes",
            topics.len(),
            data.len()
        ))),
    }
}

pub struct ContractListener {
    provider: Provider<Http>,
    address: Address,
    room_id: RoomId,
    poll_interval: Duration,
}

impl ContractListener {
    pub fn new(config: &ContractConfig, room_id: RoomId) -> Result<Self> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| RoundError::FatalInit(format!("Invalid RPC url: {}", e)))?;
        let address = Address::from_str(&config.address)
            .map_err(|e| RoundError::FatalInit(format!("Invalid contract address: {}", e)))?;

        Ok(Self {
            provider,
            address,
            room_id,
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(100)),
        })
    }

    fn handle_log(&self, log: &Log) -> Option<LifecycleEvent> {
        match decode_round_started(&log.topics, &log.data) {
            Ok(started) => {
                info!(
                    round_id = started.round_id,
                    start_ts = started.start_ts,
                    end_ts = started.end_ts,
                    "RoundStarted on chain"
                );
                started.into_event(self.room_id)
            }
            Err(e) => {
                warn!(error = %e, tx = ?log.transaction_hash, "Undecodable RoundStarted log");
                None
            }
        }
    }

    /// Poll from the current head until `shutdown` flips or the consumer
    /// goes away. RPC errors are logged and retried on the next tick.
    pub async fn run(
        self,
        events: mpsc::Sender<LifecycleEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut next_block: U64 = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| RoundError::FatalInit(format!("RPC unreachable: {}", e)))?;
        info!(address = ?self.address, from_block = %next_block, "Watching RoundStarted events");

        let mut interval = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => {
                    info!("Contract listener stopping");
                    return Ok(());
                }
            }

            let head = match self.provider.get_block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(error = %e, "Failed to read block number");
                    continue;
                }
            };
            if head < next_block {
                continue;
            }

            let filter = Filter::new()
                .address(self.address)
                .topic0(round_started_topic())
                .from_block(BlockNumber::Number(next_block))
                .to_block(BlockNumber::Number(head));

            let logs = match self.provider.get_logs(&filter).await {
                Ok(logs) => logs,
                Err(e) => {
                    warn!(error = %e, "Failed to fetch RoundStarted logs");
                    continue;
                }
            };
            debug!(from = %next_block, to = %head, count = logs.len(), "Polled contract logs");

            for log in &logs {
                if let Some(event) = self.handle_log(log) {
                    if events.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
            next_block = head + 1u64;
        }
    }
}
