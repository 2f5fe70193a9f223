//! End-to-end flows through the public engine API with in-memory collaborators.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use roundtable::config::{AgentConfig, AgentProfile, EngineConfig};
use roundtable::domain::{
    AgentId, AgentMessage, AgentMessageContent, AgentOutcome, AgentSummary, Decision,
    DecisionMessage, DecisionRequest, MessageEnvelope, MessageType, RoomId, RoundId, RoundStatus,
};
use roundtable::engine::RejectReason;
use roundtable::error::{Result, RoundError};
use roundtable::signing::{verify_signed_payload, Wallet};
use roundtable::store::{RoomRecord, RoundRecord};
use roundtable::{
    LifecycleEvent, MessageOutcome, ModelClass, Oracle, OracleRequest, Relay, RoundEngine,
    RoundStore, SyncOutcome,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

const HARDHAT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
const SELF_ID: AgentId = 1;
const PEER_ID: AgentId = 2;
const ROOM: RoomId = 290;

/// Answers by model class, optionally stalling the large model
struct FakeOracle {
    should_respond: String,
    reply: String,
    decision: String,
    small_delay: Duration,
    large_delay: Duration,
}

impl FakeOracle {
    fn answering(should_respond: &str) -> Self {
        Self {
            should_respond: should_respond.to_string(),
            reply: "Volume is thin, I'd wait.".to_string(),
            decision: "BUY, momentum is clear".to_string(),
            small_delay: Duration::ZERO,
            large_delay: Duration::ZERO,
        }
    }
}

#[async_trait]
impl Oracle for FakeOracle {
    async fn generate_text(&self, request: OracleRequest) -> Result<String> {
        match request.model {
            ModelClass::Small => {
                tokio::time::sleep(self.small_delay).await;
                Ok(self.should_respond.clone())
            }
            ModelClass::Medium => Ok(self.decision.clone()),
            ModelClass::Large => {
                tokio::time::sleep(self.large_delay).await;
                Ok(self.reply.clone())
            }
        }
    }
}

#[derive(Default)]
struct FakeRelay {
    messages: Mutex<Vec<AgentMessage>>,
    decisions: Mutex<Vec<DecisionMessage>>,
}

#[async_trait]
impl Relay for FakeRelay {
    async fn post_agent_message(&self, message: AgentMessage) -> Result<()> {
        self.messages.lock().unwrap().push(message);
        Ok(())
    }

    async fn post_decision(&self, message: DecisionMessage) -> Result<()> {
        self.decisions.lock().unwrap().push(message);
        Ok(())
    }
}

#[derive(Default)]
struct FakeStore {
    outcomes: Mutex<Vec<(RoundId, AgentId, AgentOutcome)>>,
    roster_unavailable: AtomicBool,
}

fn roster() -> BTreeMap<AgentId, AgentSummary> {
    [SELF_ID, PEER_ID]
        .into_iter()
        .map(|id| {
            (
                id,
                AgentSummary {
                    id,
                    display_name: format!("Agent {id}"),
                    wallet_address: format!("0x{:040x}", id),
                    single_sentence_summary: None,
                },
            )
        })
        .collect()
}

#[async_trait]
impl RoundStore for FakeStore {
    async fn fetch_room(&self, _room_id: RoomId) -> Result<Option<RoomRecord>> {
        Ok(None)
    }

    async fn fetch_latest_round(&self, _room_id: RoomId) -> Result<Option<RoundRecord>> {
        Ok(None)
    }

    async fn fetch_rounds(&self, _room_id: RoomId, _round_ids: Vec<RoundId>) -> Result<Vec<RoundRecord>> {
        Ok(Vec::new())
    }

    async fn fetch_round_roster(&self, _round_id: RoundId) -> Result<BTreeMap<AgentId, AgentSummary>> {
        if self.roster_unavailable.load(Ordering::SeqCst) {
            return Err(RoundError::Database(sqlx::Error::PoolTimedOut));
        }
        Ok(roster())
    }

    async fn fetch_observations(&self, _round_id: RoundId, _limit: usize) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn fetch_agent_wallets(&self, _agent_id: AgentId) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    async fn record_outcome(&self, round_id: RoundId, agent_id: AgentId, outcome: AgentOutcome) -> Result<()> {
        self.outcomes.lock().unwrap().push((round_id, agent_id, outcome));
        Ok(())
    }
}

struct Harness {
    engine: Arc<RoundEngine>,
    relay: Arc<FakeRelay>,
    store: Arc<FakeStore>,
}

fn harness_with(oracle: FakeOracle, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    let mut config = EngineConfig::default();
    config.should_respond.initial_delay_ms = 1;
    config.should_respond.max_attempts = 2;
    tweak(&mut config);

    let agent = AgentConfig {
        id: SELF_ID,
        room_id: ROOM,
        chain_id: 1,
        profile: AgentProfile {
            name: "Cautious Carl".into(),
            ..AgentProfile::default()
        },
    };
    let relay = Arc::new(FakeRelay::default());
    let store = Arc::new(FakeStore::default());
    let engine = RoundEngine::new(
        &agent,
        config,
        Wallet::from_private_key(HARDHAT_KEY, 1).unwrap(),
        Arc::new(oracle),
        relay.clone(),
        store.clone(),
    );
    Harness {
        engine: Arc::new(engine),
        relay,
        store,
    }
}

fn harness(oracle: FakeOracle) -> Harness {
    harness_with(oracle, |_| {})
}

fn insert(round_id: RoundId, status: RoundStatus) -> LifecycleEvent {
    LifecycleEvent::RoundInsert {
        round_id,
        room_id: ROOM,
        status,
        created_at: Utc::now() - ChronoDuration::minutes(1),
        ends_at: Some(Utc::now() + ChronoDuration::minutes(10)),
    }
}

fn update(round_id: RoundId, status: RoundStatus) -> LifecycleEvent {
    LifecycleEvent::RoundUpdate {
        round_id,
        room_id: ROOM,
        status,
    }
}

fn peer_message(signature: &str, round_id: RoundId) -> AgentMessage {
    MessageEnvelope {
        content: AgentMessageContent {
            agent_id: PEER_ID,
            room_id: ROOM,
            round_id,
            text: "Anyone else watching ETH here?".into(),
            timestamp: Utc::now().timestamp_millis(),
        },
        message_type: MessageType::AgentMessage,
        signature: signature.into(),
        sender: format!("0x{:040x}", PEER_ID),
    }
}

#[tokio::test]
async fn round_insert_on_empty_context_becomes_current() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    assert!(h.engine.tracked_rounds().await.is_empty());

    let outcome = h.engine.apply_lifecycle_event(insert(42, RoundStatus::Open)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Applied);

    assert_eq!(h.engine.current_round_id().await, 42);
    assert_eq!(h.engine.round_status(42).await, Some(RoundStatus::Open));
    assert!(h.engine.round_messages(42).await.is_empty());
}

#[tokio::test]
async fn round_insert_survives_roster_fetch_failure() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    h.store.roster_unavailable.store(true, Ordering::SeqCst);

    let outcome = h.engine.apply_lifecycle_event(insert(42, RoundStatus::Open)).await.unwrap();
    assert_eq!(outcome, SyncOutcome::Applied);
    assert_eq!(h.engine.current_round_id().await, 42);
    assert_eq!(h.engine.tracked_rounds().await, vec![42]);

    // A later insert with the roster available fills in participants
    h.store.roster_unavailable.store(false, Ordering::SeqCst);
    h.engine.apply_lifecycle_event(insert(42, RoundStatus::Open)).await.unwrap();
    let outcome = h.engine.handle_agent_message(peer_message("0xc3", 42)).await;
    assert!(outcome.is_success());
}

#[tokio::test]
async fn inserting_past_capacity_evicts_oldest_round() {
    let capacity = 3;
    let h = harness_with(FakeOracle::answering("[IGNORE]"), |c| c.round_cache_capacity = capacity);

    for round_id in 1..=(capacity as RoundId + 1) {
        h.engine
            .apply_lifecycle_event(insert(round_id, RoundStatus::Open))
            .await
            .unwrap();
    }

    let mut tracked = h.engine.tracked_rounds().await;
    tracked.sort_unstable();
    assert_eq!(tracked, vec![2, 3, 4]);
    assert_eq!(h.engine.current_round_id().await, 4);
    assert_eq!(h.engine.round_status(1).await, None);
}

#[tokio::test]
async fn other_room_insert_is_ignored() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    let event = LifecycleEvent::RoundInsert {
        round_id: 5,
        room_id: ROOM + 1,
        status: RoundStatus::Open,
        created_at: Utc::now(),
        ends_at: None,
    };
    let outcome = h.engine.apply_lifecycle_event(event).await.unwrap();
    assert!(!outcome.is_applied());
    assert!(h.engine.tracked_rounds().await.is_empty());
}

#[tokio::test]
async fn decision_for_closed_round_is_signed_dispatched_and_recorded() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    h.engine.apply_lifecycle_event(insert(7, RoundStatus::Open)).await.unwrap();
    h.engine.apply_lifecycle_event(update(7, RoundStatus::Closed)).await.unwrap();
    assert_eq!(h.engine.round_status(7).await, Some(RoundStatus::Closed));

    let outcome = h
        .engine
        .handle_decision_request(DecisionRequest {
            room_id: ROOM,
            round_id: 7,
        })
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Buy);
    assert!(!outcome.fallback);

    let decisions = h.relay.decisions.lock().unwrap().clone();
    assert_eq!(decisions.len(), 1);
    let sent = &decisions[0];
    assert_eq!(sent.content.round_id, 7);
    assert_eq!(sent.message_type, MessageType::AgentDecision);
    verify_signed_payload(&sent.content, &sent.signature, &sent.sender).unwrap();

    let outcomes = h.store.outcomes.lock().unwrap().clone();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].0, 7);
    assert_eq!(outcomes[0].1, SELF_ID);
    assert_eq!(outcomes[0].2.decision, Decision::Buy);
}

#[tokio::test]
async fn decision_text_without_keyword_falls_back_to_hold() {
    let mut oracle = FakeOracle::answering("[IGNORE]");
    oracle.decision = "I would rather not say".into();
    let h = harness(oracle);

    let outcome = h
        .engine
        .handle_decision_request(DecisionRequest {
            room_id: ROOM,
            round_id: 11,
        })
        .await
        .unwrap();
    assert_eq!(outcome.decision, Decision::Hold);
    assert!(outcome.fallback);
}

#[tokio::test]
async fn decision_for_another_room_is_refused() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    let result = h
        .engine
        .handle_decision_request(DecisionRequest {
            room_id: ROOM + 1,
            round_id: 7,
        })
        .await;
    assert!(result.is_err());
    assert!(h.relay.decisions.lock().unwrap().is_empty());
}

#[tokio::test]
async fn reordered_keys_produce_identical_signatures() {
    let wallet = Wallet::from_private_key(HARDHAT_KEY, 1).unwrap();
    let a = json!({"roundId": 3, "agentId": 1, "nested": {"z": true, "a": [1, 2]}});
    let b: serde_json::Value =
        serde_json::from_str(r#"{"nested":{"a":[1,2],"z":true},"agentId":1,"roundId":3}"#).unwrap();

    let sig_a = wallet.sign_payload(&a).await.unwrap();
    let sig_b = wallet.sign_payload(&b).await.unwrap();
    assert_eq!(sig_a, sig_b);
    verify_signed_payload(&b, &sig_a, &wallet.address_string()).unwrap();
}

#[tokio::test]
async fn duplicate_signature_is_rejected_until_ttl_expires() {
    let h = harness_with(FakeOracle::answering("[IGNORE]"), |c| c.signature_ttl_secs = 1);
    h.engine.apply_lifecycle_event(insert(4, RoundStatus::Open)).await.unwrap();

    let first = h.engine.handle_agent_message(peer_message("0xfeed", 4)).await;
    assert!(first.is_success());

    let replay = h.engine.handle_agent_message(peer_message("0xfeed", 4)).await;
    assert_eq!(replay, MessageOutcome::Rejected(RejectReason::Duplicate));

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let after_ttl = h.engine.handle_agent_message(peer_message("0xfeed", 4)).await;
    assert!(after_ttl.is_success());
}

#[tokio::test]
async fn respond_path_dispatches_signed_reply() {
    let h = harness(FakeOracle::answering("[RESPOND]"));
    h.engine.apply_lifecycle_event(insert(4, RoundStatus::Open)).await.unwrap();

    let outcome = h.engine.handle_agent_message(peer_message("0xa1", 4)).await;
    assert!(matches!(outcome, MessageOutcome::Responded { .. }));

    // Dispatch happens in the background
    for _ in 0..50 {
        if !h.relay.messages.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = h.relay.messages.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].content.round_id, 4);
    assert_eq!(sent[0].content.agent_id, SELF_ID);
    verify_signed_payload(&sent[0].content, &sent[0].signature, &sent[0].sender).unwrap();
}

#[tokio::test]
async fn closing_round_cancels_inflight_reply() {
    let mut oracle = FakeOracle::answering("[RESPOND]");
    oracle.large_delay = Duration::from_secs(5);
    let h = harness(oracle);
    h.engine.apply_lifecycle_event(insert(9, RoundStatus::Open)).await.unwrap();

    let engine = Arc::clone(&h.engine);
    let inflight = tokio::spawn(async move { engine.handle_agent_message(peer_message("0xb2", 9)).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    h.engine.apply_lifecycle_event(update(9, RoundStatus::Closed)).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(2), inflight)
        .await
        .expect("reply was not cancelled")
        .unwrap();
    assert_eq!(outcome, MessageOutcome::Cancelled);
    assert!(h.relay.messages.lock().unwrap().is_empty());
}

#[tokio::test]
async fn lifecycle_stream_applies_events_concurrently() {
    let h = harness(FakeOracle::answering("[IGNORE]"));
    let (tx, rx) = mpsc::channel(16);
    let driver = tokio::spawn(Arc::clone(&h.engine).drive_lifecycle(rx));

    for round_id in 1..=3 {
        tx.send(insert(round_id, RoundStatus::Open)).await.unwrap();
    }
    drop(tx);
    driver.await.unwrap();

    let mut tracked = Vec::new();
    for _ in 0..50 {
        tracked = h.engine.tracked_rounds().await;
        if tracked.len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracked.sort_unstable();
    assert_eq!(tracked, vec![1, 2, 3]);
}

#[tokio::test]
async fn concurrent_peers_get_a_single_reply_per_cooldown() {
    let mut oracle = FakeOracle::answering("[RESPOND]");
    oracle.small_delay = Duration::from_millis(100);
    let h = harness(oracle);
    h.engine.apply_lifecycle_event(insert(4, RoundStatus::Open)).await.unwrap();

    let (a, b) = tokio::join!(
        h.engine.handle_agent_message(peer_message("0x1", 4)),
        h.engine.handle_agent_message(peer_message("0x2", 4)),
    );
    let outcomes = [a, b];
    let replied = outcomes
        .iter()
        .filter(|o| matches!(o, MessageOutcome::Responded { .. }))
        .count();
    assert_eq!(replied, 1);
    assert!(outcomes
        .iter()
        .any(|o| *o == MessageOutcome::Rejected(RejectReason::CooldownActive)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.relay.messages.lock().unwrap().len(), 1);
}
