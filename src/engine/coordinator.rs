//! Round engine: the single owner of the room context for one agent.
//!
//! All state lives behind one mutex. Oracle, relay and store calls are made
//! with the lock released so a slow call for one event never blocks others.

use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::decision::classify_decision;
use super::gatekeeper::{check_round, GateOutcome, Gatekeeper, RejectReason};
use super::lifecycle::{apply_event, IgnoreReason, LifecycleEvent, SyncOutcome};
use super::prompt::{
    announce_prompt, completion_prompt, decision_prompt, should_respond_prompt, PromptContext,
};
use super::should_respond::{decide_should_respond, RetryPolicy, ShouldRespond, Verdict};
use super::state::EngineState;
use crate::config::{AgentConfig, AgentProfile, EngineConfig};
use crate::domain::{
    AgentId, AgentMessage, AgentMessageContent, AgentOutcome, Decision, DecisionContent,
    DecisionMessage, DecisionRequest, MessageEnvelope, MessageRecord, MessageType, Observation,
    RoomId, Round, RoundId, RoundStatus, NO_ROUND,
};
use crate::error::{Result, RoundError};
use crate::oracle::{ModelClass, Oracle, OracleRequest};
use crate::relay::Relay;
use crate::signing::{verify_signed_payload, Wallet};
use crate::store::RoundStore;

/// Result of handling one inbound message or observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Rejected(RejectReason),
    Ignored(RejectReason),
    /// Observation admitted into context
    Recorded,
    /// Reply generated, signed and handed to the relay
    Responded { text: String },
    /// Oracle answered IGNORE or STOP
    Declined(ShouldRespond),
    /// The round closed while the reply was being prepared
    Cancelled,
    Failed(String),
}

impl MessageOutcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            MessageOutcome::Recorded | MessageOutcome::Responded { .. } | MessageOutcome::Declined(_)
        )
    }

    pub fn reason_code(&self) -> Option<&'static str> {
        match self {
            MessageOutcome::Rejected(r) | MessageOutcome::Ignored(r) => Some(r.code()),
            MessageOutcome::Cancelled => Some("CANCELLED"),
            MessageOutcome::Failed(_) => Some("FAILED"),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            MessageOutcome::Rejected(r) | MessageOutcome::Ignored(r) => {
                Some(format!("{}: {}", r.code(), r))
            }
            MessageOutcome::Cancelled => Some("CANCELLED: round closed".to_string()),
            MessageOutcome::Failed(e) => Some(format!("FAILED: {}", e)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DecisionOutcome {
    pub decision: Decision,
    /// Oracle text matched no keyword and HOLD was assumed
    pub fallback: bool,
    pub message: DecisionMessage,
}

/// Resolves once the round reaches a terminal status or leaves the cache
async fn round_closed(mut status: watch::Receiver<RoundStatus>) {
    let _ = status.wait_for(|s| s.is_terminal()).await;
}

pub struct RoundEngine {
    agent_id: AgentId,
    room_id: RoomId,
    profile: AgentProfile,
    config: EngineConfig,
    gatekeeper: Gatekeeper,
    retry: RetryPolicy,
    state: Mutex<EngineState>,
    oracle: Arc<dyn Oracle>,
    relay: Arc<dyn Relay>,
    store: Arc<dyn RoundStore>,
    wallet: Wallet,
}

impl RoundEngine {
    pub fn new(
        agent: &AgentConfig,
        config: EngineConfig,
        wallet: Wallet,
        oracle: Arc<dyn Oracle>,
        relay: Arc<dyn Relay>,
        store: Arc<dyn RoundStore>,
    ) -> Self {
        let mut state = EngineState::new(agent.room_id, &config);
        state.context.chain_id = agent.chain_id;

        Self {
            agent_id: agent.id,
            room_id: agent.room_id,
            profile: agent.profile.clone(),
            gatekeeper: Gatekeeper::new(
                agent.id,
                agent.room_id,
                config.privileged_agent_ids.iter().copied(),
                config.message_policy,
                config.observation_policy,
            ),
            retry: RetryPolicy::from(&config.should_respond),
            config,
            state: Mutex::new(state),
            oracle,
            relay,
            store,
            wallet,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        self.agent_id
    }

    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn wallet_address(&self) -> String {
        self.wallet.address_string()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Check an inbound envelope's signature when verification is enabled
    pub fn verify_envelope<C: Serialize>(&self, envelope: &MessageEnvelope<C>) -> Result<()> {
        if !self.config.verify_signatures {
            return Ok(());
        }
        verify_signed_payload(&envelope.content, &envelope.signature, &envelope.sender)
    }

    fn capture(&self, state: &EngineState, round_id: RoundId, window: usize) -> PromptContext {
        PromptContext::capture(&state.context, round_id, self.agent_id, &self.profile, window)
    }

    async fn generate(&self, model: ModelClass, prompt: String) -> Result<String> {
        let limit = Duration::from_millis(self.config.generation_timeout_ms);
        match timeout(limit, self.oracle.generate_text(OracleRequest::new(model, prompt))).await {
            Ok(result) => result,
            Err(_) => Err(RoundError::Timeout(format!(
                "text generation exceeded {}ms",
                self.config.generation_timeout_ms
            ))),
        }
    }

    // ==================== Inbound ====================

    #[instrument(skip(self, message), fields(agent_id = message.content.agent_id, round_id = message.content.round_id))]
    pub async fn handle_agent_message(&self, message: AgentMessage) -> MessageOutcome {
        let round_id = message.content.round_id;
        let privileged = self.gatekeeper.is_privileged(message.content.agent_id);

        let (context, status) = {
            let mut state = self.state.lock().await;
            match self.gatekeeper.admit_message(&mut state, &message, Utc::now()) {
                GateOutcome::Admitted => {}
                GateOutcome::Rejected(reason) => {
                    debug!(code = reason.code(), %reason, "Message rejected");
                    return MessageOutcome::Rejected(reason);
                }
                GateOutcome::Ignored(reason) => {
                    debug!(%reason, "Message ignored");
                    return MessageOutcome::Ignored(reason);
                }
            }
            let Some(round) = state.context.rounds.get(round_id) else {
                return MessageOutcome::Failed(format!("round {} vanished", round_id));
            };
            let status = round.subscribe_status();
            (self.capture(&state, round_id, self.config.context_window), status)
        };

        let request = OracleRequest::new(ModelClass::Small, should_respond_prompt(&context));
        let verdict = decide_should_respond(
            self.oracle.as_ref(),
            request,
            &self.retry,
            round_closed(status.clone()),
        )
        .await;

        match verdict {
            Verdict::Decided(ShouldRespond::Respond) => {}
            Verdict::Decided(other) => {
                debug!(answer = other.as_str(), "Not responding");
                return MessageOutcome::Declined(other);
            }
            Verdict::Cancelled => {
                info!("Round closed before should-respond finished");
                return MessageOutcome::Cancelled;
            }
            Verdict::GaveUp {
                attempts,
                last_error,
            } => {
                warn!(attempts, error = ?last_error, "Should-respond gave up");
                return MessageOutcome::Failed(
                    last_error.unwrap_or_else(|| "should-respond exhausted".to_string()),
                );
            }
        }

        // Another reply may have claimed the cooldown while the oracle was deciding
        let context = {
            let mut state = self.state.lock().await;
            let now = Utc::now();
            if !privileged && state.cooldown.is_active(now) {
                debug!("Cooldown started while deciding, dropping reply");
                return MessageOutcome::Rejected(RejectReason::CooldownActive);
            }
            state.cooldown.mark_response(now);
            self.capture(&state, round_id, self.config.max_messages)
        };

        let prompt = completion_prompt(&context, &mut rand::thread_rng());
        let text = tokio::select! {
            biased;
            _ = round_closed(status) => {
                info!("Round closed during generation, dropping reply");
                return MessageOutcome::Cancelled;
            }
            result = self.generate(ModelClass::Large, prompt) => match result {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Reply generation failed");
                    return MessageOutcome::Failed(e.to_string());
                }
            },
        };

        match self.send_message(text.clone()).await {
            Ok(_) => MessageOutcome::Responded { text },
            Err(e) => {
                warn!(error = %e, "Failed to send reply");
                MessageOutcome::Failed(e.to_string())
            }
        }
    }

    #[instrument(skip(self, observation), fields(round_id = observation.content.round_id))]
    pub async fn handle_observation(&self, observation: Observation) -> MessageOutcome {
        let mut state = self.state.lock().await;
        match self
            .gatekeeper
            .admit_observation(&mut state, &observation, Utc::now())
        {
            GateOutcome::Admitted => MessageOutcome::Recorded,
            GateOutcome::Rejected(reason) => {
                debug!(code = reason.code(), %reason, "Observation rejected");
                MessageOutcome::Rejected(reason)
            }
            GateOutcome::Ignored(reason) => MessageOutcome::Ignored(reason),
        }
    }

    /// End-of-round decision. Relay and store failures are logged; the
    /// decision is still returned.
    #[instrument(skip(self), fields(round_id = request.round_id))]
    pub async fn handle_decision_request(&self, request: DecisionRequest) -> Result<DecisionOutcome> {
        if request.room_id != self.room_id {
            return Err(RoundError::Validation(format!(
                "decision requested for room {}, agent is in room {}",
                request.room_id, self.room_id
            )));
        }

        let context = {
            let state = self.state.lock().await;
            let policy = self.config.decision_policy;
            let gated = policy.require_current || policy.require_open;
            // An ungated policy also accepts rounds this agent never saw
            let checked = if gated {
                check_round(&state.context, request.round_id, policy)
            } else {
                Ok(())
            };
            if let Err(why) = checked {
                return Err(RoundError::Validation(format!(
                    "{}: {}",
                    RejectReason::RoundInvalid {
                        round_id: request.round_id,
                        why
                    }
                    .code(),
                    why
                )));
            }
            self.capture(&state, request.round_id, self.config.max_messages)
        };

        let text = self
            .generate(ModelClass::Medium, decision_prompt(&context))
            .await?;
        let classified = classify_decision(&text);
        if classified.fallback {
            warn!(response = %text, "Unrecognized decision text, defaulting to HOLD");
        }

        let timestamp = Utc::now().timestamp_millis();
        let content = DecisionContent {
            decision: classified.decision,
            agent_id: self.agent_id,
            room_id: self.room_id,
            round_id: request.round_id,
            timestamp,
        };
        let signature = self.wallet.sign_payload(&content).await?;
        let message = MessageEnvelope {
            content,
            message_type: MessageType::AgentDecision,
            signature,
            sender: self.wallet.address_string(),
        };

        match self.relay.post_decision(message.clone()).await {
            Ok(()) => info!(decision = %classified.decision, "Decision dispatched"),
            Err(e) => warn!(error = %e, "Failed to dispatch decision"),
        }

        let outcome = AgentOutcome {
            decision: classified.decision,
            timestamp: Some(timestamp),
            fabricated: false,
        };
        if let Err(e) = self
            .store
            .record_outcome(request.round_id, self.agent_id, outcome)
            .await
        {
            warn!(error = %e, "Failed to record decision outcome");
        }

        Ok(DecisionOutcome {
            decision: classified.decision,
            fallback: classified.fallback,
            message,
        })
    }

    // ==================== Outbound ====================

    /// Sign a message for the current round and hand it to the relay in the
    /// background. Dispatch failures are only logged.
    pub async fn send_message(&self, text: String) -> Result<AgentMessage> {
        let round_id = {
            let state = self.state.lock().await;
            state.context.current_round_id
        };
        if round_id == NO_ROUND {
            return Err(RoundError::Validation("no current round to post into".to_string()));
        }

        let content = AgentMessageContent {
            agent_id: self.agent_id,
            room_id: self.room_id,
            round_id,
            text,
            timestamp: Utc::now().timestamp_millis(),
        };
        let signature = self.wallet.sign_payload(&content).await?;
        let message = MessageEnvelope {
            content,
            message_type: MessageType::AgentMessage,
            signature,
            sender: self.wallet.address_string(),
        };

        {
            let mut state = self.state.lock().await;
            if let Some(round) = state.context.rounds.get_mut(round_id) {
                round.messages.push(MessageRecord {
                    timestamp: message.content.timestamp,
                    agent_id: self.agent_id,
                    agent_name: self.profile.name.clone(),
                    text: message.content.text.clone(),
                });
            }
        }

        self.dispatch(message.clone());
        Ok(message)
    }

    fn dispatch(&self, message: AgentMessage) -> JoinHandle<()> {
        let relay = Arc::clone(&self.relay);
        tokio::spawn(async move {
            let round_id = message.content.round_id;
            match relay.post_agent_message(message).await {
                Ok(()) => info!(round_id, "Message dispatched"),
                Err(e) => warn!(round_id, error = %e, "Message dispatch failed"),
            }
        })
    }

    async fn announce_presence(&self, context: PromptContext) {
        let text = match self.generate(ModelClass::Large, announce_prompt(&context)).await {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Presence announcement generation failed");
                return;
            }
        };
        match self.send_message(text).await {
            Ok(_) => info!(round_id = context.round_id, "Announced presence"),
            Err(e) => warn!(error = %e, "Presence announcement not sent"),
        }
    }

    // ==================== Lifecycle ====================

    pub async fn apply_lifecycle_event(&self, event: LifecycleEvent) -> Result<SyncOutcome> {
        let roster = match &event {
            LifecycleEvent::RoundInsert {
                round_id, room_id, ..
            } => {
                if *room_id != self.room_id {
                    return Ok(SyncOutcome::Ignored(IgnoreReason::OtherRoom(*room_id)));
                }
                match self.store.fetch_round_roster(*round_id).await {
                    Ok(roster) => roster,
                    Err(e) => {
                        warn!(round_id, error = %e, "Roster fetch failed, inserting round without participants");
                        BTreeMap::new()
                    }
                }
            }
            _ => BTreeMap::new(),
        };

        let is_insert = matches!(event, LifecycleEvent::RoundInsert { .. });
        let round_id = event.round_id();
        let (outcome, announce) = {
            let mut state = self.state.lock().await;
            let outcome = apply_event(&mut state.context, event, roster);
            let announce = match state.context.rounds.get(round_id) {
                Some(round)
                    if is_insert
                        && outcome.is_applied()
                        && self.config.introduce_on_round_start
                        && round.status.is_joinable()
                        && round.is_participant(self.agent_id) =>
                {
                    Some(self.capture(&state, round_id, self.config.context_window))
                }
                _ => None,
            };
            (outcome, announce)
        };

        if let SyncOutcome::Ignored(reason) = outcome {
            debug!(%reason, "Lifecycle event ignored");
        }
        if let Some(context) = announce {
            self.announce_presence(context).await;
        }
        Ok(outcome)
    }

    /// Apply every event from `events`, each in its own task, until the
    /// channel closes.
    pub async fn drive_lifecycle(self: Arc<Self>, mut events: mpsc::Receiver<LifecycleEvent>) {
        while let Some(event) = events.recv().await {
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                let kind = event.kind();
                let round_id = event.round_id();
                if let Err(e) = engine.apply_lifecycle_event(event).await {
                    warn!(kind, round_id, error = %e, "Failed to apply lifecycle event");
                }
            });
        }
        info!("Lifecycle event stream closed");
    }

    /// Load the room and its latest round. Failures here abort startup.
    pub async fn initialize_room_context(&self) -> Result<()> {
        let fatal = |e: RoundError| RoundError::FatalInit(e.to_string());

        let room = self
            .store
            .fetch_room(self.room_id)
            .await
            .map_err(fatal)?
            .ok_or_else(|| RoundError::FatalInit(format!("room {} not found", self.room_id)))?;
        if !room.active {
            return Err(RoundError::FatalInit(format!("room {} is not active", self.room_id)));
        }

        let latest = self
            .store
            .fetch_latest_round(self.room_id)
            .await
            .map_err(fatal)?;

        let announce = {
            let mut state = self.state.lock().await;
            state.context.topic = room.topic;
            state.context.chain_id = room.chain_id;

            match latest {
                Some(record) => {
                    let joinable = record.status.is_joinable();
                    let round_id = record.id;
                    let limits = state.context.limits;
                    let round = Round::new(
                        record.id,
                        record.room_id,
                        record.status,
                        record.created_at,
                        record.agents,
                        limits,
                    )
                    .with_ends_at(record.ends_at);
                    state.context.install_round(round);
                    info!(round_id, status = %record.status, "Room context initialized");
                    joinable.then(|| self.capture(&state, round_id, self.config.context_window))
                }
                None => {
                    info!(room_id = self.room_id, "No rounds yet, waiting for round start");
                    None
                }
            }
        };

        if let Some(context) = announce {
            self.announce_presence(context).await;
        }
        Ok(())
    }

    /// Refresh one round, or every tracked round, from the store. Messages
    /// are kept; observations are re-fetched for OPEN rounds.
    pub async fn sync_state_with_round(
        &self,
        room_id: RoomId,
        round_id: Option<RoundId>,
    ) -> Result<usize> {
        if room_id != self.room_id {
            return Err(RoundError::Validation(format!(
                "sync requested for room {}, agent is in room {}",
                room_id, self.room_id
            )));
        }

        let ids = match round_id {
            Some(id) => vec![id],
            None => self.state.lock().await.context.rounds.ids(),
        };
        let records = self.store.fetch_rounds(room_id, ids).await?;

        let mut refreshed = Vec::with_capacity(records.len());
        for record in records {
            let observations = if record.status == RoundStatus::Open {
                Some(
                    self.store
                        .fetch_observations(record.id, self.config.max_observations)
                        .await?,
                )
            } else {
                None
            };
            refreshed.push((record, observations));
        }

        let count = refreshed.len();
        let mut state = self.state.lock().await;
        let limits = state.context.limits;
        for (record, observations) in refreshed.into_iter().rev() {
            match state.context.rounds.get_mut(record.id) {
                Some(round) => {
                    round.set_status(record.status);
                    round.agents = record.agents;
                    round.started_at = record.created_at;
                    round.ends_at = record.ends_at;
                    if let Some(observations) = observations {
                        round.observations.replace_with(observations);
                    }
                }
                None => {
                    let mut round = Round::new(
                        record.id,
                        record.room_id,
                        record.status,
                        record.created_at,
                        record.agents,
                        limits,
                    )
                    .with_ends_at(record.ends_at);
                    if let Some(observations) = observations {
                        round.observations.replace_with(observations);
                    }
                    state.context.upsert_round(round);
                }
            }
        }
        info!(count, "Synchronized rounds with store");
        Ok(count)
    }

    /// Startup check that the signing wallet is registered for this agent
    pub async fn verify_identity(&self) -> Result<()> {
        let ours = self.wallet.address_string();
        let registered = self
            .store
            .fetch_agent_wallets(self.agent_id)
            .await
            .map_err(|e| RoundError::FatalInit(e.to_string()))?;

        if registered.iter().any(|w| w.eq_ignore_ascii_case(&ours)) {
            info!(address = %ours, "Wallet matches registered agent wallet");
            Ok(())
        } else {
            error!(address = %ours, registered = ?registered, "Wallet not registered for agent");
            Err(RoundError::FatalInit(format!(
                "wallet {} is not registered for agent {}",
                ours, self.agent_id
            )))
        }
    }

    // ==================== Introspection ====================

    pub async fn context_snapshot(&self) -> Result<serde_json::Value> {
        let state = self.state.lock().await;
        Ok(serde_json::to_value(&state.context)?)
    }

    pub async fn current_round_id(&self) -> RoundId {
        self.state.lock().await.context.current_round_id
    }

    pub async fn tracked_rounds(&self) -> Vec<RoundId> {
        self.state.lock().await.context.rounds.ids()
    }

    pub async fn round_status(&self, round_id: RoundId) -> Option<RoundStatus> {
        self.state
            .lock()
            .await
            .context
            .rounds
            .get(round_id)
            .map(|r| r.status)
    }

    pub async fn round_messages(&self, round_id: RoundId) -> Vec<MessageRecord> {
        self.state
            .lock()
            .await
            .context
            .rounds
            .get(round_id)
            .map(|r| r.messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn round_decisions(&self, round_id: RoundId) -> BTreeMap<AgentId, AgentOutcome> {
        self.state
            .lock()
            .await
            .context
            .rounds
            .get(round_id)
            .map(|r| r.decisions.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AgentSummary, FifoLimits, ObservationContent};
    use crate::oracle::MockOracle;
    use crate::relay::MockRelay;
    use crate::store::{MockRoundStore, RoomRecord, RoundRecord};
    use crate::domain::Topic;
    use serde_json::json;

    const HARDHAT_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const SELF_ID: AgentId = 1;
    const PEER_ID: AgentId = 2;
    const ROOM: RoomId = 290;

    fn agent() -> AgentConfig {
        AgentConfig {
            id: SELF_ID,
            room_id: ROOM,
            chain_id: 1,
            profile: AgentProfile {
                name: "Cautious Carl".into(),
                ..AgentProfile::default()
            },
        }
    }

    fn engine_config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.should_respond.initial_delay_ms = 1;
        config.should_respond.max_attempts = 2;
        config
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

    fn engine(oracle: MockOracle, relay: MockRelay, store: MockRoundStore) -> RoundEngine {
        RoundEngine::new(
            &agent(),
            engine_config(),
            Wallet::from_private_key(HARDHAT_KEY, 1).unwrap(),
            Arc::new(oracle),
            Arc::new(relay),
            Arc::new(store),
        )
    }

    async fn seed_round(engine: &RoundEngine, round_id: RoundId, status: RoundStatus) {
        let mut state = engine.state.lock().await;
        let round = Round::new(round_id, ROOM, status, Utc::now(), roster(), FifoLimits::default());
        state.context.install_round(round);
    }

    fn peer_message(sig: &str, round_id: RoundId) -> AgentMessage {
        MessageEnvelope {
            content: AgentMessageContent {
                agent_id: PEER_ID,
                room_id: ROOM,
                round_id,
                text: "ETH looks strong, thoughts @Cautious Carl?".into(),
                timestamp: 1_700_000_000_000,
            },
            message_type: MessageType::AgentMessage,
            signature: sig.into(),
            sender: format!("0x{:040x}", PEER_ID),
        }
    }

    #[tokio::test]
    async fn test_respond_path_marks_cooldown_and_dispatches() {
        let mut oracle = MockOracle::new();
        oracle.expect_generate_text().returning(|req| match req.model {
            ModelClass::Small => Ok("```json\n{\"action\": \"[RESPOND]\"}\n```".into()),
            _ => Ok("Careful, volume is thin.".into()),
        });
        let mut relay = MockRelay::new();
        relay.expect_post_agent_message().times(1).returning(|_| Ok(()));

        let engine = engine(oracle, relay, MockRoundStore::new());
        seed_round(&engine, 4, RoundStatus::Open).await;

        let outcome = engine.handle_agent_message(peer_message("0xa", 4)).await;
        assert_eq!(
            outcome,
            MessageOutcome::Responded {
                text: "Careful, volume is thin.".into()
            }
        );
        assert!(engine.state.lock().await.cooldown.is_active(Utc::now()));

        // Own reply and the peer message are both in context
        let messages = engine.round_messages(4).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].agent_id, SELF_ID);

        // Next unsolicited peer message hits the cooldown
        let second = engine.handle_agent_message(peer_message("0xb", 4)).await;
        assert_eq!(second, MessageOutcome::Rejected(RejectReason::CooldownActive));

        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn test_ignore_does_not_start_cooldown() {
        let mut oracle = MockOracle::new();
        oracle
            .expect_generate_text()
            .times(1)
            .returning(|_| Ok("[IGNORE]".into()));
        let engine = engine(oracle, MockRelay::new(), MockRoundStore::new());
        seed_round(&engine, 4, RoundStatus::Open).await;

        let outcome = engine.handle_agent_message(peer_message("0xa", 4)).await;
        assert_eq!(outcome, MessageOutcome::Declined(ShouldRespond::Ignore));
        assert!(outcome.is_success());
        assert!(!engine.state.lock().await.cooldown.is_active(Utc::now()));
    }

    #[tokio::test]
    async fn test_rejected_message_never_reaches_oracle() {
        let mut oracle = MockOracle::new();
        oracle.expect_generate_text().times(0);
        let engine = engine(oracle, MockRelay::new(), MockRoundStore::new());
        seed_round(&engine, 4, RoundStatus::Open).await;

        let outcome = engine.handle_agent_message(peer_message("0xa", 5)).await;
        assert_eq!(outcome.reason_code(), Some("ROUND_INVALID"));
        assert!(!outcome.is_success());
    }

    #[tokio::test]
    async fn test_decision_for_closed_round_is_signed_and_recorded() {
        let mut oracle = MockOracle::new();
        oracle
            .expect_generate_text()
            .times(1)
            .returning(|_| Ok("SELL, the trend is broken".into()));
        let mut relay = MockRelay::new();
        relay.expect_post_decision().times(1).returning(|_| Ok(()));
        let mut store = MockRoundStore::new();
        store
            .expect_record_outcome()
            .withf(|round_id, agent_id, outcome| {
                *round_id == 4 && *agent_id == SELF_ID && outcome.decision == Decision::Sell && !outcome.fabricated
            })
            .times(1)
            .returning(|_, _, _| Ok(()));

        let engine = engine(oracle, relay, store);
        seed_round(&engine, 4, RoundStatus::Closed).await;

        let outcome = engine
            .handle_decision_request(DecisionRequest {
                room_id: ROOM,
                round_id: 4,
            })
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Sell);
        assert!(!outcome.fallback);
        assert_eq!(outcome.message.message_type, MessageType::AgentDecision);
        verify_signed_payload(
            &outcome.message.content,
            &outcome.message.signature,
            &outcome.message.sender,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_decision_survives_relay_and_store_failures() {
        let mut oracle = MockOracle::new();
        oracle
            .expect_generate_text()
            .returning(|_| Ok("no idea".into()));
        let mut relay = MockRelay::new();
        relay
            .expect_post_decision()
            .returning(|_| Err(RoundError::Relay("502".into())));
        let mut store = MockRoundStore::new();
        store
            .expect_record_outcome()
            .returning(|_, _, _| Err(RoundError::RoundNotFound(4)));

        let engine = engine(oracle, relay, store);
        let outcome = engine
            .handle_decision_request(DecisionRequest {
                room_id: ROOM,
                round_id: 4,
            })
            .await
            .unwrap();
        assert_eq!(outcome.decision, Decision::Hold);
        assert!(outcome.fallback);
    }

    #[tokio::test]
    async fn test_round_insert_fetches_roster() {
        let mut store = MockRoundStore::new();
        store
            .expect_fetch_round_roster()
            .withf(|id| *id == 42)
            .times(1)
            .returning(|_| Ok(roster()));
        let engine = engine(MockOracle::new(), MockRelay::new(), store);

        let outcome = engine
            .apply_lifecycle_event(LifecycleEvent::RoundInsert {
                round_id: 42,
                room_id: ROOM,
                status: RoundStatus::Open,
                created_at: Utc::now(),
                ends_at: None,
            })
            .await
            .unwrap();
        assert!(outcome.is_applied());
        assert_eq!(engine.current_round_id().await, 42);

        let other_room = engine
            .apply_lifecycle_event(LifecycleEvent::RoundInsert {
                round_id: 43,
                room_id: 7,
                status: RoundStatus::Open,
                created_at: Utc::now(),
                ends_at: None,
            })
            .await
            .unwrap();
        assert_eq!(other_room, SyncOutcome::Ignored(IgnoreReason::OtherRoom(7)));
    }

    #[tokio::test]
    async fn test_initialize_rejects_inactive_room() {
        let mut store = MockRoundStore::new();
        store.expect_fetch_room().returning(|id| {
            Ok(Some(RoomRecord {
                id,
                active: false,
                chain_id: 1,
                topic: Topic::default(),
            }))
        });
        let engine = engine(MockOracle::new(), MockRelay::new(), store);
        let err = engine.initialize_room_context().await.unwrap_err();
        assert!(matches!(err, RoundError::FatalInit(_)));
    }

    #[tokio::test]
    async fn test_sync_keeps_messages_and_refetches_observations() {
        let mut store = MockRoundStore::new();
        store.expect_fetch_rounds().returning(|room_id, _| {
            Ok(vec![RoundRecord {
                id: 4,
                room_id,
                status: RoundStatus::Open,
                created_at: Utc::now(),
                ends_at: None,
                agents: roster(),
            }])
        });
        store
            .expect_fetch_observations()
            .returning(|_, _| Ok(vec![json!({"price": 1}).to_string()]));
        let mut oracle = MockOracle::new();
        oracle.expect_generate_text().returning(|_| Ok("[STOP]".into()));

        let engine = engine(oracle, MockRelay::new(), store);
        seed_round(&engine, 4, RoundStatus::Open).await;
        let outcome = engine.handle_agent_message(peer_message("0xa", 4)).await;
        assert_eq!(outcome, MessageOutcome::Declined(ShouldRespond::Stop));

        let count = engine.sync_state_with_round(ROOM, Some(4)).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(engine.round_status(4).await, Some(RoundStatus::Open));

        let state = engine.state.lock().await;
        let round = state.context.rounds.get(4).unwrap();
        assert_eq!(round.observations.len(), 1);
        assert_eq!(round.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_identity() {
        let mut store = MockRoundStore::new();
        store
            .expect_fetch_agent_wallets()
            .returning(|_| Ok(vec!["0xf39fd6e51aad88f6f4ce6ab8827279cfffb92266".into()]));
        let engine = engine(MockOracle::new(), MockRelay::new(), store);
        engine.verify_identity().await.unwrap();

        let mut store = MockRoundStore::new();
        store
            .expect_fetch_agent_wallets()
            .returning(|_| Ok(vec!["0x0000000000000000000000000000000000000001".into()]));
        let engine = RoundEngine::new(
            &agent(),
            engine_config(),
            Wallet::from_private_key(HARDHAT_KEY, 1).unwrap(),
            Arc::new(MockOracle::new()),
            Arc::new(MockRelay::new()),
            Arc::new(store),
        );
        assert!(engine.verify_identity().await.is_err());
    }

    #[tokio::test]
    async fn test_observation_recorded() {
        let engine = engine(MockOracle::new(), MockRelay::new(), MockRoundStore::new());
        seed_round(&engine, 4, RoundStatus::Open).await;
        let observation = MessageEnvelope {
            content: ObservationContent {
                agent_id: 50,
                room_id: ROOM,
                round_id: 4,
                observation_type: "price-data".into(),
                data: json!({"price": 3100}),
                timestamp: None,
            },
            message_type: MessageType::Observation,
            signature: "0xobs".into(),
            sender: format!("0x{:040x}", 50),
        };
        assert_eq!(engine.handle_observation(observation.clone()).await, MessageOutcome::Recorded);
        assert_eq!(
            engine.handle_observation(observation).await,
            MessageOutcome::Rejected(RejectReason::Duplicate)
        );
    }
}
