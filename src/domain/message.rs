//! Wire payloads exchanged with the relay

use serde::{Deserialize, Serialize};

use super::round::{AgentId, Decision, RoomId, RoundId};
use crate::error::{Result, RoundError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    AgentMessage,
    AgentDecision,
    GmMessage,
    Observation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::AgentMessage => "agent_message",
            MessageType::AgentDecision => "agent_decision",
            MessageType::GmMessage => "gm_message",
            MessageType::Observation => "observation",
        }
    }
}

/// Signed envelope around a content payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope<C> {
    pub content: C,
    pub message_type: MessageType,
    pub signature: String,
    pub sender: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentMessageContent {
    pub agent_id: AgentId,
    pub room_id: RoomId,
    pub round_id: RoundId,
    pub text: String,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservationContent {
    pub agent_id: AgentId,
    pub room_id: RoomId,
    pub round_id: RoundId,
    pub observation_type: String,
    pub data: serde_json::Value,
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionContent {
    pub decision: Decision,
    pub agent_id: AgentId,
    pub room_id: RoomId,
    pub round_id: RoundId,
    pub timestamp: i64,
}

pub type AgentMessage = MessageEnvelope<AgentMessageContent>;
pub type Observation = MessageEnvelope<ObservationContent>;
pub type DecisionMessage = MessageEnvelope<DecisionContent>;

/// End-of-round request for this agent's verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub room_id: RoomId,
    pub round_id: RoundId,
}

fn validate_envelope_fields(signature: &str, sender: &str) -> Result<()> {
    if signature.trim().is_empty() {
        return Err(RoundError::Validation("signature is empty".into()));
    }
    let address = sender.trim_start_matches("0x");
    if !sender.starts_with("0x") || address.len() != 40 || hex::decode(address).is_err() {
        return Err(RoundError::Validation(format!(
            "sender is not a 20-byte hex address: {sender}"
        )));
    }
    Ok(())
}

fn validate_ids(agent_id: AgentId, room_id: RoomId, round_id: RoundId) -> Result<()> {
    if agent_id <= 0 || room_id <= 0 || round_id <= 0 {
        return Err(RoundError::Validation(format!(
            "ids must be positive (agent={agent_id}, room={room_id}, round={round_id})"
        )));
    }
    Ok(())
}

impl AgentMessage {
    /// Boundary validation; failures map to a 400 before the engine sees them
    pub fn validate(&self) -> Result<()> {
        match self.message_type {
            MessageType::AgentMessage | MessageType::GmMessage => {}
            other => {
                return Err(RoundError::Validation(format!(
                    "unexpected message type {} for an agent message",
                    other.as_str()
                )))
            }
        }
        validate_envelope_fields(&self.signature, &self.sender)?;
        validate_ids(self.content.agent_id, self.content.room_id, self.content.round_id)?;
        if self.content.text.trim().is_empty() {
            return Err(RoundError::Validation("message text is empty".into()));
        }
        if self.content.timestamp <= 0 {
            return Err(RoundError::Validation("timestamp must be positive".into()));
        }
        Ok(())
    }
}

impl Observation {
    pub fn validate(&self) -> Result<()> {
        if self.message_type != MessageType::Observation {
            return Err(RoundError::Validation(format!(
                "unexpected message type {} for an observation",
                self.message_type.as_str()
            )));
        }
        validate_envelope_fields(&self.signature, &self.sender)?;
        validate_ids(self.content.agent_id, self.content.room_id, self.content.round_id)?;
        if self.content.observation_type.trim().is_empty() {
            return Err(RoundError::Validation("observationType is empty".into()));
        }
        Ok(())
    }
}

impl ObservationContent {
    /// JSON line kept in a round's observation buffer, camelCase keys
    pub fn to_context_entry(&self) -> String {
        let mut entry = serde_json::Map::new();
        entry.insert("agentId".into(), self.agent_id.into());
        entry.insert("roomId".into(), self.room_id.into());
        entry.insert("roundId".into(), self.round_id.into());
        entry.insert("observationType".into(), self.observation_type.clone().into());
        entry.insert("data".into(), self.data.clone());
        entry.insert(
            "timestamp".into(),
            match self.timestamp {
                Some(ts) => ts.into(),
                None => serde_json::Value::Null,
            },
        );
        serde_json::Value::Object(entry).to_string()
    }
}
