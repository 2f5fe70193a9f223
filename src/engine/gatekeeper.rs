//! Inbound gatekeeper: ordered validation of agent messages and observations.
//!
//! Checks run in a fixed order and stop at the first failure:
//! duplicate → cooldown → room → round validity → unknown sender → self.
//! Expected rejections are values, never errors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use tracing::debug;

use crate::domain::{
    AgentId, AgentMessage, MessageRecord, Observation, RoomContext, RoomId, RoundId, RoundStatus,
};

use super::state::EngineState;

/// Which round-validity rules apply to a kind of inbound traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundValidityPolicy {
    /// The round must be the agent's current round
    pub require_current: bool,
    /// The round must be OPEN
    pub require_open: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundInvalid {
    Unknown,
    NotCurrent { current: RoundId },
    NotOpen(RoundStatus),
}

impl fmt::Display for RoundInvalid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundInvalid::Unknown => write!(f, "round does not exist in context"),
            RoundInvalid::NotCurrent { current } => {
                write!(f, "round does not match current round {}", current)
            }
            RoundInvalid::NotOpen(status) => write!(f, "round is {} not OPEN", status),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Duplicate,
    CooldownActive,
    RoomMismatch { expected: RoomId, got: RoomId },
    RoundInvalid { round_id: RoundId, why: RoundInvalid },
    UnknownSender(AgentId),
    SelfMessage,
}

impl RejectReason {
    /// Stable reason code returned to callers
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Duplicate => "DUPLICATE",
            RejectReason::CooldownActive => "COOLDOWN_ACTIVE",
            RejectReason::RoomMismatch { .. } => "ROOM_MISMATCH",
            RejectReason::RoundInvalid { .. } => "ROUND_INVALID",
            RejectReason::UnknownSender(_) => "UNKNOWN_SENDER",
            RejectReason::SelfMessage => "SELF_MESSAGE",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Duplicate => write!(f, "duplicate message"),
            RejectReason::CooldownActive => write!(f, "response cooldown active"),
            RejectReason::RoomMismatch { expected, got } => {
                write!(f, "room {} does not match {}", got, expected)
            }
            RejectReason::RoundInvalid { round_id, why } => {
                write!(f, "round {} invalid: {}", round_id, why)
            }
            RejectReason::UnknownSender(id) => write!(f, "agent {} is not in the round", id),
            RejectReason::SelfMessage => write!(f, "message from self"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    /// Passed every check; the payload has been appended to its round
    Admitted,
    Rejected(RejectReason),
    /// Out of scope for this agent (other room); not an error
    Ignored(RejectReason),
}

impl GateOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, GateOutcome::Admitted)
    }
}

/// Round validity check shared by messages, observations and decision requests
pub fn check_round(
    ctx: &RoomContext,
    round_id: RoundId,
    policy: RoundValidityPolicy,
) -> Result<(), RoundInvalid> {
    if policy.require_current && round_id != ctx.current_round_id {
        return Err(RoundInvalid::NotCurrent {
            current: ctx.current_round_id,
        });
    }
    let round = ctx.rounds.get(round_id).ok_or(RoundInvalid::Unknown)?;
    if policy.require_open && !round.status.accepts_messages() {
        return Err(RoundInvalid::NotOpen(round.status));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct Gatekeeper {
    agent_id: AgentId,
    room_id: RoomId,
    privileged: HashSet<AgentId>,
    message_policy: RoundValidityPolicy,
    observation_policy: RoundValidityPolicy,
}

impl Gatekeeper {
    pub fn new(
        agent_id: AgentId,
        room_id: RoomId,
        privileged: impl IntoIterator<Item = AgentId>,
        message_policy: RoundValidityPolicy,
        observation_policy: RoundValidityPolicy,
    ) -> Self {
        Self {
            agent_id,
            room_id,
            privileged: privileged.into_iter().collect(),
            message_policy,
            observation_policy,
        }
    }

    pub fn is_privileged(&self, agent_id: AgentId) -> bool {
        self.privileged.contains(&agent_id)
    }

    /// Run the full pipeline on an agent message. On admission the message
    /// is appended to its round's message FIFO.
    pub fn admit_message(
        &self,
        state: &mut EngineState,
        message: &AgentMessage,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        let content = &message.content;
        let privileged = self.is_privileged(content.agent_id);

        if state.signatures.check_and_insert(&message.signature, now) {
            return GateOutcome::Rejected(RejectReason::Duplicate);
        }

        if !privileged && state.cooldown.is_active(now) {
            return GateOutcome::Rejected(RejectReason::CooldownActive);
        }

        if content.room_id != self.room_id {
            return GateOutcome::Ignored(RejectReason::RoomMismatch {
                expected: self.room_id,
                got: content.room_id,
            });
        }

        if let Err(why) = check_round(&state.context, content.round_id, self.message_policy) {
            return GateOutcome::Rejected(RejectReason::RoundInvalid {
                round_id: content.round_id,
                why,
            });
        }

        let Some(round) = state.context.rounds.get_mut(content.round_id) else {
            return GateOutcome::Rejected(RejectReason::RoundInvalid {
                round_id: content.round_id,
                why: RoundInvalid::Unknown,
            });
        };

        if !privileged && !round.is_participant(content.agent_id) {
            return GateOutcome::Rejected(RejectReason::UnknownSender(content.agent_id));
        }

        if content.agent_id == self.agent_id {
            return GateOutcome::Rejected(RejectReason::SelfMessage);
        }

        let agent_name = if privileged && !round.is_participant(content.agent_id) {
            "Game Master".to_string()
        } else {
            round.agent_name(content.agent_id)
        };
        round.messages.push(MessageRecord {
            timestamp: content.timestamp,
            agent_id: content.agent_id,
            agent_name,
            text: content.text.clone(),
        });
        debug!(
            round_id = round.id,
            agent_id = content.agent_id,
            buffered = round.messages.len(),
            "Admitted agent message"
        );
        GateOutcome::Admitted
    }

    /// Observations only go through the duplicate, room and round checks.
    /// On admission the serialized content is appended to the round's
    /// observation FIFO.
    pub fn admit_observation(
        &self,
        state: &mut EngineState,
        observation: &Observation,
        now: DateTime<Utc>,
    ) -> GateOutcome {
        let content = &observation.content;

        if state.signatures.check_and_insert(&observation.signature, now) {
            return GateOutcome::Rejected(RejectReason::Duplicate);
        }

        if content.room_id != self.room_id {
            return GateOutcome::Ignored(RejectReason::RoomMismatch {
                expected: self.room_id,
                got: content.room_id,
            });
        }

        if let Err(why) = check_round(&state.context, content.round_id, self.observation_policy) {
            return GateOutcome::Rejected(RejectReason::RoundInvalid {
                round_id: content.round_id,
                why,
            });
        }

        let Some(round) = state.context.rounds.get_mut(content.round_id) else {
            return GateOutcome::Rejected(RejectReason::RoundInvalid {
                round_id: content.round_id,
                why: RoundInvalid::Unknown,
            });
        };

        round.observations.push(content.to_context_entry());
        debug!(
            round_id = round.id,
            observation_type = %content.observation_type,
            buffered = round.observations.len(),
            "Admitted observation"
        );
        GateOutcome::Admitted
    }
}
