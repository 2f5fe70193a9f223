//! Lifecycle synchronizer: applies round insert/update/outcome events from
//! the change feed or chain listener to the room context.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

use crate::domain::{
    AgentId, AgentOutcome, AgentSummary, RoomContext, RoomId, Round, RoundId, RoundStatus,
};

#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    RoundInsert {
        round_id: RoundId,
        room_id: RoomId,
        status: RoundStatus,
        created_at: DateTime<Utc>,
        ends_at: Option<DateTime<Utc>>,
    },
    RoundUpdate {
        round_id: RoundId,
        room_id: RoomId,
        status: RoundStatus,
    },
    RoundAgentOutcome {
        round_id: RoundId,
        agent_id: AgentId,
        outcome: AgentOutcome,
    },
}

impl LifecycleEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::RoundInsert { .. } => "round_insert",
            LifecycleEvent::RoundUpdate { .. } => "round_update",
            LifecycleEvent::RoundAgentOutcome { .. } => "round_agent_outcome",
        }
    }

    pub fn round_id(&self) -> RoundId {
        match self {
            LifecycleEvent::RoundInsert { round_id, .. }
            | LifecycleEvent::RoundUpdate { round_id, .. }
            | LifecycleEvent::RoundAgentOutcome { round_id, .. } => *round_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    OtherRoom(RoomId),
    UnknownRound(RoundId),
    UnknownAgent { round_id: RoundId, agent_id: AgentId },
}

impl fmt::Display for IgnoreReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IgnoreReason::OtherRoom(room) => write!(f, "event for room {}", room),
            IgnoreReason::UnknownRound(round) => write!(f, "round {} not tracked", round),
            IgnoreReason::UnknownAgent { round_id, agent_id } => {
                write!(f, "agent {} not in round {}", agent_id, round_id)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    Ignored(IgnoreReason),
}

impl SyncOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, SyncOutcome::Applied)
    }
}

/// Insert a round and make it current. A round that is already tracked keeps
/// its FIFOs and decisions; only status, timing and roster are refreshed.
pub fn apply_round_insert(
    ctx: &mut RoomContext,
    round_id: RoundId,
    room_id: RoomId,
    status: RoundStatus,
    created_at: DateTime<Utc>,
    ends_at: Option<DateTime<Utc>>,
    roster: BTreeMap<AgentId, AgentSummary>,
) -> SyncOutcome {
    if room_id != ctx.room_id {
        debug!(round_id, room_id, "Ignoring round insert for other room");
        return SyncOutcome::Ignored(IgnoreReason::OtherRoom(room_id));
    }

    if let Some(existing) = ctx.rounds.get_mut(round_id) {
        existing.set_status(status);
        existing.started_at = created_at;
        if ends_at.is_some() {
            existing.ends_at = ends_at;
        }
        if !roster.is_empty() {
            existing.agents = roster;
        }
        ctx.current_round_id = round_id;
        info!(round_id, %status, "Round re-inserted, state refreshed");
        return SyncOutcome::Applied;
    }

    let round = Round::new(round_id, room_id, status, created_at, roster, ctx.limits)
        .with_ends_at(ends_at);
    let agents = round.agents.len();
    let evicted = ctx.install_round(round);
    info!(
        round_id,
        %status,
        agents,
        evicted = ?evicted,
        "Round inserted and set as current"
    );
    SyncOutcome::Applied
}

/// Merge a status change into a tracked round
pub fn apply_round_update(
    ctx: &mut RoomContext,
    round_id: RoundId,
    room_id: RoomId,
    status: RoundStatus,
) -> SyncOutcome {
    if room_id != ctx.room_id {
        return SyncOutcome::Ignored(IgnoreReason::OtherRoom(room_id));
    }

    match ctx.rounds.get_mut(round_id) {
        Some(round) => {
            let previous = round.status;
            round.set_status(status);
            info!(round_id, from = %previous, to = %status, "Round status updated");
            SyncOutcome::Applied
        }
        None => {
            warn!(round_id, %status, "Round update for untracked round ignored");
            SyncOutcome::Ignored(IgnoreReason::UnknownRound(round_id))
        }
    }
}

/// Record an agent's outcome. Last write wins.
pub fn apply_agent_outcome(
    ctx: &mut RoomContext,
    round_id: RoundId,
    agent_id: AgentId,
    outcome: AgentOutcome,
) -> SyncOutcome {
    let Some(round) = ctx.rounds.get_mut(round_id) else {
        warn!(round_id, agent_id, "Outcome for untracked round ignored");
        return SyncOutcome::Ignored(IgnoreReason::UnknownRound(round_id));
    };

    if !round.is_participant(agent_id) {
        warn!(round_id, agent_id, "Outcome for agent outside roster ignored");
        return SyncOutcome::Ignored(IgnoreReason::UnknownAgent { round_id, agent_id });
    }

    debug!(round_id, agent_id, decision = %outcome.decision, "Recorded agent outcome");
    round.decisions.insert(agent_id, outcome);
    SyncOutcome::Applied
}

/// Apply any event. `roster` is only consulted for inserts.
pub fn apply_event(
    ctx: &mut RoomContext,
    event: LifecycleEvent,
    roster: BTreeMap<AgentId, AgentSummary>,
) -> SyncOutcome {
    match event {
        LifecycleEvent::RoundInsert {
            round_id,
            room_id,
            status,
            created_at,
            ends_at,
        } => apply_round_insert(ctx, round_id, room_id, status, created_at, ends_at, roster),
        LifecycleEvent::RoundUpdate {
            round_id,
            room_id,
            status,
        } => apply_round_update(ctx, round_id, room_id, status),
        LifecycleEvent::RoundAgentOutcome {
            round_id,
            agent_id,
            outcome,
        } => apply_agent_outcome(ctx, round_id, agent_id, outcome),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Decision, FifoLimits, MessageRecord, NO_ROUND};

    const ROOM: RoomId = 290;

    fn context(capacity: usize) -> RoomContext {
        RoomContext::new(ROOM, capacity, FifoLimits::default())
    }

    fn roster(ids: &[AgentId]) -> BTreeMap<AgentId, AgentSummary> {
        ids.iter()
            .map(|id| {
                (
                    *id,
                    AgentSummary {
                        id: *id,
                        display_name: format!("Agent {id}"),
                        wallet_address: format!("0x{:040x}", id),
                        single_sentence_summary: Some("trader".into()),
                    },
                )
            })
            .collect()
    }

    fn insert(id: RoundId) -> LifecycleEvent {
        LifecycleEvent::RoundInsert {
            round_id: id,
            room_id: ROOM,
            status: RoundStatus::Open,
            created_at: Utc::now(),
            ends_at: None,
        }
    }

    #[test]
    fn test_insert_into_empty_context() {
        let mut ctx = context(4);
        assert_eq!(ctx.current_round_id, NO_ROUND);

        let outcome = apply_event(&mut ctx, insert(42), roster(&[1, 2, 3]));
        assert!(outcome.is_applied());
        assert_eq!(ctx.current_round_id, 42);
        let round = ctx.rounds.get(42).unwrap();
        assert_eq!(round.agents.len(), 3);
        assert!(round.decisions.is_empty());
        assert!(round.messages.is_empty());
    }

    #[test]
    fn test_capacity_plus_one_inserts_evict_lowest() {
        let mut ctx = context(3);
        for id in [10, 11, 12, 13] {
            apply_event(&mut ctx, insert(id), roster(&[1]));
        }
        assert!(ctx.rounds.get(10).is_none());
        assert_eq!(ctx.rounds.ids(), vec![11, 12, 13]);
        assert_eq!(ctx.current_round_id, 13);
    }

    #[test]
    fn test_other_room_ignored() {
        let mut ctx = context(3);
        let event = LifecycleEvent::RoundInsert {
            round_id: 5,
            room_id: 7,
            status: RoundStatus::Open,
            created_at: Utc::now(),
            ends_at: None,
        };
        assert_eq!(
            apply_event(&mut ctx, event, BTreeMap::new()),
            SyncOutcome::Ignored(IgnoreReason::OtherRoom(7))
        );
        assert!(ctx.rounds.is_empty());
    }

    #[test]
    fn test_reinsert_preserves_history() {
        let mut ctx = context(3);
        apply_event(&mut ctx, insert(5), roster(&[1, 2]));
        ctx.rounds.get_mut(5).unwrap().messages.push(MessageRecord {
            timestamp: 1,
            agent_id: 2,
            agent_name: "Agent 2".into(),
            text: "gm".into(),
        });

        let again = LifecycleEvent::RoundInsert {
            round_id: 5,
            room_id: ROOM,
            status: RoundStatus::Closing,
            created_at: Utc::now(),
            ends_at: None,
        };
        apply_event(&mut ctx, again, BTreeMap::new());
        let round = ctx.rounds.get(5).unwrap();
        assert_eq!(round.status, RoundStatus::Closing);
        assert_eq!(round.messages.len(), 1);
        assert_eq!(round.agents.len(), 2);
    }

    #[test]
    fn test_update_merges_status_and_wakes_waiters() {
        let mut ctx = context(3);
        apply_event(&mut ctx, insert(8), roster(&[1]));
        let rx = ctx.rounds.get(8).unwrap().subscribe_status();

        let outcome = apply_round_update(&mut ctx, 8, ROOM, RoundStatus::Closed);
        assert!(outcome.is_applied());
        assert_eq!(*rx.borrow(), RoundStatus::Closed);
        assert_eq!(ctx.rounds.get(8).unwrap().agents.len(), 1);
    }

    #[test]
    fn test_update_for_unknown_round_ignored() {
        let mut ctx = context(3);
        assert_eq!(
            apply_round_update(&mut ctx, 77, ROOM, RoundStatus::Open),
            SyncOutcome::Ignored(IgnoreReason::UnknownRound(77))
        );
    }

    #[test]
    fn test_outcome_recording() {
        let mut ctx = context(3);
        apply_event(&mut ctx, insert(9), roster(&[1, 2]));

        let outcome = AgentOutcome {
            decision: Decision::Sell,
            timestamp: Some(1_700_000_000_000),
            fabricated: false,
        };
        assert!(apply_agent_outcome(&mut ctx, 9, 2, outcome.clone()).is_applied());
        assert_eq!(
            apply_agent_outcome(&mut ctx, 9, 44, outcome.clone()),
            SyncOutcome::Ignored(IgnoreReason::UnknownAgent {
                round_id: 9,
                agent_id: 44
            })
        );
        assert_eq!(
            apply_agent_outcome(&mut ctx, 3, 2, outcome),
            SyncOutcome::Ignored(IgnoreReason::UnknownRound(3))
        );

        let latest = AgentOutcome {
            decision: Decision::Buy,
            timestamp: None,
            fabricated: true,
        };
        apply_agent_outcome(&mut ctx, 9, 2, latest);
        assert_eq!(ctx.rounds.get(9).unwrap().decisions[&2].decision, Decision::Buy);
    }
}
