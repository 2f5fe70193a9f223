//! Round coordination engine

pub mod cooldown;
pub mod coordinator;
pub mod decision;
pub mod dedup;
pub mod gatekeeper;
pub mod lifecycle;
pub mod prompt;
pub mod should_respond;
pub mod state;

pub use cooldown::CooldownTimer;
pub use coordinator::{DecisionOutcome, MessageOutcome, RoundEngine};
pub use decision::{classify_decision, Classified};
pub use dedup::{SignatureCache, SignatureCacheEntry};
pub use gatekeeper::{check_round, GateOutcome, Gatekeeper, RejectReason, RoundInvalid, RoundValidityPolicy};
pub use lifecycle::{apply_event, IgnoreReason, LifecycleEvent, SyncOutcome};
pub use should_respond::{decide_should_respond, parse_should_respond, RetryPolicy, ShouldRespond, Verdict};
pub use state::EngineState;
