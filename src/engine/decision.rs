//! Free-text to trade decision classification

use crate::domain::Decision;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classified {
    pub decision: Decision,
    /// No keyword matched; HOLD was assumed
    pub fallback: bool,
}

/// Case-insensitive keyword match with priority buy > sell > hold.
/// Anything else falls back to HOLD.
pub fn classify_decision(text: &str) -> Classified {
    let lower = text.to_lowercase();
    let decision = if lower.contains("buy") {
        Some(Decision::Buy)
    } else if lower.contains("sell") {
        Some(Decision::Sell)
    } else if lower.contains("hold") {
        Some(Decision::Hold)
    } else {
        None
    };

    Classified {
        decision: decision.unwrap_or(Decision::Hold),
        fallback: decision.is_none(),
    }
}
