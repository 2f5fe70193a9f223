//! Single-timestamp gate on unsolicited responses. Applies to all peers
//! uniformly.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

#[derive(Debug)]
pub struct CooldownTimer {
    window: ChronoDuration,
    last_response: Option<DateTime<Utc>>,
}

impl CooldownTimer {
    pub fn new(window_ms: u64) -> Self {
        let clamped = window_ms.min(i64::MAX as u64) as i64;
        Self {
            window: ChronoDuration::milliseconds(clamped),
            last_response: None,
        }
    }

    /// Active iff `now - last_response < window`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.last_response {
            Some(last) => now.signed_duration_since(last) < self.window,
            None => false,
        }
    }

    pub fn mark_response(&mut self, now: DateTime<Utc>) {
        self.last_response = Some(now);
    }

    pub fn remaining(&self, now: DateTime<Utc>) -> ChronoDuration {
        match self.last_response {
            Some(last) => (self.window - now.signed_duration_since(last)).max(ChronoDuration::zero()),
            None => ChronoDuration::zero(),
        }
    }
}
