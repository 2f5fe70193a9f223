//! Signature cache: TTL set of already-seen envelope signatures

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureCacheEntry {
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SignatureCache {
    ttl: ChronoDuration,
    entries: HashMap<String, SignatureCacheEntry>,
}

impl SignatureCache {
    pub fn new(ttl_secs: u64) -> Self {
        let clamped = ttl_secs.min(i64::MAX as u64 / 1000) as i64;
        Self {
            ttl: ChronoDuration::seconds(clamped.max(1)),
            entries: HashMap::new(),
        }
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    /// Insert-if-absent. Returns `true` when the signature was already
    /// present and unexpired (a duplicate); otherwise records it with a
    /// fresh expiry and returns `false`.
    pub fn check_and_insert(&mut self, signature: &str, now: DateTime<Utc>) -> bool {
        self.prune(now);
        if self.entries.contains_key(signature) {
            return true;
        }
        self.entries.insert(
            signature.to_string(),
            SignatureCacheEntry {
                expires_at: now + self.ttl,
            },
        );
        false
    }

    pub fn contains(&self, signature: &str, now: DateTime<Utc>) -> bool {
        self.entries
            .get(signature)
            .is_some_and(|entry| entry.expires_at > now)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
