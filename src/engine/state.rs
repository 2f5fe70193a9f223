//! Mutable state owned by one engine. Every field is only touched while the
//! engine's state mutex is held.

use crate::config::EngineConfig;
use crate::domain::{FifoLimits, RoomContext, RoomId};

use super::cooldown::CooldownTimer;
use super::dedup::SignatureCache;

#[derive(Debug)]
pub struct EngineState {
    pub context: RoomContext,
    pub signatures: SignatureCache,
    pub cooldown: CooldownTimer,
}

impl EngineState {
    pub fn new(room_id: RoomId, config: &EngineConfig) -> Self {
        let limits = FifoLimits {
            max_observations: config.max_observations,
            max_messages: config.max_messages,
        };
        Self {
            context: RoomContext::new(room_id, config.round_cache_capacity, limits),
            signatures: SignatureCache::new(config.signature_ttl_secs),
            cooldown: CooldownTimer::new(config.cooldown_ms),
        }
    }
}
