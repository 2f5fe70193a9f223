pub mod contract_listener;

pub use contract_listener::{decode_round_started, ContractListener, RoundStarted};
