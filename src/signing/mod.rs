pub mod canonical;
pub mod wallet;

pub use canonical::{canonical_payload, canonical_string, canonicalize};
pub use wallet::{recover_signer, verify_signed_payload, Wallet};
