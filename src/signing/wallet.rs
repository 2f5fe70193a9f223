use crate::error::{Result, RoundError};
use ethers::signers::{LocalWallet, Signer as EthersSigner};
use ethers::types::{Address, Signature};
use ethers::utils::to_checksum;
use serde::Serialize;
use std::str::FromStr;
use tracing::{debug, info};
use zeroize::Zeroize;

use super::canonical::canonical_payload;

/// Agent wallet used to sign outbound envelopes
///
/// # Security
/// The private key is only used during wallet creation and then zeroized.
#[derive(Clone)]
pub struct Wallet {
    inner: LocalWallet,
    chain_id: u64,
}

impl Wallet {
    /// Create a wallet from a private key hex string
    pub fn from_private_key(private_key: &str, chain_id: u64) -> Result<Self> {
        let mut secure_key = private_key.trim_start_matches("0x").to_string();

        let wallet = secure_key
            .parse::<LocalWallet>()
            .map_err(|e| RoundError::Wallet(format!("Invalid private key: {}", e)))?
            .with_chain_id(chain_id);

        secure_key.zeroize();

        info!("Wallet initialized: {} (private key zeroized from memory)", wallet.address());

        Ok(Self {
            inner: wallet,
            chain_id,
        })
    }

    /// Create a wallet for an agent from the environment.
    ///
    /// Reads `AGENT_<id>_PRIVATE_KEY`, falling back to `ROUNDTABLE_PRIVATE_KEY`.
    pub fn from_env(agent_id: i64, chain_id: u64) -> Result<Self> {
        let agent_var = format!("AGENT_{}_PRIVATE_KEY", agent_id);
        let mut private_key = std::env::var(&agent_var)
            .or_else(|_| std::env::var("ROUNDTABLE_PRIVATE_KEY"))
            .map_err(|_| {
                RoundError::Wallet(format!(
                    "{} or ROUNDTABLE_PRIVATE_KEY environment variable not set",
                    agent_var
                ))
            })?;

        let result = Self::from_private_key(&private_key, chain_id);
        private_key.zeroize();
        result
    }

    pub fn address(&self) -> Address {
        self.inner.address()
    }

    /// EIP-55 checksummed address, as attached to outbound envelopes
    pub fn address_string(&self) -> String {
        to_checksum(&self.address(), None)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    /// Sign a message (will be prefixed with Ethereum signed message)
    pub async fn sign_message<S: AsRef<[u8]> + Send + Sync>(&self, message: S) -> Result<Signature> {
        self.inner
            .sign_message(message)
            .await
            .map_err(|e| RoundError::Signature(format!("Failed to sign message: {}", e)))
    }

    /// Canonicalize a payload and sign the canonical string.
    /// Returns the 65-byte signature as 0x-prefixed hex.
    pub async fn sign_payload<T: Serialize + Sync>(&self, payload: &T) -> Result<String> {
        let canonical = canonical_payload(payload)?;
        debug!(payload = %canonical, "Signing canonical payload");
        let signature = self.sign_message(canonical.as_bytes()).await?;
        Ok(format!("0x{}", signature))
    }
}

impl std::fmt::Debug for Wallet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wallet")
            .field("address", &self.address())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

/// Recover the signer of a canonicalized payload
pub fn recover_signer<T: Serialize>(payload: &T, signature: &str) -> Result<Address> {
    let canonical = canonical_payload(payload)?;
    let signature = Signature::from_str(signature)
        .map_err(|e| RoundError::Signature(format!("Malformed signature: {}", e)))?;
    signature
        .recover(canonical.as_str())
        .map_err(|e| RoundError::Signature(format!("Signature recovery failed: {}", e)))
}

/// Check that `signature` over the canonical payload was produced by `sender`
pub fn verify_signed_payload<T: Serialize>(payload: &T, signature: &str, sender: &str) -> Result<()> {
    let expected = Address::from_str(sender)
        .map_err(|e| RoundError::Validation(format!("Invalid sender address {}: {}", sender, e)))?;
    let recovered = recover_signer(payload, signature)?;
    if recovered != expected {
        return Err(RoundError::Validation(format!(
            "signature was produced by {:?}, not {}",
            recovered, sender
        )));
    }
    Ok(())
}
