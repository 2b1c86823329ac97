//! Ledger Oracle: the contract that anchors commitments and payments.
//!
//! Reads are plain view calls. Every write signs and submits a transaction
//! from the client's own account and returns its id; only
//! [`LedgerOracle::start_new_round`] waits for on-chain confirmation.

pub mod memory;

#[cfg(feature = "evm")]
pub mod evm;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryLedger;

#[cfg(feature = "evm")]
pub use evm::EvmLedger;

/// Transaction identifier as returned by the ledger
pub type TxId = String;

/// bytes32 zero: nothing committed for (round, participant)
pub const ZERO_HASH: &str = "0x0000000000000000000000000000000000000000000000000000000000000000";

/// On-chain record for one (round, participant)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commitment {
    pub hash: String,
    pub validated: bool,
    pub paid: bool,
}

impl Commitment {
    pub fn empty() -> Self {
        Self {
            hash: ZERO_HASH.to_string(),
            validated: false,
            paid: false,
        }
    }

    pub fn is_committed(&self) -> bool {
        let digits = self.hash.trim_start_matches("0x");
        !digits.is_empty() && digits.chars().any(|c| c != '0')
    }
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger call timed out after {0:?}")]
    Timeout(Duration),
    #[error("ledger RPC failed: {0}")]
    Rpc(String),
    #[error("transaction {0} was not confirmed")]
    Unconfirmed(String),
    #[error("ledger rejected the call: {0}")]
    Rejected(String),
    #[error("invalid ledger input: {0}")]
    InvalidInput(String),
}

impl LedgerError {
    /// Worth retrying on the next tick or request
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Rpc(_) | Self::Unconfirmed(_))
    }
}

#[async_trait]
pub trait LedgerOracle: Send + Sync {
    async fn is_training_active(&self) -> Result<bool, LedgerError>;

    async fn current_round(&self) -> Result<u64, LedgerError>;

    /// All-zero hash when nothing was committed
    async fn get_contribution(&self, round: u64, participant: &str) -> Result<Commitment, LedgerError>;

    /// Commits `hash` for the sender in the ledger's current round.
    async fn submit_update(&self, hash: &str) -> Result<TxId, LedgerError>;

    /// Opens the next round and returns its number once confirmed.
    async fn start_new_round(&self) -> Result<u64, LedgerError>;

    /// Pays the fixed reward and marks the contribution paid. Returns as soon
    /// as the transaction is submitted.
    async fn validate_and_pay(&self, participant: &str) -> Result<TxId, LedgerError>;
}

/// Connection and transaction settings shared by every ledger client
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub rpc_url: String,
    pub contract_address: String,
    pub private_key: String,
    /// Bound on every individual RPC round-trip
    pub call_timeout: Duration,
    /// Bound on waiting for a round-start receipt
    pub confirmation_timeout: Duration,
    /// Network gas price is multiplied by `gas_multiplier_pct / 100`
    pub gas_multiplier_pct: u64,
    pub gas_limit: u64,
    /// Value attached to `validateAndPay`
    pub reward_wei: u128,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            contract_address: String::new(),
            private_key: String::new(),
            call_timeout: Duration::from_secs(15),
            confirmation_timeout: Duration::from_secs(180),
            gas_multiplier_pct: 110,
            gas_limit: 300_000,
            reward_wei: 10_000_000_000_000, // 0.00001 ether
        }
    }
}

/// Network gas price with the configured safety margin applied
pub fn bump_gas_price(network_price: u128, multiplier_pct: u64) -> u128 {
    network_price.saturating_mul(multiplier_pct as u128) / 100
}
