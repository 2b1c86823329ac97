use async_trait::async_trait;
use ethers::contract::abigen;
use ethers::middleware::{NonceManagerMiddleware, SignerMiddleware};
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, BlockNumber, U256, U64};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{bump_gas_price, Commitment, LedgerConfig, LedgerError, LedgerOracle, TxId};

abigen!(
    FederatedLedgerContract,
    r#"[
        function trainingActive() external view returns (bool)
        function currentRound() external view returns (uint256)
        function contributions(uint256, address) external view returns (bytes32, bool, bool)
        function submitUpdate(bytes32 _modelHash) external
        function startNewRound() external
        function validateAndPay(address _participant) external payable
    ]"#
);

/// Nonces are allocated locally so back-to-back sends never collide.
type Client = NonceManagerMiddleware<SignerMiddleware<Provider<Http>, LocalWallet>>;

/// Ledger Oracle backed by the federated-learning contract on an EVM chain
pub struct EvmLedger {
    contract: FederatedLedgerContract<Client>,
    client: Arc<Client>,
    config: LedgerConfig,
}

impl EvmLedger {
    pub async fn connect(config: LedgerConfig) -> Result<Self, LedgerError> {
        let provider = Provider::<Http>::try_from(config.rpc_url.as_str())
            .map_err(|e| LedgerError::InvalidInput(format!("rpc url: {e}")))?;
        let chain_id = bounded(config.call_timeout, provider.get_chainid()).await?;
        let wallet = config
            .private_key
            .parse::<LocalWallet>()
            .map_err(|e| LedgerError::InvalidInput(format!("private key: {e}")))?
            .with_chain_id(chain_id.low_u64());
        let sender = wallet.address();
        let contract_address = parse_address(&config.contract_address)?;

        let client = Arc::new(NonceManagerMiddleware::new(SignerMiddleware::new(provider, wallet), sender));
        let contract = FederatedLedgerContract::new(contract_address, client.clone());
        tracing::info!(sender = ?sender, contract = ?contract_address, chain_id = %chain_id, "Connected to ledger");

        Ok(Self { contract, client, config })
    }

    async fn gas_price(&self) -> Result<U256, LedgerError> {
        let network = bounded(self.config.call_timeout, self.client.get_gas_price()).await?;
        if network > U256::from(u128::MAX) {
            return Ok(network);
        }
        Ok(U256::from(bump_gas_price(network.as_u128(), self.config.gas_multiplier_pct)))
    }

    /// A send dropped by the timeout may already hold a locally reserved
    /// nonce. Re-read it from the pending block before reporting the error.
    async fn after_send<T>(&self, result: Result<T, LedgerError>) -> Result<T, LedgerError> {
        if let Err(e) = &result {
            if needs_nonce_resync(e) {
                let resync = self.client.initialize_nonce(Some(BlockNumber::Pending.into()));
                match bounded(self.config.call_timeout, resync).await {
                    Ok(nonce) => tracing::warn!(nonce = %nonce, "Send timed out, nonce resynced"),
                    Err(err) => tracing::error!(error = %err, "Send timed out and the nonce resync failed"),
                }
            }
        }
        result
    }
}

/// The nonce manager resyncs by itself when the node returns an error, but
/// not when the send future is cancelled.
fn needs_nonce_resync(err: &LedgerError) -> bool {
    matches!(err, LedgerError::Timeout(_))
}

#[async_trait]
impl LedgerOracle for EvmLedger {
    async fn is_training_active(&self) -> Result<bool, LedgerError> {
        bounded(self.config.call_timeout, self.contract.training_active().call()).await
    }

    async fn current_round(&self) -> Result<u64, LedgerError> {
        let round = bounded(self.config.call_timeout, self.contract.current_round().call()).await?;
        to_round(round)
    }

    async fn get_contribution(&self, round: u64, participant: &str) -> Result<Commitment, LedgerError> {
        let participant = parse_address(participant)?;
        let (hash, validated, paid) = bounded(
            self.config.call_timeout,
            self.contract.contributions(U256::from(round), participant).call(),
        )
        .await?;
        Ok(Commitment {
            hash: format!("0x{}", hex::encode(hash)),
            validated,
            paid,
        })
    }

    async fn submit_update(&self, hash: &str) -> Result<TxId, LedgerError> {
        let digest = parse_bytes32(hash)?;
        let gas_price = self.gas_price().await?;
        let call = self
            .contract
            .submit_update(digest)
            .legacy()
            .gas(self.config.gas_limit)
            .gas_price(gas_price);
        let pending = self.after_send(bounded(self.config.call_timeout, call.send()).await).await?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }

    async fn start_new_round(&self) -> Result<u64, LedgerError> {
        let gas_price = self.gas_price().await?;
        let call = self
            .contract
            .start_new_round()
            .legacy()
            .gas(self.config.gas_limit)
            .gas_price(gas_price);
        let pending = self.after_send(bounded(self.config.call_timeout, call.send()).await).await?;
        let tx = format!("{:#x}", pending.tx_hash());
        tracing::info!(tx = %tx, "startNewRound submitted, waiting for receipt");

        let receipt = bounded(self.config.confirmation_timeout, pending)
            .await?
            .ok_or_else(|| LedgerError::Unconfirmed(tx.clone()))?;
        if receipt.status == Some(U64::zero()) {
            return Err(LedgerError::Rejected(format!("startNewRound reverted in {tx}")));
        }
        self.current_round().await
    }

    async fn validate_and_pay(&self, participant: &str) -> Result<TxId, LedgerError> {
        let participant = parse_address(participant)?;
        let gas_price = self.gas_price().await?;
        let call = self
            .contract
            .validate_and_pay(participant)
            .legacy()
            .value(U256::from(self.config.reward_wei))
            .gas(self.config.gas_limit)
            .gas_price(gas_price);
        let pending = self.after_send(bounded(self.config.call_timeout, call.send()).await).await?;
        Ok(format!("{:#x}", pending.tx_hash()))
    }
}

/// Applies the per-call timeout and flattens client errors into `Rpc`.
async fn bounded<T, E, F>(limit: Duration, fut: F) -> Result<T, LedgerError>
where
    E: std::fmt::Display,
    F: Future<Output = Result<T, E>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(LedgerError::Rpc(e.to_string())),
        Err(_) => Err(LedgerError::Timeout(limit)),
    }
}

fn to_round(value: U256) -> Result<u64, LedgerError> {
    if value > U256::from(u64::MAX) {
        return Err(LedgerError::Rpc(format!("round {value} does not fit in u64")));
    }
    Ok(value.low_u64())
}

fn parse_address(raw: &str) -> Result<Address, LedgerError> {
    raw.parse::<Address>()
        .map_err(|e| LedgerError::InvalidInput(format!("address '{raw}': {e}")))
}

fn parse_bytes32(raw: &str) -> Result<[u8; 32], LedgerError> {
    let bytes = hex::decode(raw.trim_start_matches("0x"))
        .map_err(|e| LedgerError::InvalidInput(format!("hash '{raw}': {e}")))?;
    bytes
        .try_into()
        .map_err(|_| LedgerError::InvalidInput(format!("hash '{raw}' is not 32 bytes")))
}
