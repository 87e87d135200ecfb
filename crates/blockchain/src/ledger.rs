use crate::types::{TransferReceipt, ValidatedTransfer};
use async_trait::async_trait;
use shared::Result;

/// Remote ledger the gateway submits transfer authorizations to
///
/// Each method is one round trip; the caller owns timeouts and decides which
/// failure stage a returned error belongs to.
#[async_trait]
pub trait TransferLedger: Send + Sync {
    /// Verify the ledger endpoint is reachable
    async fn check_connection(&self) -> Result<()>;

    /// Native balance of the relayer account paying for gas
    async fn relayer_balance(&self) -> Result<u128>;

    /// Token balance of `owner` on `contract`
    async fn token_balance(&self, contract: &[u8; 20], owner: &[u8; 20]) -> Result<u128>;

    /// Submit the transfer and return its transaction hash
    async fn submit_transfer(&self, transfer: &ValidatedTransfer) -> Result<String>;

    /// Wait until the transaction is mined
    async fn await_confirmation(&self, tx_hash: &str) -> Result<TransferReceipt>;

    /// Block explorer link for a transaction
    fn explorer_url(&self, tx_hash: &str) -> String;
}
