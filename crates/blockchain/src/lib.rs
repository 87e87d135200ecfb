pub mod abi;
pub mod evm_client;
pub mod ledger;
pub mod retry;
pub mod types;

pub use evm_client::{EvmClient, EvmClientConfig};
pub use ledger::TransferLedger;
pub use retry::{retry_with_backoff, RetryConfig};
pub use types::*;
