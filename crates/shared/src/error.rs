use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("EVM RPC error: {0}")]
    EvmRpc(String),

    #[error("RPC endpoint unreachable: {0}")]
    RpcUnavailable(String),

    #[error("Invalid wallet address: {0}")]
    InvalidWalletAddress(String),

    #[error("Transaction reverted: {0}")]
    TransactionReverted(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Whether repeating the same request could succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::RpcUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
