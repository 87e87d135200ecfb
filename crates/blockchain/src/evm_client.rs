use async_trait::async_trait;
use serde_json::{json, Value};
use shared::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::abi;
use crate::ledger::TransferLedger;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::types::{TransferReceipt, ValidatedTransfer};

/// Connection settings for an EVM JSON-RPC ledger
#[derive(Debug, Clone)]
pub struct EvmClientConfig {
    pub rpc_url: String,
    /// Chain id the endpoint must report, if pinned
    pub chain_id: Option<u64>,
    /// Account the node's signer submits relayed transfers from
    pub relayer_address: String,
    /// Explorer prefix a transaction hash is appended to
    pub explorer_tx_url: String,
    pub receipt_poll_interval: Duration,
}

/// JSON-RPC client for the token ledger
///
/// Transactions are sent with `eth_sendTransaction` from the relayer account;
/// signing happens in the node's account manager or a signer proxy in front of
/// it, never in this process.
pub struct EvmClient {
    http: reqwest::Client,
    rpc_url: String,
    expected_chain_id: Option<u64>,
    relayer_address: String,
    explorer_tx_url: String,
    receipt_poll_interval: Duration,
    retry_config: RetryConfig,
    next_request_id: AtomicU64,
}

impl EvmClient {
    /// Create a new client, validating the relayer address
    pub fn new(config: EvmClientConfig) -> Result<Self> {
        abi::parse_address(&config.relayer_address)?;

        info!(
            "Initializing EVM ledger client with RPC: {} (relayer {})",
            config.rpc_url, config.relayer_address
        );

        Ok(Self {
            http: reqwest::Client::new(),
            rpc_url: config.rpc_url,
            expected_chain_id: config.chain_id,
            relayer_address: config.relayer_address.to_lowercase(),
            explorer_tx_url: config.explorer_tx_url,
            receipt_poll_interval: config.receipt_poll_interval,
            retry_config: RetryConfig::default(),
            next_request_id: AtomicU64::new(1),
        })
    }

    /// Replace the retry policy used for read calls
    pub fn with_retry_config(mut self, retry_config: RetryConfig) -> Self {
        self.retry_config = retry_config;
        self
    }

    /// Chain id reported by the endpoint
    pub async fn chain_id(&self) -> Result<u64> {
        let result = self.read("eth_chainId", json!([])).await?;
        let chain_id = parse_quantity(&result)?;
        u64::try_from(chain_id).map_err(|_| Error::EvmRpc(format!("chain id {} out of range", chain_id)))
    }

    /// Idempotent call, retried on transport failures
    async fn read(&self, method: &str, params: Value) -> Result<Value> {
        retry_with_backoff(method, &self.retry_config, Error::is_transient, || {
            self.call(method, params.clone())
        })
        .await
    }

    /// Single JSON-RPC round trip
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let request_body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_request_id.fetch_add(1, Ordering::Relaxed),
        });

        debug!("Sending {} to {}", method, self.rpc_url);

        let response = self
            .http
            .post(&self.rpc_url)
            .json(&request_body)
            .send()
            .await
            .map_err(|e| Error::RpcUnavailable(format!("Failed to send {} request: {}", method, e)))?;

        if !response.status().is_success() {
            return Err(Error::RpcUnavailable(format!(
                "{} request failed with status: {}",
                method,
                response.status()
            )));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| Error::EvmRpc(format!("Failed to parse {} response: {}", method, e)))?;

        extract_result(method, response_json)
    }
}

/// Pull `result` out of a JSON-RPC response, surfacing `error` objects
fn extract_result(method: &str, mut response: Value) -> Result<Value> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        return Err(Error::EvmRpc(format!("{} returned error: {}", method, message)));
    }

    match response.get_mut("result") {
        Some(result) => Ok(result.take()),
        None => Err(Error::EvmRpc(format!("{} response missing result", method))),
    }
}

/// Parse a hex quantity such as `"0x1b4"`
fn parse_quantity(value: &Value) -> Result<u128> {
    let text = value
        .as_str()
        .ok_or_else(|| Error::EvmRpc(format!("expected hex quantity, got {}", value)))?;
    let digits = text
        .strip_prefix("0x")
        .ok_or_else(|| Error::EvmRpc(format!("quantity {} missing 0x prefix", text)))?;
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|e| Error::EvmRpc(format!("invalid quantity {}: {}", text, e)))
}

/// Turn an `eth_getTransactionReceipt` result into a receipt, `None` while pending
fn parse_receipt(tx_hash: &str, receipt: &Value) -> Result<Option<TransferReceipt>> {
    if receipt.is_null() {
        return Ok(None);
    }

    if let Some(status) = receipt.get("status") {
        if parse_quantity(status)? == 0 {
            return Err(Error::TransactionReverted(tx_hash.to_string()));
        }
    }

    let block_number = receipt
        .get("blockNumber")
        .ok_or_else(|| Error::EvmRpc("receipt missing blockNumber".to_string()))
        .and_then(parse_quantity)?;
    let gas_used = receipt
        .get("gasUsed")
        .ok_or_else(|| Error::EvmRpc("receipt missing gasUsed".to_string()))
        .and_then(parse_quantity)?;

    Ok(Some(TransferReceipt {
        transaction_hash: tx_hash.to_string(),
        block_number: u64::try_from(block_number)
            .map_err(|_| Error::EvmRpc(format!("block number {} out of range", block_number)))?,
        gas_used: gas_used.to_string(),
    }))
}

fn hex_address(address: &[u8; 20]) -> String {
    format!("0x{}", hex::encode(address))
}

#[async_trait]
impl TransferLedger for EvmClient {
    async fn check_connection(&self) -> Result<()> {
        let chain_id = self.chain_id().await?;

        if let Some(expected) = self.expected_chain_id {
            if chain_id != expected {
                return Err(Error::EvmRpc(format!(
                    "connected to chain {}, expected {}",
                    chain_id, expected
                )));
            }
        }

        debug!("Ledger reachable on chain {}", chain_id);
        Ok(())
    }

    async fn relayer_balance(&self) -> Result<u128> {
        let result = self
            .read("eth_getBalance", json!([self.relayer_address, "latest"]))
            .await?;
        parse_quantity(&result)
    }

    async fn token_balance(&self, contract: &[u8; 20], owner: &[u8; 20]) -> Result<u128> {
        let call = json!({
            "to": hex_address(contract),
            "data": format!("0x{}", hex::encode(abi::encode_balance_of(owner))),
        });
        let result = self.read("eth_call", json!([call, "latest"])).await?;
        let text = result
            .as_str()
            .ok_or_else(|| Error::EvmRpc(format!("eth_call returned {}", result)))?;
        let bytes = abi::parse_hex_bytes("balanceOf result", text)
            .map_err(|e| Error::EvmRpc(e.to_string()))?;
        abi::decode_uint_word(&bytes)
    }

    async fn submit_transfer(&self, transfer: &ValidatedTransfer) -> Result<String> {
        let transaction = json!({
            "from": self.relayer_address,
            "to": hex_address(&transfer.contract),
            "data": format!("0x{}", hex::encode(abi::encode_transfer_with_authorization(transfer))),
        });

        // Not retried: a lost response may still have broadcast the transaction
        let result = self.call("eth_sendTransaction", json!([transaction])).await?;
        let tx_hash = result
            .as_str()
            .ok_or_else(|| Error::EvmRpc("Missing transaction hash in response".to_string()))?;

        info!("Transfer submitted: {}", tx_hash);
        Ok(tx_hash.to_string())
    }

    async fn await_confirmation(&self, tx_hash: &str) -> Result<TransferReceipt> {
        loop {
            match self
                .call("eth_getTransactionReceipt", json!([tx_hash]))
                .await
                .and_then(|receipt| parse_receipt(tx_hash, &receipt))
            {
                Ok(Some(receipt)) => {
                    info!(
                        "Transfer {} confirmed in block {}",
                        tx_hash, receipt.block_number
                    );
                    return Ok(receipt);
                }
                Ok(None) => debug!("Transfer {} still pending", tx_hash),
                Err(e) if e.is_transient() => {
                    warn!("Receipt poll for {} failed, will retry: {}", tx_hash, e)
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.receipt_poll_interval).await;
        }
    }

    fn explorer_url(&self, tx_hash: &str) -> String {
        format!("{}{}", self.explorer_tx_url, tx_hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> EvmClientConfig {
        EvmClientConfig {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: Some(545),
            relayer_address: "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0".to_string(),
            explorer_tx_url: "https://evm-testnet.flowscan.io/tx/".to_string(),
            receipt_poll_interval: Duration::from_millis(10),
        }
    }

    #[test]
    fn test_new_rejects_invalid_relayer() {
        let mut config = config();
        config.relayer_address = "not-an-address".to_string();
        assert!(EvmClient::new(config).is_err());
    }

    #[test]
    fn test_relayer_address_lowercased() {
        let client = EvmClient::new(config()).unwrap();
        assert_eq!(
            client.relayer_address,
            "0x742d35cc6634c0532925a3b844bc9e7595f0beb0"
        );
    }

    #[test]
    fn test_explorer_url() {
        let client = EvmClient::new(config()).unwrap();
        assert_eq!(
            client.explorer_url("0xabc"),
            "https://evm-testnet.flowscan.io/tx/0xabc"
        );
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x1b4")).unwrap(), 436);
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), 0);
        assert!(parse_quantity(&json!("1b4")).is_err());
        assert!(parse_quantity(&json!(12)).is_err());
    }

    #[test]
    fn test_extract_result_surfaces_rpc_error() {
        let response = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "insufficient funds for gas" }
        });
        let err = extract_result("eth_sendTransaction", response).unwrap_err();
        assert!(err.to_string().contains("insufficient funds for gas"));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_parse_receipt_pending_and_mined() {
        assert_eq!(parse_receipt("0xabc", &Value::Null).unwrap(), None);

        let receipt = parse_receipt(
            "0xabc",
            &json!({ "status": "0x1", "blockNumber": "0x10", "gasUsed": "0x5208" }),
        )
        .unwrap()
        .unwrap();
        assert_eq!(receipt.block_number, 16);
        assert_eq!(receipt.gas_used, "21000");
        assert_eq!(receipt.transaction_hash, "0xabc");
    }

    #[test]
    fn test_parse_receipt_reverted() {
        let result = parse_receipt(
            "0xabc",
            &json!({ "status": "0x0", "blockNumber": "0x10", "gasUsed": "0x5208" }),
        );
        assert!(matches!(result, Err(Error::TransactionReverted(_))));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let mut config = config();
        config.rpc_url = "http://127.0.0.1:9".to_string();
        let client = EvmClient::new(config)
            .unwrap()
            .with_retry_config(RetryConfig::no_retry());

        let err = client.check_connection().await.unwrap_err();
        assert!(err.is_transient());
    }
}
