//! Gateway relay: submits reassembled transfer requests to the ledger
//!
//! Every stage runs under its own timeout and maps failures to a
//! [`FailureStage`]. The outcome is always a [`GatewayResponse`], which the
//! engine floods back through the mesh as the acknowledgement.

use crate::codec::MAX_MESSAGE_LEN;
use crate::error::{MeshError, MeshResult};
use blockchain::{TransferLedger, TransferPayload, TransferReceipt};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Per-stage time budgets for ledger calls
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub connection_timeout: Duration,
    pub balance_timeout: Duration,
    /// Shared by submission and confirmation
    pub submission_timeout: Duration,
    /// Compare the sender's token balance with the transfer value before submitting
    pub check_sender_balance: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            balance_timeout: Duration::from_secs(10),
            submission_timeout: Duration::from_secs(120),
            check_sender_balance: true,
        }
    }
}

impl From<&shared::config::GatewayConfig> for GatewayConfig {
    fn from(config: &shared::config::GatewayConfig) -> Self {
        Self {
            connection_timeout: Duration::from_secs(config.connection_timeout_secs),
            balance_timeout: Duration::from_secs(config.balance_timeout_secs),
            submission_timeout: Duration::from_secs(config.submission_timeout_secs),
            check_sender_balance: config.check_sender_balance,
        }
    }
}

/// Pipeline stage a failed request stopped at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStage {
    Parsing,
    Validation,
    Connection,
    BalanceCheck,
    Submission,
    Confirmation,
    GatewayProcessing,
}

/// Result message carried back to the sender as an acknowledgement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explorer_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_used: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<FailureStage>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl GatewayResponse {
    pub fn confirmed(receipt: TransferReceipt, explorer_url: String) -> Self {
        Self {
            success: true,
            transaction_hash: Some(receipt.transaction_hash),
            explorer_url: Some(explorer_url),
            block_number: Some(receipt.block_number),
            gas_used: Some(receipt.gas_used),
            error: None,
            stage: None,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn failed(stage: FailureStage, error: impl Into<String>) -> Self {
        Self {
            success: false,
            transaction_hash: None,
            explorer_url: None,
            block_number: None,
            gas_used: None,
            error: Some(error.into()),
            stage: Some(stage),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Serialize to JSON, shortening the error text until it fits one mesh message
    pub fn to_message(&self) -> MeshResult<String> {
        let mut response = self.clone();
        loop {
            let text = serde_json::to_string(&response)?;
            if text.len() <= MAX_MESSAGE_LEN {
                return Ok(text);
            }

            let excess = text.len() - MAX_MESSAGE_LEN;
            match response.error.as_mut() {
                Some(error) if error.len() > 3 => shorten(error, excess),
                _ => {
                    return Err(MeshError::SerializationError(format!(
                        "response of {} bytes exceeds the {} byte message limit",
                        text.len(),
                        MAX_MESSAGE_LEN
                    )))
                }
            }
        }
    }

    /// Acknowledgement text for this response, degrading to a processing failure
    pub fn ack_text(&self) -> String {
        self.to_message().unwrap_or_else(|e| {
            error!("Failed to encode gateway response: {}", e);
            GatewayResponse::failed(FailureStage::GatewayProcessing, "Gateway processing failed")
                .to_message()
                .unwrap_or_else(|_| r#"{"success":false,"stage":"gateway_processing"}"#.to_string())
        })
    }
}

fn shorten(text: &mut String, excess: usize) {
    let mut cut = text.len().saturating_sub(excess + 3);
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("...");
}

/// A pipeline stage that did not succeed
#[derive(Debug)]
struct StageFailure {
    stage: FailureStage,
    message: String,
    transaction_hash: Option<String>,
}

impl StageFailure {
    fn new(stage: FailureStage, message: impl Into<String>) -> Self {
        Self {
            stage,
            message: message.into(),
            transaction_hash: None,
        }
    }
}

/// Run a ledger call under a deadline, attributing both failure kinds to `stage`
async fn within<T, F>(
    deadline: Instant,
    stage: FailureStage,
    what: &str,
    call: F,
) -> Result<T, StageFailure>
where
    F: Future<Output = shared::Result<T>>,
{
    match tokio::time::timeout_at(deadline, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(StageFailure::new(stage, format!("{} failed: {}", what, e))),
        Err(_) => Err(StageFailure::new(stage, format!("{} timed out", what))),
    }
}

/// Submits completed transfer requests while this node has connectivity
pub struct GatewayRelay {
    ledger: Arc<dyn TransferLedger>,
    config: GatewayConfig,
}

impl GatewayRelay {
    pub fn new(ledger: Arc<dyn TransferLedger>, config: GatewayConfig) -> Self {
        Self { ledger, config }
    }

    /// Process one reassembled request end to end
    pub async fn process(&self, request: &str) -> GatewayResponse {
        let started = Instant::now();

        let response = match self.submit(request).await {
            Ok(receipt) => {
                let explorer_url = self.ledger.explorer_url(&receipt.transaction_hash);
                GatewayResponse::confirmed(receipt, explorer_url)
            }
            Err(failure) => {
                error!(
                    "Gateway request failed at {:?} stage: {}",
                    failure.stage, failure.message
                );
                let mut response = GatewayResponse::failed(failure.stage, failure.message);
                if let Some(hash) = failure.transaction_hash {
                    response.explorer_url = Some(self.ledger.explorer_url(&hash));
                    response.transaction_hash = Some(hash);
                }
                response
            }
        };

        info!(
            "Gateway request finished in {:?} (success: {})",
            started.elapsed(),
            response.success
        );
        response
    }

    async fn submit(&self, request: &str) -> Result<TransferReceipt, StageFailure> {
        let value: serde_json::Value = serde_json::from_str(request).map_err(|e| {
            StageFailure::new(FailureStage::Parsing, format!("Invalid JSON payload: {}", e))
        })?;

        let payload: TransferPayload = serde_json::from_value(value).map_err(|e| {
            StageFailure::new(FailureStage::Validation, format!("Invalid transfer payload: {}", e))
        })?;
        let transfer = payload
            .validate()
            .map_err(|e| StageFailure::new(FailureStage::Validation, e.to_string()))?;

        debug!(
            "Validated transfer of {} to 0x{}",
            transfer.value,
            hex::encode(transfer.to)
        );

        within(
            Instant::now() + self.config.connection_timeout,
            FailureStage::Connection,
            "Ledger connection",
            self.ledger.check_connection(),
        )
        .await?;

        let relayer_balance = within(
            Instant::now() + self.config.balance_timeout,
            FailureStage::BalanceCheck,
            "Balance check",
            self.ledger.relayer_balance(),
        )
        .await?;
        if relayer_balance == 0 {
            return Err(StageFailure::new(
                FailureStage::BalanceCheck,
                "Relayer wallet has insufficient balance",
            ));
        }

        if self.config.check_sender_balance {
            match tokio::time::timeout(
                self.config.balance_timeout,
                self.ledger.token_balance(&transfer.contract, &transfer.from),
            )
            .await
            {
                Ok(Ok(balance)) if balance < transfer.value => {
                    return Err(StageFailure::new(
                        FailureStage::BalanceCheck,
                        format!(
                            "Insufficient token balance: has {}, needs {}",
                            balance, transfer.value
                        ),
                    ));
                }
                Ok(Ok(balance)) => debug!("Sender token balance {} covers transfer", balance),
                // The contract rejects an uncovered transfer anyway
                Ok(Err(e)) => warn!("Token balance check failed, continuing: {}", e),
                Err(_) => warn!("Token balance check timed out, continuing"),
            }
        }

        let deadline = Instant::now() + self.config.submission_timeout;

        let tx_hash = within(
            deadline,
            FailureStage::Submission,
            "Transaction submission",
            self.ledger.submit_transfer(&transfer),
        )
        .await?;
        info!("Transfer submitted as {}, awaiting confirmation", tx_hash);

        match tokio::time::timeout_at(deadline, self.ledger.await_confirmation(&tx_hash)).await {
            Ok(Ok(receipt)) => Ok(receipt),
            Ok(Err(e)) => Err(StageFailure {
                stage: FailureStage::Confirmation,
                message: format!("Transaction confirmation failed: {}", e),
                transaction_hash: Some(tx_hash),
            }),
            Err(_) => Err(StageFailure {
                stage: FailureStage::Confirmation,
                message: "Transaction sent but confirmation timed out".to_string(),
                transaction_hash: Some(tx_hash),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use blockchain::ValidatedTransfer;
    use shared::{Error, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Copy, PartialEq)]
    enum Behavior {
        Succeed,
        Fail,
        Hang,
    }

    struct MockLedger {
        connection: Behavior,
        relayer_balance: u128,
        token_balance: Behavior,
        submit: Behavior,
        confirm: Behavior,
        submissions: AtomicUsize,
    }

    impl Default for MockLedger {
        fn default() -> Self {
            Self {
                connection: Behavior::Succeed,
                relayer_balance: 1_000_000,
                token_balance: Behavior::Succeed,
                submit: Behavior::Succeed,
                confirm: Behavior::Succeed,
                submissions: AtomicUsize::new(0),
            }
        }
    }

    async fn act<T>(behavior: Behavior, value: T) -> Result<T> {
        match behavior {
            Behavior::Succeed => Ok(value),
            Behavior::Fail => Err(Error::EvmRpc("execution reverted".to_string())),
            Behavior::Hang => std::future::pending().await,
        }
    }

    #[async_trait]
    impl TransferLedger for MockLedger {
        async fn check_connection(&self) -> Result<()> {
            act(self.connection, ()).await
        }

        async fn relayer_balance(&self) -> Result<u128> {
            Ok(self.relayer_balance)
        }

        async fn token_balance(&self, _contract: &[u8; 20], _owner: &[u8; 20]) -> Result<u128> {
            act(self.token_balance, 500).await
        }

        async fn submit_transfer(&self, _transfer: &ValidatedTransfer) -> Result<String> {
            self.submissions.fetch_add(1, Ordering::SeqCst);
            act(self.submit, "0xfeed".to_string()).await
        }

        async fn await_confirmation(&self, tx_hash: &str) -> Result<TransferReceipt> {
            act(
                self.confirm,
                TransferReceipt {
                    transaction_hash: tx_hash.to_string(),
                    block_number: 42,
                    gas_used: "21000".to_string(),
                },
            )
            .await
        }

        fn explorer_url(&self, tx_hash: &str) -> String {
            format!("https://explorer.test/tx/{}", tx_hash)
        }
    }

    fn request(value: u64) -> String {
        format!(
            r#"{{"type":"TRANSFER_WITH_AUTHORIZATION","contractAddress":"0xd1Eb9CeAA265D4d2f13E4dDD815AA5fe7212fdA8","parameters":{{"from":"0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0","to":"0xA37EDfF34e2f01Fee837e5baC232ec3009Da24b4","value":"{}","validAfter":0,"validBefore":1893456000,"nonce":"0x{}","signature":"0x{}"}}}}"#,
            value,
            "ab".repeat(32),
            "cd".repeat(65)
        )
    }

    fn relay(ledger: MockLedger) -> (GatewayRelay, Arc<MockLedger>) {
        let ledger = Arc::new(ledger);
        (
            GatewayRelay::new(ledger.clone(), GatewayConfig::default()),
            ledger,
        )
    }

    #[tokio::test]
    async fn test_successful_transfer() {
        let (relay, ledger) = relay(MockLedger::default());
        let response = relay.process(&request(100)).await;

        assert!(response.success);
        assert_eq!(response.transaction_hash.as_deref(), Some("0xfeed"));
        assert_eq!(
            response.explorer_url.as_deref(),
            Some("https://explorer.test/tx/0xfeed")
        );
        assert_eq!(response.block_number, Some(42));
        assert_eq!(response.gas_used.as_deref(), Some("21000"));
        assert_eq!(response.stage, None);
        assert_eq!(ledger.submissions.load(Ordering::SeqCst), 1);

        let json: serde_json::Value = serde_json::from_str(&response.to_message().unwrap()).unwrap();
        assert_eq!(json["transactionHash"], "0xfeed");
        assert_eq!(json["gasUsed"], "21000");
        assert!(json.get("error").is_none());
        assert!(json["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_parsing_failure() {
        let (relay, ledger) = relay(MockLedger::default());
        let response = relay.process("hello mesh").await;

        assert!(!response.success);
        assert_eq!(response.stage, Some(FailureStage::Parsing));
        assert_eq!(ledger.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let (relay, _) = relay(MockLedger::default());

        let wrong_type = request(1).replace("TRANSFER_WITH_AUTHORIZATION", "SWAP");
        assert_eq!(
            relay.process(&wrong_type).await.stage,
            Some(FailureStage::Validation)
        );

        let missing = r#"{"type":"TRANSFER_WITH_AUTHORIZATION"}"#;
        assert_eq!(
            relay.process(missing).await.stage,
            Some(FailureStage::Validation)
        );
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let (relay, ledger) = relay(MockLedger {
            connection: Behavior::Fail,
            ..MockLedger::default()
        });
        let response = relay.process(&request(1)).await;
        assert_eq!(response.stage, Some(FailureStage::Connection));
        assert_eq!(ledger.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout() {
        let (relay, _) = relay(MockLedger {
            connection: Behavior::Hang,
            ..MockLedger::default()
        });
        let started = Instant::now();
        let response = relay.process(&request(1)).await;

        assert_eq!(response.stage, Some(FailureStage::Connection));
        assert!(response.error.unwrap().contains("timed out"));
        assert!(started.elapsed() >= Duration::from_secs(10));
        assert!(started.elapsed() < Duration::from_secs(11));
    }

    #[tokio::test]
    async fn test_empty_relayer_wallet() {
        let (relay, _) = relay(MockLedger {
            relayer_balance: 0,
            ..MockLedger::default()
        });
        let response = relay.process(&request(1)).await;
        assert_eq!(response.stage, Some(FailureStage::BalanceCheck));
        assert_eq!(
            response.error.as_deref(),
            Some("Relayer wallet has insufficient balance")
        );
    }

    #[tokio::test]
    async fn test_insufficient_sender_tokens() {
        let (relay, ledger) = relay(MockLedger::default());
        let response = relay.process(&request(501)).await;

        assert_eq!(response.stage, Some(FailureStage::BalanceCheck));
        assert!(response.error.unwrap().contains("has 500, needs 501"));
        assert_eq!(ledger.submissions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_sender_balance_check_can_be_disabled() {
        let ledger = Arc::new(MockLedger::default());
        let relay = GatewayRelay::new(
            ledger.clone(),
            GatewayConfig {
                check_sender_balance: false,
                ..GatewayConfig::default()
            },
        );
        assert!(relay.process(&request(501)).await.success);
    }

    #[tokio::test]
    async fn test_failed_token_lookup_is_ignored() {
        let (relay, _) = relay(MockLedger {
            token_balance: Behavior::Fail,
            ..MockLedger::default()
        });
        assert!(relay.process(&request(10_000)).await.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_submission_times_out() {
        let (relay, ledger) = relay(MockLedger {
            submit: Behavior::Hang,
            ..MockLedger::default()
        });
        let started = Instant::now();
        let response = relay.process(&request(1)).await;

        assert_eq!(response.stage, Some(FailureStage::Submission));
        assert_eq!(response.transaction_hash, None);
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(121));
        assert_eq!(ledger.submissions.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_confirmation_reports_hash() {
        let (relay, _) = relay(MockLedger {
            confirm: Behavior::Hang,
            ..MockLedger::default()
        });
        let response = relay.process(&request(1)).await;

        assert!(!response.success);
        assert_eq!(response.stage, Some(FailureStage::Confirmation));
        assert_eq!(
            response.error.as_deref(),
            Some("Transaction sent but confirmation timed out")
        );
        assert_eq!(response.transaction_hash.as_deref(), Some("0xfeed"));
        assert_eq!(
            response.explorer_url.as_deref(),
            Some("https://explorer.test/tx/0xfeed")
        );
    }

    #[tokio::test]
    async fn test_reverted_confirmation() {
        let (relay, _) = relay(MockLedger {
            confirm: Behavior::Fail,
            ..MockLedger::default()
        });
        let response = relay.process(&request(1)).await;
        assert_eq!(response.stage, Some(FailureStage::Confirmation));
        assert!(response.error.unwrap().contains("execution reverted"));
        assert_eq!(response.transaction_hash.as_deref(), Some("0xfeed"));
    }

    #[test]
    fn test_stage_serializes_snake_case() {
        let json = GatewayResponse::failed(FailureStage::BalanceCheck, "low")
            .to_message()
            .unwrap();
        assert!(json.contains(r#""stage":"balance_check""#));
        assert!(json.contains(r#""success":false"#));
        assert!(!json.contains("transactionHash"));
    }

    #[test]
    fn test_long_error_truncated_to_fit() {
        let response = GatewayResponse::failed(FailureStage::Submission, "é".repeat(2000));
        let text = response.to_message().unwrap();

        assert!(text.len() <= MAX_MESSAGE_LEN);
        let decoded: GatewayResponse = serde_json::from_str(&text).unwrap();
        assert!(decoded.error.unwrap().ends_with("..."));
        assert_eq!(decoded.stage, Some(FailureStage::Submission));
    }

    #[test]
    fn test_ack_text_falls_back_when_unencodable() {
        let mut response = GatewayResponse::failed(FailureStage::Confirmation, "x");
        response.explorer_url = Some("u".repeat(MAX_MESSAGE_LEN));

        let decoded: GatewayResponse = serde_json::from_str(&response.ack_text()).unwrap();
        assert_eq!(decoded.stage, Some(FailureStage::GatewayProcessing));
    }
}
