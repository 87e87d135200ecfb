use crate::abi;
use serde::{Deserialize, Deserializer, Serialize};
use shared::{Error, Result};

/// Type tag carried by every transfer payload relayed through the mesh
pub const TRANSFER_WITH_AUTHORIZATION: &str = "TRANSFER_WITH_AUTHORIZATION";

/// Signed transfer authorization as produced by the sender's wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAuthorization {
    pub from: String,
    pub to: String,
    #[serde(deserialize_with = "string_or_number")]
    pub value: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_after: String,
    #[serde(deserialize_with = "string_or_number")]
    pub valid_before: String,
    pub nonce: String,
    pub signature: String,
}

/// Mesh payload wrapping an authorization and the token contract it targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub contract_address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub parameters: TransferAuthorization,
}

/// Transfer authorization with every field decoded to its ABI width
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedTransfer {
    pub contract: [u8; 20],
    pub from: [u8; 20],
    pub to: [u8; 20],
    pub value: u128,
    pub valid_after: u128,
    pub valid_before: u128,
    pub nonce: [u8; 32],
    pub signature: Vec<u8>,
}

/// Confirmed transfer as reported by the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferReceipt {
    pub transaction_hash: String,
    pub block_number: u64,
    pub gas_used: String,
}

impl TransferPayload {
    /// Check the type tag and decode every field, rejecting ill-shaped input
    pub fn validate(&self) -> Result<ValidatedTransfer> {
        if self.kind != TRANSFER_WITH_AUTHORIZATION {
            return Err(Error::Validation(format!(
                "Unsupported payload type '{}'",
                self.kind
            )));
        }

        let params = &self.parameters;
        let signature = abi::parse_hex_bytes("signature", &params.signature)?;
        if signature.len() != 65 {
            return Err(Error::Validation(format!(
                "signature must be 65 bytes, got {}",
                signature.len()
            )));
        }

        Ok(ValidatedTransfer {
            contract: abi::parse_address(&self.contract_address)?,
            from: abi::parse_address(&params.from)?,
            to: abi::parse_address(&params.to)?,
            value: abi::parse_uint("value", &params.value)?,
            valid_after: abi::parse_uint("validAfter", &params.valid_after)?,
            valid_before: abi::parse_uint("validBefore", &params.valid_before)?,
            nonce: abi::parse_bytes32("nonce", &params.nonce)?,
            signature,
        })
    }
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Text(String),
        Number(u64),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Text(text) => text,
        Raw::Number(number) => number.to_string(),
    })
}
