//! Minimal ABI helpers for the token contract calls the gateway makes
//!
//! Only static words and a single trailing `bytes` argument are needed, so the
//! encoder works directly on 32-byte words instead of a generic ABI model.

use crate::types::ValidatedTransfer;
use shared::{Error, Result};

/// `transferWithAuthorization(address,address,uint256,uint256,uint256,bytes32,bytes)`
pub const TRANSFER_WITH_AUTHORIZATION_SELECTOR: [u8; 4] = [0xcf, 0x09, 0x29, 0x95];

/// `balanceOf(address)`
pub const BALANCE_OF_SELECTOR: [u8; 4] = [0x70, 0xa0, 0x82, 0x31];

const WORD: usize = 32;

/// Parse a `0x`-prefixed 20-byte address
pub fn parse_address(address: &str) -> Result<[u8; 20]> {
    let digits = address.strip_prefix("0x").ok_or_else(|| {
        Error::InvalidWalletAddress(format!("{}: address must start with 0x", address))
    })?;

    if digits.len() != 40 {
        return Err(Error::InvalidWalletAddress(format!(
            "{}: address must be 42 characters (0x + 40 hex)",
            address
        )));
    }

    let mut out = [0u8; 20];
    hex::decode_to_slice(digits, &mut out).map_err(|_| {
        Error::InvalidWalletAddress(format!(
            "{}: address must contain only hexadecimal characters",
            address
        ))
    })?;
    Ok(out)
}

/// Parse an unsigned integer given in decimal or `0x` hex
pub fn parse_uint(field: &str, value: &str) -> Result<u128> {
    let parsed = match value.strip_prefix("0x") {
        Some(digits) => u128::from_str_radix(digits, 16),
        None => value.parse::<u128>(),
    };
    parsed.map_err(|e| Error::Validation(format!("{} is not a valid uint: {}", field, e)))
}

/// Parse a `0x`-prefixed 32-byte value
pub fn parse_bytes32(field: &str, value: &str) -> Result<[u8; 32]> {
    let bytes = parse_hex_bytes(field, value)?;
    bytes.try_into().map_err(|bytes: Vec<u8>| {
        Error::Validation(format!("{} must be 32 bytes, got {}", field, bytes.len()))
    })
}

/// Parse a `0x`-prefixed byte string
pub fn parse_hex_bytes(field: &str, value: &str) -> Result<Vec<u8>> {
    let digits = value
        .strip_prefix("0x")
        .ok_or_else(|| Error::Validation(format!("{} must start with 0x", field)))?;
    hex::decode(digits).map_err(|e| Error::Validation(format!("{} is not valid hex: {}", field, e)))
}

fn address_word(address: &[u8; 20]) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[12..].copy_from_slice(address);
    word
}

fn uint_word(value: u128) -> [u8; WORD] {
    let mut word = [0u8; WORD];
    word[16..].copy_from_slice(&value.to_be_bytes());
    word
}

/// Call data for `transferWithAuthorization`
pub fn encode_transfer_with_authorization(transfer: &ValidatedTransfer) -> Vec<u8> {
    let padded_len = transfer.signature.len().div_ceil(WORD) * WORD;
    let mut data = Vec::with_capacity(4 + WORD * 8 + padded_len);

    data.extend_from_slice(&TRANSFER_WITH_AUTHORIZATION_SELECTOR);
    data.extend_from_slice(&address_word(&transfer.from));
    data.extend_from_slice(&address_word(&transfer.to));
    data.extend_from_slice(&uint_word(transfer.value));
    data.extend_from_slice(&uint_word(transfer.valid_after));
    data.extend_from_slice(&uint_word(transfer.valid_before));
    data.extend_from_slice(&transfer.nonce);
    // Offset of the dynamic `bytes` argument, measured from the first head word
    data.extend_from_slice(&uint_word((WORD * 7) as u128));
    data.extend_from_slice(&uint_word(transfer.signature.len() as u128));
    data.extend_from_slice(&transfer.signature);
    data.resize(4 + WORD * 8 + padded_len, 0);

    data
}

/// Call data for `balanceOf(owner)`
pub fn encode_balance_of(owner: &[u8; 20]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + WORD);
    data.extend_from_slice(&BALANCE_OF_SELECTOR);
    data.extend_from_slice(&address_word(owner));
    data
}

/// Decode a single `uint256` return word, saturating values beyond `u128`
pub fn decode_uint_word(data: &[u8]) -> Result<u128> {
    if data.len() < WORD {
        return Err(Error::EvmRpc(format!(
            "expected a 32-byte return word, got {} bytes",
            data.len()
        )));
    }
    if data[..16].iter().any(|b| *b != 0) {
        return Ok(u128::MAX);
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&data[16..WORD]);
    Ok(u128::from_be_bytes(low))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer() -> ValidatedTransfer {
        ValidatedTransfer {
            contract: [0x11; 20],
            from: [0x22; 20],
            to: [0x33; 20],
            value: 1_000,
            valid_after: 0,
            valid_before: 2_000_000_000,
            nonce: [0x44; 32],
            signature: vec![0x55; 65],
        }
    }

    #[test]
    fn test_parse_address_valid() {
        let address = parse_address("0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb0").unwrap();
        assert_eq!(address[0], 0x74);
        assert_eq!(address[19], 0xb0);
    }

    #[test]
    fn test_parse_address_invalid_prefix() {
        assert!(parse_address("742d35Cc6634C0532925a3b844Bc9e7595f0bEb0").is_err());
    }

    #[test]
    fn test_parse_address_invalid_length() {
        assert!(parse_address("0x742d35Cc").is_err());
    }

    #[test]
    fn test_parse_address_invalid_chars() {
        assert!(parse_address("0x742d35Cc6634C0532925a3b844Bc9e7595f0bEbZ").is_err());
    }

    #[test]
    fn test_parse_uint_decimal_and_hex() {
        assert_eq!(parse_uint("value", "1000").unwrap(), 1000);
        assert_eq!(parse_uint("value", "0x3e8").unwrap(), 1000);
        assert!(parse_uint("value", "-1").is_err());
        assert!(parse_uint("value", "1e18").is_err());
    }

    #[test]
    fn test_parse_bytes32_length_checked() {
        assert!(parse_bytes32("nonce", &format!("0x{}", "00".repeat(32))).is_ok());
        assert!(parse_bytes32("nonce", &format!("0x{}", "00".repeat(31))).is_err());
        assert!(parse_bytes32("nonce", "00").is_err());
    }

    #[test]
    fn test_transfer_call_data_layout() {
        let data = encode_transfer_with_authorization(&transfer());

        // selector + 7 head words + length word + 65 bytes padded to 96
        assert_eq!(data.len(), 4 + 32 * 8 + 96);
        assert_eq!(&data[..4], &TRANSFER_WITH_AUTHORIZATION_SELECTOR);

        let word = |i: usize| &data[4 + i * 32..4 + (i + 1) * 32];
        assert_eq!(&word(0)[12..], &[0x22; 20]);
        assert_eq!(&word(1)[12..], &[0x33; 20]);
        assert_eq!(decode_uint_word(word(2)).unwrap(), 1_000);
        assert_eq!(decode_uint_word(word(4)).unwrap(), 2_000_000_000);
        assert_eq!(word(5), &[0x44; 32]);
        assert_eq!(decode_uint_word(word(6)).unwrap(), 224);
        assert_eq!(decode_uint_word(word(7)).unwrap(), 65);
        assert_eq!(&data[4 + 32 * 8..4 + 32 * 8 + 65], &[0x55; 65][..]);
        assert!(data[4 + 32 * 8 + 65..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_balance_of_call_data() {
        let data = encode_balance_of(&[0x22; 20]);
        assert_eq!(data.len(), 36);
        assert_eq!(&data[..4], &BALANCE_OF_SELECTOR);
        assert_eq!(&data[16..], &[0x22; 20]);
    }

    #[test]
    fn test_decode_uint_word_saturates() {
        let mut word = [0u8; 32];
        word[0] = 1;
        assert_eq!(decode_uint_word(&word).unwrap(), u128::MAX);
        assert!(decode_uint_word(&word[..8]).is_err());
    }
}
