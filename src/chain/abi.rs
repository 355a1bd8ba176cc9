//! Minimal Solidity ABI encoding for the router calls the keeper makes.
//!
//! Only static types are needed: `uint256` and `address` arguments, and
//! return values that are a flat sequence of 32-byte words.

use super::error::{ChainError, ChainResult};
use sha3::{Digest, Keccak256};

/// One 32-byte ABI word.
pub type Word = [u8; 32];

/// A static call argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbiArg {
    Uint(u128),
    Address([u8; 20]),
}

/// First four bytes of the Keccak-256 hash of a function signature.
pub fn selector(signature: &str) -> [u8; 4] {
    let hash = Keccak256::digest(signature.as_bytes());
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Build calldata for `signature` with static arguments.
pub fn encode_call(signature: &str, args: &[AbiArg]) -> Vec<u8> {
    let mut data = Vec::with_capacity(4 + 32 * args.len());
    data.extend_from_slice(&selector(signature));
    for arg in args {
        let mut word = [0u8; 32];
        match arg {
            AbiArg::Uint(value) => word[16..].copy_from_slice(&value.to_be_bytes()),
            AbiArg::Address(addr) => word[12..].copy_from_slice(addr),
        }
        data.extend_from_slice(&word);
    }
    data
}

/// Parse a `0x`-prefixed (or bare) 20-byte hex address.
pub fn parse_address(addr: &str) -> ChainResult<[u8; 20]> {
    let stripped = addr.strip_prefix("0x").unwrap_or(addr);
    let bytes = hex::decode(stripped)
        .map_err(|e| ChainError::Decode(format!("invalid address '{}': {}", addr, e)))?;
    bytes
        .try_into()
        .map_err(|_| ChainError::Decode(format!("address '{}' is not 20 bytes", addr)))
}

/// Decode a `0x` hex string into bytes.
pub fn decode_hex(data: &str) -> ChainResult<Vec<u8>> {
    let stripped = data.strip_prefix("0x").unwrap_or(data);
    hex::decode(stripped).map_err(|e| ChainError::Decode(format!("invalid hex: {}", e)))
}

/// Split return data into 32-byte words.
pub fn words(data: &[u8]) -> ChainResult<Vec<Word>> {
    if data.len() % 32 != 0 {
        return Err(ChainError::Decode(format!(
            "return data length {} is not a multiple of 32",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(32)
        .map(|chunk| {
            let mut word = [0u8; 32];
            word.copy_from_slice(chunk);
            word
        })
        .collect())
}

pub fn word_to_u128(word: &Word) -> ChainResult<u128> {
    if word[..16].iter().any(|&b| b != 0) {
        return Err(ChainError::Decode("uint256 value exceeds u128".to_string()));
    }
    let mut low = [0u8; 16];
    low.copy_from_slice(&word[16..]);
    Ok(u128::from_be_bytes(low))
}

pub fn word_to_u64(word: &Word) -> ChainResult<u64> {
    u64::try_from(word_to_u128(word)?)
        .map_err(|_| ChainError::Decode("uint256 value exceeds u64".to_string()))
}

pub fn word_to_bool(word: &Word) -> bool {
    word.iter().any(|&b| b != 0)
}

/// Lower-case `0x` address from the low 20 bytes of a word.
pub fn word_to_address(word: &Word) -> String {
    format!("0x{}", hex::encode(&word[12..]))
}
