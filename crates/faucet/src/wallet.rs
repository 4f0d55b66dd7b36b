//! Sender key handling and address derivation
//!
//! Secrets are hex encoded secp256k1 keys. Ethermint networks use the
//! Keccak based `0x` address, cosmos networks the bech32 encoding of
//! RIPEMD160(SHA256(compressed public key)).

use crate::config::NetworkKind;
use crate::error::{FaucetError, FaucetResult};
use k256::ecdsa::SigningKey;
use bech32::primitives::decode::CheckedHrpstring;
use bech32::{Bech32, Hrp};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// Options that select the address format for a derived key
#[derive(Debug, Clone)]
pub struct DerivationOptions {
    pub kind: NetworkKind,
    pub prefix: String,
}

/// Derives the public address that belongs to a configured sender secret
pub trait AddressDeriver: Send + Sync {
    fn derive(&self, secret: &str, options: &DerivationOptions) -> FaucetResult<String>;
}

/// secp256k1 derivation for cosmos and ethermint networks
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Deriver;

impl AddressDeriver for Secp256k1Deriver {
    fn derive(&self, secret: &str, options: &DerivationOptions) -> FaucetResult<String> {
        let key = signing_key_from_hex(secret)?;
        match options.kind {
            NetworkKind::Ethermint => Ok(format!("0x{}", hex::encode(evm_address(&key)))),
            NetworkKind::Cosmos => cosmos_address(&key, &options.prefix),
        }
    }
}

/// Decode a hex secret key, with or without `0x`
pub fn signing_key_from_hex(secret: &str) -> FaucetResult<SigningKey> {
    let secret = secret.trim();
    let secret = secret.strip_prefix("0x").unwrap_or(secret);
    let bytes = hex::decode(secret)
        .map_err(|e| FaucetError::Config(format!("Invalid sender secret: {}", e)))?;
    if bytes.len() != 32 {
        return Err(FaucetError::Config(format!(
            "Invalid sender secret: expected 32 bytes, got {}",
            bytes.len()
        )));
    }
    SigningKey::from_slice(&bytes)
        .map_err(|e| FaucetError::Config(format!("Invalid signing key: {}", e)))
}

pub fn evm_address(key: &SigningKey) -> [u8; 20] {
    let public_key = key.verifying_key().to_encoded_point(false);
    // skip the 0x04 tag of the uncompressed point
    let hash = keccak_hash::keccak(&public_key.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&hash.0[12..]);
    address
}

pub fn cosmos_address(key: &SigningKey, prefix: &str) -> FaucetResult<String> {
    let public_key = key.verifying_key().to_encoded_point(true);
    let sha = Sha256::digest(public_key.as_bytes());
    let hash = Ripemd160::digest(sha);
    bech32_encode(prefix, &hash)
}

/// Parse a recipient in `0x` hex or bech32 form into raw EVM address bytes
pub fn to_evm_address(address: &str) -> FaucetResult<[u8; 20]> {
    let bytes = match address.strip_prefix("0x") {
        Some(hex_part) => hex::decode(hex_part)
            .map_err(|_| FaucetError::UnsupportedAddressFormat(address.to_string()))?,
        None => bech32_decode(address)?.1,
    };
    bytes
        .try_into()
        .map_err(|_| FaucetError::UnsupportedAddressFormat(address.to_string()))
}

/// Longest string BIP-173 allows
const BECH32_MAX_LENGTH: usize = 90;

/// Bech32 encoding of an 8-bit payload under `prefix`
pub fn bech32_encode(prefix: &str, payload: &[u8]) -> FaucetResult<String> {
    let hrp = Hrp::parse(prefix)
        .map_err(|e| FaucetError::Config(format!("invalid bech32 prefix '{}': {}", prefix, e)))?;
    bech32::encode::<Bech32>(hrp, payload)
        .map_err(|e| FaucetError::InternalError(format!("bech32 encoding failed: {}", e)))
}

/// Human readable part (lowercased) and 8-bit payload of a bech32 string
pub fn bech32_decode(address: &str) -> FaucetResult<(String, Vec<u8>)> {
    if address.len() > BECH32_MAX_LENGTH {
        return Err(FaucetError::UnsupportedAddressFormat(address.to_string()));
    }
    let checked = CheckedHrpstring::new::<Bech32>(address)
        .map_err(|_| FaucetError::UnsupportedAddressFormat(address.to_string()))?;
    Ok((checked.hrp().to_lowercase(), checked.byte_iter().collect()))
}
