//! Chain client used by the payout worker and the balance endpoint

use crate::config::{Coin, NetworkConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::wallet::{evm_address, signing_key_from_hex, to_evm_address};
use async_trait::async_trait;
use rlp::RlpStream;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info};

/// Result of a broadcast transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReceipt {
    pub tx_hash: String,
}

/// Signing, broadcasting and balance queries for one or more networks
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Send the network's configured amount to `recipient`, paying its configured fee
    async fn transfer(&self, network: &NetworkConfig, recipient: &str) -> FaucetResult<TransferReceipt>;

    /// Balance of `address` in the network's payout denomination
    async fn balance(&self, network: &NetworkConfig, address: &str) -> FaucetResult<Coin>;
}

/// How long a broadcast transaction may take to show up in a block
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);
const RECEIPT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Ethereum JSON-RPC client for networks that expose an EVM endpoint
pub struct EvmRpcClient {
    client: reqwest::Client,
    receipt_timeout: Duration,
}

impl Default for EvmRpcClient {
    fn default() -> Self {
        Self::new()
    }
}

impl EvmRpcClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_default(),
            receipt_timeout: RECEIPT_TIMEOUT,
        }
    }

    fn endpoint<'a>(&self, network: &'a NetworkConfig) -> FaucetResult<&'a str> {
        network
            .endpoint
            .evm_endpoint
            .as_deref()
            .ok_or_else(|| FaucetError::Config(format!("network '{}' has no evm_endpoint", network.name)))
    }

    async fn call(&self, url: &str, method: &str, params: serde_json::Value) -> FaucetResult<serde_json::Value> {
        let payload = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });

        let response = self
            .client
            .post(url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Request failed: {}", e)))?;

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| FaucetError::RpcError(format!("Invalid response: {}", e)))?;

        if let Some(error) = json.get("error") {
            return Err(FaucetError::RpcError(format!("{} failed: {}", method, error)));
        }

        Ok(json.get("result").cloned().unwrap_or(serde_json::Value::Null))
    }

    async fn call_quantity(&self, url: &str, method: &str, params: serde_json::Value) -> FaucetResult<u128> {
        let result = self.call(url, method, params).await?;
        let text = result
            .as_str()
            .ok_or_else(|| FaucetError::RpcError(format!("{} returned {}", method, result)))?;
        parse_quantity(text)
    }

    async fn wait_for_receipt(&self, url: &str, tx_hash: &str) -> FaucetResult<()> {
        let deadline = tokio::time::Instant::now() + self.receipt_timeout;
        loop {
            let receipt = self
                .call(url, "eth_getTransactionReceipt", serde_json::json!([tx_hash]))
                .await?;
            if !receipt.is_null() {
                let status = receipt.get("status").and_then(|s| s.as_str()).unwrap_or("0x1");
                if parse_quantity(status)? == 0 {
                    return Err(FaucetError::RpcError(format!("transaction {} reverted", tx_hash)));
                }
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(FaucetError::RpcError(format!(
                    "transaction {} not confirmed within {:?}",
                    tx_hash, self.receipt_timeout
                )));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ChainClient for EvmRpcClient {
    async fn transfer(&self, network: &NetworkConfig, recipient: &str) -> FaucetResult<TransferReceipt> {
        let url = self.endpoint(network)?;
        let signing_key = signing_key_from_hex(network.sender.secret()?)?;
        let sender = format!("0x{}", hex::encode(evm_address(&signing_key)));
        let to = to_evm_address(recipient)?;

        let nonce = self
            .call_quantity(url, "eth_getTransactionCount", serde_json::json!([sender, "pending"]))
            .await? as u64;
        let chain_id = self.call_quantity(url, "eth_chainId", serde_json::json!([])).await? as u64;

        let tx = LegacyTransaction {
            nonce,
            gas_price: network.fee_amount()? / network.tx.fee.gas.max(1) as u128,
            gas_limit: network.tx.fee.gas,
            to,
            value: network.payout_amount()?,
            chain_id,
        };
        let raw = tx.sign(&signing_key)?;

        let result = self
            .call(url, "eth_sendRawTransaction", serde_json::json!([format!("0x{}", hex::encode(raw))]))
            .await?;
        let tx_hash = result.as_str().unwrap_or_default().to_string();
        info!("Transaction sent on {}: {}", network.name, tx_hash);

        self.wait_for_receipt(url, &tx_hash).await?;
        Ok(TransferReceipt { tx_hash })
    }

    async fn balance(&self, network: &NetworkConfig, address: &str) -> FaucetResult<Coin> {
        let url = self.endpoint(network)?;
        let address = format!("0x{}", hex::encode(to_evm_address(address)?));
        let amount = self
            .call_quantity(url, "eth_getBalance", serde_json::json!([address, "latest"]))
            .await?;
        debug!("Balance of {} on {}: {}", address, network.name, amount);

        Ok(Coin {
            denom: network.payout().denom.clone(),
            amount: amount.to_string(),
        })
    }
}

/// Legacy (pre EIP-1559) value transfer, signed per EIP-155
#[derive(Debug, Clone)]
struct LegacyTransaction {
    nonce: u64,
    gas_price: u128,
    gas_limit: u64,
    to: [u8; 20],
    value: u128,
    chain_id: u64,
}

impl LegacyTransaction {
    fn append_body(&self, stream: &mut RlpStream) {
        stream.append(&self.nonce);
        stream.append(&trim_be(self.gas_price));
        stream.append(&self.gas_limit);
        stream.append(&self.to.to_vec());
        stream.append(&trim_be(self.value));
        stream.append_empty_data(); // data
    }

    fn sign(&self, key: &k256::ecdsa::SigningKey) -> FaucetResult<Vec<u8>> {
        let mut unsigned = RlpStream::new_list(9);
        self.append_body(&mut unsigned);
        unsigned.append(&self.chain_id);
        unsigned.append_empty_data();
        unsigned.append_empty_data();

        let sighash = keccak_hash::keccak(unsigned.out());
        let (signature, recovery_id) = key
            .sign_prehash_recoverable(&sighash.0)
            .map_err(|e| FaucetError::InternalError(format!("signing failed: {}", e)))?;
        let bytes = signature.to_bytes();
        let v = self.chain_id * 2 + 35 + recovery_id.to_byte() as u64;

        let mut signed = RlpStream::new_list(9);
        self.append_body(&mut signed);
        signed.append(&v);
        signed.append(&strip_zeros(&bytes[..32]));
        signed.append(&strip_zeros(&bytes[32..]));
        Ok(signed.out().to_vec())
    }
}

/// Minimal big-endian encoding of an RLP integer
fn trim_be(value: u128) -> Vec<u8> {
    strip_zeros(&value.to_be_bytes())
}

fn strip_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|&b| b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

/// Parse a JSON-RPC hex quantity such as `0x1bc16d674ec80000`
fn parse_quantity(text: &str) -> FaucetResult<u128> {
    let digits = text.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(0);
    }
    u128::from_str_radix(digits, 16)
        .map_err(|_| FaucetError::RpcError(format!("invalid quantity '{}'", text)))
}
