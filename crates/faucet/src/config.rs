//! Faucet configuration
//!
//! One [`FaucetConfig`] per process, loaded from a TOML file layered with
//! `FAUCET__*` environment variables. Every network is validated when the
//! file is loaded so the rest of the service can rely on its invariants.

use crate::error::{FaucetError, FaucetResult};
use crate::logging::LoggingConfig;
use ::config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Default pause between two payouts
pub const DEFAULT_COOLDOWN_SECS: u64 = 5;

/// Faucet service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaucetConfig {
    /// HTTP port
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub db: DatabaseConfig,

    #[serde(default)]
    pub project: ProjectConfig,

    #[serde(default)]
    pub recaptcha: RecaptchaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Networks served by this faucet
    #[serde(default)]
    pub blockchains: Vec<NetworkConfig>,
}

fn default_port() -> u16 { 8000 }

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// sled directory for the request limiter
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./faucet.db".to_string(),
        }
    }
}

/// Operator facing project metadata, served by `/config.json`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub logo: String,
    #[serde(default)]
    pub deployer: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecaptchaConfig {
    #[serde(default)]
    pub site_key: String,
    /// Verification is disabled when empty
    #[serde(default)]
    pub secret_key: String,
}

/// Chain family; decides address formats and which chain client pays out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
    Cosmos,
    Ethermint,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub rpc_endpoint: Option<String>,
    #[serde(default)]
    pub evm_endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SenderConfig {
    /// Hex encoded secp256k1 secret key
    #[serde(default)]
    pub secret: Option<String>,
    /// File holding the secret; read once at load time
    #[serde(default)]
    pub secret_file: Option<String>,
    /// Human readable bech32 prefix
    pub prefix: String,
}

impl SenderConfig {
    /// The resolved secret. Present on every validated config.
    pub fn secret(&self) -> FaucetResult<&str> {
        self.secret
            .as_deref()
            .ok_or_else(|| FaucetError::Config("sender secret not resolved".to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coin {
    pub denom: String,
    pub amount: String,
}

impl Coin {
    pub fn amount_u128(&self) -> FaucetResult<u128> {
        self.amount
            .parse::<u128>()
            .map_err(|_| FaucetError::Config(format!("invalid amount '{}' for {}", self.amount, self.denom)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeeConfig {
    pub amount: Vec<Coin>,
    /// Gas limit
    pub gas: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxConfig {
    pub amount: Vec<Coin>,
    pub fee: FeeConfig,
}

/// Requests allowed per 24h window
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitConfig {
    pub address: u32,
    pub ip: u32,
}

/// Per-network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub name: String,
    #[serde(default = "default_kind")]
    pub kind: NetworkKind,
    #[serde(default)]
    pub endpoint: EndpointConfig,
    pub sender: SenderConfig,
    pub tx: TxConfig,
    pub limit: LimitConfig,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_kind() -> NetworkKind { NetworkKind::Cosmos }
fn default_cooldown() -> u64 { DEFAULT_COOLDOWN_SECS }

impl NetworkConfig {
    /// The single denomination paid out; reconciliation compares against it
    pub fn payout(&self) -> &Coin {
        &self.tx.amount[0]
    }

    pub fn payout_amount(&self) -> FaucetResult<u128> {
        self.payout().amount_u128()
    }

    /// Total fee in the first fee denomination
    pub fn fee_amount(&self) -> FaucetResult<u128> {
        match self.tx.fee.amount.first() {
            Some(coin) => coin.amount_u128(),
            None => Ok(0),
        }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    /// Native bech32 form or `0x` hex form
    pub fn accepts_address(&self, address: &str) -> bool {
        if let Some(hex_part) = address.strip_prefix("0x") {
            return hex_part.len() == 40 && hex_part.chars().all(|c| c.is_ascii_hexdigit());
        }
        address.starts_with(&self.sender.prefix) && address.len() > self.sender.prefix.len()
    }

    fn validate(&mut self) -> FaucetResult<()> {
        let name = self.name.clone();
        let invalid = |msg: &str| FaucetError::Config(format!("network '{}': {}", name, msg));

        if self.name.trim().is_empty() {
            return Err(FaucetError::Config("network name must not be empty".to_string()));
        }
        if self.tx.amount.is_empty() {
            return Err(invalid("tx.amount must list at least one coin"));
        }
        for coin in self.tx.amount.iter().chain(self.tx.fee.amount.iter()) {
            coin.amount_u128()?;
        }
        if self.limit.address == 0 || self.limit.ip == 0 {
            return Err(invalid("limit.address and limit.ip must be positive"));
        }
        if self.sender.prefix.is_empty() {
            return Err(invalid("sender.prefix must not be empty"));
        }
        // payouts on every network kind go through the EVM JSON-RPC endpoint
        if self.endpoint.evm_endpoint.is_none() {
            return Err(invalid("endpoint.evm_endpoint is required"));
        }

        if self.sender.secret.is_none() {
            let path = self
                .sender
                .secret_file
                .as_ref()
                .ok_or_else(|| invalid("sender.secret or sender.secret_file is required"))?;
            let secret = std::fs::read_to_string(path)
                .map_err(|e| invalid(&format!("cannot read {}: {}", path, e)))?;
            self.sender.secret = Some(secret.trim().to_string());
        }

        Ok(())
    }
}

impl Default for FaucetConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            db: DatabaseConfig::default(),
            project: ProjectConfig::default(),
            recaptcha: RecaptchaConfig::default(),
            logging: LoggingConfig::default(),
            blockchains: Vec::new(),
        }
    }
}

impl FaucetConfig {
    /// Load from a config file layered with `FAUCET__*` environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> FaucetResult<Self> {
        let path_str = path
            .as_ref()
            .to_str()
            .ok_or_else(|| FaucetError::Config("invalid config path".to_string()))?;

        let settings = Config::builder()
            .add_source(File::with_name(path_str))
            .add_source(Environment::with_prefix("FAUCET").separator("__"))
            .build()
            .map_err(|e| FaucetError::Config(format!("failed to build configuration: {}", e)))?;

        let mut config: FaucetConfig = settings
            .try_deserialize()
            .map_err(|e| FaucetError::Config(format!("failed to deserialize configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every network and resolve secret files
    pub fn validate(&mut self) -> FaucetResult<()> {
        if self.blockchains.is_empty() {
            return Err(FaucetError::Config("at least one blockchain must be configured".to_string()));
        }

        let mut seen = HashSet::new();
        for network in &mut self.blockchains {
            network.validate()?;
            if !seen.insert(network.name.clone()) {
                return Err(FaucetError::Config(format!("duplicate network '{}'", network.name)));
            }
        }
        Ok(())
    }

    pub fn network(&self, name: &str) -> Option<&NetworkConfig> {
        self.blockchains.iter().find(|n| n.name == name)
    }

    /// Prefix advertised to the web frontend
    pub fn address_prefix(&self) -> &str {
        self.blockchains
            .first()
            .map(|n| n.sender.prefix.as_str())
            .unwrap_or_default()
    }
}
