//! Faucet service: owns the admission pipeline and its collaborators

use crate::admission::{Admission, AdmissionController, ClaimRequest};
use crate::blocklist::OriginBlocklist;
use crate::captcha::CaptchaVerifier;
use crate::chain::ChainClient;
use crate::config::{Coin, FaucetConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::limiter::WindowedLimiter;
use crate::metrics::FaucetMetrics;
use crate::queue::{AddressStatus, Claim, DispatchQueue};
use crate::wallet::{AddressDeriver, DerivationOptions};
use crate::worker::PayoutWorker;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// External systems the faucet talks to
pub struct Collaborators {
    pub chain: Arc<dyn ChainClient>,
    pub captcha: Arc<dyn CaptchaVerifier>,
    pub deriver: Arc<dyn AddressDeriver>,
}

/// Queue state of one claimant
#[derive(Debug, Clone, Serialize)]
pub struct ClaimStatus {
    pub network: String,
    pub address: String,
    pub status: Option<AddressStatus>,
    pub queue_length: usize,
}

pub struct FaucetService {
    config: Arc<FaucetConfig>,
    limiter: WindowedLimiter,
    blocklist: Arc<OriginBlocklist>,
    queue: Arc<DispatchQueue>,
    admission: AdmissionController,
    chain: Arc<dyn ChainClient>,
    captcha: Arc<dyn CaptchaVerifier>,
    metrics: Arc<FaucetMetrics>,
    /// Sender address per network, derived once at startup
    sender_addresses: BTreeMap<String, String>,
}

impl FaucetService {
    pub fn new(
        config: FaucetConfig,
        limiter: WindowedLimiter,
        collaborators: Collaborators,
    ) -> FaucetResult<Self> {
        let config = Arc::new(config);
        let metrics = Arc::new(
            FaucetMetrics::new().map_err(|e| FaucetError::InternalError(e.to_string()))?,
        );

        let mut sender_addresses = BTreeMap::new();
        for network in &config.blockchains {
            let options = DerivationOptions {
                kind: network.kind,
                prefix: network.sender.prefix.clone(),
            };
            let address = collaborators
                .deriver
                .derive(network.sender.secret()?, &options)?;
            info!(
                "Network {}: sender {}..., payout {} {}",
                network.name,
                &address[..address.len().min(12)],
                network.payout().amount,
                network.payout().denom
            );
            sender_addresses.insert(network.name.clone(), address);
        }

        let blocklist = Arc::new(OriginBlocklist::new());
        let queue = Arc::new(DispatchQueue::new());
        let admission = AdmissionController::new(
            config.clone(),
            limiter.clone(),
            blocklist.clone(),
            queue.clone(),
            metrics.clone(),
        );

        Ok(Self {
            config,
            limiter,
            blocklist,
            queue,
            admission,
            chain: collaborators.chain,
            captcha: collaborators.captcha,
            metrics,
            sender_addresses,
        })
    }

    pub fn config(&self) -> &FaucetConfig {
        &self.config
    }

    pub fn metrics(&self) -> &FaucetMetrics {
        &self.metrics
    }

    pub async fn verify_captcha(&self, token: &str, origin: &str) -> FaucetResult<()> {
        let result = self.captcha.verify(token, origin).await;
        if result.is_err() {
            self.metrics.request("captcha_failed");
        }
        result
    }

    pub async fn admit(&self, request: &ClaimRequest) -> FaucetResult<Admission> {
        self.admission.admit(request).await
    }

    /// One sender address per network, keyed by network name
    pub fn sample_addresses(&self) -> &BTreeMap<String, String> {
        &self.sender_addresses
    }

    pub async fn sender_balance(&self, network: &str) -> FaucetResult<Coin> {
        let config = self
            .config
            .network(network)
            .ok_or_else(|| FaucetError::UnsupportedNetwork(network.to_string()))?;
        let sender = self
            .sender_addresses
            .get(network)
            .ok_or_else(|| FaucetError::UnsupportedNetwork(network.to_string()))?;
        self.chain.balance(config, sender).await
    }

    pub fn claim_status(&self, network: &str, address: &str) -> FaucetResult<ClaimStatus> {
        if self.config.network(network).is_none() {
            return Err(FaucetError::UnsupportedNetwork(network.to_string()));
        }
        let claim = Claim::new(network, address);
        Ok(ClaimStatus {
            network: claim.network.clone(),
            address: claim.address.clone(),
            status: self.queue.status(&claim),
            queue_length: self.queue.len(),
        })
    }

    pub fn blocked_prefixes(&self) -> usize {
        self.blocklist.blocked_count()
    }

    /// Start the single payout worker
    pub fn spawn_worker(&self) -> JoinHandle<()> {
        let worker = PayoutWorker::new(
            self.queue.clone(),
            self.chain.clone(),
            self.config.clone(),
            self.metrics.clone(),
        );
        tokio::spawn(worker.run())
    }

    /// Periodically drop limiter keys that no longer hold live entries
    pub fn spawn_janitor(&self, period: Duration) -> JoinHandle<()> {
        let limiter = self.limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                match limiter.prune_expired() {
                    Ok(count) => info!("Pruned {} expired limiter keys", count),
                    Err(e) => warn!("Limiter cleanup failed: {}", e),
                }
            }
        })
    }

    pub async fn flush(&self) -> FaucetResult<()> {
        self.limiter.flush().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::captcha::DisabledCaptcha;
    use crate::config::tests::sample_network;
    use crate::limiter::LIMITER_WINDOW;
    use crate::wallet::Secp256k1Deriver;
    use crate::worker::tests::MockChain;
    use tempfile::TempDir;

    pub(crate) fn service(dir: &TempDir) -> FaucetService {
        let db = sled::open(dir.path()).unwrap();
        let mut network = sample_network("edgenet");
        network.cooldown_secs = 0;
        let config = FaucetConfig {
            blockchains: vec![network],
            ..FaucetConfig::default()
        };
        FaucetService::new(
            config,
            WindowedLimiter::new(&db, LIMITER_WINDOW).unwrap(),
            Collaborators {
                chain: Arc::new(MockChain::default()),
                captcha: Arc::new(DisabledCaptcha),
                deriver: Arc::new(Secp256k1Deriver),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_sender_addresses_are_derived() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let sample = service.sample_addresses();
        assert_eq!(sample.len(), 1);
        assert!(sample["edgenet"].starts_with("allo1"));
    }

    #[test]
    fn test_claim_status_for_unknown_network() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        assert!(service.claim_status("mainnet", "allo1abc").is_err());
        let status = service.claim_status("edgenet", "allo1abc").unwrap();
        assert_eq!(status.status, None);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_worker_completes_sent_claims() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let worker = service.spawn_worker();

        let request = ClaimRequest {
            network: "edgenet".to_string(),
            address: "allo1abc".to_string(),
            origin: "1.2.3.4".to_string(),
        };
        assert_eq!(service.admit(&request).await.unwrap(), Admission::Enqueued);

        for _ in 0..100 {
            if service.claim_status("edgenet", "allo1abc").unwrap().status
                == Some(AddressStatus::Completed)
            {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        worker.abort();

        assert_eq!(
            service.claim_status("edgenet", "allo1abc").unwrap().status,
            Some(AddressStatus::Completed)
        );
        assert_eq!(service.admit(&request).await.unwrap(), Admission::Resubmit);
    }

    #[tokio::test]
    async fn test_sender_balance_uses_payout_denom() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir);
        let balance = service.sender_balance("edgenet").await.unwrap();
        assert_eq!(balance.denom, "uallo");
        assert_eq!(balance.amount, "0");
        assert!(service.sender_balance("mainnet").await.is_err());
    }
}
