//! Admission decisions for incoming claims

use crate::blocklist::OriginBlocklist;
use crate::config::{FaucetConfig, NetworkConfig};
use crate::error::{FaucetError, FaucetResult, QuotaScope};
use crate::limiter::{ClaimKey, WindowedLimiter};
use crate::metrics::FaucetMetrics;
use crate::queue::{Claim, DispatchQueue, EnqueueOutcome};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// A claim as received from a caller
#[derive(Debug, Clone, Deserialize)]
pub struct ClaimRequest {
    pub network: String,
    pub address: String,
    pub origin: String,
}

/// Successful admission results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    AlreadyQueued,
    /// The previous payout finished; this request only acknowledges it
    Resubmit,
}

impl Admission {
    pub fn message(&self) -> &'static str {
        match self {
            Admission::Enqueued => "Address enqueued for faucet processing.",
            Admission::AlreadyQueued => "Address already in the processing queue",
            Admission::Resubmit => {
                "Your previous faucet request has been processed. You can now submit a new request."
            }
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Admission::Enqueued => "enqueued",
            Admission::AlreadyQueued => "already_queued",
            Admission::Resubmit => "resubmit",
        }
    }
}

pub struct AdmissionController {
    config: Arc<FaucetConfig>,
    limiter: WindowedLimiter,
    blocklist: Arc<OriginBlocklist>,
    queue: Arc<DispatchQueue>,
    metrics: Arc<FaucetMetrics>,
    /// Held for a whole decision so check and record cannot interleave
    decision_lock: Mutex<()>,
}

impl AdmissionController {
    pub fn new(
        config: Arc<FaucetConfig>,
        limiter: WindowedLimiter,
        blocklist: Arc<OriginBlocklist>,
        queue: Arc<DispatchQueue>,
        metrics: Arc<FaucetMetrics>,
    ) -> Self {
        Self {
            config,
            limiter,
            blocklist,
            queue,
            metrics,
            decision_lock: Mutex::new(()),
        }
    }

    pub async fn admit(&self, request: &ClaimRequest) -> FaucetResult<Admission> {
        let result = self.decide(request).await;
        match &result {
            Ok(admission) => self.metrics.request(admission.label()),
            Err(e) => self.metrics.request(rejection_label(e)),
        }
        self.metrics.queue_depth.set(self.queue.len() as f64);
        self.metrics
            .blocked_prefixes
            .set(self.blocklist.blocked_count() as f64);
        result
    }

    async fn decide(&self, request: &ClaimRequest) -> FaucetResult<Admission> {
        let network = self.resolve(request)?;
        let claim = Claim::new(&network.name, &request.address);
        let address_key = ClaimKey::address(&network.name, &request.address);
        let origin_key = ClaimKey::origin(&network.name, &request.origin);

        let _guard = self.decision_lock.lock().await;

        if !self.limiter.check(&address_key, network.limit.address)? {
            return Err(quota_exceeded(QuotaScope::Address, network, &request.address));
        }
        if !self.limiter.check(&origin_key, network.limit.ip)? {
            return Err(quota_exceeded(QuotaScope::Origin, network, &request.address));
        }

        if self.queue.consume_if_completed(&claim) {
            debug!("Acknowledged completed payout for {}", claim);
            return Ok(Admission::Resubmit);
        }
        if self.queue.is_queued(&claim) {
            return Ok(Admission::AlreadyQueued);
        }

        if self.blocklist.record_and_maybe_block(&request.origin) {
            warn!("Rejected {} from blocked origin {}", claim, request.origin);
            return Err(FaucetError::OriginBlocked);
        }

        // quota is consumed before the claim can reach the worker; a failed
        // write leaves nothing queued
        self.limiter.record(&address_key)?;
        self.limiter.record(&origin_key)?;
        if self.queue.enqueue(claim.clone())? == EnqueueOutcome::AlreadyQueued {
            return Ok(Admission::AlreadyQueued);
        }

        info!("Enqueued {} from {}", claim, request.origin);
        Ok(Admission::Enqueued)
    }

    fn resolve(&self, request: &ClaimRequest) -> FaucetResult<&NetworkConfig> {
        let network = self
            .config
            .network(&request.network)
            .ok_or_else(|| FaucetError::UnsupportedNetwork(request.network.clone()))?;
        if !network.accepts_address(&request.address) {
            return Err(FaucetError::UnsupportedAddressFormat(request.address.clone()));
        }
        Ok(network)
    }
}

fn quota_exceeded(scope: QuotaScope, network: &NetworkConfig, address: &str) -> FaucetError {
    FaucetError::QuotaExceeded {
        scope,
        message: format!(
            "Too many faucet requests sent for address '{}'. Try again later. \
             Limits per 24h: {} times per address, {} times per IP.",
            address, network.limit.address, network.limit.ip
        ),
    }
}

fn rejection_label(error: &FaucetError) -> &'static str {
    match error {
        FaucetError::QuotaExceeded { .. } | FaucetError::LimiterStoreUnavailable(_) => "quota_exceeded",
        FaucetError::OriginBlocked => "blocked",
        FaucetError::UnsupportedNetwork(_)
        | FaucetError::UnsupportedAddressFormat(_)
        | FaucetError::MissingField(_) => "invalid",
        _ => "error",
    }
}
