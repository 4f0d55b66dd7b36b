//! Prometheus metrics for the faucet

use prometheus::{
    histogram_opts, opts, Encoder, Gauge, Histogram, IntCounterVec, Registry, TextEncoder,
};

/// Faucet metrics, registered on a private registry
#[derive(Debug)]
pub struct FaucetMetrics {
    registry: Registry,

    /// `/send` decisions by outcome label
    pub requests_total: IntCounterVec,
    /// Payout attempts by outcome (sent, reconciled, failed)
    pub payouts_total: IntCounterVec,
    pub queue_depth: Gauge,
    pub blocked_prefixes: Gauge,
    pub payout_duration: Histogram,
}

impl FaucetMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            opts!("faucet_requests_total", "Faucet claims by admission outcome"),
            &["outcome"],
        )?;
        let payouts_total = IntCounterVec::new(
            opts!("faucet_payouts_total", "Payout attempts by outcome"),
            &["outcome"],
        )?;
        let queue_depth = Gauge::with_opts(opts!(
            "faucet_queue_depth",
            "Claims waiting for the payout worker"
        ))?;
        let blocked_prefixes = Gauge::with_opts(opts!(
            "faucet_blocked_prefixes",
            "Origin prefixes on the permanent blocklist"
        ))?;
        let payout_duration = Histogram::with_opts(histogram_opts!(
            "faucet_payout_duration_seconds",
            "Time spent in a single transfer including reconciliation"
        ))?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(payouts_total.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(blocked_prefixes.clone()))?;
        registry.register(Box::new(payout_duration.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            payouts_total,
            queue_depth,
            blocked_prefixes,
            payout_duration,
        })
    }

    pub fn request(&self, outcome: &str) {
        self.requests_total.with_label_values(&[outcome]).inc();
    }

    pub fn payout(&self, outcome: &str) {
        self.payouts_total.with_label_values(&[outcome]).inc();
    }

    /// Render in the Prometheus text exposition format
    pub fn gather(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
