//! Payout worker: the single consumer of the dispatch queue

use crate::chain::ChainClient;
use crate::config::{FaucetConfig, NetworkConfig};
use crate::error::{FaucetError, FaucetResult};
use crate::metrics::FaucetMetrics;
use crate::queue::{Claim, DispatchQueue};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

/// How a resolved claim ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayoutOutcome {
    Sent { tx_hash: String },
    /// The client reported an error but the recipient was credited exactly
    /// the payout amount
    Reconciled { error: String },
}

pub struct PayoutWorker {
    queue: Arc<DispatchQueue>,
    chain: Arc<dyn ChainClient>,
    config: Arc<FaucetConfig>,
    metrics: Arc<FaucetMetrics>,
}

impl PayoutWorker {
    pub fn new(
        queue: Arc<DispatchQueue>,
        chain: Arc<dyn ChainClient>,
        config: Arc<FaucetConfig>,
        metrics: Arc<FaucetMetrics>,
    ) -> Self {
        Self {
            queue,
            chain,
            config,
            metrics,
        }
    }

    /// Drain the queue forever, one claim at a time
    pub async fn run(self) {
        info!("Payout worker started");
        loop {
            let claim = self.queue.dequeue_next().await;
            self.metrics.queue_depth.set(self.queue.len() as f64);

            self.process(&claim).await;

            let cooldown = self
                .config
                .network(&claim.network)
                .map(|n| n.cooldown())
                .unwrap_or_default();
            tokio::time::sleep(cooldown).await;
        }
    }

    /// Pay one claim. The claim is marked completed whatever the result;
    /// there is no automatic retry.
    pub async fn process(&self, claim: &Claim) -> Option<PayoutOutcome> {
        let started = Instant::now();
        let result = match self.config.network(&claim.network) {
            Some(network) => self.pay(network, &claim.address).await,
            None => Err(FaucetError::UnsupportedNetwork(claim.network.clone())),
        };
        self.metrics
            .payout_duration
            .observe(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(PayoutOutcome::Sent { tx_hash }) => {
                info!("Sent tokens to {} ({})", claim, tx_hash);
                self.metrics.payout("sent");
                Some(PayoutOutcome::Sent { tx_hash })
            }
            Ok(PayoutOutcome::Reconciled { error }) => {
                warn!(
                    "Transfer to {} reported an error but the balance shows the payout: {}",
                    claim, error
                );
                self.metrics.payout("reconciled");
                Some(PayoutOutcome::Reconciled { error })
            }
            Err(e) => {
                error!("Payout to {} failed: {}", claim, e);
                self.metrics.payout("failed");
                None
            }
        };

        if let Err(e) = self.queue.mark_completed(claim) {
            error!("Could not mark {} completed: {}", claim, e);
        }
        outcome
    }

    /// Transfer with balance reconciliation on error
    async fn pay(&self, network: &NetworkConfig, recipient: &str) -> FaucetResult<PayoutOutcome> {
        let before = self.chain.balance(network, recipient).await;

        let err = match self.chain.transfer(network, recipient).await {
            Ok(receipt) => {
                return Ok(PayoutOutcome::Sent {
                    tx_hash: receipt.tx_hash,
                })
            }
            Err(e) => e,
        };

        let before = match before {
            Ok(coin) => coin.amount_u128()?,
            Err(snapshot_err) => {
                return Err(FaucetError::TransferFailed(format!(
                    "{} (no balance snapshot: {})",
                    err, snapshot_err
                )))
            }
        };
        let after = self
            .chain
            .balance(network, recipient)
            .await
            .and_then(|coin| coin.amount_u128())
            .map_err(|e| FaucetError::TransferFailed(format!("{} (balance recheck failed: {})", err, e)))?;

        if after.checked_sub(before) == Some(network.payout_amount()?) {
            Ok(PayoutOutcome::Reconciled {
                error: err.to_string(),
            })
        } else {
            Err(FaucetError::TransferFailed(err.to_string()))
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::chain::TransferReceipt;
    use crate::config::tests::sample_network;
    use crate::config::Coin;
    use crate::queue::AddressStatus;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// In-memory chain. `fail_after_credit` credits the recipient and then
    /// reports an error, like a broadcast whose confirmation timed out.
    /// `credited_amount` replaces the payout amount actually credited;
    /// `failing_balance_calls` makes that many leading balance queries fail.
    #[derive(Default)]
    pub(crate) struct MockChain {
        pub balances: Mutex<HashMap<String, u128>>,
        pub transfers: Mutex<Vec<String>>,
        pub fail_after_credit: bool,
        pub fail_without_credit: bool,
        pub credited_amount: Option<u128>,
        pub failing_balance_calls: AtomicUsize,
    }

    #[async_trait]
    impl ChainClient for MockChain {
        async fn transfer(&self, network: &NetworkConfig, recipient: &str) -> FaucetResult<TransferReceipt> {
            if self.fail_without_credit {
                return Err(FaucetError::RpcError("insufficient funds".to_string()));
            }
            let amount = match self.credited_amount {
                Some(amount) => amount,
                None => network.payout_amount()?,
            };
            *self.balances.lock().entry(recipient.to_string()).or_default() += amount;
            self.transfers.lock().push(recipient.to_string());
            if self.fail_after_credit {
                return Err(FaucetError::RpcError("receipt timeout".to_string()));
            }
            Ok(TransferReceipt {
                tx_hash: format!("0x{:064x}", self.transfers.lock().len()),
            })
        }

        async fn balance(&self, network: &NetworkConfig, address: &str) -> FaucetResult<Coin> {
            let failing = self
                .failing_balance_calls
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(FaucetError::RpcError("balance query timed out".to_string()));
            }
            let amount = self.balances.lock().get(address).copied().unwrap_or(0);
            Ok(Coin {
                denom: network.payout().denom.clone(),
                amount: amount.to_string(),
            })
        }
    }

    fn worker(chain: MockChain) -> (PayoutWorker, Arc<DispatchQueue>, Arc<MockChain>) {
        let mut network = sample_network("edgenet");
        network.cooldown_secs = 0;
        let config = Arc::new(FaucetConfig {
            blockchains: vec![network],
            ..FaucetConfig::default()
        });
        let queue = Arc::new(DispatchQueue::new());
        let chain = Arc::new(chain);
        let worker = PayoutWorker::new(
            queue.clone(),
            chain.clone(),
            config,
            Arc::new(FaucetMetrics::new().unwrap()),
        );
        (worker, queue, chain)
    }

    fn dispatch(queue: &DispatchQueue, address: &str) -> Claim {
        let claim = Claim::new("edgenet", address);
        queue.enqueue(claim.clone()).unwrap();
        queue.try_dequeue().unwrap();
        claim
    }

    #[tokio::test]
    async fn test_successful_payout_marks_completed() {
        let (worker, queue, chain) = worker(MockChain::default());
        let claim = dispatch(&queue, "allo1abc");

        let outcome = worker.process(&claim).await;
        assert!(matches!(outcome, Some(PayoutOutcome::Sent { .. })));
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(chain.balances.lock()["allo1abc"], 1_000_000_000);
    }

    #[tokio::test]
    async fn test_error_with_exact_credit_is_reconciled() {
        let (worker, queue, _chain) = worker(MockChain {
            fail_after_credit: true,
            ..MockChain::default()
        });
        let claim = dispatch(&queue, "allo1abc");

        let outcome = worker.process(&claim).await;
        assert!(matches!(outcome, Some(PayoutOutcome::Reconciled { .. })));
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(
            worker.metrics.payouts_total.with_label_values(&["reconciled"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_genuine_failure_still_completes_claim() {
        let (worker, queue, _chain) = worker(MockChain {
            fail_without_credit: true,
            ..MockChain::default()
        });
        let claim = dispatch(&queue, "allo1abc");

        assert_eq!(worker.process(&claim).await, None);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(worker.metrics.payouts_total.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_partial_credit_is_not_reconciled() {
        let (worker, queue, chain) = worker(MockChain {
            fail_after_credit: true,
            credited_amount: Some(400_000_000),
            ..MockChain::default()
        });
        let claim = dispatch(&queue, "allo1abc");

        assert_eq!(worker.process(&claim).await, None);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(chain.balances.lock()["allo1abc"], 400_000_000);
        assert_eq!(worker.metrics.payouts_total.with_label_values(&["failed"]).get(), 1);
        assert_eq!(
            worker.metrics.payouts_total.with_label_values(&["reconciled"]).get(),
            0
        );
    }

    #[tokio::test]
    async fn test_extra_credit_is_not_reconciled() {
        let (worker, queue, chain) = worker(MockChain {
            fail_after_credit: true,
            credited_amount: Some(2_000_000_000),
            ..MockChain::default()
        });
        chain.balances.lock().insert("allo1abc".to_string(), 5);
        let claim = dispatch(&queue, "allo1abc");

        assert_eq!(worker.process(&claim).await, None);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(worker.metrics.payouts_total.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_missing_snapshot_makes_error_unreconcilable() {
        let (worker, queue, chain) = worker(MockChain {
            fail_after_credit: true,
            failing_balance_calls: AtomicUsize::new(1),
            ..MockChain::default()
        });
        let network = worker.config.network("edgenet").unwrap().clone();

        // credited exactly, yet without a snapshot the error stands
        let result = worker.pay(&network, "allo1abc").await;
        assert!(matches!(result, Err(FaucetError::TransferFailed(_))));
        assert_eq!(chain.balances.lock()["allo1abc"], 1_000_000_000);

        chain.failing_balance_calls.store(1, Ordering::SeqCst);
        let claim = dispatch(&queue, "allo1def");
        assert_eq!(worker.process(&claim).await, None);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
        assert_eq!(worker.metrics.payouts_total.with_label_values(&["failed"]).get(), 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_in_order() {
        let (worker, queue, chain) = worker(MockChain::default());
        for address in ["allo1a", "allo1b", "allo1c"] {
            queue.enqueue(Claim::new("edgenet", address)).unwrap();
        }

        let handle = tokio::spawn(worker.run());
        for _ in 0..100 {
            if chain.transfers.lock().len() == 3 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.abort();

        assert_eq!(*chain.transfers.lock(), vec!["allo1a", "allo1b", "allo1c"]);
        assert!(queue.is_empty());
        assert_eq!(
            queue.status(&Claim::new("edgenet", "allo1c")),
            Some(AddressStatus::Completed)
        );
    }
}
