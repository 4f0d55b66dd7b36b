//! Deduplicating FIFO of pending claims with per-claim status
//!
//! Status transitions:
//!
//! ```text
//! (none | Cleared) --enqueue--> Pending --mark_completed--> Completed
//! Completed --consume_if_completed--> Cleared
//! ```
//!
//! `Cleared` behaves like "no row": the row is dropped as soon as it is
//! reached and the next enqueue starts over at `Pending`.

use crate::error::{FaucetError, FaucetResult};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use tokio::sync::Notify;
use tracing::debug;

/// One payout request waiting for the worker
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Claim {
    pub network: String,
    pub address: String,
}

impl Claim {
    pub fn new(network: &str, address: &str) -> Self {
        Self {
            network: network.to_string(),
            address: address.to_string(),
        }
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressStatus {
    Pending,
    Completed,
    Cleared,
}

impl AddressStatus {
    fn can_transition_to(current: Option<AddressStatus>, next: AddressStatus) -> bool {
        matches!(
            (current, next),
            (None | Some(AddressStatus::Cleared), AddressStatus::Pending)
                | (Some(AddressStatus::Pending), AddressStatus::Completed)
                | (Some(AddressStatus::Completed), AddressStatus::Cleared)
        )
    }
}

impl fmt::Display for AddressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressStatus::Pending => write!(f, "pending"),
            AddressStatus::Completed => write!(f, "completed"),
            AddressStatus::Cleared => write!(f, "cleared"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    AlreadyQueued,
}

#[derive(Default)]
struct QueueState {
    entries: VecDeque<Claim>,
    status: HashMap<Claim, AddressStatus>,
}

impl QueueState {
    fn transition(&mut self, claim: &Claim, next: AddressStatus) -> FaucetResult<()> {
        let current = self.status.get(claim).copied();
        if !AddressStatus::can_transition_to(current, next) {
            return Err(FaucetError::InvalidStatusTransition {
                claim: claim.to_string(),
                from: current.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string()),
                to: next.to_string(),
            });
        }
        self.status.insert(claim.clone(), next);
        Ok(())
    }
}

/// Queue and status map share one lock so membership and status never
/// disagree.
#[derive(Default)]
pub struct DispatchQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl DispatchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the claim unless it is already pending. A `Completed` claim
    /// must be consumed first.
    pub fn enqueue(&self, claim: Claim) -> FaucetResult<EnqueueOutcome> {
        {
            let mut state = self.state.lock();
            let pending = state.status.get(&claim) == Some(&AddressStatus::Pending);
            if pending || state.entries.contains(&claim) {
                return Ok(EnqueueOutcome::AlreadyQueued);
            }
            state.transition(&claim, AddressStatus::Pending)?;
            debug!("Enqueueing {} (queue length {})", claim, state.entries.len() + 1);
            state.entries.push_back(claim);
        }

        self.notify.notify_one();
        Ok(EnqueueOutcome::Enqueued)
    }

    /// Wait until a claim is available and pop the oldest one
    pub async fn dequeue_next(&self) -> Claim {
        loop {
            // register interest before checking so a concurrent enqueue is not missed
            let notified = self.notify.notified();
            if let Some(claim) = self.try_dequeue() {
                return claim;
            }
            notified.await;
        }
    }

    pub fn try_dequeue(&self) -> Option<Claim> {
        self.state.lock().entries.pop_front()
    }

    /// Resolve a dispatched claim. Claims still waiting in the FIFO are
    /// rejected.
    pub fn mark_completed(&self, claim: &Claim) -> FaucetResult<()> {
        let mut state = self.state.lock();
        if state.entries.contains(claim) {
            return Err(FaucetError::InvalidStatusTransition {
                claim: claim.to_string(),
                from: "queued".to_string(),
                to: AddressStatus::Completed.to_string(),
            });
        }
        state.transition(claim, AddressStatus::Completed)
    }

    /// Clear a completed claim, dropping its status row. Returns true when
    /// that happened.
    pub fn consume_if_completed(&self, claim: &Claim) -> bool {
        let mut state = self.state.lock();
        if state.status.get(claim) != Some(&AddressStatus::Completed) {
            return false;
        }
        state.status.remove(claim);
        true
    }

    pub fn is_queued(&self, claim: &Claim) -> bool {
        let state = self.state.lock();
        state.status.get(claim) == Some(&AddressStatus::Pending) || state.entries.contains(claim)
    }

    pub fn status(&self, claim: &Claim) -> Option<AddressStatus> {
        self.state.lock().status.get(claim).copied()
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_enqueue_is_idempotent() {
        let queue = DispatchQueue::new();
        let claim = Claim::new("edgenet", "allo1abc");

        assert_eq!(queue.enqueue(claim.clone()).unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.enqueue(claim.clone()).unwrap(), EnqueueOutcome::AlreadyQueued);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Pending));
    }

    #[test]
    fn test_fifo_order() {
        let queue = DispatchQueue::new();
        for addr in ["a", "b", "c"] {
            queue.enqueue(Claim::new("edgenet", addr)).unwrap();
        }
        let order: Vec<_> = std::iter::from_fn(|| queue.try_dequeue())
            .map(|c| c.address)
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_claim_stays_pending_while_in_flight() {
        let queue = DispatchQueue::new();
        let claim = Claim::new("edgenet", "allo1abc");

        queue.enqueue(claim.clone()).unwrap();
        assert_eq!(queue.try_dequeue(), Some(claim.clone()));
        // popped but not resolved yet
        assert!(queue.is_queued(&claim));
        assert_eq!(queue.enqueue(claim.clone()).unwrap(), EnqueueOutcome::AlreadyQueued);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_status_cycle() {
        let queue = DispatchQueue::new();
        let claim = Claim::new("edgenet", "allo1abc");

        assert!(!queue.consume_if_completed(&claim));
        queue.enqueue(claim.clone()).unwrap();
        queue.try_dequeue();
        queue.mark_completed(&claim).unwrap();
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));

        assert!(queue.consume_if_completed(&claim));
        assert!(!queue.consume_if_completed(&claim));
        assert_eq!(queue.status(&claim), None);

        assert_eq!(queue.enqueue(claim.clone()).unwrap(), EnqueueOutcome::Enqueued);
        assert_eq!(queue.status(&claim), Some(AddressStatus::Pending));
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let queue = DispatchQueue::new();
        let claim = Claim::new("edgenet", "allo1abc");

        assert!(matches!(
            queue.mark_completed(&claim),
            Err(FaucetError::InvalidStatusTransition { .. })
        ));

        queue.enqueue(claim.clone()).unwrap();
        // still waiting in the FIFO
        assert!(matches!(
            queue.mark_completed(&claim),
            Err(FaucetError::InvalidStatusTransition { .. })
        ));
        assert_eq!(queue.status(&claim), Some(AddressStatus::Pending));

        assert_eq!(queue.try_dequeue(), Some(claim.clone()));
        queue.mark_completed(&claim).unwrap();
        assert!(queue.mark_completed(&claim).is_err());
        // a completed claim has to be consumed before it can be queued again
        assert!(queue.enqueue(claim.clone()).is_err());
        assert_eq!(queue.status(&claim), Some(AddressStatus::Completed));
    }

    #[test]
    fn test_consumed_claims_leave_no_status_row() {
        let queue = DispatchQueue::new();
        for i in 0..50 {
            let claim = Claim::new("edgenet", &format!("allo1user{}", i));
            queue.enqueue(claim.clone()).unwrap();
            queue.try_dequeue();
            queue.mark_completed(&claim).unwrap();
            assert!(queue.consume_if_completed(&claim));
        }
        assert!(queue.state.lock().status.is_empty());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_concurrent_enqueue_produces_one_entry() {
        let queue = Arc::new(DispatchQueue::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || queue.enqueue(Claim::new("edgenet", "allo1abc")).unwrap())
            })
            .collect();

        let outcomes: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let enqueued = outcomes.iter().filter(|o| **o == EnqueueOutcome::Enqueued).count();
        assert_eq!(enqueued, 1);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_waits_for_enqueue() {
        let queue = Arc::new(DispatchQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue_next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished());

        queue.enqueue(Claim::new("edgenet", "allo1abc")).unwrap();
        let claim = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(claim.address, "allo1abc");
    }
}
