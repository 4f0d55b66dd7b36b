//! Persistent 24h request limiter
//!
//! Every key maps to the list of request timestamps (unix millis) that fall
//! inside the rolling window. Records live in a sled tree so quotas survive a
//! restart. Writes go through `update_and_fetch`, which retries on concurrent
//! modification, so two concurrent `record` calls never lose a timestamp.

use crate::error::{FaucetError, FaucetResult};
use chrono::Utc;
use sled::{Db, Tree};
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Rolling window applied to both key classes
pub const LIMITER_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

const LIMITER_TREE: &str = "limiter";

/// A limiter key. Address and origin keys never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClaimKey {
    /// Claimant address on a network
    Address { network: String, address: String },
    /// Network name combined with the caller's network address
    Origin { network: String, origin: String },
}

impl ClaimKey {
    pub fn address(network: &str, address: &str) -> Self {
        ClaimKey::Address {
            network: network.to_string(),
            address: address.to_string(),
        }
    }

    pub fn origin(network: &str, origin: &str) -> Self {
        ClaimKey::Origin {
            network: network.to_string(),
            origin: origin.to_string(),
        }
    }

    fn storage_key(&self) -> Vec<u8> {
        match self {
            ClaimKey::Address { network, address } => format!("addr:{}:{}", network, address),
            ClaimKey::Origin { network, origin } => format!("origin:{}{}", network, origin),
        }
        .into_bytes()
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClaimKey::Address { network, address } => write!(f, "{}/{}", network, address),
            ClaimKey::Origin { network, origin } => write!(f, "{}{}", network, origin),
        }
    }
}

/// Windowed limiter over a sled tree
#[derive(Clone)]
pub struct WindowedLimiter {
    tree: Tree,
    window_millis: i64,
}

impl WindowedLimiter {
    /// Create or open the limiter database at `path`
    pub fn open(path: &str) -> FaucetResult<Self> {
        info!("Opening limiter database at: {}", path);

        let db = sled::Config::default()
            .path(path)
            .cache_capacity(64 * 1024 * 1024)
            .open()?;
        Self::new(&db, LIMITER_WINDOW)
    }

    /// Use the limiter tree of an already opened database
    pub fn new(db: &Db, window: Duration) -> FaucetResult<Self> {
        let tree = db.open_tree(LIMITER_TREE)?;
        Ok(Self {
            tree,
            window_millis: window.as_millis() as i64,
        })
    }

    /// Whether `key` may be admitted once more under `quota`.
    ///
    /// Read-only. A store failure is returned as `LimiterStoreUnavailable`,
    /// which callers must treat as a rejection.
    pub fn check(&self, key: &ClaimKey, quota: u32) -> FaucetResult<bool> {
        self.check_at(key, quota, now_millis())
    }

    /// Append the current time to `key`, dropping expired entries
    pub fn record(&self, key: &ClaimKey) -> FaucetResult<()> {
        self.record_at(key, now_millis())
    }

    /// Unused quota for `key`
    pub fn remaining(&self, key: &ClaimKey, quota: u32) -> FaucetResult<u32> {
        let used = self.count_at(key, now_millis())?;
        Ok(quota.saturating_sub(used as u32))
    }

    /// Remove keys whose every timestamp has left the window
    pub fn prune_expired(&self) -> FaucetResult<usize> {
        let cutoff = now_millis() - self.window_millis;
        let mut removed = 0;

        for item in self.tree.iter() {
            let (key, value) = item?;
            let timestamps = match decode(&value) {
                Ok(timestamps) => timestamps,
                Err(e) => {
                    warn!("Keeping unreadable limiter key {}: {}", String::from_utf8_lossy(&key), e);
                    continue;
                }
            };
            if timestamps.iter().all(|&ts| ts <= cutoff) {
                // a concurrent record wins; the key is simply kept
                if self
                    .tree
                    .compare_and_swap(&key, Some(&value), None as Option<&[u8]>)?
                    .is_ok()
                {
                    removed += 1;
                }
            }
        }

        debug!("Pruned {} expired limiter keys", removed);
        Ok(removed)
    }

    pub async fn flush(&self) -> FaucetResult<()> {
        self.tree.flush_async().await?;
        Ok(())
    }

    fn check_at(&self, key: &ClaimKey, quota: u32, now: i64) -> FaucetResult<bool> {
        let used = self.count_at(key, now)?;
        let allowed = used < quota as usize;
        if !allowed {
            debug!("Quota exhausted for {}: {}/{}", key, used, quota);
        }
        Ok(allowed)
    }

    fn count_at(&self, key: &ClaimKey, now: i64) -> FaucetResult<usize> {
        let cutoff = now - self.window_millis;
        let value = self.tree.get(key.storage_key()).map_err(|e| {
            error!("Limiter store read failed for {}: {}", key, e);
            FaucetError::LimiterStoreUnavailable(e.to_string())
        })?;

        let Some(bytes) = value else {
            return Ok(0);
        };
        let timestamps = decode(&bytes).map_err(|e| {
            error!("Limiter record for {} is unreadable: {}", key, e);
            e
        })?;
        Ok(timestamps.into_iter().filter(|&ts| ts > cutoff).count())
    }

    fn record_at(&self, key: &ClaimKey, now: i64) -> FaucetResult<()> {
        let cutoff = now - self.window_millis;
        let mut failure: Option<FaucetError> = None;

        self.tree
            .update_and_fetch(key.storage_key(), |old| {
                failure = None;
                let previous = match old.map(decode).transpose() {
                    Ok(previous) => previous.unwrap_or_default(),
                    Err(e) => {
                        // leave the unreadable record in place
                        failure = Some(e);
                        return old.map(<[u8]>::to_vec);
                    }
                };
                let mut timestamps: Vec<i64> =
                    previous.into_iter().filter(|&ts| ts > cutoff).collect();
                timestamps.push(now);
                match bincode::serialize(&timestamps) {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        failure = Some(FaucetError::LimiterStoreUnavailable(e.to_string()));
                        old.map(<[u8]>::to_vec)
                    }
                }
            })
            .map_err(|e| {
                error!("Limiter store write failed for {}: {}", key, e);
                FaucetError::LimiterStoreUnavailable(e.to_string())
            })?;

        if let Some(e) = failure {
            error!("Limiter record for {} was not updated: {}", key, e);
            return Err(e);
        }

        debug!("Recorded request for {}", key);
        Ok(())
    }
}

/// Unreadable records are a store failure, never an empty history
fn decode(bytes: &[u8]) -> FaucetResult<Vec<i64>> {
    bincode::deserialize::<Vec<i64>>(bytes)
        .map_err(|e| FaucetError::LimiterStoreUnavailable(format!("corrupt record: {}", e)))
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const HOUR: i64 = 60 * 60 * 1000;

    fn limiter(dir: &TempDir) -> WindowedLimiter {
        let db = sled::open(dir.path()).unwrap();
        WindowedLimiter::new(&db, LIMITER_WINDOW).unwrap()
    }

    #[test]
    fn test_quota_is_enforced() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let key = ClaimKey::address("edgenet", "allo1abc");

        for _ in 0..2 {
            assert!(limiter.check(&key, 2).unwrap());
            limiter.record(&key).unwrap();
        }
        assert!(!limiter.check(&key, 2).unwrap());
        assert_eq!(limiter.remaining(&key, 2).unwrap(), 0);
    }

    #[test]
    fn test_check_does_not_consume_quota() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let key = ClaimKey::address("edgenet", "allo1abc");

        for _ in 0..10 {
            assert!(limiter.check(&key, 1).unwrap());
        }
        assert_eq!(limiter.remaining(&key, 1).unwrap(), 1);
    }

    #[test]
    fn test_key_classes_are_independent() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let address = ClaimKey::address("edgenet", "1.2.3.4");
        let origin = ClaimKey::origin("edgenet", "1.2.3.4");

        limiter.record(&address).unwrap();
        assert!(!limiter.check(&address, 1).unwrap());
        assert!(limiter.check(&origin, 1).unwrap());
    }

    #[test]
    fn test_old_entries_expire() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let key = ClaimKey::origin("edgenet", "9.9.9.9");
        let start = now_millis() - 25 * HOUR;

        limiter.record_at(&key, start).unwrap();
        limiter.record_at(&key, start + HOUR).unwrap();
        assert!(!limiter.check_at(&key, 2, start + 2 * HOUR).unwrap());

        // first entry has left the window
        assert!(limiter.check_at(&key, 2, start + 24 * HOUR + 1).unwrap());

        // a new record prunes what expired
        limiter.record_at(&key, now_millis()).unwrap();
        let stored = decode(&limiter.tree.get(key.storage_key()).unwrap().unwrap()).unwrap();
        assert_eq!(stored.len(), 1);
    }

    #[test]
    fn test_prune_expired_removes_stale_keys() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let stale = ClaimKey::address("edgenet", "allo1old");
        let fresh = ClaimKey::address("edgenet", "allo1new");

        limiter.record_at(&stale, now_millis() - 48 * HOUR).unwrap();
        limiter.record(&fresh).unwrap();

        assert_eq!(limiter.prune_expired().unwrap(), 1);
        assert!(limiter.tree.get(stale.storage_key()).unwrap().is_none());
        assert!(!limiter.check(&fresh, 1).unwrap());
    }

    #[test]
    fn test_corrupt_record_fails_closed() {
        let temp_dir = TempDir::new().unwrap();
        let limiter = limiter(&temp_dir);
        let key = ClaimKey::address("edgenet", "allo1abc");

        limiter.record(&key).unwrap();
        assert!(!limiter.check(&key, 1).unwrap());
        limiter.tree.insert(key.storage_key(), &b"garbage"[..]).unwrap();

        assert!(matches!(
            limiter.check(&key, 1),
            Err(FaucetError::LimiterStoreUnavailable(_))
        ));
        assert!(matches!(
            limiter.remaining(&key, 1),
            Err(FaucetError::LimiterStoreUnavailable(_))
        ));
        assert!(matches!(
            limiter.record(&key),
            Err(FaucetError::LimiterStoreUnavailable(_))
        ));

        // the unreadable record is neither reset nor pruned
        assert_eq!(limiter.prune_expired().unwrap(), 0);
        let stored = limiter.tree.get(key.storage_key()).unwrap().unwrap();
        assert_eq!(&stored[..], b"garbage");
    }

    #[test]
    fn test_records_survive_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let key = ClaimKey::address("edgenet", "allo1abc");
        {
            let db = sled::open(temp_dir.path()).unwrap();
            let limiter = WindowedLimiter::new(&db, LIMITER_WINDOW).unwrap();
            limiter.record(&key).unwrap();
            db.flush().unwrap();
        }

        let limiter = limiter(&temp_dir);
        assert!(!limiter.check(&key, 1).unwrap());
    }
}
