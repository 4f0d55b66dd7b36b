//! Sliding-window origin blocklist
//!
//! Origins are grouped by prefix (first two IPv4 octets, first two IPv6
//! groups). A prefix that sends more than [`MAX_REQUESTS`] admitted claims
//! within [`TIME_WINDOW`] is blocked for the rest of the process lifetime.

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub const TIME_WINDOW: Duration = Duration::from_secs(60);
pub const MAX_REQUESTS: usize = 3;

#[derive(Default)]
struct BlocklistState {
    counters: HashMap<String, VecDeque<Instant>>,
    blocked: HashSet<String>,
}

pub struct OriginBlocklist {
    state: Mutex<BlocklistState>,
    window: Duration,
    max_requests: usize,
}

impl Default for OriginBlocklist {
    fn default() -> Self {
        Self::new()
    }
}

impl OriginBlocklist {
    pub fn new() -> Self {
        Self::with_limits(TIME_WINDOW, MAX_REQUESTS)
    }

    pub fn with_limits(window: Duration, max_requests: usize) -> Self {
        Self {
            state: Mutex::new(BlocklistState::default()),
            window,
            max_requests,
        }
    }

    pub fn is_blocked(&self, origin: &str) -> bool {
        self.state.lock().blocked.contains(&origin_prefix(origin))
    }

    /// Count one request for the origin's prefix and escalate if needed.
    /// Returns whether the prefix is blocked after this request.
    pub fn record_and_maybe_block(&self, origin: &str) -> bool {
        self.record_at(origin, Instant::now())
    }

    /// Number of permanently blocked prefixes
    pub fn blocked_count(&self) -> usize {
        self.state.lock().blocked.len()
    }

    fn record_at(&self, origin: &str, now: Instant) -> bool {
        let prefix = origin_prefix(origin);
        let mut state = self.state.lock();

        if state.blocked.contains(&prefix) {
            debug!("Origin prefix {} already blocked", prefix);
            return true;
        }

        // drop prefixes whose window has emptied
        let window = self.window;
        state.counters.retain(|_, timestamps| {
            timestamps
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) <= window)
        });

        let timestamps = state.counters.entry(prefix.clone()).or_default();
        timestamps.push_back(now);
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) > self.window {
                timestamps.pop_front();
            } else {
                break;
            }
        }

        if timestamps.len() > self.max_requests {
            state.counters.remove(&prefix);
            state.blocked.insert(prefix.clone());
            warn!("Origin prefix {} added to blocklist (origin {})", prefix, origin);
            return true;
        }

        false
    }
}

/// Coarse origin grouping used for escalation
pub fn origin_prefix(origin: &str) -> String {
    match origin.trim().parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            let octets = ip.octets();
            format!("{}.{}", octets[0], octets[1])
        }
        Ok(IpAddr::V6(ip)) => match ip.to_ipv4_mapped() {
            Some(v4) => {
                let octets = v4.octets();
                format!("{}.{}", octets[0], octets[1])
            }
            None => {
                let segments = ip.segments();
                format!("{:x}:{:x}", segments[0], segments[1])
            }
        },
        // not an address; keep the first two separator-delimited parts
        Err(_) => origin
            .trim()
            .split(['.', ':'])
            .take(2)
            .collect::<Vec<_>>()
            .join("."),
    }
}
