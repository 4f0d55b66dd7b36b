//! Testnet token faucet
//!
//! Claims arrive over HTTP and pass an admission pipeline before they are
//! paid out:
//! - CAPTCHA verification
//! - persistent 24h quotas per address and per origin
//! - a short-window blocklist for bursts from one address prefix
//! - a deduplicating queue drained by a single payout worker

pub mod admission;
pub mod api;
pub mod blocklist;
pub mod captcha;
pub mod chain;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod service;
pub mod wallet;
pub mod worker;

pub use admission::{Admission, AdmissionController, ClaimRequest};
pub use config::{FaucetConfig, NetworkConfig};
pub use error::{FaucetError, FaucetResult};
pub use service::{Collaborators, FaucetService};
