//! Node configuration.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use arbor_tree::{is_fanout_valid, DEFAULT_FANOUT, MAX_FANOUT, MIN_FANOUT};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Multicast group used for bootstrap discovery.
pub const MULTICAST_GROUP: SocketAddrV4 = SocketAddrV4::new(Ipv4Addr::new(224, 1, 1, 1), 11999);

/// Default listening port of a peer.
pub const DEFAULT_PORT: u16 = 2000;

/// Hard ceiling on Find-End forwarding.
pub const MAX_HOPS: u16 = 64;

const DEFAULT_TIMEOUT_MS: u64 = 2500;

/// Response timeouts, one per awaited message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub bootstrap_response: Duration,
    pub join_accept_response: Duration,
    pub join_accept_ack_response: Duration,
    pub replacement_offer_response: Duration,
    pub replacement_ack_response: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self::uniform(Duration::from_millis(DEFAULT_TIMEOUT_MS))
    }
}

impl TimeoutConfig {
    /// Every timeout set to `timeout`.
    #[must_use]
    pub fn uniform(timeout: Duration) -> Self {
        Self {
            bootstrap_response: timeout,
            join_accept_response: timeout,
            join_accept_ack_response: timeout,
            replacement_offer_response: timeout,
            replacement_ack_response: timeout,
        }
    }

    fn all(&self) -> [Duration; 5] {
        [
            self.bootstrap_response,
            self.join_accept_response,
            self.join_accept_ack_response,
            self.replacement_offer_response,
            self.replacement_ack_response,
        ]
    }
}

/// Configuration for a single overlay peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Maximum number of children per node.
    pub fanout: u32,

    /// Fill the first free child slot (`true`) or the free slot closest to
    /// the root by horizontal value (`false`).
    pub complete_balancing: bool,

    pub timeouts: TimeoutConfig,

    /// Bootstrap rounds without any response before becoming a root.
    pub bootstrap_retries: u32,

    /// Seed of the event-id generator.
    pub seed: u64,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            fanout: DEFAULT_FANOUT,
            complete_balancing: true,
            timeouts: TimeoutConfig::default(),
            bootstrap_retries: 3,
            seed: 0,
        }
    }
}

impl OverlayConfig {
    #[must_use]
    pub fn with_fanout(mut self, fanout: u32) -> Self {
        self.fanout = fanout;
        self
    }

    #[must_use]
    pub fn with_complete_balancing(mut self, enabled: bool) -> Self {
        self.complete_balancing = enabled;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    #[must_use]
    pub fn with_bootstrap_retries(mut self, retries: u32) -> Self {
        self.bootstrap_retries = retries;
        self
    }

    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Defaults overridden by `ARBOR_FANOUT`, `ARBOR_TIMEOUT_MS` and `ARBOR_SEED`.
    ///
    /// Missing or unparsable variables keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(fanout) = lookup("ARBOR_FANOUT").and_then(|v| v.parse().ok()) {
            config.fanout = fanout;
        }
        if let Some(ms) = lookup("ARBOR_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
            config.timeouts = TimeoutConfig::uniform(Duration::from_millis(ms));
        }
        if let Some(seed) = lookup("ARBOR_SEED").and_then(|v| v.parse().ok()) {
            config.seed = seed;
        }
        config
    }

    pub fn validate(&self) -> Result<()> {
        if !is_fanout_valid(self.fanout) {
            return Err(Error::Config(format!(
                "fanout {} outside {}..={}",
                self.fanout, MIN_FANOUT, MAX_FANOUT
            )));
        }
        if self.timeouts.all().iter().any(Duration::is_zero) {
            return Err(Error::Config("timeouts must be non-zero".into()));
        }
        Ok(())
    }
}
