// SPDX-License-Identifier: AGPL-3.0-only

//! Tunables for the polling loops.
//!
//! Defaults suit the stock shell build. Each
//! struct can be overridden from the environment so a slow shell build can be
//! probed without recompiling:
//!
//! | Variable | Field |
//! |----------|-------|
//! | `WD_SIDEBAND_ATTEMPTS` | [`ChannelConfig::max_attempts`] |
//! | `WD_SIDEBAND_INTERVAL_US` | [`ChannelConfig::poll_interval`] |
//! | `WD_DMA_POLL_US` | [`PollConfig::interval`] |
//! | `WD_DMA_TIMEOUT_MS` | [`PollConfig::timeout`] |

use std::time::Duration;

/// Sideband echo polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Status reads before giving up on the echo.
    pub max_attempts: u32,
    /// Sleep between status reads.
    pub poll_interval: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        // 200 × 10 µs ≈ 2 ms worst case per byte
        Self {
            max_attempts: 200,
            poll_interval: Duration::from_micros(10),
        }
    }
}

impl ChannelConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(n) = env_parse::<u32>("WD_SIDEBAND_ATTEMPTS") {
            cfg.max_attempts = n.max(1);
        }
        if let Some(us) = env_parse::<u64>("WD_SIDEBAND_INTERVAL_US") {
            cfg.poll_interval = Duration::from_micros(us);
        }
        cfg
    }

    /// Set the attempt budget.
    #[must_use]
    pub const fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Upper bound on how long one byte read can block.
    #[must_use]
    pub fn worst_case(&self) -> Duration {
        self.poll_interval * self.max_attempts
    }
}

/// DMA completion polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollConfig {
    /// Sleep between invalidate-and-inspect passes.
    pub interval: Duration,
    /// Default deadline for [`crate::CompletionDetector::poll`].
    pub timeout: Duration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_micros(50),
            timeout: Duration::from_millis(5),
        }
    }
}

impl PollConfig {
    /// Defaults with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(us) = env_parse::<u64>("WD_DMA_POLL_US") {
            cfg.interval = Duration::from_micros(us);
        }
        if let Some(ms) = env_parse::<u64>("WD_DMA_TIMEOUT_MS") {
            cfg.timeout = Duration::from_millis(ms);
        }
        cfg
    }

    /// Set the poll interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the default deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring {key}={raw:?}: not a number");
            None
        }
    }
}
