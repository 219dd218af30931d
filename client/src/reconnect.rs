//! Reconnection policy with jittered backoff.

use rand::Rng;
use std::time::Duration;

/// When and how often a dropped client re-dials.
///
/// The effective wait before each attempt is `interval` perturbed by a
/// uniform offset from `-interval/2` to `+2s`, so a fleet of clients
/// losing the same server does not reconnect in lockstep.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub interval: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(5),
            max_attempts: 20,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// The base interval plus this attempt's random jitter.
    pub fn jittered_delay(&self) -> Duration {
        let base = self.interval.as_millis().min(i64::MAX as u128) as i64;
        let jitter = rand::rng().random_range(-(base / 2)..=2000);
        Duration::from_millis((base + jitter).max(0) as u64)
    }
}
