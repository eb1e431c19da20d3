// Engine configuration
// Every field has a default so the config can be embedded in a host application's settings file

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    // ISO-4217 code stamped on every payment record
    pub currency: String,
    pub max_special_request_len: usize,
    // Absolute cap, applied on top of the room type's max occupancy
    pub max_guests: u32,
    pub relay: RelayConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            currency: "USD".to_string(),
            max_special_request_len: 500,
            max_guests: 10,
            relay: RelayConfig::default(),
        }
    }
}

// Outbox relay configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub batch_size: usize,
    pub poll_interval_ms: u64,
    // How long a claimed entry stays invisible to other relays
    pub lease_ms: u64,
    pub retry: RetryConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            batch_size: 16,
            poll_interval_ms: 500,
            lease_ms: 30000,
            retry: RetryConfig::default(),
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }
}

// Retry configuration for outbox deliveries
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryConfig {
    // Exponential backoff with jitter, capped at max_backoff_ms before jitter is applied
    pub fn calculate_backoff(&self, retry_attempt: u32) -> Duration {
        let base_backoff_ms = (self.initial_backoff_ms as f64
            * self.backoff_multiplier.powf(retry_attempt as f64))
        .min(self.max_backoff_ms as f64);

        // Spread retries of entries that failed together
        let jitter = rand::random::<f64>() * self.jitter_factor * base_backoff_ms;
        let backoff_ms = base_backoff_ms * (1.0 - self.jitter_factor / 2.0) + jitter;

        Duration::from_millis(backoff_ms as u64)
    }
}
