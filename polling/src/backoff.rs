//! Retry with exponential backoff for the price sources.

use crate::error::{PollingError, PollingResult};
use prosper_core::{log::Logger, warn};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt::Display, future::Future, time::Duration};

pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_MULTIPLIER: f64 = 1.5;
pub const DEFAULT_MAX_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ExponentialBackoff {
    #[serde(rename = "initial-interval-ms", with = "millis")]
    pub initial_interval: Duration,
    pub multiplier: f64,
    #[serde(rename = "max-interval-ms", with = "millis")]
    pub max_interval: Duration,
    /// Total tries including the first one.
    pub max_attempts: u32,
    /// Each delay is drawn from `interval * (1 ± randomization_factor)`.
    pub randomization_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            multiplier: DEFAULT_MULTIPLIER,
            max_interval: DEFAULT_MAX_INTERVAL,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
        }
    }
}

impl ExponentialBackoff {
    /// Interval before retry number `retry` (zero based), before randomization.
    pub fn interval(&self, retry: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(retry.min(i32::MAX as u32) as i32);
        let interval = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(interval.min(self.max_interval.as_secs_f64()))
    }

    /// `interval(retry)` spread by the randomization factor. `random` is in `[0, 1)`.
    pub fn delay(&self, retry: u32, random: f64) -> Duration {
        let factor = self.randomization_factor.clamp(0.0, 1.0);
        let spread = 1.0 + (random * 2.0 - 1.0) * factor;
        Duration::from_secs_f64((self.interval(retry).as_secs_f64() * spread).max(0.0))
    }

    /// Runs `operation` until it succeeds or `max_attempts` tries failed.
    pub async fn retry<T, E, F, Fut>(&self, data_source: &'static str, logger: &Logger, mut operation: F) -> PollingResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match operation().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if attempt >= max_attempts {
                return Err(PollingError::Fetch { data_source, attempts: attempt, message: err.to_string() });
            }
            let delay = self.delay(attempt - 1, rand::random::<f64>());
            warn!(logger, "{} attempt {} failed, retrying in {:?}: {}", data_source, attempt, delay, err);
            tokio::time::sleep(delay).await;
        }
    }
}

mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
