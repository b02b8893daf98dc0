use crate::backoff::ExponentialBackoff;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 15;

/// Settings shared by every price source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PollingConfig {
    pub coinmarketcap_key: Option<String>,
    pub oneforge_key: Option<String>,
    pub request_timeout_secs: u64,
    pub backoff: ExponentialBackoff,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            coinmarketcap_key: None,
            oneforge_key: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            backoff: ExponentialBackoff::default(),
        }
    }
}

impl PollingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Blank keys count as missing.
pub(crate) fn api_key(key: &Option<String>) -> Option<String> {
    key.as_deref().map(str::trim).filter(|key| !key.is_empty()).map(str::to_string)
}
