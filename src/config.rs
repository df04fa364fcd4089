//! Core configuration.
//!
//! One explicit `CoreConfig` constructed by the host shell at startup and
//! injected into `PosCore`; the crate has no ambient configuration state.

use std::time::Duration;

use crate::api::normalize_base_url;

/// Default timeout for backend write/read requests.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used for the lightweight connectivity probe.
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval for the background connectivity/sync loop.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(30);

/// Configuration for one device's offline core.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Normalised base URL of the POS backend (no trailing slash or `/api`).
    pub api_base_url: String,
    /// API key sent as `X-POS-API-Key` on every request.
    pub api_key: String,
    /// Branch this device serves; shift sessions are scoped to it.
    pub branch_id: String,
    /// Stable identifier for this device, sent as `x-device-id`.
    pub device_id: String,
    pub request_timeout: Duration,
    pub health_timeout: Duration,
    pub sync_interval: Duration,
}

impl CoreConfig {
    pub fn new(
        api_base_url: impl AsRef<str>,
        api_key: impl Into<String>,
        branch_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            api_base_url: normalize_base_url(api_base_url.as_ref()),
            api_key: api_key.into(),
            branch_id: branch_id.into(),
            device_id: device_id.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
        }
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_normalizes_base_url() {
        let config = CoreConfig::new("pos.bestea.id/api/", "key", "branch-1", "dev-1");
        assert_eq!(config.api_base_url, "https://pos.bestea.id");
        assert_eq!(config.request_timeout, DEFAULT_REQUEST_TIMEOUT);
    }

    #[test]
    fn test_builder_overrides() {
        let config = CoreConfig::new("localhost:3000", "key", "branch-1", "dev-1")
            .with_sync_interval(Duration::from_secs(5))
            .with_request_timeout(Duration::from_secs(15));
        assert_eq!(config.api_base_url, "http://localhost:3000");
        assert_eq!(config.sync_interval, Duration::from_secs(5));
        assert_eq!(config.request_timeout, Duration::from_secs(15));
    }
}
