//! Runtime and gateway configuration.
//!
//! Supplied by the host, not computed here. Every field has a serde
//! default mirroring the runtime's documented constants, so a partial TOML
//! or JSON document is enough.

use std::time::Duration;

use serde::Deserialize;

/// Top-level runtime configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RuntimeConfig {
    /// Concurrent-app ceiling enforced by `load`.
    pub max_apps: usize,
    /// Initialization handshake timeout.
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,
    /// Fixed per-call correlation timeout (not configurable per app).
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Interval of the synthetic usage-sampling sweep.
    #[serde(with = "duration_secs")]
    pub usage_sample_interval: Duration,
    /// Paused instances inactive longer than this are reaped.
    #[serde(with = "duration_secs")]
    pub inactivity_timeout: Duration,
    pub gateway: GatewayConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_apps: 50,
            handshake_timeout: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
            usage_sample_interval: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30 * 60),
            gateway: GatewayConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse from a TOML document. Missing fields take defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

/// Outbound call gateway configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct GatewayConfig {
    /// Endpoint root relative endpoints are joined onto.
    pub base_url: String,
    /// Per-attempt execution timeout.
    #[serde(with = "duration_secs")]
    pub call_timeout: Duration,
    /// Total attempts per call (the final attempt surfaces the error
    /// instead of retrying).
    pub max_retries: u32,
    /// Rate-limit window duration.
    #[serde(with = "duration_secs")]
    pub rate_limit_window: Duration,
    /// Requests allowed per window per app.
    pub max_requests_per_window: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            call_timeout: Duration::from_secs(30),
            max_retries: 3,
            rate_limit_window: Duration::from_secs(60),
            max_requests_per_window: 100,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = RuntimeConfig::default();
        assert_eq!(config.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.call_timeout, Duration::from_secs(30));
        assert_eq!(config.gateway.max_requests_per_window, 100);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config = RuntimeConfig::from_toml_str(
            "max_apps = 3\n\n[gateway]\nmax_requests_per_window = 5\nrate_limit_window = 10\n",
        )
        .expect("config should parse");
        assert_eq!(config.max_apps, 3);
        assert_eq!(config.gateway.max_requests_per_window, 5);
        assert_eq!(config.gateway.rate_limit_window, Duration::from_secs(10));
        // untouched fields keep defaults
        assert_eq!(config.inactivity_timeout, Duration::from_secs(1800));
        assert_eq!(config.gateway.max_retries, 3);
    }
}
