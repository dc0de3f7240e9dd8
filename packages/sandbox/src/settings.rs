// ABOUTME: Process-level sandbox settings with pool lifecycle knobs
// ABOUTME: Deserialized from the host's configuration layer, defaults for everything

use crate::config::{Runtime, PROVIDER_LOCAL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Lifecycle knobs consumed by the sandbox pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSettings {
    /// Maximum age of a pooled sandbox before it is retired.
    pub ttl_secs: u64,
    /// Maximum number of invocations served by one pooled sandbox.
    pub max_use_count: u32,
    /// A sandbox whose remaining timeout budget drops below this margin is
    /// retired rather than handed out for another invocation.
    pub safety_margin_ms: u64,
    /// Interval of the background expiry sweep.
    pub sweep_interval_secs: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_use_count: 50,
            safety_margin_ms: 10_000,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolSettings {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn safety_margin(&self) -> Duration {
        Duration::from_millis(self.safety_margin_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Process-wide sandbox execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxSettings {
    pub default_provider: String,
    pub default_runtime: Runtime,
    #[serde(default)]
    pub pool: PoolSettings,

    /// Base directory for local sandbox scratch roots. Defaults to the
    /// system temp directory when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,

    // Remote micro-VM provider credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_api_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_api_key: Option<String>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            default_provider: PROVIDER_LOCAL.to_string(),
            default_runtime: Runtime::Node,
            pool: PoolSettings::default(),
            local_root: None,
            remote_api_endpoint: None,
            remote_api_key: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_settings_defaults() {
        let pool = PoolSettings::default();
        assert_eq!(pool.ttl(), Duration::from_secs(300));
        assert_eq!(pool.safety_margin(), Duration::from_millis(10_000));
    }

    #[test]
    fn test_settings_deserialize_with_defaults() {
        let settings: SandboxSettings = serde_json::from_str(
            r#"{"default_provider": "remote", "default_runtime": "python"}"#,
        )
        .unwrap();
        assert_eq!(settings.default_provider, "remote");
        assert_eq!(settings.pool.max_use_count, 50);
        assert!(settings.remote_api_key.is_none());
    }
}
