//! Sandbox configuration.
//!
//! [`SandboxConfig`] controls the resource limits applied to every plugin
//! instance and the time budgets of the request path.  Sensible defaults are
//! provided via the [`Default`] implementation, and a builder-style API allows
//! callers to customise individual fields fluently.  The struct is
//! deserializable so hosts can keep it in their own config files.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Resource limits and time budgets for plugin instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Maximum linear memory a single instance may allocate, in bytes.
    ///
    /// Default: **16 MiB** (16 * 1024 * 1024).
    pub max_memory: usize,

    /// Fuel (abstract instruction count) granted to each callback.
    ///
    /// Fuel is refilled before every callback into the sandbox, so a
    /// long-lived shared instance is bounded per call rather than over its
    /// whole lifetime.
    ///
    /// Default: **10 000 000**.
    pub max_fuel: u64,

    /// Wall-clock budget for one inbound request, in milliseconds.
    ///
    /// Default: **30 000 ms**.
    pub request_timeout_ms: u64,

    /// Timeout applied to outbound HTTP calls whose guest-supplied timeout
    /// is zero, in milliseconds.
    ///
    /// Default: **5 000 ms**.
    pub http_call_timeout_ms: u64,

    /// Idle time after which an unreferenced shared instance may be evicted.
    ///
    /// Default: **None** (shared instances stay resident).
    pub idle_eviction_ms: Option<u64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_memory: 16 * 1024 * 1024,
            max_fuel: 10_000_000,
            request_timeout_ms: 30_000,
            http_call_timeout_ms: 5_000,
            idle_eviction_ms: None,
        }
    }
}

impl SandboxConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum memory limit (in bytes).
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    /// Set the per-callback fuel budget.
    pub fn with_max_fuel(mut self, fuel: u64) -> Self {
        self.max_fuel = fuel;
        self
    }

    /// Set the per-request time budget (in milliseconds).
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the default outbound call timeout (in milliseconds).
    pub fn with_http_call_timeout_ms(mut self, ms: u64) -> Self {
        self.http_call_timeout_ms = ms;
        self
    }

    /// Enable idle eviction of unreferenced shared instances.
    pub fn with_idle_eviction_ms(mut self, ms: u64) -> Self {
        self.idle_eviction_ms = Some(ms);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn http_call_timeout(&self) -> Duration {
        Duration::from_millis(self.http_call_timeout_ms)
    }

    pub fn idle_eviction(&self) -> Option<Duration> {
        self.idle_eviction_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_values() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.max_memory, 16 * 1024 * 1024);
        assert_eq!(cfg.max_fuel, 10_000_000);
        assert_eq!(cfg.request_timeout_ms, 30_000);
        assert_eq!(cfg.http_call_timeout_ms, 5_000);
        assert!(cfg.idle_eviction_ms.is_none());
    }

    #[test]
    fn new_equals_default() {
        assert_eq!(SandboxConfig::new(), SandboxConfig::default());
    }

    #[test]
    fn builder_chaining() {
        let cfg = SandboxConfig::new()
            .with_max_memory(32 * 1024 * 1024)
            .with_max_fuel(500_000)
            .with_request_timeout_ms(1000)
            .with_http_call_timeout_ms(250)
            .with_idle_eviction_ms(60_000);
        assert_eq!(cfg.max_memory, 32 * 1024 * 1024);
        assert_eq!(cfg.max_fuel, 500_000);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(1000));
        assert_eq!(cfg.http_call_timeout(), Duration::from_millis(250));
        assert_eq!(cfg.idle_eviction(), Some(Duration::from_secs(60)));
    }

    #[test]
    fn partial_toml_falls_back_to_defaults() {
        let cfg: SandboxConfig = toml::from_str(
            r#"
            max_fuel = 42
            idle_eviction_ms = 1500
            "#,
        )
        .expect("valid toml");
        assert_eq!(cfg.max_fuel, 42);
        assert_eq!(cfg.idle_eviction_ms, Some(1500));
        assert_eq!(cfg.max_memory, SandboxConfig::default().max_memory);
        assert_eq!(cfg.request_timeout_ms, 30_000);
    }

    #[test]
    fn json_round_trip_keeps_values() {
        let cfg = SandboxConfig::new().with_max_fuel(7);
        let json = serde_json::to_string(&cfg).unwrap();
        let back: SandboxConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
