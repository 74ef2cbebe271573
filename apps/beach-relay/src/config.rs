use std::time::Duration;

use serde::Deserialize;

use crate::reliable::ReliableConfig;

/// Process configuration, read from the environment (`__` separates nested
/// keys). Every field has a default so an empty environment runs in memory.
#[derive(Debug, Clone, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub database_url: Option<String>,
    #[serde(default = "default_db_max_connections")]
    pub database_max_connections: u32,
    #[serde(default)]
    pub log_path: Option<String>,
    #[serde(default = "default_listen_addr")]
    pub relay_listen_addr: String,
    #[serde(default = "default_retransmit_base_ms")]
    pub relay_retransmit_base_ms: u64,
    #[serde(default = "default_max_retransmit_attempts")]
    pub relay_max_retransmit_attempts: u32,
    #[serde(default = "default_max_retransmit_timeout_ms")]
    pub relay_max_retransmit_timeout_ms: u64,
    #[serde(default = "default_buffer_ttl_ms")]
    pub relay_buffer_ttl_ms: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub relay_tick_interval_ms: u64,
    #[serde(default = "default_cleanup_interval_ms")]
    pub relay_cleanup_interval_ms: u64,
    #[serde(default = "default_stale_threshold_secs")]
    pub relay_stale_threshold_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub relay_sweep_interval_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            database_max_connections: default_db_max_connections(),
            log_path: None,
            relay_listen_addr: default_listen_addr(),
            relay_retransmit_base_ms: default_retransmit_base_ms(),
            relay_max_retransmit_attempts: default_max_retransmit_attempts(),
            relay_max_retransmit_timeout_ms: default_max_retransmit_timeout_ms(),
            relay_buffer_ttl_ms: default_buffer_ttl_ms(),
            relay_tick_interval_ms: default_tick_interval_ms(),
            relay_cleanup_interval_ms: default_cleanup_interval_ms(),
            relay_stale_threshold_secs: default_stale_threshold_secs(),
            relay_sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl RelayConfig {
    pub fn from_env() -> Self {
        Self::from_source(config::Environment::default().separator("__"))
    }

    fn from_source<S>(source: S) -> Self
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()
            .and_then(|c| c.try_deserialize::<RelayConfig>())
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "invalid relay configuration; using defaults");
                RelayConfig::default()
            })
            .normalize()
    }

    fn normalize(mut self) -> Self {
        self.database_url = Self::normalize_opt(self.database_url.take());
        self.log_path = Self::normalize_opt(self.log_path.take());
        self.relay_listen_addr = Self::normalize_opt(Some(self.relay_listen_addr))
            .unwrap_or_else(default_listen_addr);
        self.database_max_connections = self.database_max_connections.max(1);
        // Zero periods would make tokio intervals panic.
        self.relay_tick_interval_ms = self.relay_tick_interval_ms.max(1);
        self.relay_cleanup_interval_ms = self.relay_cleanup_interval_ms.max(1);
        self.relay_sweep_interval_secs = self.relay_sweep_interval_secs.max(1);
        self.relay_retransmit_base_ms = self.relay_retransmit_base_ms.max(1);
        self.relay_max_retransmit_timeout_ms = self
            .relay_max_retransmit_timeout_ms
            .max(self.relay_retransmit_base_ms);
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn reliable(&self) -> ReliableConfig {
        ReliableConfig {
            retransmit_base: Duration::from_millis(self.relay_retransmit_base_ms),
            max_retransmit_attempts: self.relay_max_retransmit_attempts,
            max_timeout: Duration::from_millis(self.relay_max_retransmit_timeout_ms),
            buffer_ttl: Duration::from_millis(self.relay_buffer_ttl_ms),
            tick_interval: Duration::from_millis(self.relay_tick_interval_ms),
            cleanup_interval: Duration::from_millis(self.relay_cleanup_interval_ms),
        }
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_secs(self.relay_stale_threshold_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.relay_sweep_interval_secs)
    }
}

fn default_listen_addr() -> String {
    "0.0.0.0:8090".to_string()
}

fn default_db_max_connections() -> u32 {
    5
}

fn default_retransmit_base_ms() -> u64 {
    1_000
}

fn default_max_retransmit_attempts() -> u32 {
    10
}

fn default_max_retransmit_timeout_ms() -> u64 {
    30_000
}

fn default_buffer_ttl_ms() -> u64 {
    30_000
}

fn default_tick_interval_ms() -> u64 {
    250
}

fn default_cleanup_interval_ms() -> u64 {
    5_000
}

fn default_stale_threshold_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn from_vars(vars: &[(&str, &str)]) -> RelayConfig {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_source(
            config::Environment::default()
                .separator("__")
                .source(Some(source)),
        )
    }

    #[test_timeout::timeout]
    fn empty_environment_uses_defaults() {
        let config = from_vars(&[]);
        assert_eq!(config.database_url, None);
        assert_eq!(config.relay_listen_addr, "0.0.0.0:8090");
        assert_eq!(config.reliable(), ReliableConfig::default());
        assert_eq!(config.stale_threshold(), Duration::from_secs(120));
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));
    }

    #[test_timeout::timeout]
    fn overrides_and_blank_values() {
        let config = from_vars(&[
            ("DATABASE_URL", "   "),
            ("LOG_PATH", " /tmp/relay.log "),
            ("RELAY_TICK_INTERVAL_MS", "0"),
            ("RELAY_RETRANSMIT_BASE_MS", "200"),
            ("RELAY_LISTEN_ADDR", " "),
        ]);
        assert_eq!(config.relay_listen_addr, "0.0.0.0:8090");
        assert_eq!(config.database_url, None);
        assert_eq!(config.log_path.as_deref(), Some("/tmp/relay.log"));
        let reliable = config.reliable();
        assert_eq!(reliable.tick_interval, Duration::from_millis(1));
        assert_eq!(reliable.retransmit_base, Duration::from_millis(200));
    }
}
