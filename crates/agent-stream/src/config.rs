use serde::Deserialize;
use std::time::Duration;
use tracing::warn;

use crate::error::{StreamError, StreamResult};

/// Tunables for a streaming session, read from `AGENT_STREAM__*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_direct_timeout_ms")]
    pub direct_timeout_ms: u64,
    #[serde(default = "default_proxied_timeout_ms")]
    pub proxied_timeout_ms: u64,
    #[serde(default = "default_size_threshold")]
    pub size_threshold: u64,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_frame_misses")]
    pub max_frame_misses: u32,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_stream_idle_timeout_ms")]
    pub stream_idle_timeout_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            direct_timeout_ms: default_direct_timeout_ms(),
            proxied_timeout_ms: default_proxied_timeout_ms(),
            size_threshold: default_size_threshold(),
            buffer_size: default_buffer_size(),
            max_frame_misses: default_max_frame_misses(),
            poll_interval_ms: default_poll_interval_ms(),
            stream_idle_timeout_ms: default_stream_idle_timeout_ms(),
        }
    }
}

impl StreamConfig {
    pub fn from_env() -> Self {
        ::config::Config::builder()
            .add_source(
                ::config::Environment::with_prefix("AGENT_STREAM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<StreamConfig>())
            .map_err(|err| StreamError::InvalidConfig(err.to_string()))
            .and_then(|cfg| cfg.validate().map(|_| cfg))
            .unwrap_or_else(|err| {
                warn!(
                    target = "agent_stream.config",
                    error = %err,
                    "ignoring stream configuration from environment"
                );
                StreamConfig::default()
            })
    }

    pub fn validate(&self) -> StreamResult<()> {
        let checks = [
            ("direct_timeout_ms", self.direct_timeout_ms),
            ("proxied_timeout_ms", self.proxied_timeout_ms),
            ("size_threshold", self.size_threshold),
            ("buffer_size", self.buffer_size as u64),
            ("max_frame_misses", u64::from(self.max_frame_misses)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("stream_idle_timeout_ms", self.stream_idle_timeout_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(StreamError::InvalidConfig(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        Ok(())
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_millis(self.direct_timeout_ms)
    }

    pub fn proxied_timeout(&self) -> Duration {
        Duration::from_millis(self.proxied_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_idle_timeout_ms)
    }
}

fn default_direct_timeout_ms() -> u64 {
    1_000
}

fn default_proxied_timeout_ms() -> u64 {
    5_000
}

fn default_size_threshold() -> u64 {
    50_000
}

fn default_buffer_size() -> usize {
    500
}

fn default_max_frame_misses() -> u32 {
    3
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_stream_idle_timeout_ms() -> u64 {
    30_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const VARS: [&str; 3] = [
        "AGENT_STREAM__DIRECT_TIMEOUT_MS",
        "AGENT_STREAM__MAX_FRAME_MISSES",
        "AGENT_STREAM__BUFFER_SIZE",
    ];

    fn clear_vars() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    fn defaults_match_transport_budgets() {
        let config = StreamConfig::default();
        assert_eq!(config.direct_timeout(), Duration::from_secs(1));
        assert_eq!(config.proxied_timeout(), Duration::from_secs(5));
        assert_eq!(config.size_threshold, 50_000);
        assert_eq!(config.max_frame_misses, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn from_env_without_overrides_uses_defaults() {
        clear_vars();
        assert_eq!(StreamConfig::from_env(), StreamConfig::default());
    }

    #[test]
    #[serial]
    fn from_env_reads_overrides() {
        clear_vars();
        env::set_var("AGENT_STREAM__DIRECT_TIMEOUT_MS", "1500");
        env::set_var("AGENT_STREAM__MAX_FRAME_MISSES", "5");
        let config = StreamConfig::from_env();
        clear_vars();

        assert_eq!(config.direct_timeout_ms, 1500);
        assert_eq!(config.max_frame_misses, 5);
        assert_eq!(config.proxied_timeout_ms, 5_000);
    }

    #[test]
    #[serial]
    fn from_env_rejects_zero_values() {
        clear_vars();
        env::set_var("AGENT_STREAM__BUFFER_SIZE", "0");
        let config = StreamConfig::from_env();
        clear_vars();

        assert_eq!(config, StreamConfig::default());
    }
}
