// SPDX-License-Identifier: MIT
//! Daemon configuration.
//!
//! Values resolve in priority order: CLI flags, then environment variables,
//! then `{data_dir}/config.toml`, then built-in defaults. The TOML file is
//! optional; every section and field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

pub const DEFAULT_PORT: u16 = 8787;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Root of the optional TOML config file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TomlConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub provider: ProviderSection,
    #[serde(default)]
    pub stream: StreamSection,
    #[serde(default)]
    pub websocket: WebSocketSection,
    #[serde(default)]
    pub poller: PollerSection,
    #[serde(default)]
    pub pricing: PricingSection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonSection {
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub log_level: Option<String>,
    pub log_format: Option<String>,
    /// Shared token required in the websocket auth frame. Empty disables the
    /// token check (user identity is still taken from the auth frame).
    pub auth_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderSection {
    pub base_url: String,
    pub api_key: Option<String>,
    pub request_timeout_secs: u64,
    /// Upper bound on concurrent status queries during one poll pass.
    pub qps_limit: usize,
}

impl Default for ProviderSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.kie.ai".into(),
            api_key: None,
            request_timeout_secs: 30,
            qps_limit: 50,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StreamSection {
    /// Replay buffer byte ceiling per task.
    pub buffer_max_bytes: usize,
    /// Events older than this are evicted from the replay buffer.
    pub buffer_max_age_secs: u64,
    /// Throttle for persisting accumulated output during streaming.
    pub db_flush_ms: u64,
    /// Heartbeat cadence on quiet streams.
    pub heartbeat_secs: u64,
    /// Per-subscriber outbound queue depth. A subscriber that falls this far
    /// behind is dropped.
    pub subscriber_queue_capacity: usize,
}

impl Default for StreamSection {
    fn default() -> Self {
        Self {
            buffer_max_bytes: 1024 * 1024,
            buffer_max_age_secs: 300,
            db_flush_ms: 500,
            heartbeat_secs: 15,
            subscriber_queue_capacity: 256,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSocketSection {
    pub max_connections_per_user: usize,
    /// Connections silent for longer than this are reaped by the sweep.
    pub heartbeat_timeout_secs: u64,
    /// Cadence of application-level pings sent to clients.
    pub ping_interval_secs: u64,
    /// Message buffer byte ceiling per task.
    pub buffer_max_bytes: usize,
    pub buffer_max_age_secs: u64,
    /// Buffers for tasks nobody marked complete are still dropped after this
    /// long without writes.
    pub buffer_idle_max_secs: u64,
    /// How long a completed task's buffer stays around for late reconnects.
    pub completed_grace_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for WebSocketSection {
    fn default() -> Self {
        Self {
            max_connections_per_user: 5,
            heartbeat_timeout_secs: 60,
            ping_interval_secs: 25,
            buffer_max_bytes: 1024 * 1024,
            buffer_max_age_secs: 300,
            buffer_idle_max_secs: 1800,
            completed_grace_secs: 300,
            sweep_interval_secs: 600,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PollerSection {
    pub interval_secs: u64,
    pub chat_timeout_minutes: i64,
    pub image_timeout_minutes: i64,
    pub video_timeout_minutes: i64,
}

impl Default for PollerSection {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            chat_timeout_minutes: 10,
            image_timeout_minutes: 10,
            video_timeout_minutes: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PricingSection {
    pub credits_per_1k_input: f64,
    pub credits_per_1k_output: f64,
}

impl Default for PricingSection {
    fn default() -> Self {
        Self {
            credits_per_1k_input: 1.0,
            credits_per_1k_output: 1.8,
        }
    }
}

impl PricingSection {
    /// Credits for a completed chat exchange, rounded up with a floor of 1.
    pub fn estimate(&self, prompt_tokens: u64, completion_tokens: u64) -> i64 {
        let cost = prompt_tokens as f64 / 1000.0 * self.credits_per_1k_input
            + completion_tokens as f64 / 1000.0 * self.credits_per_1k_output;
        (cost.ceil() as i64).max(1)
    }

    /// Used when the provider never reported usage: approximate tokens from
    /// output length at roughly three bytes per token, floor of 10 tokens.
    pub fn estimate_from_length(&self, output_len: usize) -> i64 {
        let tokens = ((output_len / 3) as u64).max(10);
        (tokens as f64 / 1000.0 * self.credits_per_1k_output).ceil() as i64 + 1
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug)]
pub struct DaemonConfig {
    pub port: u16,
    pub bind_address: String,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub log_format: String,
    pub auth_token: Option<String>,
    pub provider: ProviderSection,
    pub stream: StreamSection,
    pub websocket: WebSocketSection,
    pub poller: PollerSection,
    pub pricing: PricingSection,
}

impl DaemonConfig {
    /// Resolve the effective config from CLI overrides and `{data_dir}/config.toml`.
    pub fn load(
        data_dir: PathBuf,
        port: Option<u16>,
        bind_address: Option<String>,
        log_level: Option<String>,
    ) -> Result<Self> {
        let toml_path = data_dir.join("config.toml");
        let toml: TomlConfig = if toml_path.exists() {
            let raw = std::fs::read_to_string(&toml_path)
                .with_context(|| format!("failed to read {}", toml_path.display()))?;
            toml::from_str(&raw)
                .with_context(|| format!("failed to parse {}", toml_path.display()))?
        } else {
            debug!(path = %toml_path.display(), "no config file, using defaults");
            TomlConfig::default()
        };

        let api_key = std::env::var("GEND_PROVIDER_API_KEY")
            .ok()
            .or(toml.provider.api_key.clone());
        let auth_token = std::env::var("GEND_AUTH_TOKEN")
            .ok()
            .or(toml.daemon.auth_token.clone())
            .filter(|t| !t.is_empty());

        Ok(Self {
            port: port.or(toml.daemon.port).unwrap_or(DEFAULT_PORT),
            bind_address: bind_address
                .or(toml.daemon.bind_address.clone())
                .unwrap_or_else(|| DEFAULT_BIND.into()),
            log_level: log_level
                .or(toml.daemon.log_level.clone())
                .unwrap_or_else(|| "info".into()),
            log_format: toml
                .daemon
                .log_format
                .clone()
                .unwrap_or_else(|| "compact".into()),
            auth_token,
            provider: ProviderSection {
                api_key,
                ..toml.provider
            },
            stream: toml.stream,
            websocket: toml.websocket,
            poller: toml.poller,
            pricing: toml.pricing,
            data_dir,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

impl StreamSection {
    pub fn buffer_max_age(&self) -> Duration {
        Duration::from_secs(self.buffer_max_age_secs)
    }

    pub fn db_flush_interval(&self) -> Duration {
        Duration::from_millis(self.db_flush_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

impl WebSocketSection {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    pub fn buffer_max_age(&self) -> Duration {
        Duration::from_secs(self.buffer_max_age_secs)
    }

    pub fn buffer_idle_max_age(&self) -> Duration {
        Duration::from_secs(self.buffer_idle_max_secs)
    }

    pub fn completed_grace(&self) -> Duration {
        Duration::from_secs(self.completed_grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl ProviderSection {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl PollerSection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}
