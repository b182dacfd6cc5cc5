use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::Channel;
use crate::pipeline::RetryPolicy;

/// Retry policy as it appears in the JSON config file; converted into
/// `pipeline::RetryPolicy` (which uses `Duration`) at load time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    #[serde(default = "default_max_channel_retries")]
    pub max_channel_retries: usize,
    #[serde(default = "default_max_single_channel_retries")]
    pub max_single_channel_retries: usize,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_channel_retries: default_max_channel_retries(),
            max_single_channel_retries: default_max_single_channel_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl From<RetryPolicyConfig> for RetryPolicy {
    fn from(value: RetryPolicyConfig) -> Self {
        RetryPolicy {
            max_channel_retries: value.max_channel_retries,
            max_single_channel_retries: value.max_single_channel_retries,
            retry_delay: Duration::from_millis(value.retry_delay_ms),
        }
    }
}

fn default_max_channel_retries() -> usize {
    2
}

fn default_max_single_channel_retries() -> usize {
    1
}

fn default_retry_delay_ms() -> u64 {
    200
}

fn default_port() -> u16 {
    8787
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_timeout_ms() -> u64 {
    120_000
}

fn default_pool_max_idle_per_host() -> usize {
    32
}

fn default_pool_idle_timeout_ms() -> u64 {
    90_000
}

fn default_sse_buffer_size() -> usize {
    64
}

fn default_max_connections_per_channel() -> i64 {
    0
}

/// Parsed JSON configuration file (channel directory plus server and
/// pipeline tunables).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(rename = "Channels")]
    pub channels: Vec<Channel>,

    #[serde(default, rename = "RetryPolicy")]
    pub retry_policy: RetryPolicyConfig,

    #[serde(default = "default_port", rename = "PORT")]
    pub port: u16,

    #[serde(default = "default_host", rename = "HOST")]
    pub host: String,

    #[serde(default = "default_timeout_ms", rename = "API_TIMEOUT_MS")]
    pub api_timeout_ms: u64,

    #[serde(default, rename = "PROXY_URL")]
    pub proxy_url: Option<String>,

    #[serde(default = "default_pool_max_idle_per_host", rename = "POOL_MAX_IDLE_PER_HOST")]
    pub pool_max_idle_per_host: usize,

    #[serde(default = "default_pool_idle_timeout_ms", rename = "POOL_IDLE_TIMEOUT_MS")]
    pub pool_idle_timeout_ms: u64,

    #[serde(default = "default_sse_buffer_size", rename = "SSE_BUFFER_SIZE")]
    pub sse_buffer_size: usize,

    /// Process-wide soft cap on in-flight requests per channel, 0 = unlimited.
    #[serde(default = "default_max_connections_per_channel", rename = "MAX_CONNECTIONS_PER_CHANNEL")]
    pub max_connections_per_channel: i64,
}

/// Runtime configuration shared across handlers via Axum state. Wraps
/// the parsed file plus a shared `reqwest::Client` connection pool.
#[derive(Debug, Clone)]
pub struct Config {
    inner: Arc<ConfigInner>,
}

#[derive(Debug)]
struct ConfigInner {
    file: ConfigFile,
    http_client: reqwest::Client,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let expanded = shellexpand::tilde(path).to_string();
        let contents = fs::read_to_string(&expanded)
            .with_context(|| format!("reading config file at {expanded}"))?;
        let file: ConfigFile =
            serde_json::from_str(&contents).with_context(|| format!("parsing config file at {expanded}"))?;
        Self::from_file(file)
    }

    pub fn from_file(file: ConfigFile) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(file.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_millis(file.pool_idle_timeout_ms))
            .timeout(Duration::from_millis(file.api_timeout_ms));

        if let Some(proxy_url) = &file.proxy_url {
            builder = builder.proxy(reqwest::Proxy::all(proxy_url).context("invalid PROXY_URL")?);
        }

        let http_client = builder.build().context("building reqwest client")?;

        Ok(Self {
            inner: Arc::new(ConfigInner { file, http_client }),
        })
    }

    pub fn channels(&self) -> &[Channel] {
        &self.inner.file.channels
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.inner.file.retry_policy.clone().into()
    }

    pub fn host(&self) -> &str {
        &self.inner.file.host
    }

    pub fn port(&self) -> u16 {
        self.inner.file.port
    }

    pub fn sse_buffer_size(&self) -> usize {
        self.inner.file.sse_buffer_size
    }

    pub fn max_connections_per_channel(&self) -> i64 {
        self.inner.file.max_connections_per_channel
    }

    pub fn http_client(&self) -> reqwest::Client {
        self.inner.http_client.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config_json() -> &'static str {
        r#"{
            "Channels": [
                {
                    "id": "ch1",
                    "name": "primary",
                    "provider_type": "openai",
                    "base_url": "https://api.openai.com/v1",
                    "credential": { "kind": "bearer", "token": "sk-test" },
                    "supported_models": ["gpt-4"],
                    "status": "enabled"
                }
            ],
            "PORT": 9090
        }"#
    }

    #[test]
    fn parses_channels_and_applies_defaults() {
        let file: ConfigFile = serde_json::from_str(sample_config_json()).unwrap();
        assert_eq!(file.channels.len(), 1);
        assert_eq!(file.port, 9090);
        assert_eq!(file.host, default_host());
        assert_eq!(file.retry_policy.max_channel_retries, 2);
    }

    #[test]
    fn from_file_builds_http_client() {
        let file: ConfigFile = serde_json::from_str(sample_config_json()).unwrap();
        let config = Config::from_file(file).unwrap();
        assert_eq!(config.port(), 9090);
        assert_eq!(config.channels().len(), 1);
    }

    #[test]
    fn retry_policy_converts_delay_to_duration() {
        let config = RetryPolicyConfig {
            max_channel_retries: 3,
            max_single_channel_retries: 1,
            retry_delay_ms: 500,
        };
        let policy: RetryPolicy = config.into();
        assert_eq!(policy.retry_delay, Duration::from_millis(500));
    }
}
