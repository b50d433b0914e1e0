use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};

use crate::{is_valid_app_name, PackageEndpoint};

pub const DEFAULT_BASE_URL: &str = "https://cn.etsoo.com/apps";
pub const DEFAULT_APP: &str = "core";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default = "default_app")]
    pub default_app: String,
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeoutConfig {
    #[serde(default = "default_manifest_secs")]
    pub manifest_secs: u64,
    #[serde(default = "default_download_secs")]
    pub download_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_download_attempts")]
    pub download_attempts: u32,
    #[serde(default = "default_archive_attempts")]
    pub archive_attempts: u32,
    #[serde(default = "default_backoff_millis")]
    pub backoff_millis: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            root: None,
            default_app: default_app(),
            refresh_interval_secs: default_refresh_interval_secs(),
            timeouts: TimeoutConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            manifest_secs: default_manifest_secs(),
            download_secs: default_download_secs(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            download_attempts: default_download_attempts(),
            archive_attempts: default_archive_attempts(),
            backoff_millis: default_backoff_millis(),
        }
    }
}

impl HostConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(input).context("failed to parse appdock config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let base_url = self.base_url.trim();
        if !(base_url.starts_with("https://") || base_url.starts_with("http://")) {
            return Err(anyhow!(
                "base_url must be an http(s) URL: {}",
                self.base_url
            ));
        }
        if !is_valid_app_name(&self.default_app) {
            return Err(anyhow!("default_app is not a valid app name: {}", self.default_app));
        }
        if self.timeouts.manifest_secs == 0 || self.timeouts.download_secs == 0 {
            return Err(anyhow!("timeouts must be at least one second"));
        }
        if self.retry.download_attempts == 0 || self.retry.archive_attempts == 0 {
            return Err(anyhow!("retry attempts must be at least 1"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(anyhow!("refresh_interval_secs must be at least 1"));
        }
        Ok(())
    }

    pub fn endpoint(&self) -> PackageEndpoint {
        PackageEndpoint::new(self.base_url.trim())
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl TimeoutConfig {
    pub fn manifest(&self) -> Duration {
        Duration::from_secs(self.manifest_secs)
    }

    pub fn download(&self) -> Duration {
        Duration::from_secs(self.download_secs)
    }
}

impl RetryConfig {
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_millis.saturating_mul(u64::from(attempt)))
    }
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_app() -> String {
    DEFAULT_APP.to_string()
}

fn default_refresh_interval_secs() -> u64 {
    2 * 60 * 60
}

fn default_manifest_secs() -> u64 {
    10
}

fn default_download_secs() -> u64 {
    120
}

fn default_download_attempts() -> u32 {
    3
}

fn default_archive_attempts() -> u32 {
    2
}

fn default_backoff_millis() -> u64 {
    500
}
