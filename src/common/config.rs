//! Upload configuration schema, defaults, and layered loading.
//!
//! Precedence: defaults < config file < environment
use anyhow::{ensure, Context, Result};
use directories::ProjectDirs;
use figment::{
    providers::{Env, Format, Json, Serialized},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::common::config_commands::atomic_write;
use crate::common::minutes;

pub const CONFIG_FILENAME: &str = "axon_upload.json";
pub const CONFIG_VERSION: &str = "1.0.0";
pub const DEFAULT_URL_EXPIRE_MINUTES: u64 = 60;
pub const MAX_URL_EXPIRE_MINUTES: u64 = 7 * 24 * 60;
pub(crate) const ENV_PREFIX: &str = "AXON_UPLOAD_";

pub fn config_path() -> PathBuf {
    ProjectDirs::from("", "", "axon")
        .map(|p| p.config_dir().join(CONFIG_FILENAME))
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

/// Backend used to publish registered files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Local,
    Cloudflare,
    S3,
}

/// When the tunnel is brought up without an explicit start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStartTrigger {
    AppStart,
    #[default]
    OnEnable,
    OnUpload,
}

/// When the tunnel is torn down without an explicit stop request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TunnelStopTrigger {
    #[default]
    AppClose,
    AfterMinutes,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CloudflareSettings {
    pub enabled: bool,
    /// Countdown started when a link is marked as sent.
    pub url_expire_minutes: u64,
    pub auto_insert_url: bool,
    pub tunnel_start_trigger: TunnelStartTrigger,
    pub tunnel_stop_trigger: TunnelStopTrigger,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tunnel_stop_after_minutes: Option<u64>,
}

impl Default for CloudflareSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url_expire_minutes: DEFAULT_URL_EXPIRE_MINUTES,
            auto_insert_url: true,
            tunnel_start_trigger: TunnelStartTrigger::default(),
            tunnel_stop_trigger: TunnelStopTrigger::default(),
            tunnel_stop_after_minutes: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
pub struct S3Settings {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
}

/// Fully resolved upload configuration after all layers merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UploadConfig {
    pub version: String,
    pub enabled: bool,
    pub active_provider: ProviderKind,
    pub cloudflare: CloudflareSettings,
    pub s3: S3Settings,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION.to_string(),
            enabled: true,
            active_provider: ProviderKind::Local,
            cloudflare: CloudflareSettings::default(),
            s3: S3Settings::default(),
        }
    }
}

impl UploadConfig {
    /// Rejects values the share subsystem cannot honour.
    pub fn validate(&self) -> Result<()> {
        let cf = &self.cloudflare;
        ensure!(
            cf.url_expire_minutes <= MAX_URL_EXPIRE_MINUTES,
            "Invalid config: cloudflare.urlExpireMinutes must be <= {MAX_URL_EXPIRE_MINUTES}"
        );
        if cf.tunnel_stop_trigger == TunnelStopTrigger::AfterMinutes {
            ensure!(
                cf.tunnel_stop_after_minutes.is_some_and(|m| m > 0),
                "Invalid config: cloudflare.tunnelStopAfterMinutes must be > 0 \
                 when tunnelStopTrigger is after_minutes"
            );
        }
        Ok(())
    }

    /// Delay after which a running tunnel should be stopped automatically.
    pub fn auto_stop_after(&self) -> Option<Duration> {
        match self.cloudflare.tunnel_stop_trigger {
            TunnelStopTrigger::AfterMinutes => self.cloudflare.tunnel_stop_after_minutes.map(minutes),
            TunnelStopTrigger::AppClose | TunnelStopTrigger::Manual => None,
        }
    }

    pub fn url_expire_minutes(&self) -> u64 {
        self.cloudflare.url_expire_minutes
    }
}

// Older documents were written without a version stamp.
fn apply_migrations(mut config: UploadConfig) -> UploadConfig {
    if config.version.trim().is_empty() {
        config.version = CONFIG_VERSION.to_string();
    }
    config
}

/// JSON document holding the persisted [`UploadConfig`].
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn default_location() -> Self {
        Self::new(config_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads config, substituting defaults when the file is missing or unreadable.
    pub fn load(&self) -> UploadConfig {
        match self.try_load() {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %self.path.display(),
                    "Falling back to default upload config: {err:#}"
                );
                UploadConfig::default()
            }
        }
    }

    /// Loads config from defaults/file/env.
    pub fn try_load(&self) -> Result<UploadConfig> {
        let config: UploadConfig = Figment::new()
            .merge(Serialized::defaults(UploadConfig::default()))
            .merge(Json::file(&self.path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to load upload configuration")?;

        config.validate()?;

        Ok(apply_migrations(config))
    }

    /// Validates and atomically writes `config`.
    pub fn save(&self, config: &UploadConfig) -> Result<()> {
        config.validate()?;
        let text =
            serde_json::to_string_pretty(config).context("Failed to serialize upload config")?;
        atomic_write(&self.path, &text)?;
        tracing::info!(path = %self.path.display(), "Upload config saved");
        Ok(())
    }
}
