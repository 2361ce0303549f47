use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Lifecycle state of the quick tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Restarting,
    Error,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TunnelStatus::Stopped => "stopped",
            TunnelStatus::Starting => "starting",
            TunnelStatus::Running => "running",
            TunnelStatus::Restarting => "restarting",
            TunnelStatus::Error => "error",
        };
        f.write_str(name)
    }
}

/// A file handed to the share subsystem, as presented to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedFile {
    pub id: String,
    pub original_name: String,
    pub local_path: PathBuf,
    pub size: u64,
    pub mime_type: String,
    /// Epoch milliseconds.
    pub uploaded_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    /// Epoch milliseconds, set once the link is marked as sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url_expires_at: Option<u64>,
    #[serde(default)]
    pub is_expired: bool,
}

impl UploadedFile {
    /// Whether the expiry countdown has been started for this file.
    pub fn is_sent(&self) -> bool {
        self.url_expires_at.is_some()
    }
}

/// Public link for a served file under a tunnel base URL.
pub fn file_url(base: &str, id: &str) -> String {
    format!("{}/files/{}", base.trim_end_matches('/'), id)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Longest countdown any timer honours; longer requests are clamped.
pub const MAX_COUNTDOWN: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

pub fn minutes(count: u64) -> Duration {
    Duration::from_secs(count.saturating_mul(60)).min(MAX_COUNTDOWN)
}

/// Wall-clock millisecond timestamp `after` from now, saturating.
pub fn millis_after(after: Duration) -> u64 {
    let after = u64::try_from(after.min(MAX_COUNTDOWN).as_millis()).unwrap_or(u64::MAX);
    now_millis().saturating_add(after)
}
