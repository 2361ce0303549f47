//! Error taxonomy shared by provisioning, serving, and tunnel lifecycle.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("no cloudflared build is published for {platform}")]
    UnsupportedPlatform { platform: String },

    #[error("failed to download cloudflared: {0}")]
    DownloadFailed(String),

    #[error("failed to bind local file server: {0}")]
    BindError(#[source] std::io::Error),

    #[error("timed out waiting for tunnel URL")]
    TunnelTimeout,

    #[error("tunnel is already starting")]
    AlreadyStarting,

    #[error("failed to spawn {}: {source}", path.display())]
    ProcessSpawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cloudflared exited before tunnel URL became available (status: {0})")]
    ProcessExited(String),

    #[error("tunnel start was cancelled by stop")]
    Cancelled,

    #[error("{0} provider is not available")]
    ProviderUnavailable(&'static str),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl UploadError {
    /// Startup errors the caller may retry by calling `start` again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            UploadError::DownloadFailed(_)
                | UploadError::TunnelTimeout
                | UploadError::ProcessExited(_)
                | UploadError::Cancelled
        )
    }
}

pub type Result<T, E = UploadError> = std::result::Result<T, E>;
