//! Tunnel transport: the loopback listener, the `cloudflared` child and its lifecycle.

pub mod cloudflare;
pub mod local;
pub mod manager;

use serde::Serialize;
use std::time::Duration;

use crate::common::TunnelStatus;

pub use cloudflare::{find_tunnel_url, ProcessEvents, ProcessExit, TunnelProcess};
pub use manager::TunnelManager;

/// Quick tunnels are cut off by Cloudflare after roughly eight hours.
pub const MAX_TUNNEL_DURATION: Duration = Duration::from_secs(8 * 60 * 60);
pub const RESTART_BUFFER: Duration = Duration::from_secs(10 * 60);
pub const URL_TIMEOUT: Duration = Duration::from_secs(30);
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Notifications broadcast to subscribers of a [`TunnelManager`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TunnelEvent {
    StatusChanged {
        status: TunnelStatus,
        url: Option<String>,
    },
    /// Binary download progress, 0..=100.
    DownloadProgress { percent: u8 },
    /// A new URL replaced the previous one; links built on the old URL are dead.
    Restarted { url: String },
}

/// Timing knobs for the tunnel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelOptions {
    pub url_timeout: Duration,
    pub max_duration: Duration,
    pub restart_buffer: Duration,
    pub stop_grace: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            url_timeout: URL_TIMEOUT,
            max_duration: MAX_TUNNEL_DURATION,
            restart_buffer: RESTART_BUFFER,
            stop_grace: STOP_GRACE,
        }
    }
}

impl TunnelOptions {
    /// Delay from a successful start until the proactive restart.
    pub fn restart_after(&self) -> Duration {
        self.max_duration.saturating_sub(self.restart_buffer)
    }
}

/// Public URL and loopback port of a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelEndpoint {
    pub url: String,
    pub port: u16,
}

/// Point-in-time view of the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TunnelStatusReport {
    pub status: TunnelStatus,
    pub url: Option<String>,
    /// Epoch millis of the last successful start.
    pub started_at: Option<u64>,
    pub port: Option<u16>,
}
