//! Upload providers behind one capability surface.

use serde::Serialize;

use crate::common::{ProviderKind, Result, TunnelStatus, UploadError};
use crate::server::LocalFileServer;
use crate::transport::{TunnelManager, TunnelStatusReport};

/// Where a started provider can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProviderSession {
    /// Base URL that `/files/<id>` is appended to.
    pub url: String,
    pub port: Option<u16>,
}

pub enum Provider {
    /// Loopback only; links work on this machine.
    Local(LocalFileServer),
    Cloudflare(TunnelManager),
    /// Configurable, not implemented.
    S3,
}

impl Provider {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Provider::Local(_) => ProviderKind::Local,
            Provider::Cloudflare(_) => ProviderKind::Cloudflare,
            Provider::S3 => ProviderKind::S3,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Provider::Local(_) => "Local",
            Provider::Cloudflare(_) => "Cloudflare Tunnel",
            Provider::S3 => "S3",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Provider::Local(_) => "Serve files on 127.0.0.1 for this machine only",
            Provider::Cloudflare(_) => "Free temporary public URLs through a Cloudflare quick tunnel",
            Provider::S3 => "Upload to an S3-compatible bucket",
        }
    }

    pub async fn start(&self) -> Result<ProviderSession> {
        match self {
            Provider::Local(server) => {
                let port = server.start().await?;
                Ok(ProviderSession {
                    url: format!("http://127.0.0.1:{port}"),
                    port: Some(port),
                })
            }
            Provider::Cloudflare(tunnel) => {
                let endpoint = tunnel.start().await?;
                Ok(ProviderSession {
                    url: endpoint.url,
                    port: Some(endpoint.port),
                })
            }
            Provider::S3 => Err(UploadError::ProviderUnavailable("s3")),
        }
    }

    pub async fn stop(&self) {
        match self {
            Provider::Local(server) => server.stop().await,
            Provider::Cloudflare(tunnel) => tunnel.stop().await,
            Provider::S3 => {}
        }
    }

    pub fn status(&self) -> TunnelStatusReport {
        match self {
            Provider::Local(server) => match server.port() {
                Some(port) => TunnelStatusReport {
                    status: TunnelStatus::Running,
                    url: Some(format!("http://127.0.0.1:{port}")),
                    started_at: None,
                    port: Some(port),
                },
                None => TunnelStatusReport::default(),
            },
            Provider::Cloudflare(tunnel) => tunnel.status(),
            Provider::S3 => TunnelStatusReport::default(),
        }
    }
}
