pub mod common;
pub mod manager;
pub mod provider;
pub mod provision;
pub mod server;
pub mod tracker;
pub mod transport;

pub use common::{Result, TunnelStatus, UploadConfig, UploadError, UploadedFile};
pub use manager::{ManagerOptions, UploadManager};
pub use provider::{Provider, ProviderSession};
pub use provision::BinaryProvisioner;
pub use server::LocalFileServer;
pub use tracker::UrlTracker;
pub use transport::{TunnelEvent, TunnelManager, TunnelOptions, TunnelStatusReport};
