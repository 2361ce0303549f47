pub mod config;
pub mod config_commands;
pub mod errors;
mod types;

pub use config::{ConfigStore, ProviderKind, UploadConfig};
pub use errors::{Result, UploadError};
pub use types::{
    file_url, millis_after, minutes, now_millis, TunnelStatus, UploadedFile, MAX_COUNTDOWN,
};
