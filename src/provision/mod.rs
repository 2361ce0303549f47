//! On-demand download of the `cloudflared` binary.

pub mod platform;

use directories::ProjectDirs;
use futures_util::StreamExt;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::common::{Result, UploadError};
pub use platform::{ArchiveKind, BinaryRecord, CLOUDFLARED_VERSION};

const ARCHIVE_NAME: &str = "cloudflared.tgz";
const UNPACK_DIR: &str = ".cloudflared-unpack";

/// Ensures the platform `cloudflared` build exists under an app-private directory.
#[derive(Debug, Clone)]
pub struct BinaryProvisioner {
    install_dir: PathBuf,
    platform: String,
    record: Option<BinaryRecord>,
    client: reqwest::Client,
}

impl BinaryProvisioner {
    /// Provisioner for the platform this process runs on.
    pub fn new(install_dir: impl Into<PathBuf>) -> Self {
        let record = platform::lookup(std::env::consts::OS, std::env::consts::ARCH);
        Self {
            install_dir: install_dir.into(),
            platform: platform::current_platform(),
            record,
            client: reqwest::Client::new(),
        }
    }

    /// Provisioner with an explicit download target (`None` = unsupported).
    pub fn with_record(install_dir: impl Into<PathBuf>, record: Option<BinaryRecord>) -> Self {
        let platform = record
            .as_ref()
            .map(|r| r.platform.clone())
            .unwrap_or_else(platform::current_platform);
        Self {
            install_dir: install_dir.into(),
            platform,
            record,
            client: reqwest::Client::new(),
        }
    }

    pub fn default_install_dir() -> PathBuf {
        ProjectDirs::from("", "", "axon")
            .map(|p| p.data_dir().join("bin").join("cloudflared"))
            .unwrap_or_else(|| PathBuf::from("bin").join("cloudflared"))
    }

    pub fn install_dir(&self) -> &Path {
        &self.install_dir
    }

    pub fn binary_path(&self) -> PathBuf {
        self.install_dir.join(platform::binary_name())
    }

    pub fn version(&self) -> &'static str {
        CLOUDFLARED_VERSION
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::try_exists(self.binary_path())
            .await
            .unwrap_or(false)
    }

    /// Downloads (and unpacks, for archives) the binary, reporting percent complete.
    ///
    /// The binary only appears at [`binary_path`](Self::binary_path) once it is
    /// complete. Scratch files are removed on error and when the returned future
    /// is dropped mid-download.
    #[tracing::instrument(skip_all, fields(platform = %self.platform))]
    pub async fn download(&self, mut on_progress: impl FnMut(u8) + Send) -> Result<PathBuf> {
        let record = self
            .record
            .as_ref()
            .ok_or_else(|| UploadError::UnsupportedPlatform {
                platform: self.platform.clone(),
            })?;

        tokio::fs::create_dir_all(&self.install_dir)
            .await
            .map_err(|e| failed(format!("create {}", self.install_dir.display()), e))?;

        let binary_path = self.binary_path();
        let scratch = Scratch::new(&self.install_dir);

        info!(url = %record.url, "Downloading cloudflared {CLOUDFLARED_VERSION}");

        if let Err(err) = self
            .install(record, &binary_path, &scratch, &mut on_progress)
            .await
        {
            warn!("cloudflared download failed: {err}");
            return Err(err);
        }
        drop(scratch);

        on_progress(100);
        info!(path = %binary_path.display(), "cloudflared installed");
        Ok(binary_path)
    }

    async fn install(
        &self,
        record: &BinaryRecord,
        binary_path: &Path,
        scratch: &Scratch,
        on_progress: &mut (impl FnMut(u8) + Send),
    ) -> Result<()> {
        let staged = match record.archive {
            ArchiveKind::RawExecutable => {
                self.stream_to_file(&record.url, &scratch.part, on_progress)
                    .await?;
                scratch.part.clone()
            }
            ArchiveKind::TarGz => {
                self.stream_to_file(&record.url, &scratch.archive, on_progress)
                    .await?;
                info!("Extracting cloudflared archive");
                extract_tar_gz(&scratch.archive, &scratch.unpack_dir).await?;

                let unpacked = scratch.unpack_dir.join(platform::binary_name());
                if !tokio::fs::try_exists(&unpacked).await.unwrap_or(false) {
                    return Err(UploadError::DownloadFailed(format!(
                        "archive did not contain {}",
                        platform::binary_name()
                    )));
                }
                unpacked
            }
        };

        set_executable(&staged).await?;
        tokio::fs::rename(&staged, binary_path)
            .await
            .map_err(|e| failed(format!("install {}", binary_path.display()), e))
    }

    async fn stream_to_file(
        &self,
        url: &str,
        path: &Path,
        on_progress: &mut (impl FnMut(u8) + Send),
    ) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| failed("request", e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(UploadError::DownloadFailed(format!(
                "{url} returned {status}"
            )));
        }

        let total = response.content_length().filter(|len| *len > 0);
        let mut file = tokio::fs::File::create(path)
            .await
            .map_err(|e| failed(format!("create {}", path.display()), e))?;
        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_percent = None;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| failed("read body", e))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| failed(format!("write {}", path.display()), e))?;
            downloaded += chunk.len() as u64;

            if let Some(total) = total {
                let percent = (downloaded.saturating_mul(100) / total).min(100) as u8;
                if last_percent != Some(percent) {
                    on_progress(percent);
                    last_percent = Some(percent);
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| failed(format!("flush {}", path.display()), e))?;

        tracing::debug!(bytes = downloaded, "Download stream finished");
        Ok(())
    }
}

fn failed(context: impl Display, err: impl Display) -> UploadError {
    UploadError::DownloadFailed(format!("{context}: {err}"))
}

async fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    let archive_path = archive_path.to_path_buf();
    let dest = dest.to_path_buf();

    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all(&dest)?;
        let file = std::fs::File::open(&archive_path)?;
        let decoder = flate2::read::GzDecoder::new(file);
        tar::Archive::new(decoder).unpack(&dest)
    })
    .await
    .map_err(|e| failed("extract task", e))?
    .map_err(|e| failed("extract archive", e))
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .await
        .map_err(|e| failed(format!("chmod {}", path.display()), e))
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}

/// Intermediate files of one download attempt.
///
/// Removed on drop, which also covers a download future cancelled by `stop`.
struct Scratch {
    part: PathBuf,
    archive: PathBuf,
    unpack_dir: PathBuf,
}

impl Scratch {
    fn new(install_dir: &Path) -> Self {
        Self {
            part: install_dir.join(format!("{}.part", platform::binary_name())),
            archive: install_dir.join(ARCHIVE_NAME),
            unpack_dir: install_dir.join(UNPACK_DIR),
        }
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        for file in [&self.part, &self.archive] {
            log_leftover(file, std::fs::remove_file(file));
        }
        log_leftover(&self.unpack_dir, std::fs::remove_dir_all(&self.unpack_dir));
    }
}

fn log_leftover(path: &Path, removed: std::io::Result<()>) {
    if let Err(err) = removed {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), "Failed to remove partial download: {err}");
        }
    }
}
