//! Application-facing share subsystem.
//!
//! Owns one file server, tunnel manager and tracker, and wires the configured
//! start/stop triggers between them.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::common::config::TunnelStartTrigger;
use crate::common::{
    file_url, now_millis, ConfigStore, ProviderKind, Result, UploadConfig, UploadError,
    UploadedFile,
};
use crate::provider::{Provider, ProviderSession};
use crate::provision::BinaryProvisioner;
use crate::server::LocalFileServer;
use crate::tracker::UrlTracker;
use crate::transport::{TunnelEvent, TunnelManager, TunnelOptions, TunnelStatusReport};

/// Where the manager keeps its state on disk, and tunnel timings.
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub config_path: PathBuf,
    pub install_dir: PathBuf,
    pub tunnel: TunnelOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            config_path: crate::common::config::config_path(),
            install_dir: BinaryProvisioner::default_install_dir(),
            tunnel: TunnelOptions::default(),
        }
    }
}

/// Installation state of `cloudflared`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BinaryStatus {
    pub installed: bool,
    pub path: PathBuf,
    pub version: &'static str,
}

struct Inner {
    store: ConfigStore,
    config: RwLock<UploadConfig>,
    file_server: LocalFileServer,
    tunnel: TunnelManager,
    tracker: UrlTracker,
    /// Provider brought up by the last `start_tunnel`, whatever the config says now.
    started: Mutex<Option<ProviderKind>>,
    auto_stop: Mutex<Option<CancellationToken>>,
    relay: Mutex<Option<CancellationToken>>,
}

#[derive(Clone)]
pub struct UploadManager {
    inner: Arc<Inner>,
}

impl UploadManager {
    pub fn new(options: ManagerOptions) -> Self {
        let store = ConfigStore::new(options.config_path);
        let config = store.load();
        let file_server = LocalFileServer::new();
        let tunnel = TunnelManager::with_options(
            BinaryProvisioner::new(options.install_dir),
            file_server.clone(),
            options.tunnel,
        );
        let tracker = UrlTracker::new(file_server.clone());

        Self {
            inner: Arc::new(Inner {
                store,
                config: RwLock::new(config),
                file_server,
                tunnel,
                tracker,
                started: Mutex::new(None),
                auto_stop: Mutex::new(None),
                relay: Mutex::new(None),
            }),
        }
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn config(&self) -> UploadConfig {
        self.inner.config.read().clone()
    }

    /// Validates, persists and adopts `config`.
    pub fn set_config(&self, config: UploadConfig) -> Result<()> {
        self.inner
            .store
            .save(&config)
            .map_err(|e| UploadError::Config(format!("{e:#}")))?;
        *self.inner.config.write() = config;
        Ok(())
    }

    /// Adjusts the in-memory config for this session without persisting it.
    ///
    /// The adjusted config is validated like a saved one; on rejection the
    /// current config stays in place.
    pub fn override_config(&self, apply: impl FnOnce(&mut UploadConfig)) -> Result<()> {
        let mut config = self.config();
        apply(&mut config);
        config
            .validate()
            .map_err(|e| UploadError::Config(format!("{e:#}")))?;
        *self.inner.config.write() = config;
        Ok(())
    }

    pub fn config_store(&self) -> &ConfigStore {
        &self.inner.store
    }

    /// Provider selected by the current config.
    pub fn provider(&self) -> Provider {
        let kind = self.inner.config.read().active_provider;
        self.provider_of(kind)
    }

    fn provider_of(&self, kind: ProviderKind) -> Provider {
        match kind {
            ProviderKind::Local => Provider::Local(self.inner.file_server.clone()),
            ProviderKind::Cloudflare => Provider::Cloudflare(self.inner.tunnel.clone()),
            ProviderKind::S3 => Provider::S3,
        }
    }

    pub fn tunnel(&self) -> &TunnelManager {
        &self.inner.tunnel
    }

    pub fn file_server(&self) -> &LocalFileServer {
        &self.inner.file_server
    }

    pub fn tracker(&self) -> &UrlTracker {
        &self.inner.tracker
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.tunnel.subscribe()
    }

    /// Starts the active provider and the periodic expiry sweep.
    #[tracing::instrument(skip(self))]
    pub async fn start_tunnel(&self) -> Result<ProviderSession> {
        let provider = self.provider();
        let session = provider.start().await?;
        *self.inner.started.lock() = Some(provider.kind());
        self.inner.tracker.start_cleanup_interval();
        self.inner.tracker.set_external_base(&session.url);
        self.ensure_restart_relay();
        self.arm_auto_stop();
        info!(url = %session.url, "Sharing started");
        Ok(session)
    }

    /// Stops the tunnel and the file server, and forgets every tracked file.
    #[tracing::instrument(skip(self))]
    pub async fn stop_tunnel(&self) {
        self.cancel_auto_stop();
        self.inner.started.lock().take();
        // stop the tunnel even when the config no longer names cloudflare
        self.inner.tunnel.stop().await;
        self.inner.file_server.stop().await;
        self.inner.tracker.clear();
        info!("Sharing stopped");
    }

    /// Status of the running provider, or of the configured one when idle.
    pub fn tunnel_status(&self) -> TunnelStatusReport {
        let started = *self.inner.started.lock();
        match started {
            Some(kind) => self.provider_of(kind).status(),
            None => self.provider().status(),
        }
    }

    /// Registers a local file for sharing under a fresh id.
    ///
    /// `name` defaults to the file name and `mime_type` is guessed from the extension.
    #[tracing::instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn register_file(
        &self,
        path: impl AsRef<Path>,
        name: Option<String>,
        mime_type: Option<String>,
    ) -> Result<UploadedFile> {
        let local_path = tokio::fs::canonicalize(path.as_ref()).await?;
        let metadata = tokio::fs::metadata(&local_path).await?;
        if !metadata.is_file() {
            return Err(UploadError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("{} is not a regular file", local_path.display()),
            )));
        }

        if self.trigger_applies(TunnelStartTrigger::OnUpload) && !self.provider_running() {
            info!("Starting tunnel for first upload");
            self.start_tunnel().await?;
        }

        let id = Uuid::new_v4().to_string();
        let original_name = name.unwrap_or_else(|| {
            local_path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| id.clone())
        });
        let mime_type = mime_type.unwrap_or_else(|| {
            mime_guess::from_path(&local_path)
                .first_or_octet_stream()
                .essence_str()
                .to_string()
        });
        let external_url = self
            .tunnel_status()
            .url
            .map(|base| file_url(&base, &id));

        let file = UploadedFile {
            id: id.clone(),
            original_name,
            local_path,
            size: metadata.len(),
            mime_type,
            uploaded_at: now_millis(),
            external_url,
            url_expires_at: None,
            is_expired: false,
        };

        self.inner.file_server.register_file(
            id,
            file.local_path.clone(),
            file.original_name.clone(),
            file.mime_type.clone(),
        );
        self.inner.tracker.track_file(file.clone());
        Ok(file)
    }

    pub fn unregister_file(&self, id: &str) -> bool {
        self.inner.tracker.untrack_file(id)
    }

    /// Starts the configured expiry countdown for each id; unknown ids are skipped.
    pub fn mark_as_sent<S: AsRef<str>>(&self, ids: &[S]) -> Vec<UploadedFile> {
        let expire_minutes = self.inner.config.read().url_expire_minutes();
        ids.iter()
            .filter_map(|id| self.inner.tracker.mark_as_sent(id.as_ref(), expire_minutes))
            .collect()
    }

    pub fn files(&self) -> Vec<UploadedFile> {
        self.inner.tracker.files()
    }

    pub fn file(&self, id: &str) -> Option<UploadedFile> {
        self.inner.tracker.file(id)
    }

    pub fn cleanup_expired(&self) -> usize {
        self.inner.tracker.cleanup_expired()
    }

    pub async fn check_binary(&self) -> BinaryStatus {
        let provisioner = self.inner.tunnel.provisioner();
        BinaryStatus {
            installed: provisioner.exists().await,
            path: provisioner.binary_path(),
            version: provisioner.version(),
        }
    }

    pub async fn download_binary(&self) -> Result<PathBuf> {
        self.inner.tunnel.download_binary().await
    }

    /// Applies the `app_start` trigger. Returns the session if one was started.
    pub async fn on_app_start(&self) -> Result<Option<ProviderSession>> {
        self.start_for(TunnelStartTrigger::AppStart).await
    }

    /// Applies the `on_enable` trigger. Returns the session if one was started.
    pub async fn on_enable(&self) -> Result<Option<ProviderSession>> {
        self.start_for(TunnelStartTrigger::OnEnable).await
    }

    async fn start_for(&self, trigger: TunnelStartTrigger) -> Result<Option<ProviderSession>> {
        if !self.trigger_applies(trigger) {
            return Ok(None);
        }
        self.start_tunnel().await.map(Some)
    }

    /// Tears everything down without waiting on the tunnel process.
    pub async fn shutdown(&self) {
        info!("Upload subsystem shutting down");
        self.cancel_auto_stop();
        if let Some(relay) = self.inner.relay.lock().take() {
            relay.cancel();
        }
        self.inner.started.lock().take();
        self.inner.tunnel.force_stop();
        self.inner.file_server.stop().await;
        self.inner.tracker.clear();
    }

    fn trigger_applies(&self, trigger: TunnelStartTrigger) -> bool {
        let config = self.inner.config.read();
        config.enabled
            && config.active_provider == ProviderKind::Cloudflare
            && config.cloudflare.enabled
            && config.cloudflare.tunnel_start_trigger == trigger
    }

    fn provider_running(&self) -> bool {
        self.tunnel_status().url.is_some()
    }

    // Keeps unsent links pointing at the live tunnel across restarts.
    fn ensure_restart_relay(&self) {
        let token = {
            let mut relay = self.inner.relay.lock();
            if relay.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *relay = Some(token.clone());
            token
        };

        let mut events = self.inner.tunnel.subscribe();
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => event,
                };
                let url = match event {
                    Ok(TunnelEvent::Restarted { url }) => url,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Restart relay lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = UploadManager::from_weak(&weak) else {
                    break;
                };
                let count = manager.inner.tracker.set_external_base(&url);
                info!(count, url = %url, "Re-based unsent links after tunnel restart");
            }
        });
    }

    fn arm_auto_stop(&self) {
        let Some(stop_after) = self.inner.config.read().auto_stop_after() else {
            return;
        };

        let token = CancellationToken::new();
        if let Some(previous) = self.inner.auto_stop.lock().replace(token.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(stop_after) => {}
            }
            if let Some(manager) = UploadManager::from_weak(&weak) {
                info!("Auto-stop timer elapsed");
                manager.stop_tunnel().await;
            }
        });
        info!(
            minutes = stop_after.as_secs() / 60,
            "Tunnel auto-stop armed"
        );
    }

    fn cancel_auto_stop(&self) {
        if let Some(token) = self.inner.auto_stop.lock().take() {
            token.cancel();
        }
    }

    pub fn auto_stop_armed(&self) -> bool {
        self.inner.auto_stop.lock().is_some()
    }
}
