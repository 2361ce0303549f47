//! Quick tunnel lifecycle: start, scheduled restart, stop.
//!
//! At most one `cloudflared` child is alive per manager. Starts are serialized
//! through an async lock so concurrent callers share one attempt, and a stop
//! cancels whatever attempt is in flight before tearing the child down.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cloudflare::{ProcessEvents, ProcessExit, TunnelProcess};
use super::{TunnelEndpoint, TunnelEvent, TunnelOptions, TunnelStatusReport};
use crate::common::{now_millis, Result, TunnelStatus, UploadError};
use crate::provision::BinaryProvisioner;
use crate::server::LocalFileServer;

const EVENT_CAPACITY: usize = 64;

#[derive(Default)]
struct State {
    status: TunnelStatus,
    url: Option<String>,
    started_at: Option<u64>,
    process: Option<TunnelProcess>,
    /// Bumped for every spawn and teardown; exits from older children are ignored.
    generation: u64,
    start_cancel: Option<CancellationToken>,
    restart_timer: Option<CancellationToken>,
}

struct Inner {
    provisioner: BinaryProvisioner,
    file_server: LocalFileServer,
    options: TunnelOptions,
    events: broadcast::Sender<TunnelEvent>,
    start_lock: tokio::sync::Mutex<()>,
    state: Mutex<State>,
}

/// Owns the `cloudflared` child that exposes a [`LocalFileServer`] publicly.
#[derive(Clone)]
pub struct TunnelManager {
    inner: Arc<Inner>,
}

impl TunnelManager {
    pub fn new(provisioner: BinaryProvisioner, file_server: LocalFileServer) -> Self {
        Self::with_options(provisioner, file_server, TunnelOptions::default())
    }

    pub fn with_options(
        provisioner: BinaryProvisioner,
        file_server: LocalFileServer,
        options: TunnelOptions,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                provisioner,
                file_server,
                options,
                events,
                start_lock: tokio::sync::Mutex::new(()),
                state: Mutex::new(State::default()),
            }),
        }
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TunnelEvent> {
        self.inner.events.subscribe()
    }

    pub fn file_server(&self) -> &LocalFileServer {
        &self.inner.file_server
    }

    pub fn provisioner(&self) -> &BinaryProvisioner {
        &self.inner.provisioner
    }

    pub fn options(&self) -> &TunnelOptions {
        &self.inner.options
    }

    pub fn status(&self) -> TunnelStatusReport {
        let state = self.inner.state.lock();
        TunnelStatusReport {
            status: state.status,
            url: state.url.clone(),
            started_at: state.started_at,
            port: self.inner.file_server.port(),
        }
    }

    pub fn url(&self) -> Option<String> {
        self.inner.state.lock().url.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.lock().status == TunnelStatus::Running
    }

    /// Brings the tunnel up, downloading `cloudflared` first if needed.
    ///
    /// Returns the existing endpoint when already running. Concurrent callers
    /// wait for the attempt in flight and observe its outcome.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<TunnelEndpoint> {
        let _guard = self.inner.start_lock.lock().await;
        if let Some(endpoint) = self.running_endpoint() {
            return Ok(endpoint);
        }

        let cancel = CancellationToken::new();
        self.inner.state.lock().start_cancel = Some(cancel.clone());
        self.start_locked(cancel).await
    }

    /// Replaces the running tunnel with a fresh one and returns the new URL.
    ///
    /// Links built on the previous URL stop working.
    #[tracing::instrument(skip(self))]
    pub async fn restart(&self) -> Result<String> {
        if self.inner.state.lock().status == TunnelStatus::Starting {
            return Err(UploadError::AlreadyStarting);
        }

        let _guard = self.inner.start_lock.lock().await;
        self.restart_locked().await
    }

    // A timer that fired just before a stop may still be queued on the lock.
    async fn scheduled_restart(&self, timer: CancellationToken) -> Result<String> {
        let _guard = self.inner.start_lock.lock().await;
        if timer.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.restart_locked().await
    }

    async fn restart_locked(&self) -> Result<String> {
        info!("Restarting tunnel");

        let cancel = CancellationToken::new();
        self.inner.state.lock().start_cancel = Some(cancel.clone());
        self.set_status(TunnelStatus::Restarting, None);
        self.teardown().await;

        let endpoint = self.start_locked(cancel).await?;
        info!(url = %endpoint.url, "Tunnel restarted");
        self.emit(TunnelEvent::Restarted {
            url: endpoint.url.clone(),
        });
        Ok(endpoint.url)
    }

    /// Gracefully stops the tunnel, cancelling any start in flight.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if let Some(cancel) = state.start_cancel.take() {
                cancel.cancel();
            }
            if let Some(timer) = state.restart_timer.take() {
                timer.cancel();
            }
        }

        let _guard = self.inner.start_lock.lock().await;
        self.teardown().await;
        if self.inner.state.lock().status != TunnelStatus::Stopped {
            self.set_status(TunnelStatus::Stopped, None);
        }
    }

    /// Kills the child without waiting. Used on application exit.
    pub fn force_stop(&self) {
        let process = {
            let mut state = self.inner.state.lock();
            if let Some(cancel) = state.start_cancel.take() {
                cancel.cancel();
            }
            if let Some(timer) = state.restart_timer.take() {
                timer.cancel();
            }
            state.generation += 1;
            state.url = None;
            state.started_at = None;
            state.status = TunnelStatus::Stopped;
            state.process.take()
        };

        if let Some(process) = process {
            info!(pid = ?process.pid(), "Force stopping tunnel");
            process.kill();
        }
        self.emit(TunnelEvent::StatusChanged {
            status: TunnelStatus::Stopped,
            url: None,
        });
    }

    /// Downloads `cloudflared`, broadcasting progress as [`TunnelEvent::DownloadProgress`].
    pub async fn download_binary(&self) -> Result<PathBuf> {
        let events = self.inner.events.clone();
        self.inner
            .provisioner
            .download(move |percent| {
                let _ = events.send(TunnelEvent::DownloadProgress { percent });
            })
            .await
    }

    fn running_endpoint(&self) -> Option<TunnelEndpoint> {
        let state = self.inner.state.lock();
        if state.status != TunnelStatus::Running || state.process.is_none() {
            return None;
        }
        let url = state.url.clone()?;
        let port = self.inner.file_server.port()?;
        Some(TunnelEndpoint { url, port })
    }

    // Caller holds `start_lock`.
    async fn start_locked(&self, cancel: CancellationToken) -> Result<TunnelEndpoint> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        self.set_status(TunnelStatus::Starting, None);

        let attempt = tokio::select! {
            result = self.launch(&cancel) => result,
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
        };

        // only installed under `start_lock`, so the slot holds this attempt's token or nothing
        self.inner.state.lock().start_cancel = None;

        match attempt {
            Ok(endpoint) => Ok(endpoint),
            // the canceller owns teardown and the final status
            Err(UploadError::Cancelled) => {
                info!("Tunnel start cancelled");
                Err(UploadError::Cancelled)
            }
            Err(err) => {
                warn!("Tunnel start failed: {}", err);
                self.teardown().await;
                let status = match err {
                    UploadError::TunnelTimeout => TunnelStatus::Stopped,
                    _ => TunnelStatus::Error,
                };
                self.set_status(status, None);
                Err(err)
            }
        }
    }

    async fn launch(&self, cancel: &CancellationToken) -> Result<TunnelEndpoint> {
        let inner = &self.inner;

        if !inner.provisioner.exists().await {
            info!("cloudflared not installed, downloading");
            self.download_binary().await?;
        }

        let port = inner.file_server.start().await?;
        let (process, mut events) = TunnelProcess::spawn(&inner.provisioner.binary_path(), port)?;

        let generation = {
            let mut state = inner.state.lock();
            // force_stop cancels under this lock; never adopt a child after it ran
            if cancel.is_cancelled() {
                process.kill();
                return Err(UploadError::Cancelled);
            }
            state.generation += 1;
            state.process = Some(process);
            state.generation
        };

        let url = events.wait_for_url(inner.options.url_timeout).await?;

        {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return Err(UploadError::Cancelled);
            }
            state.url = Some(url.clone());
            state.started_at = Some(now_millis());
        }

        self.watch_exit(generation, events);
        self.set_status(TunnelStatus::Running, Some(url.clone()));
        self.schedule_restart();
        info!(url = %url, port, "Tunnel running");

        Ok(TunnelEndpoint { url, port })
    }

    fn watch_exit(&self, generation: u64, events: ProcessEvents) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let exit = events.wait_for_exit().await;
            if let Some(manager) = TunnelManager::from_weak(&weak) {
                manager.handle_exit(generation, exit);
            }
        });
    }

    fn handle_exit(&self, generation: u64, exit: ProcessExit) {
        if exit.requested {
            return;
        }

        let notify = {
            let mut state = self.inner.state.lock();
            if state.generation != generation {
                debug!(status = %exit.status, "Ignoring exit of superseded tunnel process");
                return;
            }
            warn!(status = %exit.status, "Tunnel process exited unexpectedly");
            state.process = None;
            state.url = None;
            state.started_at = None;
            if let Some(timer) = state.restart_timer.take() {
                timer.cancel();
            }
            state.status != TunnelStatus::Restarting
        };

        if notify {
            self.set_status(TunnelStatus::Stopped, None);
        }
    }

    fn schedule_restart(&self) {
        let delay = self.inner.options.restart_after();
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.state.lock().restart_timer.replace(token.clone()) {
            previous.cancel();
        }

        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(manager) = TunnelManager::from_weak(&weak) else {
                return;
            };
            info!("Scheduled tunnel restart triggered");
            match manager.scheduled_restart(token).await {
                Ok(_) => {}
                Err(UploadError::Cancelled) => debug!("Scheduled restart superseded by stop"),
                Err(e) => warn!("Scheduled tunnel restart failed: {}", e),
            }
        });

        info!(
            minutes = delay.as_secs() / 60,
            "Tunnel restart scheduled"
        );
    }

    /// Terminates the current child and clears URL and timer state.
    async fn teardown(&self) {
        let process = {
            let mut state = self.inner.state.lock();
            if let Some(timer) = state.restart_timer.take() {
                timer.cancel();
            }
            state.generation += 1;
            state.url = None;
            state.started_at = None;
            state.process.take()
        };

        if let Some(process) = process {
            info!(pid = ?process.pid(), "Stopping tunnel process");
            process.terminate(self.inner.options.stop_grace).await;
        }
    }

    fn set_status(&self, status: TunnelStatus, url: Option<String>) {
        self.inner.state.lock().status = status;
        debug!(%status, "Tunnel status changed");
        self.emit(TunnelEvent::StatusChanged { status, url });
    }

    fn emit(&self, event: TunnelEvent) {
        // no receivers is fine
        let _ = self.inner.events.send(event);
    }
}
