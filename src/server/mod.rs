//! Loopback HTTP server for registered files.

pub mod handlers;
pub mod registry;
pub mod routes;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::common::{minutes, Result};
use crate::transport::local::start_local_server;
pub use registry::{FileLookup, FileRegistry, ServedFile};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

struct Listener {
    port: u16,
    handle: axum_server::Handle,
}

/// Serves registered files under `/files/:id` on an ephemeral loopback port.
///
/// Cloning yields another handle to the same server and file table.
#[derive(Clone, Default)]
pub struct LocalFileServer {
    files: FileRegistry,
    listener: Arc<Mutex<Option<Listener>>>,
    port: Arc<AtomicU16>,
}

impl LocalFileServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds the listener, or returns the already-bound port.
    pub async fn start(&self) -> Result<u16> {
        let mut listener = self.listener.lock().await;
        if let Some(active) = listener.as_ref() {
            return Ok(active.port);
        }

        let app = routes::create_file_router(&self.files);
        let (port, handle) = start_local_server(app, 0)?;
        tracing::info!(port, "File server started");

        self.port.store(port, Ordering::SeqCst);
        *listener = Some(Listener { port, handle });
        Ok(port)
    }

    /// Closes the listener and forgets every registered file.
    pub async fn stop(&self) {
        let mut listener = self.listener.lock().await;
        if let Some(active) = listener.take() {
            active.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            tracing::info!(port = active.port, "File server stopped");
        }
        self.files.clear();
        self.port.store(0, Ordering::SeqCst);
    }

    pub fn port(&self) -> Option<u16> {
        match self.port.load(Ordering::SeqCst) {
            0 => None,
            port => Some(port),
        }
    }

    pub fn is_running(&self) -> bool {
        self.port().is_some()
    }

    pub fn register_file(
        &self,
        id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        name: impl Into<String>,
        mime_type: impl Into<String>,
    ) {
        self.files.register(id, local_path, name, mime_type);
    }

    pub fn mark_as_sent(&self, id: &str, expire_minutes: u64) {
        self.files.mark_as_sent(id, minutes(expire_minutes));
    }

    pub fn unregister_file(&self, id: &str) {
        self.files.unregister(id);
    }

    pub fn cleanup_expired(&self) -> usize {
        self.files.cleanup_expired()
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    pub fn files(&self) -> &FileRegistry {
        &self.files
    }

    /// Router over this server's file table, for in-process requests.
    pub fn router(&self) -> axum::Router {
        routes::create_file_router(&self.files)
    }
}
