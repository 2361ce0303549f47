//! Expiry tracking for shared file links.
//!
//! A tracked file never expires on its own. Marking it as sent starts a
//! one-shot countdown; when it fires the file is dropped from both the tracker
//! and the [`LocalFileServer`], so a link outlives neither.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::common::{file_url, millis_after, minutes, UploadedFile};
use crate::server::LocalFileServer;

pub const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

struct TrackedFile {
    file: UploadedFile,
    expires_at: Option<Instant>,
    expiry_timer: Option<CancellationToken>,
}

impl TrackedFile {
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.expiry_timer.take() {
            timer.cancel();
        }
    }
}

struct Inner {
    server: LocalFileServer,
    files: Mutex<HashMap<String, TrackedFile>>,
    sweep: Mutex<Option<CancellationToken>>,
    sweep_every: Duration,
}

/// Tracks shared files and evicts them once their links expire.
///
/// Timers are tokio tasks, so mutating calls must run inside a runtime.
#[derive(Clone)]
pub struct UrlTracker {
    inner: Arc<Inner>,
}

impl UrlTracker {
    pub fn new(server: LocalFileServer) -> Self {
        Self::with_cleanup_interval(server, CLEANUP_INTERVAL)
    }

    pub fn with_cleanup_interval(server: LocalFileServer, sweep_every: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                files: Mutex::new(HashMap::new()),
                sweep: Mutex::new(None),
                sweep_every,
            }),
        }
    }

    fn from_weak(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn track_file(&self, file: UploadedFile) {
        debug!(id = %file.id, name = %file.original_name, "Tracking file");
        let id = file.id.clone();
        let previous = self.inner.files.lock().insert(
            id,
            TrackedFile {
                file,
                expires_at: None,
                expiry_timer: None,
            },
        );
        if let Some(mut previous) = previous {
            previous.cancel_timer();
        }
    }

    /// Starts the expiry countdown for `id` and mirrors it into the file server.
    ///
    /// Re-marking replaces the previous countdown. Unknown ids are ignored.
    pub fn mark_as_sent(&self, id: &str, expire_minutes: u64) -> Option<UploadedFile> {
        let expire_after = minutes(expire_minutes);
        let timer = CancellationToken::new();

        let updated = {
            let mut files = self.inner.files.lock();
            let tracked = files.get_mut(id)?;
            tracked.cancel_timer();
            tracked.expires_at = Some(Instant::now() + expire_after);
            tracked.expiry_timer = Some(timer.clone());
            tracked.file.url_expires_at = Some(millis_after(expire_after));
            tracked.file.is_expired = false;
            tracked.file.clone()
        };

        self.inner.server.mark_as_sent(id, expire_minutes);
        self.arm_expiry(id.to_string(), expire_after, timer);
        info!(id, expire_minutes, "Link marked as sent");
        Some(updated)
    }

    fn arm_expiry(&self, id: String, expire_after: Duration, timer: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => return,
                _ = tokio::time::sleep(expire_after) => {}
            }
            if let Some(tracker) = UrlTracker::from_weak(&weak) {
                tracker.expire(&id);
            }
        });
    }

    fn expire(&self, id: &str) {
        let now = Instant::now();
        let removed = {
            let mut files = self.inner.files.lock();
            // a re-mark may have pushed the deadline out after this timer woke
            match files.get(id) {
                Some(tracked) if tracked.is_expired_at(now) => files.remove(id),
                _ => None,
            }
        };

        if removed.is_some() {
            self.inner.server.unregister_file(id);
            info!(id, "Link expired");
        }
    }

    /// Drops every record past its expiry, then sweeps the file server.
    ///
    /// Returns the combined number of removed entries.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = {
            let mut files = self.inner.files.lock();
            let ids: Vec<String> = files
                .iter()
                .filter(|(_, tracked)| tracked.is_expired_at(now))
                .map(|(id, _)| id.clone())
                .collect();
            for id in &ids {
                if let Some(mut tracked) = files.remove(id) {
                    tracked.cancel_timer();
                }
            }
            ids
        };

        for id in &expired {
            self.inner.server.unregister_file(id);
        }
        let count = expired.len() + self.inner.server.cleanup_expired();
        if count > 0 {
            info!(count, "Removed expired links");
        }
        count
    }

    /// Forgets `id` everywhere, cancelling its countdown.
    pub fn untrack_file(&self, id: &str) -> bool {
        let removed = self.inner.files.lock().remove(id);
        self.inner.server.unregister_file(id);
        match removed {
            Some(mut tracked) => {
                tracked.cancel_timer();
                debug!(id, "Untracked file");
                true
            }
            None => false,
        }
    }

    /// Cancels all timers, including the periodic sweep, and drops every record.
    pub fn clear(&self) {
        self.stop_cleanup_interval();
        let mut files = self.inner.files.lock();
        for tracked in files.values_mut() {
            tracked.cancel_timer();
        }
        files.clear();
    }

    /// Runs [`cleanup_expired`](Self::cleanup_expired) periodically. No-op if already running.
    pub fn start_cleanup_interval(&self) {
        let token = {
            let mut sweep = self.inner.sweep.lock();
            if sweep.is_some() {
                return;
            }
            let token = CancellationToken::new();
            *sweep = Some(token.clone());
            token
        };

        let every = self.inner.sweep_every;
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(tracker) = UrlTracker::from_weak(&weak) else {
                    break;
                };
                tracker.cleanup_expired();
            }
        });
        debug!(secs = every.as_secs(), "Cleanup interval started");
    }

    pub fn stop_cleanup_interval(&self) {
        if let Some(token) = self.inner.sweep.lock().take() {
            token.cancel();
            debug!("Cleanup interval stopped");
        }
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.sweep.lock().is_some()
    }

    /// Points links of files not yet marked as sent at a new tunnel URL.
    ///
    /// Sent links keep the URL they were shared with. Returns how many records changed.
    pub fn set_external_base(&self, base_url: &str) -> usize {
        let mut files = self.inner.files.lock();
        let mut count = 0;
        for (id, tracked) in files.iter_mut() {
            if tracked.file.is_sent() {
                continue;
            }
            tracked.file.external_url = Some(file_url(base_url, id));
            count += 1;
        }
        count
    }

    /// Snapshot of tracked files, oldest first.
    pub fn files(&self) -> Vec<UploadedFile> {
        let mut files: Vec<UploadedFile> = self
            .inner
            .files
            .lock()
            .values()
            .map(|tracked| tracked.file.clone())
            .collect();
        files.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then_with(|| a.id.cmp(&b.id)));
        files
    }

    pub fn file(&self, id: &str) -> Option<UploadedFile> {
        self.inner.files.lock().get(id).map(|tracked| tracked.file.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.files.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.files.lock().is_empty()
    }
}
