//! In-memory table of files exposed by the local server.

use dashmap::DashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::common::MAX_COUNTDOWN;

/// One registered file, keyed by an opaque id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServedFile {
    pub id: String,
    pub local_path: PathBuf,
    pub display_name: String,
    pub mime_type: String,
    pub expires_at: Option<Instant>,
}

impl ServedFile {
    /// Expiry is inclusive: a zero-length countdown is already expired.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

/// Result of resolving an id for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileLookup {
    Missing,
    Expired,
    Available(ServedFile),
}

/// Shared, cloneable view of the served-file map.
#[derive(Debug, Clone, Default)]
pub struct FileRegistry {
    files: Arc<DashMap<String, ServedFile>>,
}

impl FileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts with no expiry, replacing any entry under the same id.
    pub fn register(
        &self,
        id: impl Into<String>,
        local_path: impl Into<PathBuf>,
        display_name: impl Into<String>,
        mime_type: impl Into<String>,
    ) {
        let id = id.into();
        let file = ServedFile {
            id: id.clone(),
            local_path: local_path.into(),
            display_name: display_name.into(),
            mime_type: mime_type.into(),
            expires_at: None,
        };
        tracing::info!(id = %id, name = %file.display_name, "File registered");
        self.files.insert(id, file);
    }

    /// Starts the expiry countdown; unknown ids are ignored.
    ///
    /// Countdowns longer than [`MAX_COUNTDOWN`] are clamped to it.
    pub fn mark_as_sent(&self, id: &str, expire_after: Duration) -> Option<Instant> {
        let mut entry = self.files.get_mut(id)?;
        let expire_after = expire_after.min(MAX_COUNTDOWN);
        let expires_at = Instant::now() + expire_after;
        entry.expires_at = Some(expires_at);
        tracing::info!(
            id,
            expire_secs = expire_after.as_secs(),
            "File marked as sent"
        );
        Some(expires_at)
    }

    pub fn unregister(&self, id: &str) -> bool {
        let removed = self.files.remove(id).is_some();
        if removed {
            tracing::info!(id, "File unregistered");
        }
        removed
    }

    /// Resolves `id`, evicting the entry if its countdown has run out.
    pub fn lookup(&self, id: &str) -> FileLookup {
        let now = Instant::now();
        match self.files.get(id) {
            None => return FileLookup::Missing,
            Some(file) if !file.is_expired_at(now) => return FileLookup::Available(file.clone()),
            Some(_) => {}
        }

        // read guard is released; re-check under the shard write lock
        if self.files.remove_if(id, |_, f| f.is_expired_at(now)).is_some() {
            tracing::debug!(id, "Evicted expired file on access");
        }
        FileLookup::Expired
    }

    pub fn get(&self, id: &str) -> Option<ServedFile> {
        self.files.get(id).map(|f| f.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.files.contains_key(id)
    }

    /// Removes every entry past its expiry and returns how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.files.len();
        self.files.retain(|_, file| !file.is_expired_at(now));
        let count = before.saturating_sub(self.files.len());
        if count > 0 {
            tracing::info!(count, "Cleaned up expired file(s)");
        }
        count
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&self) {
        self.files.clear();
    }
}
