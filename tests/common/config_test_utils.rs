use axon_upload::common::ConfigStore;
use std::ffi::OsString;
use std::sync::{Mutex, OnceLock};
use tempfile::TempDir;

const ENV_PREFIX: &str = "AXON_UPLOAD_";

fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

struct EnvRestore {
    saved: Vec<(OsString, OsString)>,
}

impl EnvRestore {
    fn capture() -> Self {
        let saved: Vec<(OsString, OsString)> = std::env::vars_os()
            .filter(|(key, _)| key.to_string_lossy().starts_with(ENV_PREFIX))
            .collect();
        for (key, _) in &saved {
            std::env::remove_var(key);
        }
        Self { saved }
    }
}

impl Drop for EnvRestore {
    fn drop(&mut self) {
        let leaked: Vec<OsString> = std::env::vars_os()
            .map(|(key, _)| key)
            .filter(|key| key.to_string_lossy().starts_with(ENV_PREFIX))
            .collect();
        for key in leaked {
            std::env::remove_var(key);
        }
        for (key, value) in self.saved.drain(..) {
            std::env::set_var(key, value);
        }
    }
}

/// Runs `f` against a store in a scratch dir, with `AXON_UPLOAD_*` cleared.
///
/// `contents` is written as the config file when present.
pub fn with_config_env<T>(contents: Option<&str>, f: impl FnOnce(&ConfigStore) -> T) -> T {
    let _guard = env_lock().lock().unwrap_or_else(|e| e.into_inner());
    let temp_dir = TempDir::new().expect("temp dir");
    let path = temp_dir.path().join("axon").join("axon_upload.json");

    if let Some(contents) = contents {
        std::fs::create_dir_all(path.parent().expect("parent")).expect("create config dir");
        std::fs::write(&path, contents).expect("write config");
    }

    let restore = EnvRestore::capture();
    let result = f(&ConfigStore::new(path));
    drop(restore);
    result
}
