#![allow(dead_code)]

pub mod config_test_utils;

use axon_upload::common::TunnelStatus;
use axon_upload::TunnelManager;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

pub fn setup_temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temp directory")
}

pub fn write_file(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write test file");
    path
}

pub async fn response_text(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body should be readable");
    String::from_utf8(bytes.to_vec()).expect("body should be valid UTF-8")
}

/// Prints a quick tunnel URL unique to this process, then idles.
pub const HEALTHY_TUNNEL: &str = r#"#!/bin/sh
echo "INF Requesting new quick Tunnel on trycloudflare.com..." >&2
echo "INF |  https://fake-$$.trycloudflare.com  |" >&2
exec sleep 600
"#;

/// Never prints a URL.
pub const SILENT_TUNNEL: &str = "#!/bin/sh\nexec sleep 600\n";

/// Fails before a URL is assigned.
pub const FAILING_TUNNEL: &str = r#"#!/bin/sh
echo "ERR failed to request quick Tunnel: 429 Too Many Requests" >&2
exit 1
"#;

/// Gets a URL, then dies shortly after.
pub const CRASHING_TUNNEL: &str = r#"#!/bin/sh
echo "INF |  https://crash-$$.trycloudflare.com  |" >&2
sleep 1
exit 3
"#;

/// Takes a while to get a URL.
pub const SLOW_TUNNEL: &str = r#"#!/bin/sh
sleep 2
echo "INF |  https://slow-$$.trycloudflare.com  |" >&2
exec sleep 600
"#;

/// Ignores SIGTERM, so stop has to escalate.
pub const STUBBORN_TUNNEL: &str = r#"#!/bin/sh
trap '' TERM
echo "INF |  https://stubborn-$$.trycloudflare.com  |" >&2
while true; do sleep 1; done
"#;

/// Installs `script` as `<dir>/cloudflared` with the executable bit set.
#[cfg(unix)]
pub fn install_fake_cloudflared(dir: &Path, script: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("cloudflared");
    std::fs::write(&path, script).expect("write fake cloudflared");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod fake cloudflared");
    path
}

pub async fn wait_for_status(manager: &TunnelManager, status: TunnelStatus) {
    let waited = tokio::time::timeout(Duration::from_secs(10), async {
        while manager.status().status != status {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(
        waited.is_ok(),
        "tunnel never reached {status}, still {}",
        manager.status().status
    );
}
