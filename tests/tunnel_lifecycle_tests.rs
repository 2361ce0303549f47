#![cfg(unix)]

mod common;

use axon_upload::common::TunnelStatus;
use axon_upload::transport::find_tunnel_url;
use axon_upload::{
    BinaryProvisioner, LocalFileServer, TunnelEvent, TunnelManager, TunnelOptions, UploadError,
};
use common::{install_fake_cloudflared, setup_temp_dir, wait_for_status};
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;

fn fast_options() -> TunnelOptions {
    TunnelOptions {
        url_timeout: Duration::from_secs(5),
        max_duration: Duration::from_secs(8 * 60 * 60),
        restart_buffer: Duration::from_secs(10 * 60),
        stop_grace: Duration::from_secs(2),
    }
}

fn manager_with(dir: &Path, script: &str, options: TunnelOptions) -> TunnelManager {
    install_fake_cloudflared(dir, script);
    // no download record: a missing binary would surface as UnsupportedPlatform
    let provisioner = BinaryProvisioner::with_record(dir, None);
    TunnelManager::with_options(provisioner, LocalFileServer::new(), options)
}

async fn next_matching(
    events: &mut broadcast::Receiver<TunnelEvent>,
    wanted: impl Fn(&TunnelEvent) -> bool,
) -> TunnelEvent {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

#[tokio::test]
async fn start_exposes_the_local_server() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, fast_options());

    let endpoint = manager.start().await.expect("start");

    assert_eq!(find_tunnel_url(&endpoint.url), Some(endpoint.url.as_str()));
    assert_eq!(Some(endpoint.port), manager.file_server().port());
    let report = manager.status();
    assert_eq!(report.status, TunnelStatus::Running);
    assert_eq!(report.url.as_deref(), Some(endpoint.url.as_str()));
    assert!(report.started_at.is_some());

    let health = reqwest::get(format!("http://127.0.0.1:{}/health", endpoint.port))
        .await
        .expect("health request");
    assert_eq!(health.text().await.expect("health body"), "OK");

    manager.stop().await;
    assert_eq!(manager.status().status, TunnelStatus::Stopped);
    assert!(manager.url().is_none());
}

#[tokio::test]
async fn concurrent_starts_share_one_process() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, fast_options());

    let (first, second) = tokio::join!(manager.start(), manager.start());
    let first = first.expect("first start");
    let second = second.expect("second start");

    // the URL embeds the child's pid, so equal URLs mean one child
    assert_eq!(first.url, second.url);
    assert_eq!(manager.start().await.expect("third start").url, first.url);

    manager.stop().await;
}

#[tokio::test]
async fn url_timeout_stops_the_half_started_process() {
    let dir = setup_temp_dir();
    let options = TunnelOptions {
        url_timeout: Duration::from_millis(300),
        ..fast_options()
    };
    let manager = manager_with(dir.path(), common::SILENT_TUNNEL, options);

    let err = manager.start().await.expect_err("no URL is ever printed");

    assert!(matches!(err, UploadError::TunnelTimeout));
    assert_eq!(manager.status().status, TunnelStatus::Stopped);
    assert!(manager.url().is_none());
}

#[tokio::test]
async fn early_exit_is_reported_as_error() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::FAILING_TUNNEL, fast_options());

    let err = manager.start().await.expect_err("child exits before URL");

    assert!(matches!(err, UploadError::ProcessExited(_)));
    assert_eq!(manager.status().status, TunnelStatus::Error);
}

#[tokio::test]
async fn missing_binary_without_download_target_errors() {
    let dir = setup_temp_dir();
    let provisioner = BinaryProvisioner::with_record(dir.path(), None);
    let manager = TunnelManager::with_options(provisioner, LocalFileServer::new(), fast_options());

    let err = manager.start().await.expect_err("nothing to run");

    assert!(matches!(err, UploadError::UnsupportedPlatform { .. }));
    assert_eq!(manager.status().status, TunnelStatus::Error);
}

#[tokio::test]
async fn stop_while_starting_cancels_cleanly() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::SLOW_TUNNEL, fast_options());

    let starting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start().await }
    });
    wait_for_status(&manager, TunnelStatus::Starting).await;

    manager.stop().await;

    let result = starting.await.expect("start task");
    assert!(matches!(result, Err(UploadError::Cancelled)));
    assert_eq!(manager.status().status, TunnelStatus::Stopped);

    let endpoint = manager.start().await.expect("start after cancelled start");
    assert!(endpoint.url.starts_with("https://slow-"));
    manager.stop().await;
}

#[tokio::test]
async fn restart_while_starting_is_rejected() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::SLOW_TUNNEL, fast_options());

    let starting = tokio::spawn({
        let manager = manager.clone();
        async move { manager.start().await }
    });
    wait_for_status(&manager, TunnelStatus::Starting).await;

    let err = manager.restart().await.expect_err("start in flight");
    assert!(matches!(err, UploadError::AlreadyStarting));

    starting.await.expect("start task").expect("start");
    manager.stop().await;
}

#[tokio::test]
async fn unexpected_exit_moves_to_stopped() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::CRASHING_TUNNEL, fast_options());
    let mut events = manager.subscribe();

    manager.start().await.expect("start");
    next_matching(&mut events, |e| {
        matches!(e, TunnelEvent::StatusChanged { status: TunnelStatus::Stopped, .. })
    })
    .await;

    let report = manager.status();
    assert_eq!(report.status, TunnelStatus::Stopped);
    assert!(report.url.is_none());
    assert!(report.started_at.is_none());
}

#[tokio::test]
async fn scheduled_restart_replaces_the_url() {
    let dir = setup_temp_dir();
    let options = TunnelOptions {
        max_duration: Duration::from_millis(1500),
        restart_buffer: Duration::from_millis(1000),
        ..fast_options()
    };
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, options);
    let mut events = manager.subscribe();

    let first = manager.start().await.expect("start").url;
    let restarted = next_matching(&mut events, |e| matches!(e, TunnelEvent::Restarted { .. })).await;

    let TunnelEvent::Restarted { url } = restarted else {
        unreachable!("filtered above");
    };
    assert_ne!(url, first);
    assert_eq!(manager.status().status, TunnelStatus::Running);

    manager.stop().await;
}

#[tokio::test]
async fn stop_disarms_the_restart_timer() {
    let dir = setup_temp_dir();
    let options = TunnelOptions {
        max_duration: Duration::from_millis(1500),
        restart_buffer: Duration::from_millis(1000),
        ..fast_options()
    };
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, options);

    manager.start().await.expect("start");
    manager.stop().await;
    let mut events = manager.subscribe();

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(manager.status().status, TunnelStatus::Stopped);
    assert!(
        matches!(events.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
        "no lifecycle activity after stop"
    );
}

#[tokio::test]
async fn manual_restart_emits_new_url() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, fast_options());

    let first = manager.start().await.expect("start").url;
    let mut events = manager.subscribe();
    let second = manager.restart().await.expect("restart");

    assert_ne!(first, second);
    let restarted = next_matching(&mut events, |e| matches!(e, TunnelEvent::Restarted { .. })).await;
    assert_eq!(restarted, TunnelEvent::Restarted { url: second.clone() });
    assert_eq!(manager.url().as_deref(), Some(second.as_str()));

    manager.stop().await;
}

#[tokio::test]
async fn stop_escalates_when_sigterm_is_ignored() {
    let dir = setup_temp_dir();
    let options = TunnelOptions {
        stop_grace: Duration::from_millis(300),
        ..fast_options()
    };
    let manager = manager_with(dir.path(), common::STUBBORN_TUNNEL, options);
    manager.start().await.expect("start");

    tokio::time::timeout(Duration::from_secs(5), manager.stop())
        .await
        .expect("stop must not hang on a stubborn child");
    assert_eq!(manager.status().status, TunnelStatus::Stopped);
}

#[tokio::test]
async fn force_stop_is_idempotent() {
    let dir = setup_temp_dir();
    let manager = manager_with(dir.path(), common::HEALTHY_TUNNEL, fast_options());
    manager.force_stop();

    manager.start().await.expect("start");
    manager.force_stop();
    manager.force_stop();

    assert_eq!(manager.status().status, TunnelStatus::Stopped);
    assert!(manager.url().is_none());
    manager.start().await.expect("start after force stop");
    manager.stop().await;
}
