mod common;

use axon_upload::common::{now_millis, UploadedFile};
use axon_upload::{LocalFileServer, UrlTracker};
use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use std::path::Path;
use std::time::Duration;
use tower::ServiceExt;

fn share(server: &LocalFileServer, tracker: &UrlTracker, id: &str, path: &Path) {
    server.register_file(id, path, "notes.txt", "text/plain");
    tracker.track_file(UploadedFile {
        id: id.to_string(),
        original_name: "notes.txt".to_string(),
        local_path: path.to_path_buf(),
        size: 5,
        mime_type: "text/plain".to_string(),
        uploaded_at: now_millis(),
        external_url: None,
        url_expires_at: None,
        is_expired: false,
    });
}

async fn fetch_status(server: &LocalFileServer, id: &str) -> StatusCode {
    let request = Request::builder()
        .uri(format!("/files/{id}"))
        .body(Body::empty())
        .expect("valid request");
    server
        .router()
        .oneshot(request)
        .await
        .expect("response")
        .status()
}

#[tokio::test(start_paused = true)]
async fn sent_link_expires_after_its_countdown() {
    let dir = common::setup_temp_dir();
    let path = common::write_file(dir.path(), "notes.txt", b"notes");
    let server = LocalFileServer::new();
    let tracker = UrlTracker::new(server.clone());
    share(&server, &tracker, "f1", &path);

    tracker.mark_as_sent("f1", 1);
    assert!(tracker.file("f1").is_some());
    assert_eq!(fetch_status(&server, "f1").await, StatusCode::OK);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(tracker.file("f1").is_some(), "still inside the countdown");

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(tracker.file("f1").is_none());
    assert!(!server.files().contains("f1"));
    assert_eq!(fetch_status(&server, "f1").await, StatusCode::NOT_FOUND);
}

#[tokio::test(start_paused = true)]
async fn untracking_before_expiry_disarms_the_timer() {
    let dir = common::setup_temp_dir();
    let path = common::write_file(dir.path(), "notes.txt", b"notes");
    let server = LocalFileServer::new();
    let tracker = UrlTracker::new(server.clone());
    share(&server, &tracker, "f1", &path);
    tracker.mark_as_sent("f1", 1);

    assert!(tracker.untrack_file("f1"));
    assert_eq!(fetch_status(&server, "f1").await, StatusCode::NOT_FOUND);

    // re-register under the same id; the old countdown must not touch it
    share(&server, &tracker, "f1", &path);
    tokio::time::sleep(Duration::from_secs(120)).await;

    assert!(tracker.file("f1").is_some());
    assert_eq!(fetch_status(&server, "f1").await, StatusCode::OK);
}

#[tokio::test(start_paused = true)]
async fn never_sent_files_survive_sweeps() {
    let dir = common::setup_temp_dir();
    let path = common::write_file(dir.path(), "notes.txt", b"notes");
    let server = LocalFileServer::new();
    let tracker = UrlTracker::with_cleanup_interval(server.clone(), Duration::from_secs(60));
    share(&server, &tracker, "kept", &path);
    share(&server, &tracker, "sent", &path);
    tracker.mark_as_sent("sent", 5);
    tracker.start_cleanup_interval();

    tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;

    assert!(tracker.file("kept").is_some());
    assert!(tracker.file("sent").is_none());
    assert_eq!(server.file_count(), 1);
    tracker.clear();
}

#[tokio::test(start_paused = true)]
async fn manual_cleanup_reports_removed_count() {
    let dir = common::setup_temp_dir();
    let path = common::write_file(dir.path(), "notes.txt", b"notes");
    let server = LocalFileServer::new();
    let tracker = UrlTracker::new(server.clone());
    for id in ["a", "b", "c"] {
        share(&server, &tracker, id, &path);
    }
    tracker.mark_as_sent("a", 0);
    tracker.mark_as_sent("b", 0);

    assert_eq!(tracker.cleanup_expired(), 2);
    assert_eq!(tracker.len(), 1);
    assert_eq!(server.file_count(), 1);
    assert_eq!(tracker.cleanup_expired(), 0);
}
