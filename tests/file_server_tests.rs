mod common;

use axon_upload::LocalFileServer;
use axum::{
    body::Body,
    http::{header, Request, StatusCode},
};
use common::{response_text, setup_temp_dir, write_file};
use tower::ServiceExt;

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("valid request")
}

#[tokio::test]
async fn registered_file_is_served_inline() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "a.txt", b"hello");
    let server = LocalFileServer::new();
    server.register_file("f1", &path, "a.txt", "text/plain");

    let response = server.router().oneshot(get("/files/f1")).await.expect("response");

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers();
    assert_eq!(
        headers
            .get(header::CONTENT_DISPOSITION)
            .expect("content-disposition header")
            .to_str()
            .expect("header value is valid UTF-8"),
        "inline; filename=\"a.txt\""
    );
    assert_eq!(
        headers
            .get(header::CONTENT_TYPE)
            .expect("content-type header")
            .to_str()
            .expect("header value is valid UTF-8"),
        "text/plain"
    );
    assert_eq!(
        headers
            .get(header::CONTENT_LENGTH)
            .expect("content-length header")
            .to_str()
            .expect("header value is valid UTF-8"),
        "5"
    );
    assert_eq!(response_text(response).await, "hello");
}

#[tokio::test]
async fn unregistered_file_is_not_found() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "a.txt", b"hello");
    let server = LocalFileServer::new();
    server.register_file("f1", &path, "a.txt", "text/plain");
    server.unregister_file("f1");

    let response = server.router().oneshot(get("/files/f1")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = server.router().oneshot(get("/files/never")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn zero_minute_mark_is_gone_then_not_found() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "b.txt", b"bye");
    let server = LocalFileServer::new();
    server.register_file("f2", &path, "b.txt", "text/plain");
    server.mark_as_sent("f2", 0);

    let response = server.router().oneshot(get("/files/f2")).await.expect("response");
    assert_eq!(response.status(), StatusCode::GONE);

    // evicted by the first access
    assert_eq!(server.file_count(), 0);
    let response = server.router().oneshot(get("/files/f2")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn sent_file_is_served_until_expiry() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "c.txt", b"still here");
    let server = LocalFileServer::new();
    server.register_file("f3", &path, "c.txt", "text/plain");
    server.mark_as_sent("f3", 60);

    let response = server.router().oneshot(get("/files/f3")).await.expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_text(response).await, "still here");
}

#[tokio::test]
async fn vanished_local_file_is_not_found() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "gone.txt", b"x");
    let server = LocalFileServer::new();
    server.register_file("f4", &path, "gone.txt", "text/plain");
    std::fs::remove_file(&path).expect("remove file");

    let response = server.router().oneshot(get("/files/f4")).await.expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unicode_names_are_percent_encoded() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "report.pdf", b"%PDF");
    let server = LocalFileServer::new();
    server.register_file("f5", &path, "보고서 final.pdf", "application/pdf");

    let response = server.router().oneshot(get("/files/f5")).await.expect("response");
    let disposition = response
        .headers()
        .get(header::CONTENT_DISPOSITION)
        .expect("content-disposition header")
        .to_str()
        .expect("header value is ASCII");
    assert_eq!(
        disposition,
        "inline; filename=\"%EB%B3%B4%EA%B3%A0%EC%84%9C%20final.pdf\""
    );
}

#[tokio::test]
async fn health_over_real_loopback_socket() {
    let dir = setup_temp_dir();
    let path = write_file(dir.path(), "a.txt", b"over the wire");
    let server = LocalFileServer::new();
    let port = server.start().await.expect("start");
    assert_eq!(server.start().await.expect("second start"), port);
    server.register_file("f1", &path, "a.txt", "text/plain");

    let client = reqwest::Client::new();
    let health = client
        .get(format!("http://127.0.0.1:{port}/health"))
        .send()
        .await
        .expect("health request");
    assert_eq!(health.status(), reqwest::StatusCode::OK);
    assert_eq!(health.text().await.expect("health body"), "OK");

    let file = client
        .get(format!("http://127.0.0.1:{port}/files/f1"))
        .send()
        .await
        .expect("file request");
    assert_eq!(file.text().await.expect("file body"), "over the wire");

    server.stop().await;
    assert!(!server.is_running());
    assert_eq!(server.file_count(), 0);
    assert!(server.port().is_none());
}

#[tokio::test]
async fn stop_before_start_is_harmless() {
    let server = LocalFileServer::new();
    server.stop().await;
    assert!(!server.is_running());
}
