//! HTTP handlers for served files.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, Response, StatusCode},
    response::IntoResponse,
};
use thiserror::Error;
use tokio_util::io::ReaderStream;

use super::registry::{FileLookup, FileRegistry, ServedFile};

#[derive(Debug, Error)]
pub enum ServeError {
    #[error("File not found")]
    NotFound,
    #[error("File expired")]
    Expired,
    #[error("Failed to build response: {0}")]
    Internal(String),
}

impl IntoResponse for ServeError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ServeError::NotFound => StatusCode::NOT_FOUND,
            ServeError::Expired => StatusCode::GONE,
            ServeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

pub async fn health() -> &'static str {
    "OK"
}

/// Stream a registered file inline.
pub async fn serve_file(
    Path(id): Path<String>,
    State(files): State<FileRegistry>,
) -> Result<Response<Body>, ServeError> {
    let file = match files.lookup(&id) {
        FileLookup::Missing => return Err(ServeError::NotFound),
        FileLookup::Expired => return Err(ServeError::Expired),
        FileLookup::Available(file) => file,
    };

    let handle = tokio::fs::File::open(&file.local_path).await.map_err(|err| {
        tracing::warn!(
            id = %id,
            path = %file.local_path.display(),
            "Registered file is not readable: {err}"
        );
        ServeError::NotFound
    })?;
    let len = handle.metadata().await.ok().map(|m| m.len());

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, file.mime_type.as_str())
        .header(header::CONTENT_DISPOSITION, content_disposition(&file));
    if let Some(len) = len {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }

    tracing::debug!(id = %id, bytes = ?len, "Serving file");

    builder
        .body(Body::from_stream(ReaderStream::new(handle)))
        .map_err(|e| ServeError::Internal(e.to_string()))
}

fn content_disposition(file: &ServedFile) -> String {
    format!(
        "inline; filename=\"{}\"",
        urlencoding::encode(&file.display_name)
    )
}
