//! Router definition for the local file endpoint.

use axum::{routing::get, Router};

use super::handlers;
use super::registry::FileRegistry;

/// Build the router serving registered files and the health check.
pub fn create_file_router(files: &FileRegistry) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/files/:id", get(handlers::serve_file))
        .with_state(files.clone())
}
