//! Loopback listener bootstrap.
//!
//! The file server is only ever reachable from outside through the tunnel,
//! so the socket binds 127.0.0.1 and nothing else.

use std::net::{Ipv4Addr, SocketAddr};

use crate::common::{Result, UploadError};

fn loopback_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Starts an Axum server on loopback and returns `(bound_port, handle)`.
///
/// `port` 0 asks the OS for an ephemeral port.
pub fn start_local_server(app: axum::Router, port: u16) -> Result<(u16, axum_server::Handle)> {
    let listener =
        std::net::TcpListener::bind(loopback_addr(port)).map_err(UploadError::BindError)?;

    listener
        .set_nonblocking(true)
        .map_err(UploadError::BindError)?;

    let port = listener
        .local_addr()
        .map_err(UploadError::BindError)?
        .port();

    let server_handle = axum_server::Handle::new();
    let server_handle_clone = server_handle.clone();

    tokio::spawn(async move {
        if let Err(e) = axum_server::from_tcp(listener)
            .handle(server_handle_clone)
            .serve(app.into_make_service())
            .await
        {
            tracing::error!("File server error: {}", e);
        }
    });

    Ok((port, server_handle))
}
