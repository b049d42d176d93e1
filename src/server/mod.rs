pub mod handlers;
pub mod hdhr;
pub mod m3u;
pub mod routes;
pub mod state;

use std::net::SocketAddr;

pub use state::AppState;

/// Server error types for proper error handling.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),

    #[error("Server runtime error: {0}")]
    RuntimeError(String),
}

/// Start the HTTP server on the configured streaming port.
///
/// Binds all interfaces; Plex discovers the bridge over the LAN. Runs until
/// the shutdown future resolves, then finishes in-flight requests.
pub async fn start_server(
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), ServerError> {
    let port = state.streaming_port();
    let app = routes::create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!(%addr, "HTTP server listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .map_err(|e| ServerError::RuntimeError(e.to_string()))?;

    Ok(())
}
