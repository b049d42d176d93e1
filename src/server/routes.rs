use axum::{
    routing::{delete, get},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers::{
    active_streams, device_xml, discover_json, epg_xmltv, fallback_handler, health_check,
    lineup_json, lineup_status_json, metrics_json, playlist_m3u, stream_channel, terminate_stream,
};
use super::state::AppState;

/// Create the Axum router with all routes configured.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        // HDHomeRun emulation surface
        .route("/discover.json", get(discover_json))
        .route("/device.xml", get(device_xml))
        .route("/lineup.json", get(lineup_json))
        .route("/lineup_status.json", get(lineup_status_json))
        // Streaming
        .route("/stream/{channel}", get(stream_channel))
        // Playlist and guide
        .route("/playlist.m3u", get(playlist_m3u))
        .route("/epg/xmltv", get(epg_xmltv))
        // Operational surface
        .route("/streams/active", get(active_streams))
        .route("/streams/active/{session_id}", delete(terminate_stream))
        .route("/api/metrics", get(metrics_json))
        .fallback(fallback_handler)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
