use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::models::Channel;
use crate::db::{ProgramWindow, RepositoryError};
use crate::stream::{
    detect_client_kind, AdmissionError, ClientInfo, FfmpegError, OpenError, UpstreamError,
};
use crate::xmltv::generate_xmltv;

use super::hdhr::{self, TunerIdentity};
use super::m3u;
use super::state::AppState;

/// Emission window around now for `/epg/xmltv`.
const EPG_PAST_HOURS: i64 = 2;
const EPG_FUTURE_DAYS: i64 = 7;

/// Health check response structure.
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

/// JSON error body carrying the stable error kind.
#[derive(Serialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_body(status: StatusCode, kind: &str) -> (StatusCode, Json<ErrorBody>) {
    (
        status,
        Json(ErrorBody {
            error: kind.to_string(),
        }),
    )
}

/// Health check endpoint handler.
pub async fn health_check() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
        }),
    )
}

/// Fallback handler for 404 responses.
pub async fn fallback_handler() -> StatusCode {
    StatusCode::NOT_FOUND
}

/// Generate ETag from content hash.
///
/// Fast non-cryptographic hash; this is cache validation, not security.
fn generate_etag(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

/// Enabled channels that have at least one enabled stream; the lineup,
/// playlist, and EPG endpoints all share this filter.
fn channels_with_active_streams(state: &AppState) -> Result<Vec<Channel>, RepositoryError> {
    let channels = state.repo.list_enabled_channels()?;
    let mut usable = Vec::with_capacity(channels.len());
    for channel in channels {
        let streams = state.repo.list_streams_for_channel(channel.id)?;
        if streams.iter().any(|s| s.is_enabled()) {
            usable.push(channel);
        }
    }
    Ok(usable)
}

// ----------------------------------------------------------------------------
// HDHomeRun surface
// ----------------------------------------------------------------------------

/// `GET /discover.json` — tuner identity and capabilities.
pub async fn discover_json(State(state): State<AppState>) -> impl IntoResponse {
    let identity = TunerIdentity::from_settings(&state.config.get());
    Json(hdhr::generate_discover_response(&identity))
}

/// `GET /device.xml` — UPnP device description.
pub async fn device_xml(State(state): State<AppState>) -> impl IntoResponse {
    let identity = TunerIdentity::from_settings(&state.config.get());
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    (headers, hdhr::generate_device_xml(&identity))
}

/// `GET /lineup.json` — enabled channels with a usable stream.
pub async fn lineup_json(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let channels = channels_with_active_streams(&state).map_err(|e| {
        tracing::error!(error = %e, "lineup generation failed");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "Repository.Unavailable")
    })?;
    let base_url = state.config.get().base_url();
    Ok(Json(hdhr::generate_lineup(&channels, &base_url)))
}

/// `GET /lineup_status.json` — static scan status stub.
pub async fn lineup_status_json() -> impl IntoResponse {
    Json(hdhr::generate_lineup_status())
}

// ----------------------------------------------------------------------------
// Playlist and EPG
// ----------------------------------------------------------------------------

/// `GET /playlist.m3u` — M3U playlist of enabled channels.
pub async fn playlist_m3u(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let channels = channels_with_active_streams(&state).map_err(|e| {
        tracing::error!(error = %e, "playlist generation failed");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "Repository.Unavailable")
    })?;
    let base_url = state.config.get().base_url();
    let content = m3u::generate_m3u_playlist(&channels, &base_url);

    let etag = generate_etag(&content);
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("audio/x-mpegurl"),
    );
    if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
        headers.insert(header::ETAG, value);
    }
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("public, max-age=300"),
    );
    Ok((headers, content))
}

/// `GET /epg/xmltv` — XMLTV document for the configured channels, covering
/// `[now − 2h, now + 7d]`.
pub async fn epg_xmltv(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorBody>)> {
    let now = Utc::now();
    let window = ProgramWindow::new(
        now - ChronoDuration::hours(EPG_PAST_HOURS),
        now + ChronoDuration::days(EPG_FUTURE_DAYS),
    );

    let data = state.repo.query_epg_for_emission(window).map_err(|e| {
        tracing::error!(error = %e, "EPG emission query failed");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "Repository.Unavailable")
    })?;

    let xml = generate_xmltv(&data).map_err(|e| {
        tracing::error!(error = %e, "EPG emission failed");
        error_body(StatusCode::INTERNAL_SERVER_ERROR, "Epg.EmitFailed")
    })?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml; charset=utf-8"),
    );
    Ok((headers, xml))
}

// ----------------------------------------------------------------------------
// Streaming
// ----------------------------------------------------------------------------

/// `GET /stream/{channel}` — live MPEG-TS for a channel.
///
/// The path segment matches a channel number first, then a channel id. The
/// status line is decided before any body bytes: admission failures map to
/// 404/503, upstream and FFmpeg startup failures to 502.
pub async fn stream_channel(
    Path(channel_ref): Path<String>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Response<Body>, (StatusCode, Json<ErrorBody>)> {
    let channel = lookup_channel(&state, &channel_ref)?;
    if !channel.is_enabled() {
        return Err(error_body(StatusCode::NOT_FOUND, "NoStream"));
    }

    let client = ClientInfo {
        ip: addr.ip().to_string(),
        user_agent: headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string()),
        client_kind: detect_client_kind(&headers),
    };

    let body_stream = state
        .sessions
        .open_stream(&channel, client)
        .await
        .map_err(|e| {
            tracing::warn!(
                channel = channel.number,
                error = %e,
                "stream request refused"
            );
            map_open_error(e)
        })?;

    let mut response = Response::new(Body::from_stream(body_stream));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("video/mp2t"),
    );
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    Ok(response)
}

fn lookup_channel(
    state: &AppState,
    channel_ref: &str,
) -> Result<Channel, (StatusCode, Json<ErrorBody>)> {
    // Numeric refs match the channel number first, then fall back to the id.
    if let Ok(n) = channel_ref.parse::<i32>() {
        match state.repo.get_channel_by_number(n) {
            Ok(channel) => return Ok(channel),
            Err(RepositoryError::NotFound) => {}
            Err(e) => {
                tracing::error!(error = %e, "channel lookup failed");
                return Err(error_body(StatusCode::NOT_FOUND, "NoStream"));
            }
        }
        match state.repo.get_channel_by_id(n) {
            Ok(channel) => return Ok(channel),
            Err(RepositoryError::NotFound) => {}
            Err(e) => {
                tracing::error!(error = %e, "channel lookup failed");
            }
        }
    }
    Err(error_body(StatusCode::NOT_FOUND, "NoStream"))
}

fn map_open_error(err: OpenError) -> (StatusCode, Json<ErrorBody>) {
    match err {
        OpenError::Admission(e) => {
            let status = match e {
                AdmissionError::NoStream | AdmissionError::StreamDisabled => StatusCode::NOT_FOUND,
                AdmissionError::CapacityFull | AdmissionError::PerChannelCapacityFull => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
            };
            error_body(status, e.kind())
        }
        OpenError::Upstream(e) => {
            let kind = match e {
                UpstreamError::Unreachable(_) => "Upstream.Unreachable",
                UpstreamError::HttpError(_) => "Upstream.HttpError",
                UpstreamError::Malformed(_) => "Upstream.Malformed",
                UpstreamError::TimeoutDuringProbe => "Upstream.TimeoutDuringProbe",
            };
            error_body(StatusCode::BAD_GATEWAY, kind)
        }
        OpenError::Ffmpeg(e) => {
            let kind = match e {
                FfmpegError::SpawnFailed(_) => "Ffmpeg.SpawnFailed",
                FfmpegError::StartupFailed(_) => "Ffmpeg.StartupFailed",
                FfmpegError::CrashedDuringStream { .. } => "Ffmpeg.CrashedDuringStream",
            };
            error_body(StatusCode::BAD_GATEWAY, kind)
        }
        OpenError::Profile(_) => error_body(StatusCode::INTERNAL_SERVER_ERROR, "ProfileInvalid"),
        // Read-path repository failures degrade to "no channel".
        OpenError::Repository(_) => error_body(StatusCode::NOT_FOUND, "NoStream"),
    }
}

// ----------------------------------------------------------------------------
// Operational surface
// ----------------------------------------------------------------------------

/// `GET /streams/active` — snapshot of live sessions.
pub async fn active_streams(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.sessions.snapshots())
}

#[derive(Serialize)]
pub struct TerminateResponse {
    pub status: String,
}

/// `DELETE /streams/active/{session_id}` — operator-initiated termination.
///
/// Terminating an unknown or already-closed session is a successful no-op.
pub async fn terminate_stream(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
) -> Result<Json<TerminateResponse>, (StatusCode, Json<ErrorBody>)> {
    let id = Uuid::parse_str(&session_id)
        .map_err(|_| error_body(StatusCode::BAD_REQUEST, "InvalidSessionId"))?;
    state.sessions.terminate(&id);
    Ok(Json(TerminateResponse {
        status: "terminated".to_string(),
    }))
}

/// `GET /api/metrics` — process-wide counters and gauges.
pub async fn metrics_json(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}
