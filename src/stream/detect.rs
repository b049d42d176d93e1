//! Format detector and upstream adapter.
//!
//! Classifies a stream's upstream protocol and resolves the URL FFmpeg will
//! consume. The adapter never reads media bytes itself; codec work stays
//! inside FFmpeg. Declared kinds are trusted, `auto` probes: scheme, then
//! Content-Type from a HEAD (or ranged GET fallback), then URL suffix.

use std::fmt;
use std::time::Duration;

use crate::db::models::{Stream, StreamKind};

/// Probe timeout for HEAD / ranged GET requests.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolved upstream protocol. Unlike [`StreamKind`] there is no `auto`; the
/// detector always commits to a concrete kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamKind {
    Hls,
    Dash,
    Rtsp,
    Rtmp,
    Udp,
    Mpegts,
    Http,
}

impl UpstreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            UpstreamKind::Hls => "hls",
            UpstreamKind::Dash => "dash",
            UpstreamKind::Rtsp => "rtsp",
            UpstreamKind::Rtmp => "rtmp",
            UpstreamKind::Udp => "udp",
            UpstreamKind::Mpegts => "mpegts",
            UpstreamKind::Http => "http",
        }
    }
}

impl fmt::Display for UpstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the probe observed, kept on the session for diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProbeMetadata {
    pub status: Option<u16>,
    pub content_type: Option<String>,
}

/// Result of upstream resolution.
#[derive(Debug, Clone)]
pub struct UpstreamInfo {
    pub effective_url: String,
    pub kind: UpstreamKind,
    pub probe: ProbeMetadata,
}

/// Error types for upstream resolution. None of these are retried here;
/// classification is the adapter's whole job.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream unreachable: {0}")]
    Unreachable(String),

    #[error("upstream returned HTTP {0}")]
    HttpError(u16),

    #[error("malformed upstream: {0}")]
    Malformed(String),

    #[error("probe timed out")]
    TimeoutDuringProbe,
}

pub struct FormatDetector {
    client: reqwest::Client,
}

impl FormatDetector {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .connect_timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Resolve a stream's upstream kind and effective URL.
    ///
    /// HLS master-to-variant selection is deferred to FFmpeg; the master URL
    /// passes through unchanged.
    pub async fn resolve(&self, stream: &Stream) -> Result<UpstreamInfo, UpstreamError> {
        let declared = stream.declared_kind();

        if let Some(kind) = trusted_kind(declared) {
            return Ok(UpstreamInfo {
                effective_url: stream.url.clone(),
                kind,
                probe: ProbeMetadata::default(),
            });
        }

        // kind = auto from here on.
        if let Some(kind) = kind_from_scheme(&stream.url) {
            return Ok(UpstreamInfo {
                effective_url: stream.url.clone(),
                kind,
                probe: ProbeMetadata::default(),
            });
        }

        let url: url::Url = stream
            .url
            .parse()
            .map_err(|e| UpstreamError::Malformed(format!("invalid URL '{}': {}", stream.url, e)))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(UpstreamError::Malformed(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }

        let probe = self.probe(&stream.url).await?;

        let kind = probe
            .content_type
            .as_deref()
            .and_then(kind_from_content_type)
            .or_else(|| kind_from_suffix(url.path()))
            .unwrap_or(UpstreamKind::Http);

        Ok(UpstreamInfo {
            effective_url: stream.url.clone(),
            kind,
            probe,
        })
    }

    /// HEAD the URL; fall back to a one-byte ranged GET for servers that
    /// reject HEAD outright.
    async fn probe(&self, url: &str) -> Result<ProbeMetadata, UpstreamError> {
        let response = match self.client.head(url).send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED
                || resp.status() == reqwest::StatusCode::NOT_IMPLEMENTED =>
            {
                self.client
                    .get(url)
                    .header("Range", "bytes=0-0")
                    .send()
                    .await
                    .map_err(classify_reqwest_error)?
            }
            Ok(resp) => resp,
            Err(e) => return Err(classify_reqwest_error(e)),
        };

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(UpstreamError::HttpError(status.as_u16()));
        }

        Ok(ProbeMetadata {
            status: Some(status.as_u16()),
            content_type: response
                .headers()
                .get("content-type")
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string()),
        })
    }
}

impl Default for FormatDetector {
    fn default() -> Self {
        Self::new()
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> UpstreamError {
    if e.is_timeout() {
        UpstreamError::TimeoutDuringProbe
    } else {
        UpstreamError::Unreachable(e.to_string())
    }
}

/// Declared kinds other than `auto` bypass the probe.
fn trusted_kind(kind: StreamKind) -> Option<UpstreamKind> {
    match kind {
        StreamKind::Hls => Some(UpstreamKind::Hls),
        StreamKind::Dash => Some(UpstreamKind::Dash),
        StreamKind::Rtsp => Some(UpstreamKind::Rtsp),
        StreamKind::Rtmp => Some(UpstreamKind::Rtmp),
        StreamKind::Udp => Some(UpstreamKind::Udp),
        StreamKind::Mpegts => Some(UpstreamKind::Mpegts),
        StreamKind::Http => Some(UpstreamKind::Http),
        StreamKind::Auto => None,
    }
}

fn kind_from_scheme(url: &str) -> Option<UpstreamKind> {
    let lower = url.to_ascii_lowercase();
    if lower.starts_with("udp://") {
        Some(UpstreamKind::Udp)
    } else if lower.starts_with("rtsp://") {
        Some(UpstreamKind::Rtsp)
    } else if lower.starts_with("rtmp://") || lower.starts_with("rtmps://") {
        Some(UpstreamKind::Rtmp)
    } else {
        None
    }
}

fn kind_from_content_type(content_type: &str) -> Option<UpstreamKind> {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match ct.as_str() {
        "application/vnd.apple.mpegurl" | "application/x-mpegurl" | "audio/x-mpegurl" => {
            Some(UpstreamKind::Hls)
        }
        "application/dash+xml" => Some(UpstreamKind::Dash),
        "video/mp2t" => Some(UpstreamKind::Mpegts),
        _ => None,
    }
}

fn kind_from_suffix(path: &str) -> Option<UpstreamKind> {
    let lower = path.to_ascii_lowercase();
    if lower.ends_with(".m3u8") || lower.ends_with(".m3u") {
        Some(UpstreamKind::Hls)
    } else if lower.ends_with(".mpd") {
        Some(UpstreamKind::Dash)
    } else {
        None
    }
}
