/// Parsed representation of a `<channel>` element.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChannel {
    /// XMLTV channel id attribute (opaque, matches `Channel::epg_id`).
    pub epg_id: String,
    pub display_name: String,
    pub icon: Option<String>,
}

/// Parsed representation of a `<programme>` element. Times are RFC 3339 UTC,
/// the same format the repository stores.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProgram {
    pub epg_id: String,
    pub title: String,
    pub description: Option<String>,
    pub start_utc: String,
    pub stop_utc: String,
    pub category: Option<String>,
}

/// Error types for XMLTV fetching and parsing.
#[derive(Debug, thiserror::Error)]
pub enum XmltvError {
    #[error("download failed: {0}")]
    DownloadError(String),

    #[error("decompression failed: {0}")]
    DecompressError(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("timestamp error: {0}")]
    TimestampError(String),
}
