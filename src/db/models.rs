use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::schema::{
    channels, epg_channels, epg_programs, epg_sources, ffmpeg_profiles, settings, streams,
};

/// A Plex-facing channel. Channel numbers are unique and stable; the number is
/// what Plex uses as the guide number and what `/stream/{n}` matches first.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Channel {
    pub id: i32,
    pub number: i32,
    pub name: String,
    pub enabled: i32,
    pub logo_url: Option<String>,
    pub epg_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Channel {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewChannel {
    pub number: i32,
    pub name: String,
    pub enabled: i32,
    pub logo_url: Option<String>,
    pub epg_id: Option<String>,
}

/// Declared kind of an upstream source. `Auto` defers classification to the
/// format detector probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Hls,
    Dash,
    Rtsp,
    Rtmp,
    Udp,
    Mpegts,
    Http,
    Auto,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Hls => "hls",
            StreamKind::Dash => "dash",
            StreamKind::Rtsp => "rtsp",
            StreamKind::Rtmp => "rtmp",
            StreamKind::Udp => "udp",
            StreamKind::Mpegts => "mpegts",
            StreamKind::Http => "http",
            StreamKind::Auto => "auto",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StreamKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hls" => Ok(StreamKind::Hls),
            "dash" => Ok(StreamKind::Dash),
            "rtsp" => Ok(StreamKind::Rtsp),
            "rtmp" => Ok(StreamKind::Rtmp),
            "udp" => Ok(StreamKind::Udp),
            "mpegts" => Ok(StreamKind::Mpegts),
            "http" => Ok(StreamKind::Http),
            "auto" => Ok(StreamKind::Auto),
            other => Err(format!("unknown stream kind '{}'", other)),
        }
    }
}

/// An upstream source attached to a channel. The first enabled stream in
/// insertion order is the active upstream for its channel.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = streams)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Stream {
    pub id: i32,
    pub channel_id: i32,
    pub name: String,
    pub url: String,
    pub kind: String,
    pub enabled: i32,
    pub auth: Option<String>,
    pub profile_id: Option<i32>,
    pub created_at: String,
    pub updated_at: String,
}

impl Stream {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }

    /// Declared kind, falling back to `auto` for unrecognized values so a bad
    /// row degrades to probing instead of refusing to stream.
    pub fn declared_kind(&self) -> StreamKind {
        self.kind.parse().unwrap_or(StreamKind::Auto)
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = streams)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewStream {
    pub channel_id: i32,
    pub name: String,
    pub url: String,
    pub kind: String,
    pub enabled: i32,
    pub auth: Option<String>,
    pub profile_id: Option<i32>,
}

/// Plex client family used to select an FFmpeg argument template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    WebBrowser,
    AndroidMobile,
    AndroidTv,
    IosMobile,
    AppleTv,
}

impl ClientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientKind::WebBrowser => "web_browser",
            ClientKind::AndroidMobile => "android_mobile",
            ClientKind::AndroidTv => "android_tv",
            ClientKind::IosMobile => "ios_mobile",
            ClientKind::AppleTv => "apple_tv",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-client argument templates inside an FFmpeg profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientProfile {
    /// Whitespace-tokenized argv template; the literal token `[URL]` is
    /// substituted with the resolved upstream URL.
    pub ffmpeg_args: String,
    /// Extra tokens inserted after the input when the upstream is HLS.
    #[serde(default)]
    pub hls_args: String,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = ffmpeg_profiles)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct FfmpegProfile {
    pub id: i32,
    pub name: String,
    pub is_default: i32,
    pub is_system: i32,
    pub clients: String,
    pub created_at: String,
    pub updated_at: String,
}

impl FfmpegProfile {
    pub fn is_default(&self) -> bool {
        self.is_default != 0
    }

    pub fn is_system(&self) -> bool {
        self.is_system != 0
    }

    /// Parse the JSON `clients` column into the per-client template map.
    pub fn client_map(&self) -> Result<HashMap<ClientKind, ClientProfile>, serde_json::Error> {
        serde_json::from_str(&self.clients)
    }
}

/// An XMLTV guide source polled on its refresh interval.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_sources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgSource {
    pub id: i32,
    pub name: String,
    pub url: String,
    pub refresh_interval_secs: i32,
    pub enabled: i32,
    pub last_success: Option<String>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl EpgSource {
    pub fn is_enabled(&self) -> bool {
        self.enabled != 0
    }
}

#[derive(Insertable, Debug, Clone)]
#[diesel(table_name = epg_sources)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgSource {
    pub name: String,
    pub url: String,
    pub refresh_interval_secs: i32,
    pub enabled: i32,
}

#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgChannel {
    pub id: i32,
    pub source_id: i32,
    pub epg_id: String,
    pub display_name: String,
    pub icon_url: Option<String>,
    pub updated_at: String,
}

#[derive(Insertable, AsChangeset, Debug, Clone)]
#[diesel(table_name = epg_channels)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgChannel {
    pub source_id: i32,
    pub epg_id: String,
    pub display_name: String,
    pub icon_url: Option<String>,
    pub updated_at: String,
}

/// A single guide entry. Intervals are half-open `[start_utc, stop_utc)` in
/// RFC 3339 UTC, which sorts lexicographically.
#[derive(Queryable, Selectable, Identifiable, Debug, Clone)]
#[diesel(table_name = epg_programs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct EpgProgram {
    pub id: i32,
    pub source_id: i32,
    pub epg_id: String,
    pub start_utc: String,
    pub stop_utc: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

#[derive(Insertable, Debug, Clone, PartialEq, Eq)]
#[diesel(table_name = epg_programs)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct NewEpgProgram {
    pub source_id: i32,
    pub epg_id: String,
    pub start_utc: String,
    pub stop_utc: String,
    pub title: String,
    pub description: Option<String>,
    pub category: Option<String>,
}

#[derive(Queryable, Selectable, Insertable, Debug, Clone)]
#[diesel(table_name = settings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct Setting {
    pub key: String,
    pub value: String,
}

impl Setting {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}
