//! In-memory session records.
//!
//! A session exists exactly as long as its FFmpeg subprocess is live or
//! draining. Records are owned by the session manager; everything mutable sits
//! behind small mutexes so the streaming loop can meter without holding the
//! admission lock.

use std::sync::Mutex;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::db::models::ClientKind;

use super::detect::UpstreamKind;
use super::ffmpeg::FfmpegChild;

/// Session lifecycle.
///
/// `admitting → running → draining → closed`, with `admitting → closed` for
/// spawn failures. The transition into `draining` can be requested by several
/// triggers and must stay idempotent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Admitting,
    Running,
    Draining,
    Closed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Admitting => "admitting",
            SessionState::Running => "running",
            SessionState::Draining => "draining",
            SessionState::Closed => "closed",
        }
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelCause {
    ClientDisconnect,
    OperatorTerminated,
    Shutdown,
    UpstreamEof,
    StartupFailed,
}

impl CancelCause {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelCause::ClientDisconnect => "client_disconnect",
            CancelCause::OperatorTerminated => "operator_terminated",
            CancelCause::Shutdown => "shutdown",
            CancelCause::UpstreamEof => "upstream_eof",
            CancelCause::StartupFailed => "startup_failed",
        }
    }
}

/// Throughput accounting for one session.
///
/// `current_bps` is an EWMA (α = 0.3) over one-second buckets on the
/// monotonic clock; `avg_bps` is total bytes over total elapsed time.
#[derive(Debug)]
pub struct SessionMeter {
    started: Instant,
    bucket_start: Instant,
    bucket_bytes: u64,
    bytes_sent: u64,
    current_bps: f64,
    peak_bps: f64,
    have_sample: bool,
}

/// EWMA smoothing factor.
const ALPHA: f64 = 0.3;

/// Bucket length for instantaneous rate samples.
const BUCKET_SECS: f64 = 1.0;

impl SessionMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            started: now,
            bucket_start: now,
            bucket_bytes: 0,
            bytes_sent: 0,
            current_bps: 0.0,
            peak_bps: 0.0,
            have_sample: false,
        }
    }

    /// Record one chunk written to the client.
    pub fn record_chunk(&mut self, len: usize) {
        self.bytes_sent += len as u64;
        self.bucket_bytes += len as u64;

        let elapsed = self.bucket_start.elapsed().as_secs_f64();
        if elapsed >= BUCKET_SECS {
            let instantaneous = (self.bucket_bytes * 8) as f64 / elapsed;
            self.current_bps = if self.have_sample {
                ALPHA * instantaneous + (1.0 - ALPHA) * self.current_bps
            } else {
                instantaneous
            };
            self.have_sample = true;
            self.peak_bps = self.peak_bps.max(self.current_bps);
            self.bucket_start = Instant::now();
            self.bucket_bytes = 0;
        }
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn current_bps(&self) -> u64 {
        self.current_bps as u64
    }

    pub fn peak_bps(&self) -> u64 {
        self.peak_bps as u64
    }

    pub fn avg_bps(&self) -> u64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0;
        }
        ((self.bytes_sent * 8) as f64 / elapsed) as u64
    }
}

impl Default for SessionMeter {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutable odds and ends set during the lifecycle.
#[derive(Debug, Default)]
pub struct SessionDiagnostics {
    pub ffmpeg_pid: Option<u32>,
    pub cancel_cause: Option<CancelCause>,
    pub exit_code: Option<i32>,
    pub stderr_tail: Option<String>,
}

/// One client's live consumption of one channel.
#[derive(Debug)]
pub struct SessionRecord {
    pub id: Uuid,
    pub channel_id: i32,
    pub channel_number: i32,
    pub channel_name: String,
    pub stream_id: i32,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub client_kind: ClientKind,
    pub started_at: DateTime<Utc>,
    started_mono: Instant,

    /// Set once the format detector commits to a kind; `Http` until then.
    upstream_kind: Mutex<UpstreamKind>,
    state: Mutex<SessionState>,
    pub meter: Mutex<SessionMeter>,
    pub diagnostics: Mutex<SessionDiagnostics>,
    /// The owned subprocess; taken exactly once by the reaper.
    pub child: Mutex<Option<FfmpegChild>>,
}

impl SessionRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        channel_id: i32,
        channel_number: i32,
        channel_name: String,
        stream_id: i32,
        client_ip: String,
        user_agent: Option<String>,
        client_kind: ClientKind,
        upstream_kind: UpstreamKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            channel_id,
            channel_number,
            channel_name,
            stream_id,
            client_ip,
            user_agent,
            client_kind,
            started_at: Utc::now(),
            started_mono: Instant::now(),
            upstream_kind: Mutex::new(upstream_kind),
            state: Mutex::new(SessionState::Admitting),
            meter: Mutex::new(SessionMeter::new()),
            diagnostics: Mutex::new(SessionDiagnostics::default()),
            child: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().expect("session state lock poisoned")
    }

    /// Monotonic time since admission.
    pub fn elapsed(&self) -> std::time::Duration {
        self.started_mono.elapsed()
    }

    pub fn upstream_kind(&self) -> UpstreamKind {
        *self.upstream_kind.lock().expect("upstream kind lock poisoned")
    }

    pub fn set_upstream_kind(&self, kind: UpstreamKind) {
        *self.upstream_kind.lock().expect("upstream kind lock poisoned") = kind;
    }

    pub fn mark_running(&self) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        if *state == SessionState::Admitting {
            *state = SessionState::Running;
        }
    }

    /// Request the `draining` transition. Only the first caller wins; every
    /// later trigger sees `false` and must not run termination again.
    pub fn begin_draining(&self) -> bool {
        let mut state = self.state.lock().expect("session state lock poisoned");
        match *state {
            SessionState::Admitting | SessionState::Running => {
                *state = SessionState::Draining;
                true
            }
            SessionState::Draining | SessionState::Closed => false,
        }
    }

    pub fn mark_closed(&self) {
        let mut state = self.state.lock().expect("session state lock poisoned");
        *state = SessionState::Closed;
    }

    /// Record the cancel cause if none is set yet; the first trigger wins.
    pub fn set_cancel_cause(&self, cause: CancelCause) {
        let mut diag = self.diagnostics.lock().expect("diagnostics lock poisoned");
        diag.cancel_cause.get_or_insert(cause);
    }

    pub fn cancel_cause(&self) -> Option<CancelCause> {
        self.diagnostics
            .lock()
            .expect("diagnostics lock poisoned")
            .cancel_cause
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let meter = self.meter.lock().expect("meter lock poisoned");
        let diag = self.diagnostics.lock().expect("diagnostics lock poisoned");
        SessionSnapshot {
            session_id: self.id.to_string(),
            channel_id: self.channel_id,
            channel_number: self.channel_number,
            channel_name: self.channel_name.clone(),
            stream_id: self.stream_id,
            client_ip: self.client_ip.clone(),
            user_agent: self.user_agent.clone(),
            client_kind: self.client_kind,
            upstream_kind: self.upstream_kind().as_str().to_string(),
            started_at: self.started_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            state: self.state().as_str().to_string(),
            bytes_sent: meter.bytes_sent(),
            current_bps: meter.current_bps(),
            avg_bps: meter.avg_bps(),
            peak_bps: meter.peak_bps(),
            ffmpeg_pid: diag.ffmpeg_pid,
            cancel_cause: diag.cancel_cause.map(|c| c.as_str().to_string()),
        }
    }
}

/// Serializable point-in-time view of a session, used on the event bus and
/// the `/streams/active` endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub channel_id: i32,
    pub channel_number: i32,
    pub channel_name: String,
    pub stream_id: i32,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub client_kind: ClientKind,
    pub upstream_kind: String,
    pub started_at: String,
    pub state: String,
    pub bytes_sent: u64,
    pub current_bps: u64,
    pub avg_bps: u64,
    pub peak_bps: u64,
    pub ffmpeg_pid: Option<u32>,
    pub cancel_cause: Option<String>,
}
