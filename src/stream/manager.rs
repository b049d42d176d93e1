//! Stream session manager.
//!
//! Admits or refuses streaming requests, supervises exactly one FFmpeg
//! subprocess per admitted session, meters throughput, and guarantees the
//! reap runs on every exit path. Admission counters live under a single mutex
//! so two requests can never both observe free capacity; the streaming loop
//! itself never touches that lock.

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use futures_util::{Stream as FuturesStream, StreamExt};
use tokio::process::ChildStdout;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::config::ConfigStore;
use crate::db::models::{Channel, ClientKind, Stream};
use crate::db::{Repository, RepositoryError};
use crate::events::{Event, EventBus};
use crate::metrics::Metrics;

use super::detect::{FormatDetector, UpstreamError, UpstreamInfo};
use super::ffmpeg::{self, FfmpegError};
use super::profile::{build_argv, resolve_client_entry, ProfileError};
use super::session::{CancelCause, SessionRecord, SessionSnapshot};

/// Chunk size for the FFmpeg stdout → HTTP response copy loop.
const CHUNK_SIZE: usize = 64 * 1024;

/// FFmpeg must produce its first stdout byte within this window.
const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(10);

/// Crashes earlier than this after start count as startup failures.
const STARTUP_CRASH_WINDOW: Duration = Duration::from_secs(2);

/// Admission refusals, surfaced synchronously on the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AdmissionError {
    #[error("channel has no streams")]
    NoStream,

    #[error("channel has no enabled stream")]
    StreamDisabled,

    #[error("global stream capacity reached")]
    CapacityFull,

    #[error("per-channel stream capacity reached")]
    PerChannelCapacityFull,
}

impl AdmissionError {
    /// Stable kind string used in JSON error bodies.
    pub fn kind(self) -> &'static str {
        match self {
            AdmissionError::NoStream => "NoStream",
            AdmissionError::StreamDisabled => "StreamDisabled",
            AdmissionError::CapacityFull => "CapacityFull",
            AdmissionError::PerChannelCapacityFull => "PerChannelCapacityFull",
        }
    }
}

/// Everything that can stop a stream from opening.
#[derive(Debug, thiserror::Error)]
pub enum OpenError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Ffmpeg(#[from] FfmpegError),

    #[error(transparent)]
    Profile(#[from] ProfileError),

    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

/// Request metadata captured at admission.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: Option<String>,
    pub client_kind: ClientKind,
}

#[derive(Debug, Default)]
struct AdmissionCounters {
    total: usize,
    per_channel: HashMap<i32, usize>,
}

pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<SessionRecord>>,
    admission: Mutex<AdmissionCounters>,
    config: Arc<ConfigStore>,
    repo: Repository,
    detector: FormatDetector,
    events: EventBus,
    metrics: Arc<Metrics>,
    ffmpeg_path: String,
}

impl SessionManager {
    pub fn new(
        config: Arc<ConfigStore>,
        repo: Repository,
        events: EventBus,
        metrics: Arc<Metrics>,
        ffmpeg_path: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: DashMap::new(),
            admission: Mutex::new(AdmissionCounters::default()),
            config,
            repo,
            detector: FormatDetector::new(),
            events,
            metrics,
            ffmpeg_path,
        })
    }

    /// Open a live MPEG-TS pipe for a channel.
    ///
    /// Runs the whole admission → resolve → spawn → first-byte sequence; on
    /// success the returned body streams FFmpeg stdout and tears the session
    /// down when dropped.
    pub async fn open_stream(
        self: &Arc<Self>,
        channel: &Channel,
        client: ClientInfo,
    ) -> Result<StreamBody, OpenError> {
        let active = match self.pick_active_stream(channel) {
            Ok(active) => active,
            Err(e) => {
                self.metrics.session_rejected();
                return Err(e);
            }
        };

        let record = match self.try_admit(channel, &active, &client) {
            Ok(record) => record,
            Err(e) => {
                self.metrics.session_rejected();
                return Err(e.into());
            }
        };

        match self.start_pipeline(&record, &active).await {
            Ok((first, reader)) => {
                record.mark_running();
                self.metrics.session_started();
                self.events.publish(Event::StreamStarted {
                    session: record.snapshot(),
                });
                tracing::info!(
                    session_id = %record.id,
                    channel = record.channel_number,
                    upstream = %record.upstream_kind(),
                    client_kind = %record.client_kind,
                    "stream session started"
                );
                Ok(StreamBody {
                    first: Some(first),
                    reader,
                    record,
                    manager: Arc::clone(self),
                    ended_naturally: false,
                })
            }
            Err(e) => {
                self.metrics.session_rejected();
                self.abort_admission(&record).await;
                Err(e)
            }
        }
    }

    /// First enabled stream in insertion order, distinguishing "no streams"
    /// from "all disabled".
    fn pick_active_stream(&self, channel: &Channel) -> Result<Stream, OpenError> {
        let streams = self.repo.list_streams_for_channel(channel.id)?;
        if streams.is_empty() {
            return Err(AdmissionError::NoStream.into());
        }
        streams
            .into_iter()
            .find(|s| s.is_enabled())
            .ok_or_else(|| AdmissionError::StreamDisabled.into())
    }

    /// Capacity check and counter increment under one lock, so concurrent
    /// requests can never both observe the last free slot.
    fn try_admit(
        &self,
        channel: &Channel,
        active: &Stream,
        client: &ClientInfo,
    ) -> Result<Arc<SessionRecord>, AdmissionError> {
        let settings = self.config.get();
        let mut counters = self.admission.lock().expect("admission lock poisoned");

        if counters.total >= settings.max_concurrent_streams as usize {
            return Err(AdmissionError::CapacityFull);
        }
        let channel_count = counters.per_channel.get(&channel.id).copied().unwrap_or(0);
        if channel_count >= settings.max_concurrent_per_channel as usize {
            return Err(AdmissionError::PerChannelCapacityFull);
        }

        counters.total += 1;
        *counters.per_channel.entry(channel.id).or_insert(0) += 1;

        let record = Arc::new(SessionRecord::new(
            channel.id,
            channel.number,
            channel.name.clone(),
            active.id,
            client.ip.clone(),
            client.user_agent.clone(),
            client.client_kind,
            // Placeholder until resolution runs; overwritten before `running`.
            super::detect::UpstreamKind::Http,
        ));
        self.sessions.insert(record.id, Arc::clone(&record));
        Ok(record)
    }

    /// Resolve the upstream, build the argv, spawn FFmpeg, and wait for the
    /// first stdout chunk.
    async fn start_pipeline(
        &self,
        record: &Arc<SessionRecord>,
        active: &Stream,
    ) -> Result<(Bytes, ReaderStream<ChildStdout>), OpenError> {
        let upstream: UpstreamInfo = self.detector.resolve(active).await?;
        record.set_upstream_kind(upstream.kind);

        let entry = resolve_client_entry(&self.repo, active, record.client_kind)?;
        let argv = build_argv(&entry, &upstream.effective_url, upstream.kind)?;

        tracing::debug!(
            session_id = %record.id,
            argv = ?argv,
            "spawning ffmpeg"
        );

        let (child, stdout) = ffmpeg::spawn(&self.ffmpeg_path, &argv)?;
        {
            let mut diag = record.diagnostics.lock().expect("diagnostics lock poisoned");
            diag.ffmpeg_pid = child.pid;
        }
        let stderr = Arc::clone(&child.stderr);
        *record.child.lock().expect("child lock poisoned") = Some(child);

        let mut reader = ReaderStream::with_capacity(stdout, CHUNK_SIZE);
        match tokio::time::timeout(FIRST_BYTE_TIMEOUT, reader.next()).await {
            Ok(Some(Ok(first))) => Ok((first, reader)),
            Ok(Some(Err(e))) => Err(FfmpegError::StartupFailed(format!(
                "stdout read failed: {}; stderr: {}",
                e,
                stderr.tail()
            ))
            .into()),
            Ok(None) => Err(FfmpegError::StartupFailed(format!(
                "exited before producing output; stderr: {}",
                stderr.tail()
            ))
            .into()),
            Err(_) => Err(FfmpegError::StartupFailed(format!(
                "no output within {}s; stderr: {}",
                FIRST_BYTE_TIMEOUT.as_secs(),
                stderr.tail()
            ))
            .into()),
        }
    }

    /// Tear down a session that never reached `running`. Reaps any spawned
    /// child and rolls the counters back.
    async fn abort_admission(&self, record: &Arc<SessionRecord>) {
        if !record.begin_draining() {
            return;
        }
        record.set_cancel_cause(CancelCause::StartupFailed);

        let child = record.child.lock().expect("child lock poisoned").take();
        if let Some(child) = child {
            // Short grace; nothing is consuming this child.
            let (exit_code, stderr_tail) = child.shutdown(Duration::from_secs(2)).await;
            let mut diag = record.diagnostics.lock().expect("diagnostics lock poisoned");
            diag.exit_code = exit_code;
            if !stderr_tail.is_empty() {
                diag.stderr_tail = Some(stderr_tail);
            }
        }

        record.mark_closed();
        self.remove_and_decrement(record);
    }

    /// Request termination of a running session. Idempotent: triggering an
    /// already-draining or unknown session is a successful no-op.
    pub fn finish(self: &Arc<Self>, record: &Arc<SessionRecord>, cause: CancelCause) {
        if !record.begin_draining() {
            return;
        }
        record.set_cancel_cause(cause);

        let manager = Arc::clone(self);
        let record = Arc::clone(record);
        let grace = Duration::from_millis(self.config.get().grace_period_ms);
        tokio::spawn(async move {
            let child = record.child.lock().expect("child lock poisoned").take();
            let (exit_code, stderr_tail) = match child {
                Some(child) => child.shutdown(grace).await,
                None => (None, String::new()),
            };

            {
                let mut diag = record.diagnostics.lock().expect("diagnostics lock poisoned");
                diag.exit_code = exit_code;
                if !stderr_tail.is_empty() {
                    diag.stderr_tail = Some(stderr_tail.clone());
                }
            }

            // Early non-clean exits are startup failures in disguise; later
            // ones are ordinary upstream EOF (Plex reconnects).
            if record.cancel_cause() == Some(CancelCause::UpstreamEof)
                && record.elapsed() < STARTUP_CRASH_WINDOW
                && exit_code.unwrap_or(-1) != 0
            {
                tracing::warn!(
                    session_id = %record.id,
                    exit_code = ?exit_code,
                    stderr_tail = %stderr_tail,
                    "ffmpeg crashed during startup window"
                );
            }

            record.mark_closed();
            let snapshot = record.snapshot();
            manager.remove_and_decrement(&record);
            manager.metrics.session_completed();
            manager.events.publish(Event::StreamStopped { session: snapshot });
            tracing::info!(
                session_id = %record.id,
                cause = ?record.cancel_cause().map(|c| c.as_str()),
                exit_code = ?exit_code,
                "stream session closed"
            );
        });
    }

    /// Remove the session from the table and roll back both counters.
    /// Decrement happens strictly after the reap, never before.
    fn remove_and_decrement(&self, record: &Arc<SessionRecord>) {
        self.sessions.remove(&record.id);

        let mut counters = self.admission.lock().expect("admission lock poisoned");
        counters.total = counters.total.saturating_sub(1);
        if let Some(count) = counters.per_channel.get_mut(&record.channel_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counters.per_channel.remove(&record.channel_id);
            }
        }
    }

    /// Operator termination through `DELETE /streams/active/{id}`. Unknown or
    /// already-closed ids are a successful no-op.
    pub fn terminate(self: &Arc<Self>, session_id: &Uuid) {
        let record = self
            .sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(record) = record {
            self.finish(&record, CancelCause::OperatorTerminated);
        }
    }

    /// Drain every session on process shutdown and wait for the reaps.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let records: Vec<Arc<SessionRecord>> = self
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for record in &records {
            self.finish(record, CancelCause::Shutdown);
        }

        let grace = Duration::from_millis(self.config.get().grace_period_ms);
        let deadline = Instant::now() + grace + Duration::from_secs(5);
        while !self.sessions.is_empty() && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        if !self.sessions.is_empty() {
            tracing::warn!(
                remaining = self.sessions.len(),
                "sessions still present after shutdown grace"
            );
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.sessions
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    pub fn get_snapshot(&self, session_id: &Uuid) -> Option<SessionSnapshot> {
        self.sessions.get(session_id).map(|entry| entry.snapshot())
    }

    /// Periodic bandwidth and metrics emission. Runs for the life of the
    /// process.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut bandwidth = tokio::time::interval(Duration::from_secs(1));
            let mut metrics = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = bandwidth.tick() => {
                        // Sessions still admitting have not emitted
                        // `stream:started` yet and stay out of the snapshot.
                        let sessions: Vec<SessionSnapshot> = manager
                            .snapshots()
                            .into_iter()
                            .filter(|s| s.state == "running" || s.state == "draining")
                            .collect();
                        manager.events.publish(Event::BandwidthUpdate { sessions });
                    }
                    _ = metrics.tick() => {
                        manager.events.publish(Event::MetricsUpdate {
                            snapshot: manager.metrics.snapshot(),
                        });
                    }
                }
            }
        });
    }
}

/// Response body that copies FFmpeg stdout to the client, metering every
/// chunk, and tears the session down when dropped for any reason: client
/// disconnect, upstream EOF, or operator termination.
pub struct StreamBody {
    first: Option<Bytes>,
    reader: ReaderStream<ChildStdout>,
    record: Arc<SessionRecord>,
    manager: Arc<SessionManager>,
    ended_naturally: bool,
}

impl StreamBody {
    pub fn session_id(&self) -> Uuid {
        self.record.id
    }

    fn meter(&self, len: usize) {
        self.record
            .meter
            .lock()
            .expect("meter lock poisoned")
            .record_chunk(len);
        self.manager.metrics.add_bytes_relayed(len as u64);
    }
}

impl FuturesStream for StreamBody {
    type Item = Result<Bytes, io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if let Some(first) = this.first.take() {
            this.meter(first.len());
            return Poll::Ready(Some(Ok(first)));
        }

        match Pin::new(&mut this.reader).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.meter(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            // Mid-stream errors end the body silently; the cause lands on the
            // session record, not the wire.
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => {
                this.ended_naturally = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for StreamBody {
    fn drop(&mut self) {
        let cause = match self.record.cancel_cause() {
            Some(cause) => cause,
            None if self.ended_naturally => CancelCause::UpstreamEof,
            None => CancelCause::ClientDisconnect,
        };
        self.manager.finish(&self.record, cause);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::db::connection::run_migrations;
    use crate::db::models::NewChannel;
    use diesel::r2d2::ConnectionManager;

    fn test_manager(max_total: u32, max_per_channel: u32) -> (Arc<SessionManager>, Repository) {
        let manager = ConnectionManager::<diesel::SqliteConnection>::new(":memory:");
        let pool = diesel::r2d2::Pool::builder()
            .max_size(1)
            .build(manager)
            .expect("pool");
        let mut conn = pool.get().expect("conn");
        run_migrations(&mut conn).expect("migrations");
        drop(conn);

        let repo = Repository::new(pool);
        let events = EventBus::new();
        let settings = Settings {
            max_concurrent_streams: max_total,
            max_concurrent_per_channel: max_per_channel,
            ..Settings::default()
        };
        let config = Arc::new(ConfigStore::with_settings(
            repo.clone(),
            events.clone(),
            settings,
        ));
        let manager = SessionManager::new(
            config,
            repo.clone(),
            events,
            Arc::new(Metrics::new()),
            "ffmpeg".to_string(),
        );
        (manager, repo)
    }

    fn channel(repo: &Repository, number: i32) -> Channel {
        repo.insert_channel(&NewChannel {
            number,
            name: format!("ch{number}"),
            enabled: 1,
            logo_url: None,
            epg_id: None,
        })
        .expect("channel")
    }

    fn stream_row(channel_id: i32) -> Stream {
        Stream {
            id: 1,
            channel_id,
            name: "s".into(),
            url: "http://example/live.ts".into(),
            kind: "mpegts".into(),
            enabled: 1,
            auth: None,
            profile_id: None,
            created_at: String::new(),
            updated_at: String::new(),
        }
    }

    fn client() -> ClientInfo {
        ClientInfo {
            ip: "127.0.0.1".into(),
            user_agent: None,
            client_kind: ClientKind::WebBrowser,
        }
    }

    #[tokio::test]
    async fn test_global_capacity_enforced() {
        let (manager, repo) = test_manager(2, 3);
        let a = channel(&repo, 1);
        let b = channel(&repo, 2);
        let c = channel(&repo, 3);

        let s1 = manager.try_admit(&a, &stream_row(a.id), &client()).unwrap();
        let _s2 = manager.try_admit(&b, &stream_row(b.id), &client()).unwrap();
        let err = manager
            .try_admit(&c, &stream_row(c.id), &client())
            .unwrap_err();
        assert_eq!(err, AdmissionError::CapacityFull);
        assert_eq!(manager.active_count(), 2);

        // Releasing a slot lets the next request in.
        manager.abort_admission(&s1).await;
        assert!(manager.try_admit(&c, &stream_row(c.id), &client()).is_ok());
    }

    #[tokio::test]
    async fn test_per_channel_capacity_enforced() {
        let (manager, repo) = test_manager(10, 2);
        let a = channel(&repo, 1);
        let b = channel(&repo, 2);

        manager.try_admit(&a, &stream_row(a.id), &client()).unwrap();
        manager.try_admit(&a, &stream_row(a.id), &client()).unwrap();
        let err = manager
            .try_admit(&a, &stream_row(a.id), &client())
            .unwrap_err();
        assert_eq!(err, AdmissionError::PerChannelCapacityFull);

        // Another channel is unaffected.
        assert!(manager.try_admit(&b, &stream_row(b.id), &client()).is_ok());
    }

    #[tokio::test]
    async fn test_abort_rolls_counters_back() {
        let (manager, repo) = test_manager(1, 1);
        let a = channel(&repo, 1);

        let record = manager.try_admit(&a, &stream_row(a.id), &client()).unwrap();
        assert_eq!(manager.active_count(), 1);
        manager.abort_admission(&record).await;
        assert_eq!(manager.active_count(), 0);
        assert_eq!(record.state(), crate::stream::session::SessionState::Closed);

        // Full capacity is available again.
        assert!(manager.try_admit(&a, &stream_row(a.id), &client()).is_ok());
    }

    #[tokio::test]
    async fn test_no_stream_and_disabled_stream_classification() {
        let (manager, repo) = test_manager(5, 3);
        let ch = channel(&repo, 1);

        match manager.pick_active_stream(&ch) {
            Err(OpenError::Admission(AdmissionError::NoStream)) => {}
            other => panic!("expected NoStream, got {:?}", other.map(|s| s.id)),
        }

        repo.insert_stream(&crate::db::models::NewStream {
            channel_id: ch.id,
            name: "off".into(),
            url: "http://example/x.ts".into(),
            kind: "mpegts".into(),
            enabled: 0,
            auth: None,
            profile_id: None,
        })
        .unwrap();

        match manager.pick_active_stream(&ch) {
            Err(OpenError::Admission(AdmissionError::StreamDisabled)) => {}
            other => panic!("expected StreamDisabled, got {:?}", other.map(|s| s.id)),
        }
    }

    #[tokio::test]
    async fn test_first_enabled_stream_wins() {
        let (manager, repo) = test_manager(5, 3);
        let ch = channel(&repo, 1);
        for (name, enabled) in [("disabled", 0), ("primary", 1), ("backup", 1)] {
            repo.insert_stream(&crate::db::models::NewStream {
                channel_id: ch.id,
                name: name.into(),
                url: format!("http://example/{name}.ts"),
                kind: "mpegts".into(),
                enabled,
                auth: None,
                profile_id: None,
            })
            .unwrap();
        }

        let active = manager.pick_active_stream(&ch).unwrap();
        assert_eq!(active.name, "primary");
    }

    #[tokio::test]
    async fn test_terminate_unknown_session_is_noop() {
        let (manager, _repo) = test_manager(5, 3);
        manager.terminate(&Uuid::new_v4());
        assert_eq!(manager.active_count(), 0);
    }
}
