//! EPG ingestion pipeline.
//!
//! A fetch cycle pulls one XMLTV source, stream-parses it, upserts guide
//! channels, and replaces the covered program window per guide channel.
//! Failures mark the source and wait for the next schedule tick; there are no
//! in-cycle retries, and ingest never touches the streaming path.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::db::repository::format_utc;
use crate::db::{
    EpgSource, NewEpgChannel, NewEpgProgram, ProgramWindow, Repository, RepositoryError,
};
use crate::metrics::Metrics;
use crate::xmltv::{fetch_xmltv, parse_xmltv_data, ParsedProgram, XmltvError};

/// Error types for an ingest cycle.
#[derive(Debug, thiserror::Error)]
pub enum EpgError {
    #[error("fetch failed for source {source_id}: {cause}")]
    FetchFailed { source_id: i32, cause: String },

    #[error("parse failed for source {source_id}: {cause}")]
    ParseFailed { source_id: i32, cause: String },

    #[error("storage failed for source {source_id}: {cause}")]
    StoreFailed {
        source_id: i32,
        cause: RepositoryError,
    },
}

/// Counts reported after a successful cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub channels: usize,
    pub programs: usize,
    pub dropped_overlaps: usize,
}

#[derive(Clone)]
pub struct EpgIngester {
    repo: Repository,
    metrics: Arc<Metrics>,
}

impl EpgIngester {
    pub fn new(repo: Repository, metrics: Arc<Metrics>) -> Self {
        Self { repo, metrics }
    }

    /// Refresh every enabled source once. Used at startup; periodic refresh
    /// goes through the scheduler.
    pub async fn refresh_all(&self) {
        let sources = match self.repo.list_enabled_epg_sources() {
            Ok(sources) => sources,
            Err(e) => {
                tracing::error!(error = %e, "failed to list EPG sources for refresh");
                return;
            }
        };

        for source in sources {
            if let Err(e) = self.refresh_source(&source).await {
                tracing::warn!(source_id = source.id, error = %e, "EPG refresh failed");
            }
        }
    }

    /// Run one fetch cycle for a source, updating its bookkeeping columns on
    /// both success and failure.
    pub async fn refresh_source(&self, source: &EpgSource) -> Result<IngestStats, EpgError> {
        match self.run_cycle(source).await {
            Ok(stats) => {
                self.metrics.epg_ingest_succeeded();
                if let Err(e) = self.repo.mark_epg_source_success(source.id) {
                    tracing::warn!(source_id = source.id, error = %e, "failed to record EPG success");
                }
                tracing::info!(
                    source_id = source.id,
                    channels = stats.channels,
                    programs = stats.programs,
                    "EPG ingest complete"
                );
                Ok(stats)
            }
            Err(e) => {
                self.metrics.epg_ingest_failed();
                if let Err(mark) = self.repo.mark_epg_source_error(source.id, &e.to_string()) {
                    tracing::warn!(source_id = source.id, error = %mark, "failed to record EPG error");
                }
                Err(e)
            }
        }
    }

    async fn run_cycle(&self, source: &EpgSource) -> Result<IngestStats, EpgError> {
        let data = fetch_xmltv(&source.url)
            .await
            .map_err(|e| classify_fetch_error(source.id, e))?;

        let (channels, programs) =
            parse_xmltv_data(&data).map_err(|e| EpgError::ParseFailed {
                source_id: source.id,
                cause: e.to_string(),
            })?;

        let mut stats = IngestStats {
            channels: channels.len(),
            ..IngestStats::default()
        };

        let now = format_utc(Utc::now());
        for channel in &channels {
            self.repo
                .upsert_epg_channel(&NewEpgChannel {
                    source_id: source.id,
                    epg_id: channel.epg_id.clone(),
                    display_name: channel.display_name.clone(),
                    icon_url: channel.icon.clone(),
                    updated_at: now.clone(),
                })
                .map_err(|e| EpgError::StoreFailed {
                    source_id: source.id,
                    cause: e,
                })?;
        }

        for (epg_id, mut group) in group_by_channel(programs) {
            group.sort_by(|a, b| a.start_utc.cmp(&b.start_utc));
            let dropped = drop_overlaps(&mut group);
            stats.dropped_overlaps += dropped;

            let Some(window) = ingest_window(&group) else {
                continue;
            };

            let rows: Vec<NewEpgProgram> = group
                .into_iter()
                .map(|p| NewEpgProgram {
                    source_id: source.id,
                    epg_id: p.epg_id,
                    start_utc: p.start_utc,
                    stop_utc: p.stop_utc,
                    title: p.title,
                    description: p.description,
                    category: p.category,
                })
                .collect();

            stats.programs += self
                .repo
                .replace_epg_programs(source.id, &epg_id, window, &rows)
                .map_err(|e| EpgError::StoreFailed {
                    source_id: source.id,
                    cause: e,
                })?;
        }

        Ok(stats)
    }
}

fn classify_fetch_error(source_id: i32, err: XmltvError) -> EpgError {
    match err {
        XmltvError::DownloadError(cause) | XmltvError::DecompressError(cause) => {
            EpgError::FetchFailed { source_id, cause }
        }
        other => EpgError::ParseFailed {
            source_id,
            cause: other.to_string(),
        },
    }
}

fn group_by_channel(programs: Vec<ParsedProgram>) -> BTreeMap<String, Vec<ParsedProgram>> {
    let mut groups: BTreeMap<String, Vec<ParsedProgram>> = BTreeMap::new();
    for program in programs {
        groups.entry(program.epg_id.clone()).or_default().push(program);
    }
    groups
}

/// Enforce monotonic non-overlapping intervals within one ingest: a program
/// starting before the previous one stops is dropped. Input must be sorted by
/// start. Returns the number of dropped entries.
fn drop_overlaps(programs: &mut Vec<ParsedProgram>) -> usize {
    let before = programs.len();
    let mut last_stop: Option<String> = None;
    programs.retain(|p| {
        // Zero or negative duration never survives.
        if p.stop_utc <= p.start_utc {
            return false;
        }
        match &last_stop {
            Some(stop) if p.start_utc < *stop => false,
            _ => {
                last_stop = Some(p.stop_utc.clone());
                true
            }
        }
    });
    before - programs.len()
}

/// The time range this ingest covers for one guide channel.
fn ingest_window(programs: &[ParsedProgram]) -> Option<ProgramWindow> {
    let first = programs.first()?;
    let last = programs.last()?;
    let start = chrono::DateTime::parse_from_rfc3339(&first.start_utc)
        .ok()?
        .to_utc();
    let stop = chrono::DateTime::parse_from_rfc3339(&last.stop_utc)
        .ok()?
        .to_utc();
    Some(ProgramWindow::new(start, stop))
}
