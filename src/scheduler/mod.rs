//! EPG refresh scheduling.
//!
//! One repeated job per enabled XMLTV source, firing on the source's own
//! refresh interval. Uses tokio-cron-scheduler for job management; the
//! startup refresh runs separately through [`EpgIngester::refresh_all`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use uuid::Uuid;

use crate::db::Repository;
use crate::epg::EpgIngester;

/// Error types for scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Scheduler error: {0}")]
    SchedulerError(String),

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),
}

impl From<JobSchedulerError> for SchedulerError {
    fn from(err: JobSchedulerError) -> Self {
        SchedulerError::SchedulerError(err.to_string())
    }
}

/// Minimum accepted refresh interval. Anything shorter hammers the source.
const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct EpgScheduler {
    scheduler: Arc<RwLock<Option<JobScheduler>>>,
    jobs: Arc<RwLock<HashMap<i32, Uuid>>>,
    repo: Repository,
    ingester: EpgIngester,
}

impl EpgScheduler {
    pub fn new(repo: Repository, ingester: EpgIngester) -> Self {
        Self {
            scheduler: Arc::new(RwLock::new(None)),
            jobs: Arc::new(RwLock::new(HashMap::new())),
            repo,
            ingester,
        }
    }

    /// Start the underlying job scheduler. Must be called before
    /// [`sync_jobs`](Self::sync_jobs).
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let sched = JobScheduler::new().await?;
        sched.start().await?;

        let mut scheduler = self.scheduler.write().await;
        *scheduler = Some(sched);

        tracing::info!("EPG scheduler started");
        Ok(())
    }

    /// Stop the scheduler gracefully, removing all jobs.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        {
            let jobs: Vec<Uuid> = self.jobs.read().await.values().copied().collect();
            if let Some(ref sched) = *self.scheduler.read().await {
                for uuid in jobs {
                    let _ = sched.remove(&uuid).await;
                }
            }
        }

        if let Some(ref mut sched) = *self.scheduler.write().await {
            sched.shutdown().await?;
        }

        {
            let mut scheduler = self.scheduler.write().await;
            *scheduler = None;
        }
        {
            let mut jobs = self.jobs.write().await;
            jobs.clear();
        }

        tracing::info!("EPG scheduler stopped");
        Ok(())
    }

    /// Reconcile scheduled jobs with the current set of enabled sources:
    /// remove jobs for sources that vanished or were disabled, add jobs for
    /// new ones.
    pub async fn sync_jobs(&self) -> Result<(), SchedulerError> {
        let sources = self
            .repo
            .list_enabled_epg_sources()
            .map_err(|e| SchedulerError::SchedulerError(e.to_string()))?;

        let scheduler_guard = self.scheduler.read().await;
        let sched = scheduler_guard
            .as_ref()
            .ok_or_else(|| SchedulerError::SchedulerError("Scheduler not started".to_string()))?;

        let mut jobs = self.jobs.write().await;

        let wanted: HashMap<i32, Duration> = sources
            .iter()
            .map(|s| {
                (
                    s.id,
                    clamp_interval(Duration::from_secs(s.refresh_interval_secs.max(0) as u64)),
                )
            })
            .collect();

        // Drop jobs for sources no longer enabled.
        let stale: Vec<i32> = jobs.keys().filter(|id| !wanted.contains_key(id)).copied().collect();
        for source_id in stale {
            if let Some(uuid) = jobs.remove(&source_id) {
                let _ = sched.remove(&uuid).await;
                tracing::info!(source_id, "removed EPG refresh job");
            }
        }

        // Add jobs for newly enabled sources.
        for source in sources {
            if jobs.contains_key(&source.id) {
                continue;
            }
            let interval = wanted[&source.id];
            let repo = self.repo.clone();
            let ingester = self.ingester.clone();
            let source_id = source.id;

            let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
                let repo = repo.clone();
                let ingester = ingester.clone();
                Box::pin(async move {
                    // Re-read the source each tick; its URL or enabled flag
                    // may have changed since scheduling.
                    let source = match repo.list_epg_sources() {
                        Ok(sources) => sources.into_iter().find(|s| s.id == source_id),
                        Err(e) => {
                            tracing::error!(source_id, error = %e, "EPG source lookup failed");
                            None
                        }
                    };
                    match source {
                        Some(source) if source.is_enabled() => {
                            if let Err(e) = ingester.refresh_source(&source).await {
                                tracing::warn!(source_id, error = %e, "scheduled EPG refresh failed");
                            }
                        }
                        _ => {
                            tracing::debug!(source_id, "skipping refresh for missing or disabled source");
                        }
                    }
                })
            })
            .map_err(|e| SchedulerError::SchedulerError(e.to_string()))?;

            let uuid = sched.add(job).await?;
            jobs.insert(source_id, uuid);
            tracing::info!(
                source_id,
                interval_secs = interval.as_secs(),
                "scheduled EPG refresh"
            );
        }

        Ok(())
    }

    /// Whether a refresh job exists for a source.
    pub async fn has_job(&self, source_id: i32) -> bool {
        self.jobs.read().await.contains_key(&source_id)
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }
}

fn clamp_interval(interval: Duration) -> Duration {
    interval.max(MIN_REFRESH_INTERVAL)
}
