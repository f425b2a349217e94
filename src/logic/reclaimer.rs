use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{PipelineError, PipelineResult};
use crate::logic::deploy_ops::DeployPipeline;
use crate::model::{now, trash_cache_key, JobRecord, ReclaimJob, Timestamp, TrashEntry};
use crate::storage::paths::is_safe_deploy_path;
use crate::storage::TieredFileStore;
use crate::store::traits::Store;

/// Sweeps run once every this many polls
const SWEEP_EVERY_POLLS: u32 = 30;
/// Longest backoff exponent; keeps the delay from overflowing
const MAX_BACKOFF_SHIFT: i32 = 20;

/// Out-of-band channel for paths that need a human
pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, detail: &str);
}

/// Writes notifications to the error log
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, detail: &str) {
        error!("[reclaimer] {}: {}", subject, detail);
    }
}

#[derive(Debug, Clone)]
pub struct ReclaimerSettings {
    pub max_attempts: i32,
    pub base_delay: Duration,
    pub poll_interval: Duration,
    pub batch_size: usize,
    /// How long a claimed job is hidden from other workers
    pub lease: Duration,
}

impl Default for ReclaimerSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(2),
            batch_size: 16,
            lease: Duration::from_secs(300),
        }
    }
}

/// Counts from one [`Reclaimer::run_once`] pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReclaimReport {
    pub completed: usize,
    pub retried: usize,
    pub buried: usize,
}

/// Runs queued reclamation jobs with retry and backoff.
pub struct Reclaimer<S: Store> {
    store: Arc<S>,
    files: TieredFileStore,
    settings: ReclaimerSettings,
    notifier: Arc<dyn Notifier>,
}

impl<S: Store + 'static> Reclaimer<S> {
    pub fn new(store: Arc<S>, files: TieredFileStore, settings: ReclaimerSettings) -> Self {
        Self {
            store,
            files,
            settings,
            notifier: Arc::new(LogNotifier),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Delay before attempt `attempts + 1`, doubling from `base_delay`
    pub fn backoff(&self, attempts: i32) -> Duration {
        let shift = (attempts - 1).clamp(0, MAX_BACKOFF_SHIFT) as u32;
        self.settings.base_delay.saturating_mul(1u32 << shift)
    }

    /// Claim and run one batch of due jobs.
    pub async fn run_once(&self) -> PipelineResult<ReclaimReport> {
        let jobs = self
            .store
            .claim_due_jobs(now(), self.settings.batch_size, self.settings.lease)
            .await?;

        let mut report = ReclaimReport::default();
        for record in jobs {
            match self.execute(&record.job).await {
                Ok(()) => {
                    self.store.complete_job(record.id, now()).await?;
                    info!(
                        "Reclaim job {} ({}) done after {} attempts",
                        record.id,
                        record.identity,
                        record.attempts + 1
                    );
                    report.completed += 1;
                }
                Err(e) => {
                    if self.handle_failure(&record, e).await? {
                        report.buried += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }
        Ok(report)
    }

    /// Returns true if the job was buried
    async fn handle_failure(&self, record: &JobRecord, err: PipelineError) -> PipelineResult<bool> {
        let attempts = record.attempts + 1;
        let message = err.to_string();
        let at = now();

        let hard_stop = matches!(err, PipelineError::UnsafePath(_));
        if hard_stop || attempts >= self.settings.max_attempts {
            self.store
                .bury_job(record.id, attempts, &message, at)
                .await?;
            self.record_trash(record.job.path(), &message, at).await?;
            self.notifier.notify(
                "reclaim job needs manual attention",
                &format!(
                    "{} gave up after {} attempts: {}",
                    record.identity, attempts, message
                ),
            );
            return Ok(true);
        }

        let delay = self.backoff(attempts);
        let next_run_at = at + chrono::Duration::from_std(delay).map_err(anyhow::Error::from)?;
        self.store
            .retry_job(record.id, attempts, next_run_at, &message)
            .await?;
        warn!(
            "Reclaim job {} attempt {} failed, retrying in {:?}: {}",
            record.identity, attempts, delay, message
        );
        Ok(false)
    }

    async fn record_trash(&self, path: &str, reason: &str, at: Timestamp) -> PipelineResult<TrashEntry> {
        let entry = TrashEntry::new(path, reason, at);
        let value = serde_json::to_value(&entry).map_err(anyhow::Error::from)?;
        self.store.cache_put(&entry.cache_key(), value, None).await?;
        Ok(entry)
    }

    /// Run one job. Safe to repeat after a partial earlier run.
    pub async fn execute(&self, job: &ReclaimJob) -> PipelineResult<()> {
        match job {
            ReclaimJob::MarkForTrash { path, reason } => {
                let entry = self.record_trash(path, reason, now()).await?;
                self.notifier.notify(
                    "path marked for trash",
                    &format!("{} ({}) safe={}", path, reason, entry.safe),
                );
                Ok(())
            }
            ReclaimJob::RemoveDirectory { path, reason } => {
                if !is_safe_deploy_path(path) {
                    return Err(PipelineError::UnsafePath(path.clone()));
                }

                self.files.remove_directory(path).await?;
                if self.files.exists(path).await? {
                    return Err(PipelineError::storage(format!(
                        "entries still listed under '{}' after removal",
                        path
                    )));
                }

                self.store.cache_evict(&trash_cache_key(path, true)).await?;
                self.store.cache_evict(&trash_cache_key(path, false)).await?;
                info!("Removed deploy tree {} ({})", path, reason);
                Ok(())
            }
        }
    }

    /// Poll for jobs on a background task; every few polls also run the
    /// pipeline's sweeps so stale deploys get queued.
    pub fn spawn(self: Arc<Self>, pipeline: Option<Arc<DeployPipeline<S>>>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut polls: u32 = 0;
            loop {
                if polls % SWEEP_EVERY_POLLS == 0 {
                    if let Some(pipeline) = &pipeline {
                        if let Err(e) = pipeline.run_sweeps().await {
                            warn!("Deploy sweep failed: {}", e);
                        }
                    }
                }
                polls = polls.wrapping_add(1);

                match self.run_once().await {
                    Ok(report) if report != ReclaimReport::default() => {
                        info!(
                            "Reclaimer pass: {} done, {} retried, {} buried",
                            report.completed, report.retried, report.buried
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("Reclaimer pass failed: {}", e),
                }
                tokio::time::sleep(self.settings.poll_interval).await;
            }
        })
    }
}
