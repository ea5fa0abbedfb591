//! End-to-end execution of one packaging job
//!
//! fetch pages -> merge extensions -> write data file -> archive -> publish
//! -> resolve the ledger -> notify waiters.
//!
//! Everything up to publishing happens in a private scratch directory under
//! the temp directory. The directory is removed when the job ends, whether
//! it succeeded, failed, timed out or panicked.

use crate::{
    fetch_all, format_bytes, format_duration, write_rows, ArchiveBuilder, CacheEntry, CacheStore,
    CatalogClient, Collaborators, Config, ErrorSeverity, ExtensionMerger, ExtensionSpec, JobHandler,
    JobLedger, JobOutcome, Metrics, NotificationDispatcher, PackagerError, QueuedJob, SlotInfo,
};
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};

pub struct JobExecutor {
    config: Arc<Config>,
    catalog: Arc<dyn CatalogClient>,
    merger: Arc<dyn ExtensionMerger>,
    archiver: Arc<dyn ArchiveBuilder>,
    store: Arc<CacheStore>,
    ledger: Arc<JobLedger>,
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Arc<Metrics>,
    extension_spec: ExtensionSpec,
}

impl JobExecutor {
    pub fn new(
        config: Arc<Config>,
        collaborators: &Collaborators,
        store: Arc<CacheStore>,
        ledger: Arc<JobLedger>,
        dispatcher: Arc<NotificationDispatcher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let extension_spec = ExtensionSpec::from_config(&config);
        Self {
            config,
            catalog: collaborators.catalog.clone(),
            merger: collaborators.merger.clone(),
            archiver: collaborators.archiver.clone(),
            store,
            ledger,
            dispatcher,
            metrics,
            extension_spec,
        }
    }

    /// Run `job`, resolve it in the ledger and notify its waiters.
    pub async fn execute(&self, job: QueuedJob, slot: SlotInfo) -> JobOutcome {
        let started = Instant::now();
        self.ledger.mark_running(&job.fingerprint);
        info!(
            job_id = %job.job_id,
            slot = slot.slot_id,
            "Building {} archive of {} ({})",
            job.request.format.file_extension(),
            job.request.resource_id,
            job.fingerprint.short()
        );

        let timeout = self.config.job_timeout();
        let build = AssertUnwindSafe(self.build(&job)).catch_unwind();
        let outcome = match tokio::time::timeout(timeout, build).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PackagerError::Internal("packaging task panicked".to_string())),
            Err(_) => Err(PackagerError::Timeout(timeout)),
        };

        let elapsed = started.elapsed();
        match &outcome {
            Ok(entry) => info!(
                job_id = %job.job_id,
                "Published {} ({}) in {}",
                entry.file_name(),
                format_bytes(entry.size),
                format_duration(elapsed)
            ),
            Err(e) => match e.severity() {
                ErrorSeverity::High => error!(
                    job_id = %job.job_id,
                    kind = e.kind(),
                    "Packaging {} failed after {}: {}",
                    job.request.resource_id,
                    format_duration(elapsed),
                    e
                ),
                ErrorSeverity::Medium | ErrorSeverity::Low => warn!(
                    job_id = %job.job_id,
                    kind = e.kind(),
                    "Packaging {} failed after {}: {}",
                    job.request.resource_id,
                    format_duration(elapsed),
                    e
                ),
            },
        }
        self.metrics.record_job_finished(
            elapsed,
            outcome.is_ok(),
            outcome.as_ref().ok().map(|entry| entry.size),
        );

        let waiters = self.ledger.resolve(&job.fingerprint, outcome.clone());
        self.metrics.set_jobs_in_flight(self.ledger.in_flight());
        self.dispatcher.dispatch(waiters, &outcome);

        outcome
    }

    async fn build(&self, job: &QueuedJob) -> Result<CacheEntry, PackagerError> {
        let workspace = tempfile::Builder::new()
            .prefix("packager-")
            .tempdir_in(&self.config.temp_directory)
            .map_err(|e| {
                PackagerError::StorageFailure(format!(
                    "cannot create scratch directory in {}: {e}",
                    self.config.temp_directory.display()
                ))
            })?;

        let rows = fetch_all(self.catalog.as_ref(), &job.request, self.config.page_size).await?;
        debug!("Fetched {} rows for job {}", rows.len(), job.job_id);

        let rows = if job.request.format.needs_extension_merge() {
            let merger = self.merger.clone();
            let spec = self.extension_spec.clone();
            tokio::task::spawn_blocking(move || merger.merge(rows, &spec))
                .await
                .map_err(|e| PackagerError::Internal(e.to_string()))??
        } else {
            rows
        };

        let data_path = workspace.path().join(format!(
            "{}.{}",
            job.request.resource_id,
            job.request.format.file_extension()
        ));
        let format = job.request.format;
        let written = {
            let data_path = data_path.clone();
            tokio::task::spawn_blocking(move || write_rows(&data_path, &rows, format))
                .await
                .map_err(|e| PackagerError::Internal(e.to_string()))??
        };
        debug!("Wrote {} to {}", format_bytes(written), data_path.display());

        let archive_path = workspace
            .path()
            .join(job.fingerprint.archive_file_name(&self.config.archive_extension));
        self.archiver.create_archive(&data_path, &archive_path).await?;

        self.store.publish(&job.fingerprint, &archive_path).await
    }
}

#[async_trait]
impl JobHandler for JobExecutor {
    async fn handle(&self, job: QueuedJob, slot: SlotInfo) {
        self.execute(job, slot).await;
    }
}
