//! Packaging service orchestrating the cache, ledger and worker pool
//!
//! This module provides the `PackagerService` every front end talks to.
//! A submission is answered from the cache when possible, attached to an
//! in-flight build of the same fingerprint when one exists, and queued as a
//! new job otherwise.

use crate::{
    ArchiveBuilder, CacheEntry, CacheStore, CatalogClient, CkanClient, Clock,
    CommandArchiveBuilder, CommandMailNotifier, Config, DwcTermMerger, EmailTemplates,
    ExtensionMerger, Fingerprint, JobExecutor, JobHandle, JobLedger, JobOutcome, LogNotifier,
    Metrics, NotificationDispatcher, Notifier, PackagerError, PoolStats, QueuedJob,
    RequestParameters, SystemClock, Waiter, WorkerPool,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Per-page timeout for catalog requests. CKAN gives up after 60s itself.
const CATALOG_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// The external systems a packaging job talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogClient>,
    pub merger: Arc<dyn ExtensionMerger>,
    pub archiver: Arc<dyn ArchiveBuilder>,
    pub notifier: Arc<dyn Notifier>,
}

impl Collaborators {
    /// Production collaborators: CKAN over HTTP, the Darwin Core merger, the
    /// configured zip command, and the mail command when one is set.
    pub fn from_config(config: &Config) -> Result<Self, PackagerError> {
        let notifier: Arc<dyn Notifier> = match &config.mail_command {
            Some(command) => Arc::new(CommandMailNotifier::new(command, config)?),
            None => Arc::new(LogNotifier),
        };

        Ok(Self {
            catalog: Arc::new(CkanClient::new(
                CATALOG_REQUEST_TIMEOUT,
                config.ckan_api_key.clone(),
            )?),
            merger: Arc::new(DwcTermMerger),
            archiver: Arc::new(CommandArchiveBuilder::new(&config.zip_command)?),
            notifier,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionStatus {
    /// Served from a published archive; the requester was notified already
    CacheHit,
    /// A new build was queued for this request
    Queued,
    /// Attached to a build already in flight
    Joined,
}

/// What the caller gets back for an accepted request.
#[derive(Debug)]
pub struct Submission {
    pub request_id: Uuid,
    pub fingerprint: Fingerprint,
    pub status: SubmissionStatus,
    /// Text to show the requester
    pub message: String,
    handle: JobHandle,
}

impl Submission {
    pub fn handle(&self) -> JobHandle {
        self.handle.clone()
    }

    /// Wait for the archive this submission is attached to.
    pub async fn wait(self) -> JobOutcome {
        self.handle.wait().await
    }
}

/// Where a request stands after the cache and the ledger were consulted.
enum Admission {
    Settled(Submission),
    /// This request leads a new build that still has to be queued
    Lead(Lead),
}

struct Lead {
    request_id: Uuid,
    job: QueuedJob,
    handle: JobHandle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceStats {
    pub cached_archives: usize,
    pub jobs_in_flight: usize,
    pub pool: PoolStats,
}

/// Resource packaging service
///
/// # Examples
///
/// ```rust,no_run
/// use resource_packager::{Collaborators, Config, Metrics, PackagerService, RequestParameters};
/// use std::sync::Arc;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = Config::default();
///     let collaborators = Collaborators::from_config(&config)?;
///     let service = PackagerService::new(config, collaborators, Arc::new(Metrics::new())).await?;
///
///     let submission = service.submit(&RequestParameters {
///         resource_id: "05ff2255-c38a-40c9-b657-4ccb55ab2feb".to_string(),
///         ckan_host: "https://data.nhm.ac.uk".to_string(),
///         email: "someone@example.org".to_string(),
///         ..Default::default()
///     })?;
///     let entry = submission.wait().await?;
///     println!("Archive ready: {}", entry.archive_path.display());
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct PackagerService {
    config: Arc<Config>,
    store: Arc<CacheStore>,
    ledger: Arc<JobLedger>,
    pool: WorkerPool,
    dispatcher: Arc<NotificationDispatcher>,
    metrics: Arc<Metrics>,
    eviction_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl PackagerService {
    pub async fn new(
        config: Config,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
    ) -> Result<Self, PackagerError> {
        Self::with_clock(config, collaborators, metrics, Arc::new(SystemClock)).await
    }

    /// Like [`PackagerService::new`] with an explicit clock for cache expiry.
    pub async fn with_clock(
        config: Config,
        collaborators: Collaborators,
        metrics: Arc<Metrics>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, PackagerError> {
        config.validate()?;
        tokio::fs::create_dir_all(&config.temp_directory)
            .await
            .map_err(|e| {
                PackagerError::StorageFailure(format!(
                    "cannot create {}: {e}",
                    config.temp_directory.display()
                ))
            })?;

        let config = Arc::new(config);
        let store = Arc::new(CacheStore::open(&config, clock)?);
        let ledger = Arc::new(JobLedger::new());
        let dispatcher = Arc::new(NotificationDispatcher::new(
            collaborators.notifier.clone(),
            EmailTemplates::from_config(&config),
            metrics.clone(),
        ));
        let executor = Arc::new(JobExecutor::new(
            config.clone(),
            &collaborators,
            store.clone(),
            ledger.clone(),
            dispatcher.clone(),
            metrics.clone(),
        ));
        let pool = WorkerPool::new(&config, executor, metrics.clone());
        let eviction_task = store.start_eviction_task(config.eviction_interval(), metrics.clone());

        info!(
            "Packager ready: {} cached archives in {}",
            store.len(),
            store.root().display()
        );

        Ok(Self {
            config,
            store,
            ledger,
            pool,
            dispatcher,
            metrics,
            eviction_task: std::sync::Mutex::new(Some(eviction_task)),
        })
    }

    /// Accept a packaging request.
    ///
    /// Never waits for the build itself: the returned submission carries a
    /// handle that resolves with the published archive or the job's error.
    /// Fails with `InvalidRequest` for malformed parameters and with
    /// `QueueFull` when the build cannot be queued.
    pub fn submit(&self, params: &RequestParameters) -> Result<Submission, PackagerError> {
        match self.admit(params)? {
            Admission::Settled(submission) => Ok(submission),
            Admission::Lead(lead) => {
                let queued = self.pool.submit(lead.job.clone());
                self.enqueued(lead, queued)
            }
        }
    }

    /// Like [`submit`](Self::submit), but waits for room in the queue
    /// instead of failing with `QueueFull`. Batch callers use this to apply
    /// backpressure.
    pub async fn submit_wait(
        &self,
        params: &RequestParameters,
    ) -> Result<Submission, PackagerError> {
        match self.admit(params)? {
            Admission::Settled(submission) => Ok(submission),
            Admission::Lead(lead) => {
                let queued = self.pool.submit_wait(lead.job.clone()).await;
                self.enqueued(lead, queued)
            }
        }
    }

    fn admit(&self, params: &RequestParameters) -> Result<Admission, PackagerError> {
        let request = params.normalize()?;
        let fingerprint = request.fingerprint();
        let waiter = Waiter {
            request_id: Uuid::new_v4(),
            email: params.email.trim().to_string(),
            resource_id: request.resource_id.clone(),
            ckan_host: request.host_name(),
        };
        let request_id = waiter.request_id;

        if let Some(entry) = self.store.lookup(&fingerprint) {
            self.metrics.record_cache_lookup(true);
            return Ok(Admission::Settled(self.serve_cached(fingerprint, waiter, entry)));
        }
        self.metrics.record_cache_lookup(false);

        let (handle, is_leader) = self.ledger.acquire_or_join(&fingerprint, waiter);
        if !is_leader {
            self.metrics.record_job_joined();
            debug!(request_id = %request_id, "Joined build {}", fingerprint.short());
            return Ok(Admission::Settled(self.submission(
                request_id,
                fingerprint,
                SubmissionStatus::Joined,
                handle,
            )));
        }

        // A build of this fingerprint may have published between the lookup
        // and taking leadership.
        if let Some(entry) = self.store.lookup(&fingerprint) {
            let outcome: JobOutcome = Ok(entry);
            let waiters = self.ledger.resolve(&fingerprint, outcome.clone());
            self.dispatcher.dispatch(waiters, &outcome);
            return Ok(Admission::Settled(self.submission(
                request_id,
                fingerprint,
                SubmissionStatus::CacheHit,
                handle,
            )));
        }

        Ok(Admission::Lead(Lead {
            request_id,
            job: QueuedJob::new(fingerprint, request),
            handle,
        }))
    }

    fn enqueued(
        &self,
        lead: Lead,
        queued: Result<(), PackagerError>,
    ) -> Result<Submission, PackagerError> {
        let Lead {
            request_id,
            job,
            handle,
        } = lead;
        let fingerprint = job.fingerprint;

        match queued {
            Ok(()) => {
                self.metrics.record_job_queued();
                self.metrics.set_jobs_in_flight(self.ledger.in_flight());
                info!(request_id = %request_id, "Queued build {}", fingerprint.short());
                Ok(self.submission(request_id, fingerprint, SubmissionStatus::Queued, handle))
            }
            Err(err) => {
                // The rejected requester learns from the returned error;
                // anyone who joined in the meantime is notified.
                self.ledger.detach(&fingerprint, request_id);
                let outcome: JobOutcome = Err(err.clone());
                let waiters = self.ledger.resolve(&fingerprint, outcome.clone());
                self.dispatcher.dispatch(waiters, &outcome);
                warn!("Rejected request for {}: {}", fingerprint.short(), err);
                Err(err)
            }
        }
    }

    fn serve_cached(&self, fingerprint: Fingerprint, waiter: Waiter, entry: CacheEntry) -> Submission {
        let request_id = waiter.request_id;
        let outcome: JobOutcome = Ok(entry);
        debug!(request_id = %request_id, "Cache hit for {}", fingerprint.short());
        self.dispatcher.dispatch(vec![waiter], &outcome);

        let handle = JobHandle::ready(fingerprint.clone(), outcome);
        self.submission(request_id, fingerprint, SubmissionStatus::CacheHit, handle)
    }

    fn submission(
        &self,
        request_id: Uuid,
        fingerprint: Fingerprint,
        status: SubmissionStatus,
        handle: JobHandle,
    ) -> Submission {
        Submission {
            request_id,
            fingerprint,
            status,
            message: self.config.success_message.clone(),
            handle,
        }
    }

    /// Evict expired archives now instead of waiting for the next sweep.
    pub fn evict_expired(&self) -> usize {
        let evicted = self.store.evict_expired(self.store.now());
        self.metrics.record_evictions(evicted);
        evicted
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn ledger(&self) -> &Arc<JobLedger> {
        &self.ledger
    }

    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            cached_archives: self.store.len(),
            jobs_in_flight: self.ledger.in_flight(),
            pool: self.pool.stats(),
        }
    }

    /// Stop accepting jobs, finish the queued ones and deliver every
    /// pending notification.
    pub async fn shutdown(&self) {
        info!("Shutting down packager...");
        if let Some(task) = self
            .eviction_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.abort();
        }
        self.pool.shutdown().await;
        self.dispatcher.flush().await;
        info!("Packager shutdown complete");
    }
}
