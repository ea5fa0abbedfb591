//! In-flight job tracking and request deduplication
//!
//! The ledger maps each fingerprint with a build in progress to a single
//! job. The first request for a fingerprint becomes the leader and must
//! enqueue the build; later requests attach as waiters and share the
//! leader's outcome through a single-assignment future.

use crate::{CacheEntry, Fingerprint, PackagerError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Result every waiter of a job receives.
pub type JobOutcome = Result<CacheEntry, PackagerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A requester waiting for a job's outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct Waiter {
    pub request_id: Uuid,
    pub email: String,
    pub resource_id: String,
    /// Host name of the catalog, for email templates
    pub ckan_host: String,
}

type SharedOutcome = Shared<BoxFuture<'static, Result<JobOutcome, oneshot::Canceled>>>;

/// Awaitable view of a job's outcome. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    fingerprint: Fingerprint,
    outcome: SharedOutcome,
}

impl JobHandle {
    fn pending(fingerprint: Fingerprint, receiver: oneshot::Receiver<JobOutcome>) -> Self {
        Self {
            fingerprint,
            outcome: receiver.boxed().shared(),
        }
    }

    /// Handle that is already resolved, used for cache hits.
    pub fn ready(fingerprint: Fingerprint, outcome: JobOutcome) -> Self {
        Self {
            fingerprint,
            outcome: futures::future::ready(Ok(outcome)).boxed().shared(),
        }
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Wait for the job to resolve.
    ///
    /// A job dropped without being resolved (the service shut down before
    /// running it) reports `ShuttingDown`.
    pub async fn wait(self) -> JobOutcome {
        match self.outcome.await {
            Ok(outcome) => outcome,
            Err(oneshot::Canceled) => Err(PackagerError::ShuttingDown),
        }
    }
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

struct Job {
    status: JobStatus,
    waiters: Vec<Waiter>,
    sender: Option<oneshot::Sender<JobOutcome>>,
    handle: JobHandle,
    created_at: Instant,
}

#[derive(Default)]
pub struct JobLedger {
    jobs: DashMap<Fingerprint, Job>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `waiter` to the job for `fingerprint`, creating the job if
    /// none is in flight. Returns `true` as the second element when the
    /// caller became the leader and must enqueue the build.
    pub fn acquire_or_join(&self, fingerprint: &Fingerprint, waiter: Waiter) -> (JobHandle, bool) {
        match self.jobs.entry(fingerprint.clone()) {
            Entry::Occupied(mut occupied) => {
                let job = occupied.get_mut();
                job.waiters.push(waiter);
                debug!(
                    "Request joined job {} ({} waiters)",
                    fingerprint.short(),
                    job.waiters.len()
                );
                (job.handle.clone(), false)
            }
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                let handle = JobHandle::pending(fingerprint.clone(), receiver);
                vacant.insert(Job {
                    status: JobStatus::Pending,
                    waiters: vec![waiter],
                    sender: Some(sender),
                    handle: handle.clone(),
                    created_at: Instant::now(),
                });
                debug!("Created job {}", fingerprint.short());
                (handle, true)
            }
        }
    }

    /// Pending -> Running. Returns false when no job is in flight.
    pub fn mark_running(&self, fingerprint: &Fingerprint) -> bool {
        match self.jobs.get_mut(fingerprint) {
            Some(mut job) => {
                job.status = JobStatus::Running;
                true
            }
            None => false,
        }
    }

    /// Remove a waiter that no longer wants the outcome. The job itself
    /// keeps running so the cache still gets populated.
    pub fn detach(&self, fingerprint: &Fingerprint, request_id: Uuid) -> bool {
        match self.jobs.get_mut(fingerprint) {
            Some(mut job) => {
                let before = job.waiters.len();
                job.waiters.retain(|w| w.request_id != request_id);
                job.waiters.len() != before
            }
            None => false,
        }
    }

    /// Complete the job with `outcome` and hand back its waiters.
    ///
    /// Every `JobHandle` for the job observes `outcome`. Resolving a
    /// fingerprint with no job in flight is a no-op returning no waiters.
    pub fn resolve(&self, fingerprint: &Fingerprint, outcome: JobOutcome) -> Vec<Waiter> {
        let Some((_, mut job)) = self.jobs.remove(fingerprint) else {
            return Vec::new();
        };

        job.status = if outcome.is_ok() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
        debug!(
            "Job {} resolved as {:?} after {:?} with {} waiters",
            fingerprint.short(),
            job.status,
            job.created_at.elapsed(),
            job.waiters.len()
        );

        if let Some(sender) = job.sender.take() {
            // Nobody holding a handle is fine; waiters are notified separately.
            let _ = sender.send(outcome);
        }

        job.waiters
    }

    pub fn status(&self, fingerprint: &Fingerprint) -> Option<JobStatus> {
        self.jobs.get(fingerprint).map(|job| job.status)
    }

    pub fn waiter_count(&self, fingerprint: &Fingerprint) -> usize {
        self.jobs
            .get(fingerprint)
            .map_or(0, |job| job.waiters.len())
    }

    pub fn in_flight(&self) -> usize {
        self.jobs.len()
    }
}
