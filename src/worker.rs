use crate::{Config, Fingerprint, Metrics, NormalizedRequest, PackagerError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};
use uuid::Uuid;

/// A build waiting in the queue.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: Uuid,
    pub fingerprint: Fingerprint,
    pub request: NormalizedRequest,
    pub enqueued_at: Instant,
}

impl QueuedJob {
    pub fn new(fingerprint: Fingerprint, request: NormalizedRequest) -> Self {
        Self {
            job_id: Uuid::new_v4(),
            fingerprint,
            request,
            enqueued_at: Instant::now(),
        }
    }
}

/// Identity of the worker slot running a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotInfo {
    /// Unique for the lifetime of the pool; a replacement slot gets a new id
    pub slot_id: usize,
    /// Position in the pool, stable across replacements
    pub position: usize,
}

/// Runs one queued job to completion.
///
/// Implementations own the whole job lifecycle, including resolving it;
/// the pool only decides when and where a job runs.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: QueuedJob, slot: SlotInfo);
}

#[derive(Debug, Default)]
struct PoolCounters {
    next_slot_id: AtomicUsize,
    live_slots: AtomicUsize,
    queued: AtomicUsize,
    processed: AtomicUsize,
    retired: AtomicUsize,
    crashed: AtomicUsize,
}

enum SlotExit {
    Retired,
    QueueClosed,
}

/// A bounded-lifetime worker: processes up to `limit` jobs, one at a time,
/// then exits so its supervisor can replace it.
struct WorkerSlot {
    info: SlotInfo,
    limit: usize,
    processed: usize,
    handler: Arc<dyn JobHandler>,
    counters: Arc<PoolCounters>,
    metrics: Arc<Metrics>,
}

impl WorkerSlot {
    async fn run(mut self, queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>) -> SlotExit {
        debug!(
            "Starting worker slot {} at position {}",
            self.info.slot_id, self.info.position
        );
        self.counters.live_slots.fetch_add(1, Ordering::Relaxed);

        let exit = loop {
            if self.processed >= self.limit {
                break SlotExit::Retired;
            }

            let job = {
                let mut receiver = queue.lock().await;
                receiver.recv().await
            };

            let Some(job) = job else {
                break SlotExit::QueueClosed;
            };

            let depth = self.counters.queued.fetch_sub(1, Ordering::Relaxed) - 1;
            self.metrics.set_queue_depth(depth);
            debug!(
                "Worker slot {} picked up job {} after {:?} in queue",
                self.info.slot_id,
                job.job_id,
                job.enqueued_at.elapsed()
            );

            self.handler.handle(job, self.info).await;

            self.processed += 1;
            self.counters.processed.fetch_add(1, Ordering::Relaxed);
        };

        self.counters.live_slots.fetch_sub(1, Ordering::Relaxed);
        exit
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub live_slots: usize,
    pub queued: usize,
    pub queue_capacity: usize,
    pub processed: usize,
    pub retired: usize,
    pub crashed: usize,
}

/// Fixed number of worker slots fed from a bounded queue.
///
/// Each position in the pool is owned by a supervisor task that spawns a
/// slot, waits for it to retire, and spawns a replacement until the queue
/// is closed.
pub struct WorkerPool {
    sender: std::sync::Mutex<Option<mpsc::Sender<QueuedJob>>>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
    workers: usize,
    capacity: usize,
    counters: Arc<PoolCounters>,
    metrics: Arc<Metrics>,
}

impl WorkerPool {
    pub fn new(config: &Config, handler: Arc<dyn JobHandler>, metrics: Arc<Metrics>) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let queue = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(PoolCounters::default());

        let supervisors = (0..config.workers)
            .map(|position| {
                tokio::spawn(supervise(
                    position,
                    config.requests_per_worker,
                    queue.clone(),
                    handler.clone(),
                    counters.clone(),
                    metrics.clone(),
                ))
            })
            .collect();

        info!(
            "Worker pool started with {} workers, {} jobs per worker, queue capacity {}",
            config.workers, config.requests_per_worker, config.queue_capacity
        );

        Self {
            sender: std::sync::Mutex::new(Some(sender)),
            supervisors: Mutex::new(supervisors),
            workers: config.workers,
            capacity: config.queue_capacity,
            counters,
            metrics,
        }
    }

    /// Queue a job without waiting; a full queue is reported as `QueueFull`.
    pub fn submit(&self, job: QueuedJob) -> Result<(), PackagerError> {
        let sender = self.sender()?;

        let depth = self.counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
        match sender.try_send(job) {
            Ok(()) => {
                self.metrics.set_queue_depth(depth);
                Ok(())
            }
            Err(err) => {
                self.counters.queued.fetch_sub(1, Ordering::Relaxed);
                match err {
                    TrySendError::Full(_) => {
                        self.metrics.record_queue_full();
                        Err(PackagerError::QueueFull {
                            capacity: self.capacity,
                        })
                    }
                    TrySendError::Closed(_) => Err(PackagerError::ShuttingDown),
                }
            }
        }
    }

    /// Queue a job, waiting for room when the queue is full.
    pub async fn submit_wait(&self, job: QueuedJob) -> Result<(), PackagerError> {
        let sender = self.sender()?;
        let permit = sender
            .reserve()
            .await
            .map_err(|_| PackagerError::ShuttingDown)?;

        let depth = self.counters.queued.fetch_add(1, Ordering::Relaxed) + 1;
        permit.send(job);
        self.metrics.set_queue_depth(depth);
        Ok(())
    }

    fn sender(&self) -> Result<mpsc::Sender<QueuedJob>, PackagerError> {
        self.sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(PackagerError::ShuttingDown)
    }

    /// Stop accepting jobs, let queued jobs drain, and wait for every slot to exit.
    pub async fn shutdown(&self) {
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        drop(sender);

        let supervisors = std::mem::take(&mut *self.supervisors.lock().await);
        for supervisor in supervisors {
            if let Err(e) = supervisor.await {
                error!("Worker supervisor ended abnormally: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            live_slots: self.counters.live_slots.load(Ordering::Relaxed),
            queued: self.counters.queued.load(Ordering::Relaxed),
            queue_capacity: self.capacity,
            processed: self.counters.processed.load(Ordering::Relaxed),
            retired: self.counters.retired.load(Ordering::Relaxed),
            crashed: self.counters.crashed.load(Ordering::Relaxed),
        }
    }
}

async fn supervise(
    position: usize,
    limit: usize,
    queue: Arc<Mutex<mpsc::Receiver<QueuedJob>>>,
    handler: Arc<dyn JobHandler>,
    counters: Arc<PoolCounters>,
    metrics: Arc<Metrics>,
) {
    loop {
        let info = SlotInfo {
            slot_id: counters.next_slot_id.fetch_add(1, Ordering::Relaxed),
            position,
        };
        let slot = WorkerSlot {
            info,
            limit,
            processed: 0,
            handler: handler.clone(),
            counters: counters.clone(),
            metrics: metrics.clone(),
        };

        match tokio::spawn(slot.run(queue.clone())).await {
            Ok(SlotExit::Retired) => {
                counters.retired.fetch_add(1, Ordering::Relaxed);
                metrics.record_worker_retired();
                info!(
                    "Worker slot {} retired after {} jobs, starting replacement",
                    info.slot_id, limit
                );
            }
            Ok(SlotExit::QueueClosed) => {
                debug!("Worker slot {} stopping, queue closed", info.slot_id);
                break;
            }
            Err(e) => {
                // The slot never decremented its live count.
                counters.live_slots.fetch_sub(1, Ordering::Relaxed);
                counters.crashed.fetch_add(1, Ordering::Relaxed);
                metrics.record_worker_crashed();
                error!(
                    "Worker slot {} crashed: {}, starting replacement",
                    info.slot_id, e
                );
            }
        }
    }
}
