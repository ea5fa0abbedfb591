use metrics::{register_counter, register_gauge, register_histogram, Counter, Gauge, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Duration;
use tracing::info;

/// Handles for every metric the packager emits.
///
/// Handles bind to whichever recorder is installed when `Metrics::new` runs;
/// install the Prometheus recorder first to have them exported.
pub struct Metrics {
    pub cache_hits: Counter,
    pub cache_misses: Counter,
    pub jobs_queued: Counter,
    pub jobs_joined: Counter,
    pub jobs_succeeded: Counter,
    pub jobs_failed: Counter,
    pub queue_full: Counter,
    pub worker_retirements: Counter,
    pub worker_crashes: Counter,
    pub notifications_sent: Counter,
    pub notifications_failed: Counter,
    pub archives_evicted: Counter,
    pub queue_depth: Gauge,
    pub jobs_in_flight: Gauge,
    pub job_duration: Histogram,
    pub archive_size: Histogram,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            cache_hits: register_counter!("packager_cache_hits_total"),
            cache_misses: register_counter!("packager_cache_misses_total"),
            jobs_queued: register_counter!("packager_jobs_queued_total"),
            jobs_joined: register_counter!("packager_jobs_joined_total"),
            jobs_succeeded: register_counter!("packager_jobs_succeeded_total"),
            jobs_failed: register_counter!("packager_jobs_failed_total"),
            queue_full: register_counter!("packager_queue_full_total"),
            worker_retirements: register_counter!("packager_worker_retirements_total"),
            worker_crashes: register_counter!("packager_worker_crashes_total"),
            notifications_sent: register_counter!("packager_notifications_sent_total"),
            notifications_failed: register_counter!("packager_notifications_failed_total"),
            archives_evicted: register_counter!("packager_archives_evicted_total"),
            queue_depth: register_gauge!("packager_queue_depth"),
            jobs_in_flight: register_gauge!("packager_jobs_in_flight"),
            job_duration: register_histogram!("packager_job_duration_seconds"),
            archive_size: register_histogram!("packager_archive_size_bytes"),
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if hit {
            self.cache_hits.increment(1);
        } else {
            self.cache_misses.increment(1);
        }
    }

    pub fn record_job_queued(&self) {
        self.jobs_queued.increment(1);
    }

    pub fn record_job_joined(&self) {
        self.jobs_joined.increment(1);
    }

    pub fn record_job_finished(&self, duration: Duration, success: bool, archive_size: Option<u64>) {
        if success {
            self.jobs_succeeded.increment(1);
        } else {
            self.jobs_failed.increment(1);
        }

        self.job_duration.record(duration.as_secs_f64());
        if let Some(size) = archive_size {
            self.archive_size.record(size as f64);
        }
    }

    pub fn record_queue_full(&self) {
        self.queue_full.increment(1);
    }

    pub fn record_worker_retired(&self) {
        self.worker_retirements.increment(1);
    }

    pub fn record_worker_crashed(&self) {
        self.worker_crashes.increment(1);
    }

    pub fn record_notification(&self, delivered: bool) {
        if delivered {
            self.notifications_sent.increment(1);
        } else {
            self.notifications_failed.increment(1);
        }
    }

    pub fn record_evictions(&self, count: usize) {
        self.archives_evicted.increment(count as u64);
    }

    pub fn set_queue_depth(&self, depth: usize) {
        self.queue_depth.set(depth as f64);
    }

    pub fn set_jobs_in_flight(&self, count: usize) {
        self.jobs_in_flight.set(count as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder as the global metrics recorder.
///
/// Must run before [`Metrics::new`] for the handles to be exported.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("Prometheus metrics recorder installed");
    Ok(handle)
}
