use crate::{
    Collaborators, Config, JobOutcome, Metrics, PackagerService, RequestParameters, SubmissionStatus,
    SystemClock,
};
use anyhow::{anyhow, Context};
use clap::{Parser, Subcommand};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "resource-packager")]
#[command(about = "Packages catalog resources into cached, emailed archives")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, help = "Number of worker slots")]
    pub workers: Option<usize>,

    #[arg(long, help = "Jobs a worker slot runs before it is replaced")]
    pub requests_per_worker: Option<usize>,

    #[arg(long, help = "Directory holding published archives")]
    pub store_dir: Option<PathBuf>,

    #[arg(long, help = "Directory for in-progress builds")]
    pub temp_dir: Option<PathBuf>,

    #[arg(long, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, help = "Print Prometheus metrics before exiting")]
    pub metrics: bool,
}

impl Cli {
    /// Apply the command-line overrides on top of a loaded configuration.
    pub fn apply_overrides(&self, config: &mut Config) {
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(requests_per_worker) = self.requests_per_worker {
            config.requests_per_worker = requests_per_worker;
        }
        if let Some(store_dir) = &self.store_dir {
            config.store_directory = store_dir.clone();
        }
        if let Some(temp_dir) = &self.temp_dir {
            config.temp_directory = temp_dir.clone();
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Package every request of a JSON-lines file and wait for the archives
    Run {
        #[arg(short, long, help = "File with one JSON request per line")]
        requests: PathBuf,
    },

    /// Print the fingerprint and archive name of a request
    Fingerprint {
        #[arg(short, long, help = "JSON file holding a single request")]
        request: PathBuf,
    },

    /// Remove expired archives from the store once
    Evict,

    /// Validate configuration
    Validate {
        #[arg(short, long, help = "Configuration file to validate")]
        config: PathBuf,
    },
}

/// Counts reported at the end of a `run`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub submitted: usize,
    pub cache_hits: usize,
    pub joined: usize,
    pub rejected: usize,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct CliRunner {
    pub config: Config,
    metrics: Arc<Metrics>,
    collaborators: Option<Collaborators>,
    service: OnceCell<PackagerService>,
}

impl CliRunner {
    pub fn new(config: Config, metrics: Arc<Metrics>) -> Self {
        Self {
            config,
            metrics,
            collaborators: None,
            service: OnceCell::new(),
        }
    }

    /// Use the given collaborators instead of building them from the config.
    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = Some(collaborators);
        self
    }

    /// The packaging service, started on first use.
    pub async fn service(&self) -> anyhow::Result<&PackagerService> {
        self.service
            .get_or_try_init(|| async {
                let collaborators = match &self.collaborators {
                    Some(collaborators) => collaborators.clone(),
                    None => Collaborators::from_config(&self.config)?,
                };
                let service =
                    PackagerService::new(self.config.clone(), collaborators, self.metrics.clone())
                        .await
                        .context("failed to start the packaging service")?;
                Ok::<_, anyhow::Error>(service)
            })
            .await
    }

    pub async fn run(&self, command: Commands) -> anyhow::Result<()> {
        match command {
            Commands::Run { requests } => {
                let summary = self.run_requests(&requests).await?;
                println!(
                    "Submitted: {}, cache hits: {}, joined: {}, rejected: {}, succeeded: {}, failed: {}",
                    summary.submitted,
                    summary.cache_hits,
                    summary.joined,
                    summary.rejected,
                    summary.succeeded,
                    summary.failed
                );
                Ok(())
            }
            Commands::Fingerprint { request } => self.show_fingerprint(&request).await,
            Commands::Evict => self.evict(),
            Commands::Validate { config } => self.validate_config(&config).await,
        }
    }

    pub async fn run_requests(&self, path: &Path) -> anyhow::Result<RunSummary> {
        let requests = read_requests(path).await?;
        info!("Loaded {} requests from {}", requests.len(), path.display());

        let service = self.service().await?;
        let mut summary = RunSummary::default();
        let mut pending = Vec::new();

        // Waiting for queue room keeps a large batch from being rejected
        // while the workers are busy.
        for (line, params) in requests {
            match service.submit_wait(&params).await {
                Ok(submission) => {
                    summary.submitted += 1;
                    match submission.status {
                        SubmissionStatus::CacheHit => summary.cache_hits += 1,
                        SubmissionStatus::Joined => summary.joined += 1,
                        SubmissionStatus::Queued => {}
                    }
                    info!(
                        "Line {}: {:?} as {}",
                        line,
                        submission.status,
                        submission.fingerprint.short()
                    );
                    pending.push((line, submission.wait()));
                }
                Err(e) => {
                    summary.rejected += 1;
                    warn!("Line {}: rejected: {}", line, e);
                }
            }
        }

        let (lines, waits): (Vec<usize>, Vec<_>) = pending.into_iter().unzip();
        let outcomes: Vec<JobOutcome> = join_all(waits).await;
        for (line, outcome) in lines.into_iter().zip(outcomes) {
            match outcome {
                Ok(entry) => {
                    summary.succeeded += 1;
                    println!("{}: {}", line, entry.archive_path.display());
                }
                Err(e) if e.is_job_failure() => {
                    summary.failed += 1;
                    println!("{line}: failed: {e}");
                }
                Err(e) => {
                    summary.rejected += 1;
                    println!("{line}: rejected: {e}");
                }
            }
        }

        info!(
            "Run completed. Succeeded: {}, Failed: {}, Rejected: {}",
            summary.succeeded, summary.failed, summary.rejected
        );
        Ok(summary)
    }

    pub async fn show_fingerprint(&self, path: &Path) -> anyhow::Result<()> {
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        let params: RequestParameters = serde_json::from_str(&content)
            .with_context(|| format!("{} is not a valid request", path.display()))?;
        let request = params.normalize()?;
        let fingerprint = request.fingerprint();

        println!("Fingerprint: {fingerprint}");
        println!(
            "Archive: {}",
            self.config
                .store_directory
                .join(fingerprint.archive_file_name(&self.config.archive_extension))
                .display()
        );
        println!("Canonical request: {}", serde_json::to_string(&request)?);
        Ok(())
    }

    pub fn evict(&self) -> anyhow::Result<()> {
        let store = crate::CacheStore::open(&self.config, Arc::new(SystemClock))?;
        let evicted = store.evict_expired(store.now());
        self.metrics.record_evictions(evicted);

        println!("Evicted {} expired archives, {} remain", evicted, store.len());
        Ok(())
    }

    pub async fn validate_config(&self, config_path: &Path) -> anyhow::Result<()> {
        println!("Validating configuration: {}", config_path.display());

        let config = read_config(config_path).await?;
        config.validate()?;

        println!("Configuration is valid:");
        println!("  Workers: {}", config.workers);
        println!("  Requests per worker: {}", config.requests_per_worker);
        println!("  Queue capacity: {}", config.queue_capacity);
        println!("  Store directory: {}", config.store_directory.display());
        println!("  Cache time: {}s", config.cache_time().as_secs());
        println!("  Zip command: {}", config.zip_command);
        println!(
            "  Mail command: {}",
            config.mail_command.as_deref().unwrap_or("(log only)")
        );

        Ok(())
    }

    /// Shut the service down if it was started.
    pub async fn shutdown(&self) {
        if let Some(service) = self.service.get() {
            service.shutdown().await;
        }
    }
}

pub async fn read_config(path: &Path) -> anyhow::Result<Config> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read configuration {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("invalid configuration {}", path.display()))
}

/// Parse a JSON-lines request file, skipping blank lines and `#` comments.
/// Requests are returned with their 1-based line number.
pub async fn read_requests(path: &Path) -> anyhow::Result<Vec<(usize, RequestParameters)>> {
    let content = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(number, line)| {
            serde_json::from_str(line)
                .map(|params| (number, params))
                .with_context(|| format!("line {number} is not a valid request"))
        })
        .collect()
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}
