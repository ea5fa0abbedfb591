use anyhow::anyhow;
use clap::Parser;
use resource_packager::{
    install_prometheus_recorder, read_config, setup_logging, Cli, CliRunner, Config, Metrics,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Cli::parse();

    setup_logging(args.verbose)?;

    info!("Starting resource-packager v{}", env!("CARGO_PKG_VERSION"));

    // The recorder has to be in place before any metric handle is registered.
    let prometheus = if args.metrics {
        Some(install_prometheus_recorder().map_err(|e| anyhow!("{e}"))?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    let config = load_config(&args).await?;
    let cli_runner = CliRunner::new(config, metrics);

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx);

    let result = tokio::select! {
        result = cli_runner.run(args.command) => {
            info!("Command completed");
            result
        }
        Ok(()) = shutdown_rx.recv() => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.shutdown().await;

    if let Some(handle) = prometheus {
        println!("{}", handle.render());
    }

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("resource-packager stopped");
    Ok(())
}

async fn load_config(args: &Cli) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => read_config(path).await?,
        None => Config::default(),
    };

    args.apply_overrides(&mut config);
    config.validate()?;

    info!("Configuration loaded successfully");
    info!(
        "Workers: {}, requests per worker: {}, queue capacity: {}",
        config.workers, config.requests_per_worker, config.queue_capacity
    );
    info!("Store directory: {}", config.store_directory.display());

    Ok(config)
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
