use clap::Parser;
use crawl_gateway::{
    install_prometheus_recorder, load_config, setup_logging, Cli, CliRunner, Commands, Metrics,
};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let args = Cli::parse();
    let config = load_config(&args).await?;

    setup_logging(args.verbose, &config.log_level)?;
    info!("Starting crawl-gateway v{}", env!("CARGO_PKG_VERSION"));
    info!("Worker pool size: {}", config.worker_pool_size);
    info!("Max concurrent jobs: {}", config.max_concurrent_jobs);
    info!("Job timeout: {:?}", config.job_timeout);

    // The recorder must exist before any metric handle is registered
    let prometheus = if config.metrics_enabled {
        Some(install_prometheus_recorder()?)
    } else {
        None
    };
    let metrics = Arc::new(Metrics::new());

    let cli_runner = CliRunner::new(config, metrics, prometheus)?;

    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let _shutdown_handler = setup_shutdown_handler(shutdown_tx.clone());

    // The server drains in-flight requests itself; other commands are cut short.
    let serving = matches!(args.command, Commands::Serve { .. });
    let result = tokio::select! {
        result = cli_runner.run(args.command, shutdown_tx.subscribe()) => {
            info!("Command completed");
            result
        }
        _ = shutdown_rx.recv(), if !serving => {
            info!("Received shutdown signal");
            Ok(())
        }
    };

    info!("Shutting down...");
    cli_runner.service.shutdown().await;

    if let Err(e) = result {
        error!("Application error: {:#}", e);
        std::process::exit(1);
    }

    info!("crawl-gateway stopped");
    Ok(())
}

fn setup_shutdown_handler(shutdown_tx: broadcast::Sender<()>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut sigint = match signal::unix::signal(signal::unix::SignalKind::interrupt()) {
            Ok(sigint) => sigint,
            Err(e) => {
                error!("Failed to create SIGINT handler: {}", e);
                return;
            }
        };
        let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                error!("Failed to create SIGTERM handler: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
        }

        let _ = shutdown_tx.send(());
    })
}
