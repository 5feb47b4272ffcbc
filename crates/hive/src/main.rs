use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hive::app::{assemble, load_catalog, Collaborators};
use hive::router::TransportRouter;
use hive::telemetry;
use hive::transport::{BrokerSubscriber, ZmqPublisher};
use hiveconf::HiveConfig;
use tokio::sync::broadcast;

/// Hive remote-chat control plane
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Config file used in place of ./hive.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    show_config: bool,

    /// Broker bridge endpoint for inbound device topics
    #[arg(long)]
    events: Option<String>,

    /// Broker bridge endpoint for outbound device commands
    #[arg(long)]
    commands: Option<String>,

    /// Content catalog file
    #[arg(long)]
    content: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (mut config, sources) = HiveConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(events) = cli.events {
        config.infra.broker.events = events;
    }
    if let Some(commands) = cli.commands {
        config.infra.broker.commands = commands;
    }
    if let Some(content) = cli.content {
        config.infra.paths.content_file = content;
    }

    if cli.show_config {
        for file in &sources.files {
            println!("# loaded: {}", file.display());
        }
        for var in &sources.env_overrides {
            println!("# env: {var}");
        }
        print!("{}", config.to_toml());
        return Ok(());
    }

    let guard = telemetry::init(&config.infra.telemetry).context("Failed to initialize telemetry")?;

    for file in &sources.files {
        tracing::info!(path = %file.display(), "Loaded config file");
    }

    std::fs::create_dir_all(&config.infra.paths.state_dir)
        .context("Failed to create state directory")?;

    let catalog = load_catalog(&config)?;
    let publisher = Arc::new(ZmqPublisher::connect(&config.infra.broker.commands)?);
    let router = assemble(&config, &catalog, Collaborators::from_config(&config, publisher))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let subscriber = BrokerSubscriber::connect(&config.infra.broker.events)?;
    let ingest = tokio::spawn(subscriber.run(router.clone(), shutdown_tx.subscribe()));

    let metrics = router.spawn_metrics_logger(
        Duration::from_secs(config.bootstrap.defaults.metrics_interval_secs.max(1)),
        shutdown_tx.subscribe(),
    );

    tracing::info!(
        events = %config.infra.broker.events,
        commands = %config.infra.broker.commands,
        "Hive ready"
    );

    wait_for_shutdown(&router, &config).await;

    let _ = shutdown_tx.send(());
    router.shutdown();
    let _ = ingest.await;
    let _ = metrics.await;

    tracing::info!("Shutdown complete");
    guard.shutdown();
    Ok(())
}

/// Block until SIGINT or SIGTERM. SIGHUP re-reads the content catalog.
async fn wait_for_shutdown(router: &TransportRouter, config: &HiveConfig) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sighup) =
            match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
                (Ok(term), Ok(hup)) => (term, hup),
                _ => {
                    tracing::warn!("Signal handlers unavailable, only Ctrl+C stops the service");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Received SIGINT (Ctrl+C), shutting down gracefully...");
                    return;
                }
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, shutting down gracefully...");
                    return;
                }
                _ = sighup.recv() => reload_content(router, config).await,
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = (router, config);
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Received Ctrl+C, shutting down gracefully...");
    }
}

#[cfg(unix)]
async fn reload_content(router: &TransportRouter, config: &HiveConfig) {
    tracing::info!(path = %config.infra.paths.content_file.display(), "Reloading content catalog");
    let result = match load_catalog(config) {
        Ok(catalog) => router.reload(&catalog).await.map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        tracing::error!(error = %e, "Content reload failed, keeping previous catalog");
    }
}
