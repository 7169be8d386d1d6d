//! MQTT to Prometheus bridge.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, error, info};

use promqtt::{BridgeConfig, BridgeController, HttpServer, MqttSubscriber};
use promqtt_common::init_tracing;
use promqtt_exporter::MetricStore;

/// Bridge MQTT device telemetry to Prometheus.
#[derive(Parser, Debug)]
#[command(name = "promqtt")]
#[command(about = "Export MQTT device telemetry as Prometheus metrics")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format).
    #[arg(short, long, default_value = "promqtt.json5")]
    config: PathBuf,

    /// HTTP listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// Log level (trace, debug, info, warn, error). Overrides config.
    #[arg(long)]
    log_level: Option<String>,

    /// Shorthand for --log-level debug.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load_from_file(&args.config)?;

    // CLI overrides
    if let Some(listen) = args.listen {
        config.http.listen = listen;
        config.validate()?;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    } else if args.verbose {
        config.logging.level = "debug".to_string();
    }

    init_tracing(&config.logging)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config.display(),
        "Starting promqtt"
    );

    let config = Arc::new(config);

    let store = Arc::new(
        MetricStore::new().hide_empty_metrics(config.exporter.hide_empty_metrics),
    );
    let controller = Arc::new(BridgeController::from_config(&config, store.clone())?);

    let listen_addr: SocketAddr = config
        .http
        .listen
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Create components
    let subscriber = MqttSubscriber::new(controller.clone(), config.mqtt.clone());
    let http_server = HttpServer::new(controller.clone(), config.clone(), listen_addr);

    // Start sweep task
    let sweep_store = store.clone();
    let sweep_interval = config.exporter.sweep_interval();
    let mut sweep_shutdown = shutdown_rx.clone();

    let sweep_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let removed = sweep_store.check_timeout();
                    if removed > 0 {
                        debug!(removed, "Removed stale metric instances");
                    }
                }
                _ = sweep_shutdown.changed() => {
                    if *sweep_shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });

    // Start subscriber
    let subscriber_shutdown = shutdown_rx.clone();
    let subscriber_task = tokio::spawn(async move {
        if let Err(e) = subscriber.run(subscriber_shutdown).await {
            error!("Subscriber error: {}", e);
        }
    });

    // Start HTTP server
    let http_shutdown = shutdown_rx.clone();
    let http_task = tokio::spawn(async move {
        if let Err(e) = http_server.run(http_shutdown).await {
            error!("HTTP server error: {}", e);
        }
    });

    // Wait for shutdown signal
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    // Signal shutdown
    shutdown_tx.send(true)?;

    // Wait for tasks to complete
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = subscriber_task.await;
        let _ = http_task.await;
        let _ = sweep_task.await;
    })
    .await;

    // Print final stats
    let stats = controller.stats();
    let store_stats = store.stats();
    info!(
        messages_received = stats.messages_received,
        messages_matched = stats.messages_matched,
        parse_failures = stats.parse_failures,
        eval_failures = stats.eval_failures,
        store_errors = stats.store_errors,
        handler_panics = stats.handler_panics,
        instances = store_stats.instances,
        expired_total = store_stats.expired_total,
        "Final statistics"
    );

    info!("promqtt stopped");
    Ok(())
}

/// Resolve on SIGTERM. Never resolves where the signal does not exist.
async fn terminate() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        std::future::pending::<()>().await;
    }
}
