//! Field Logger - intermittently connected environmental data logger
//!
//! Samples the configured sensors into a crash-safe durable queue and
//! delivers every record at least once to a remote collector, either by
//! serving pull requests or by pushing to an MQTT broker.
//!
//! ## Configuration
//!
//! A TOML file, path given as the first argument (default `config.toml`).
//! The `RUST_LOG` environment variable controls log filtering (default
//! info).

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use field_logger::config::{Config, DeliveryMode};
use field_logger::producer::Producer;
use field_logger::pull::PullService;
use field_logger::push::PushAgent;
use field_logger::quarantine::QuarantineStore;
use field_logger::queue::DurableQueue;

/// Grace period for tasks to wind down after the shutdown signal.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() {
    init_tracing();

    info!("Starting field logger...");

    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".to_string());
    let config = match Config::load(&config_path) {
        Ok(config) => {
            info!(
                path = %config_path,
                mode = ?config.delivery.mode,
                sensors = config.sampling.sensors.len(),
                interval_secs = config.sampling.interval_secs,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, path = %config_path, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    // A corrupt backing store requires manual intervention; do not start.
    let queue = match DurableQueue::open(&config.queue.data_path) {
        Ok(queue) => Arc::new(queue),
        Err(e) => {
            error!(error = %e, "Failed to open durable queue");
            std::process::exit(1);
        }
    };

    let quarantine = match QuarantineStore::open(&config.queue.quarantine_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "Failed to open quarantine store");
            std::process::exit(1);
        }
    };

    let device_name = config.device_name();
    info!(device = %device_name, "Resolved device name");

    let sensors: Vec<_> = config.sampling.sensors.iter().map(|kind| kind.build()).collect();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let producer = Producer::new(
        queue.clone(),
        sensors,
        config.sampling.interval(),
        shutdown_rx.clone(),
    );
    let producer_handle = tokio::spawn(producer.run());

    let delivery_handle = match config.delivery.mode {
        DeliveryMode::Pull => {
            let service = PullService::new(queue.clone(), quarantine.clone(), device_name);
            let pull_config = config.pull.clone();
            tokio::spawn(async move {
                if let Err(e) = service.run(&pull_config, shutdown_rx).await {
                    error!(error = %e, "Pull delivery service failed");
                }
            })
        }
        DeliveryMode::Push => {
            let agent = PushAgent::new(
                queue.clone(),
                quarantine.clone(),
                config.push.clone(),
                device_name,
                shutdown_rx,
            );
            tokio::spawn(agent.run())
        }
    };

    info!("Field logger running. Press Ctrl+C to stop.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping..."),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    // Wake every blocked peek and sleeping loop.
    if shutdown_tx.send(true).is_err() {
        warn!("All tasks already stopped before shutdown signal");
    }

    for (name, handle) in [("producer", producer_handle), ("delivery", delivery_handle)] {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await {
            Ok(Ok(())) => info!(task = name, "Task shut down gracefully"),
            Ok(Err(e)) => warn!(task = name, error = %e, "Task panicked during shutdown"),
            Err(_) => warn!(
                task = name,
                timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
                "Task shutdown timed out"
            ),
        }
    }

    // Final flush so soft-deleted records are not replayed next boot.
    if let Err(e) = queue.close() {
        warn!(error = %e, "Final queue flush failed");
    }

    info!("Field logger stopped");
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .init();
}
