use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use runq_core::broker::{Handler, Outcome, Worker};
use runq_core::{Broker, Message, RocksDbStorage, RunqConfig};
use tracing::{info, warn};

/// Hands each leased message to whatever reads this process's stdout, one JSON
/// object per line. A failed write puts the message back on its queue.
struct StdoutHandler;

impl Handler for StdoutHandler {
    fn handle(&self, message: &Message) -> Outcome {
        let mut out = std::io::stdout().lock();
        let written = serde_json::to_writer(&mut out, message)
            .map_err(std::io::Error::from)
            .and_then(|()| writeln!(out))
            .and_then(|()| out.flush());
        match written {
            Ok(()) => Outcome::Ack,
            Err(e) => {
                warn!(msg_id = %message.id, error = %e, "failed to emit message");
                Outcome::Nack { retry_at: None }
            }
        }
    }
}

fn load_config() -> RunqConfig {
    let paths = ["runq.toml", "/etc/runq/runq.toml"];

    for path in &paths {
        if Path::new(path).exists() {
            match std::fs::read_to_string(path) {
                Ok(contents) => match toml::from_str(&contents) {
                    Ok(config) => {
                        info!(path, "loaded configuration");
                        return config;
                    }
                    Err(e) => {
                        eprintln!("error parsing {path}: {e}");
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("error reading {path}: {e}");
                    std::process::exit(1);
                }
            }
        }
    }

    info!("no config file found, using defaults");
    RunqConfig::default()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    runq_core::telemetry::init_tracing();

    let mut config = load_config();
    if let Ok(data_dir) = std::env::var("RUNQ_DATA_DIR") {
        config.storage.data_dir = data_dir.into();
    }

    let storage = Arc::new(RocksDbStorage::open(&config.storage.data_dir)?);
    let broker = Arc::new(Broker::new(&config, storage)?);
    let worker = Arc::new(Worker::new(
        Arc::clone(&broker),
        config.worker.worker_group(),
        Arc::new(StdoutHandler),
    ));
    let mut workers = worker.spawn(
        config.worker.threads,
        Duration::from_millis(config.worker.poll_interval_ms),
    )?;
    info!(
        data_dir = %config.storage.data_dir.display(),
        sweepers = config.sweeper.workers,
        sweep_interval_ms = config.sweeper.interval_ms,
        workers = config.worker.threads,
        visibility_timeout_ms = config.broker.visibility_timeout_ms,
        "runq worker node started"
    );

    shutdown_signal().await;

    if let Err(e) = workers.stop() {
        warn!(error = %e, "workers did not stop cleanly");
    }
    drop(worker);
    match Arc::try_unwrap(broker) {
        Ok(broker) => {
            if let Err(e) = broker.shutdown() {
                warn!(error = %e, "broker did not shut down cleanly");
            }
        }
        Err(_) => warn!("broker still in use at shutdown, skipping flush"),
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to install CTRL+C handler");
    }

    info!("received shutdown signal");
}
