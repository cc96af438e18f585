use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use lib_common::core::metrics::{LatencyRing, E2E_RING_CAPACITY};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

mod fanout_logic;
use fanout_logic::downstream::AppState;
use fanout_logic::{config, downstream, engine, logger, metrics};

/// How long shutdown waits for the workers before force-exiting.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::load_config();
    config.validate()?;
    logger::setup_logging(config.log_dir.as_deref(), &config.log_level)?;

    // Bind here so a startup failure exits non-zero instead of dying inside
    // a spawned task.
    let listener = TcpListener::bind((config.host.as_str(), config.port))
        .await
        .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?;
    log::info!(
        "Server started on {}:{} in {} mode",
        config.host,
        config.port,
        config.mode
    );

    let (shutdown_tx, _) = broadcast::channel(1);
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let latency = Arc::new(Mutex::new(LatencyRing::new(E2E_RING_CAPACITY)));
    let state = Arc::new(AppState {
        cmd_tx: cmd_tx.clone(),
        latency: Arc::clone(&latency),
    });

    let engine_handle = tokio::spawn(engine::run(
        config.clone(),
        cmd_rx,
        shutdown_tx.subscribe(),
    ));
    let downstream_handle = tokio::spawn(downstream::run(
        listener,
        state,
        shutdown_tx.subscribe(),
    ));
    let metrics_handle = tokio::spawn(metrics::run(
        config.clone(),
        cmd_tx,
        latency,
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                let mut term_signal = signal::unix::signal(signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            #[cfg(not(unix))]
            {
                // On non-unix platforms, just wait forever.
                std::future::pending::<()>().await;
            }
        } => {}
    }

    // Send shutdown signal to all components, then wait with a bounded grace
    let _ = shutdown_tx.send(());
    let joined = tokio::time::timeout(SHUTDOWN_GRACE, async {
        let _ = tokio::join!(engine_handle, downstream_handle, metrics_handle);
    })
    .await;
    if joined.is_err() {
        log::warn!(
            "Workers did not stop within {:?}; forcing exit.",
            SHUTDOWN_GRACE
        );
    }

    log::info!("Shutdown complete.");
    Ok(())
}
