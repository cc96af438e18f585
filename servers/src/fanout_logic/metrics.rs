use std::sync::{Arc, Mutex};
use std::time::Duration;

use lib_common::core::dispatcher::DispatcherSnapshot;
use lib_common::core::metrics::LatencyRing;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::fanout_logic::config::Config;
use crate::fanout_logic::engine::EngineCommand;
use crate::fanout_logic::model::{ClientRecord, LatencySummary, SummaryRecord};

/// Fixed cadence between metrics emissions.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// Periodic metrics worker: requests a registry snapshot from the engine
/// and emits one summary record plus one record per client.
pub async fn run(
    config: Config,
    cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    latency: Arc<Mutex<LatencyRing>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut tick = tokio::time::interval(METRICS_INTERVAL);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // the first tick completes immediately

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                let (responder, snapshot_rx) = oneshot::channel();
                if cmd_tx.send(EngineCommand::Snapshot { responder }).is_err() {
                    break; // engine gone
                }
                let Ok(snapshot) = snapshot_rx.await else {
                    break;
                };
                let (p50, p95) = {
                    let ring = latency.lock().expect("latency ring lock poisoned");
                    (ring.p50(), ring.p95())
                };
                emit(&config, &snapshot, p50, p95);
            }
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

fn emit(config: &Config, snapshot: &DispatcherSnapshot, p50: f64, p95: f64) {
    if config.log_json {
        let summary = SummaryRecord {
            r#type: "summary".to_string(),
            clients: snapshot.connected,
            pub_rate: config.rate,
            e2e_latency: LatencySummary {
                p50: round1(p50),
                p95: round1(p95),
            },
            disconnects_total: snapshot.disconnects_total,
        };
        if let Ok(line) = serde_json::to_string(&summary) {
            log::info!("{}", line);
        }
        for client in &snapshot.clients {
            let record = ClientRecord {
                r#type: "client".to_string(),
                client_id: client.id,
                peer: client.peer.clone(),
                queue_len: client.queue_len,
                drops_total: client.drops_total,
                send_latency_ms: round1(client.send_latency_ms),
            };
            if let Ok(line) = serde_json::to_string(&record) {
                log::info!("{}", line);
            }
        }
    } else {
        log::info!(
            "Clients: {} | Rate: {}/s | E2E p50/p95: {:.1}/{:.1}ms | Disconnects: {}",
            snapshot.connected,
            config.rate,
            p50,
            p95,
            snapshot.disconnects_total
        );
        for client in &snapshot.clients {
            log::info!(
                "  client {} ({}) | queue: {} | drops: {} | send avg: {:.1}ms",
                client.id,
                client.peer,
                client.queue_len,
                client.drops_total,
                client.send_latency_ms
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_to_one_decimal() {
        assert_eq!(round1(1.26), 1.3);
        assert_eq!(round1(1.24), 1.2);
        assert_eq!(round1(0.0), 0.0);
    }
}
