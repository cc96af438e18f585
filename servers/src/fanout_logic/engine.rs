use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use lib_common::core::dispatcher::{
    wall_clock, Admission, ClientId, Dispatcher, DispatcherSnapshot, Envelope,
};
use rand::RngCore;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::MissedTickBehavior;

use crate::fanout_logic::config::Config;
use crate::fanout_logic::downstream::WsTransport;

/// Requests handled by the engine task. The engine is the sole owner of the
/// dispatcher, so every registry mutation and every snapshot funnels
/// through this channel.
pub enum EngineCommand {
    /// Register a freshly upgraded connection.
    Admit {
        transport: WsTransport,
        peer: String,
        responder: oneshot::Sender<Admission>,
    },
    /// The inbound reader saw the connection end.
    Deregister { id: ClientId },
    /// Metrics worker asking for registry counters.
    Snapshot {
        responder: oneshot::Sender<DispatcherSnapshot>,
    },
}

/// The payload is generated once so production cost stays independent of
/// payload size; only `seq` and `ts_send` differ between envelopes.
fn build_payload(payload_bytes: usize) -> String {
    let mut raw = vec![0u8; payload_bytes];
    rand::rng().fill_bytes(&mut raw);
    general_purpose::STANDARD.encode(&raw)
}

/// Publisher cadence plus the broadcast loop. Runs until shutdown.
pub async fn run(
    config: Config,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCommand>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let (mut dispatcher, mut departures) = Dispatcher::new(config.dispatcher_config());
    let payload_b64 = build_payload(config.payload_bytes);
    let mut seq: u64 = 0;

    let mut tick = tokio::time::interval(Duration::from_secs_f64(1.0 / config.rate));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut keepalive = tokio::time::interval(Duration::from_secs_f64(config.ping_interval));
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = tick.tick() => {
                seq += 1;
                let envelope = Envelope {
                    seq,
                    ts_send: wall_clock(),
                    payload_b64: &payload_b64,
                };
                match envelope.to_frame() {
                    Ok(frame) => dispatcher.broadcast(&frame).await,
                    Err(err) => log::error!("Envelope serialization failed: {}", err),
                }
            }
            Some(cmd) = cmd_rx.recv() => match cmd {
                EngineCommand::Admit { transport, peer, responder } => {
                    let admission = dispatcher.admit(transport, peer);
                    let _ = responder.send(admission);
                }
                EngineCommand::Deregister { id } => {
                    dispatcher.remove_client(id).await;
                }
                EngineCommand::Snapshot { responder } => {
                    let _ = responder.send(dispatcher.snapshot());
                }
            },
            Some(departure) = departures.recv() => {
                log::info!("Client {} relay stopped: {}", departure.id, departure.reason);
                dispatcher.remove_client(departure.id).await;
            }
            _ = keepalive.tick() => dispatcher.keepalive_pass().await,
        }
    }

    log::info!("Engine shutting down; closing {} clients.", dispatcher.connected());
    dispatcher.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length_matches_base64_expansion() {
        // 64 raw bytes -> ceil(64 / 3) * 4 = 88 base64 characters.
        assert_eq!(build_payload(64).len(), 88);
        assert_eq!(build_payload(1).len(), 4);
        assert_eq!(build_payload(3).len(), 4);
    }
}
