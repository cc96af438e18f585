use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use lib_common::core::dispatcher::{wall_clock, ClientTransport, TransportError};
use lib_common::core::metrics::LatencyRing;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::fanout_logic::engine::EngineCommand;
use crate::fanout_logic::model::ClientMessage;

/// Shared state for the WebSocket routes.
pub struct AppState {
    pub cmd_tx: mpsc::UnboundedSender<EngineCommand>,
    pub latency: Arc<Mutex<LatencyRing>>,
}

/// WebSocket write half behind the dispatcher's transport seam.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

impl WsTransport {
    pub fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self { sink }
    }
}

#[async_trait]
impl ClientTransport for WsTransport {
    async fn send_text(&mut self, frame: &str) -> Result<(), TransportError> {
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|err| TransportError::Other(err.to_string()))
    }

    async fn send_ping(&mut self) -> Result<(), TransportError> {
        self.sink
            .send(Message::Ping(Vec::new().into()))
            .await
            .map_err(|err| TransportError::Other(err.to_string()))
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

/// Serves the WebSocket endpoint until shutdown. The listener is bound by
/// the caller so a bind failure surfaces at startup.
pub async fn run(
    listener: TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state);

    let serve = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown.recv().await.ok();
        log::info!("Downstream server shutting down.");
    });

    if let Err(err) = serve.await {
        log::error!("Downstream server error: {}", err);
    }
}

async fn health_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "OK")
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, addr))
}

/// One connection: admit through the engine, then read inbound frames until
/// the peer leaves or the engine evicts the client.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, addr: SocketAddr) {
    let (sink, mut stream) = socket.split();
    let transport = WsTransport::new(sink);

    let (responder, admitted) = oneshot::channel();
    let admit = EngineCommand::Admit {
        transport,
        peer: addr.to_string(),
        responder,
    };
    if state.cmd_tx.send(admit).is_err() {
        return; // engine already gone, shutdown in progress
    }
    let Ok(admission) = admitted.await else {
        return;
    };

    loop {
        tokio::select! {
            _ = admission.cancel.cancelled() => break,
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        admission.pong.touch();
                        record_ack(&state, &text);
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        admission.pong.touch();
                    }
                    Some(Ok(Message::Binary(_))) => {} // unrecognized, ignored
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        log::info!("Client {} read error: {}", admission.id, err);
                        break;
                    }
                }
            }
        }
    }

    let _ = state.cmd_tx.send(EngineCommand::Deregister { id: admission.id });
}

/// Records `now - ack_ts` into the latency ring when the frame parses as an
/// ack. Anything else is silently ignored; clients are free to send
/// whatever they like.
fn record_ack(state: &AppState, text: &str) {
    let Ok(message) = serde_json::from_str::<ClientMessage>(text) else {
        return;
    };
    let Some(ack_ts) = message.ack_ts else {
        return;
    };
    let latency_ms = (wall_clock() - ack_ts) * 1000.0;
    state
        .latency
        .lock()
        .expect("latency ring lock poisoned")
        .record(latency_ms);
}
