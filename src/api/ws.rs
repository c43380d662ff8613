// =============================================================================
// WebSocket Handlers — live bar subscriptions
// =============================================================================
//
// Clients connect to one of:
//   /ws/live/{symbol}/{interval}/{timezone}      plain or tick view
//   /ws-ha/live/{symbol}/{interval}/{timezone}   Heikin-Ashi view
//
// and receive:
//   1. One backfill message: a JSON array of bars replayed from the buffer.
//   2. A `{completed_bar, current_bar}` message for every upstream tick.
//
// Each connection runs a pump task that owns the socket: it forwards queued
// payloads and watches for the client going away. The handler itself only
// drives join/leave on the connection manager.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::streaming::ClientHandle;
use crate::types::ViewType;

/// What a connection asked for, taken from the route.
#[derive(Debug, Clone)]
struct SubscribeRequest {
    symbol: String,
    interval: String,
    timezone: String,
    view: ViewType,
}

impl SubscribeRequest {
    fn from_route(symbol: String, interval: String, timezone: String, heikin_ashi: bool) -> Self {
        let view = ViewType::for_route(&interval, heikin_ashi);
        Self {
            symbol,
            interval,
            // Wildcard captures may keep the separator.
            timezone: timezone.trim_start_matches('/').to_string(),
            view,
        }
    }
}

// =============================================================================
// Upgrade handlers
// =============================================================================

pub async fn live_bars(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((symbol, interval, timezone)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let request = SubscribeRequest::from_route(symbol, interval, timezone, false);
    ws.on_upgrade(move |socket| handle_subscriber(socket, state, request))
}

pub async fn live_heikin_ashi(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path((symbol, interval, timezone)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let request = SubscribeRequest::from_route(symbol, interval, timezone, true);
    ws.on_upgrade(move |socket| handle_subscriber(socket, state, request))
}

// =============================================================================
// Connection handler
// =============================================================================

async fn handle_subscriber(socket: WebSocket, state: Arc<AppState>, request: SubscribeRequest) {
    let (client, outbound) = ClientHandle::channel(state.config.client_queue_capacity);
    let id = client.id();
    info!(
        connection = %id,
        symbol = %request.symbol,
        interval = %request.interval,
        timezone = %request.timezone,
        view = %request.view,
        "websocket accepted"
    );

    let pump = tokio::spawn(pump_socket(socket, outbound));

    let joined = state
        .manager
        .join(client, &request.symbol, &request.interval, &request.timezone, request.view)
        .await;

    if joined {
        if let Err(e) = pump.await {
            warn!(connection = %id, error = %e, "socket pump failed");
        }
    } else {
        pump.abort();
    }

    state.manager.leave(id);
    info!(connection = %id, symbol = %request.symbol, "websocket closed");
}

/// Forward queued payloads to the socket until either side goes away.
///
/// The queue ending means the server dropped this connection (group torn
/// down or shutdown), so a close frame is sent on the way out.
async fn pump_socket(socket: WebSocket, mut outbound: mpsc::Receiver<String>) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            queued = outbound.recv() => match queued {
                Some(text) => {
                    if let Err(e) = sender.send(Message::Text(text)).await {
                        debug!(error = %e, "websocket send failed, disconnecting");
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },

            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if let Err(e) = sender.send(Message::Pong(data)).await {
                        debug!(error = %e, "failed to send pong, disconnecting");
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {
                    // Subscriptions are fixed by the route; client text is ignored.
                }
                Some(Err(e)) => {
                    warn!(error = %e, "websocket receive error, disconnecting");
                    break;
                }
            },
        }
    }
}
