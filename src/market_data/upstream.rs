// =============================================================================
// Upstream Feed — external tick publisher into the tick bus
// =============================================================================
//
// The publisher streams one JSON object per tick over a WebSocket:
//
//   { "symbol": "ESU5", "price": 5012.25, "volume": 3, "timestamp": 1700000000.5 }
//
// The `symbol` field routes the message; the remaining fields are stored and
// published verbatim as the raw tick. Validation of the tick itself happens
// downstream, per subscription group.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::market_data::tick_bus::TickBus;

/// Connect to the publisher and forward ticks into `bus`.
///
/// Runs until the stream disconnects or an error occurs, then returns so that
/// the caller can handle reconnection.
pub async fn run_upstream_feed(url: &str, bus: &Arc<TickBus>) -> Result<()> {
    info!(url = %url, "connecting to upstream tick feed");

    let (ws_stream, _response) = connect_async(url)
        .await
        .context("failed to connect to upstream tick feed")?;

    info!(url = %url, "upstream tick feed connected");
    let (_write, mut read) = ws_stream.split();

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => match split_envelope(&text) {
                Ok((symbol, tick)) => {
                    let receivers = bus.publish(&symbol, tick);
                    debug!(symbol = %symbol, receivers, "upstream tick forwarded");
                }
                Err(e) => {
                    warn!(error = %e, "dropping malformed upstream message");
                }
            },
            Some(Ok(Message::Close(_))) => {
                warn!(url = %url, "upstream tick feed sent close frame");
                return Ok(());
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(url = %url, error = %e, "upstream tick feed read error");
                return Err(e.into());
            }
            None => {
                warn!(url = %url, "upstream tick feed stream ended");
                return Ok(());
            }
        }
    }
}

/// Spawn the reconnecting feed loop. The returned handle is the shared
/// upstream client; aborting it releases the connection.
pub fn spawn_upstream_feed(url: String, bus: Arc<TickBus>, reconnect_delay: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_upstream_feed(&url, &bus).await {
                error!(url = %url, error = %e, "upstream feed error, reconnecting");
            }
            tokio::time::sleep(reconnect_delay).await;
        }
    })
}

/// Split a publisher message into `(symbol, raw tick JSON)`.
fn split_envelope(text: &str) -> Result<(String, String)> {
    let mut root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse upstream JSON")?;

    let object = root
        .as_object_mut()
        .context("upstream message is not a JSON object")?;

    let symbol = object
        .remove("symbol")
        .and_then(|s| s.as_str().map(str::to_owned))
        .filter(|s| !s.is_empty())
        .context("missing field symbol")?;

    let tick = serde_json::to_string(&root).context("failed to re-encode tick")?;
    Ok((symbol, tick))
}
