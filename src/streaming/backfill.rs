// =============================================================================
// Backfill — replay the recent-tick buffer for a newly joined subscriber
// =============================================================================
//
// A fresh aggregator (and HA transform for the HA view) rebuilds the rolling
// bar history exactly as the live path would have produced it. Replay runs in
// bounded chunks with a cooperative yield between chunks so a large buffer
// never starves other groups' tick processing.
// =============================================================================

use chrono_tz::Tz;
use tracing::{info, warn};

use crate::market_data::aggregator::{resolve_timezone, Aggregator};
use crate::market_data::heikin_ashi::{heikin_ashi_series, HeikinAshiTransform};
use crate::market_data::tick_bus::{RawTickText, TickBus};
use crate::streaming::client::ClientHandle;
use crate::types::{Bar, GranularityKey, HeikinAshiBar, Interval, IntervalDefaults, Tick, ViewType};

#[derive(Debug, Clone, Copy)]
pub struct BackfillSettings {
    pub chunk_size: usize,
    pub interval_defaults: IntervalDefaults,
}

/// Result of one backfill attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BackfillOutcome {
    /// Payload queued for the client.
    Sent {
        bars: usize,
        /// Last completed HA bar of the replay, for seeding a fresh live
        /// transform.
        ha_seed: Option<HeikinAshiBar>,
    },
    /// The peer closed while the payload was being sent. Not an error; the
    /// caller simply won't promote the connection.
    PeerClosed,
    /// The client was gone before the send, or the payload could not be built.
    Aborted,
}

impl BackfillOutcome {
    /// Whether the attempt itself completed (a concurrent peer close counts).
    pub fn attempted(&self) -> bool {
        !matches!(self, Self::Aborted)
    }

    pub fn ha_seed(&self) -> Option<&HeikinAshiBar> {
        match self {
            Self::Sent { ha_seed, .. } => ha_seed.as_ref(),
            _ => None,
        }
    }
}

/// Completed bars plus the trailing in-progress bar of a replay.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedBars {
    pub completed: Vec<Bar>,
    pub current: Option<Bar>,
}

/// Replay raw ticks through a fresh aggregator, yielding between chunks.
pub async fn replay_ticks(raw: &[RawTickText], interval: Interval, tz: Tz, chunk_size: usize) -> ReplayedBars {
    let mut aggregator = Aggregator::new(interval, tz);
    let mut completed = Vec::new();
    let mut rejected = 0usize;

    for chunk in raw.chunks(chunk_size.max(1)) {
        for text in chunk {
            let tick = match Tick::parse(text) {
                Ok(tick) => tick,
                Err(_) => {
                    rejected += 1;
                    continue;
                }
            };
            match aggregator.update(&tick) {
                Ok(Some(bar)) => completed.push(bar),
                Ok(None) => {}
                Err(_) => rejected += 1,
            }
        }
        tokio::task::yield_now().await;
    }

    if rejected > 0 {
        warn!(rejected, total = raw.len(), "skipped malformed ticks during replay");
    }

    ReplayedBars {
        completed,
        current: aggregator.current_bar().cloned(),
    }
}

/// Send the backfill payload for one joining connection.
pub async fn send_backfill(
    bus: &TickBus,
    client: &ClientHandle,
    symbol: &str,
    granularity: &GranularityKey,
    view: ViewType,
    settings: BackfillSettings,
) -> BackfillOutcome {
    info!(symbol = %symbol, key = %granularity, view = %view, "attempting backfill");

    if !client.is_open() {
        warn!(symbol = %symbol, "client disconnected before backfill could start");
        return BackfillOutcome::Aborted;
    }

    let raw = bus.recent_ticks(symbol).await;
    if raw.is_empty() {
        return deliver(client, "[]".to_string(), 0, None, symbol).await;
    }

    let interval = Interval::parse_or_default(&granularity.interval, settings.interval_defaults);
    let tz = resolve_timezone(&granularity.timezone);
    let replayed = replay_ticks(&raw, interval, tz, settings.chunk_size).await;

    if !client.is_open() {
        warn!(symbol = %symbol, "client disconnected during backfill processing, aborting send");
        return BackfillOutcome::Aborted;
    }

    let encoded = match view {
        ViewType::HeikinAshi => {
            let mut series = heikin_ashi_series(&replayed.completed);
            let seed = series.last().cloned();
            if let Some(current) = &replayed.current {
                let mut transform = HeikinAshiTransform::new();
                transform.seed_from_history(&series);
                series.push(transform.peek(current));
            }
            serde_json::to_string(&series).map(|json| (json, series.len(), seed))
        }
        ViewType::Regular | ViewType::Tick => {
            let mut bars = replayed.completed;
            bars.extend(replayed.current);
            serde_json::to_string(&bars).map(|json| (json, bars.len(), None))
        }
    };

    match encoded {
        Ok((payload, bars, seed)) => deliver(client, payload, bars, seed, symbol).await,
        Err(e) => {
            warn!(symbol = %symbol, error = %e, "failed to encode backfill payload");
            BackfillOutcome::Aborted
        }
    }
}

async fn deliver(
    client: &ClientHandle,
    payload: String,
    bars: usize,
    ha_seed: Option<HeikinAshiBar>,
    symbol: &str,
) -> BackfillOutcome {
    match client.send(payload).await {
        Ok(()) => {
            info!(symbol = %symbol, bars, connection = %client.id(), "backfill sent");
            BackfillOutcome::Sent { bars, ha_seed }
        }
        Err(_) => {
            info!(symbol = %symbol, connection = %client.id(), "client disconnected during backfill send");
            BackfillOutcome::PeerClosed
        }
    }
}
