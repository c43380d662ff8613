// =============================================================================
// Tick Bus — per-symbol tick channels and bounded recent-tick buffers
// =============================================================================
//
// In-process stand-in for the pub/sub broker the external publisher writes to:
//   - `live_ticks:<SYM>`      fan-out channel of raw tick JSON
//   - `intraday_ticks:<SYM>`  bounded list of recent raw ticks, used only to
//                             backfill newly joined subscribers
//
// Every subscriber gets its own unbounded queue, so a subscriber that falls
// behind during a burst sees every tick late rather than missing any.
// Channels are created on first subscribe and removed when their last
// subscriber unsubscribes, so symbols are independent of each other.
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::runtime_config::ServerConfig;
use crate::types::RawTick;

/// Raw tick text shared between the buffer and every subscriber.
pub type RawTickText = Arc<str>;

pub fn tick_channel(symbol: &str) -> String {
    format!("live_ticks:{symbol}")
}

pub fn buffer_key(symbol: &str) -> String {
    format!("intraday_ticks:{symbol}")
}

#[derive(Default)]
struct Channel {
    senders: Vec<mpsc::UnboundedSender<RawTickText>>,
    subscribers: usize,
}

struct BufferedTick {
    timestamp: Option<f64>,
    raw: RawTickText,
}

/// A live subscription to one symbol's tick channel.
pub struct TickSubscription {
    channel: String,
    receiver: mpsc::UnboundedReceiver<RawTickText>,
}

impl TickSubscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Await the next raw tick. `None` means the channel is gone for good.
    pub async fn recv(&mut self) -> Option<RawTickText> {
        self.receiver.recv().await
    }
}

pub struct TickBus {
    channels: RwLock<HashMap<String, Channel>>,
    buffers: Mutex<HashMap<String, VecDeque<BufferedTick>>>,
    buffer_capacity: usize,
    buffer_window_secs: f64,
}

impl TickBus {
    pub fn new(buffer_capacity: usize, buffer_window_secs: u64) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffers: Mutex::new(HashMap::new()),
            buffer_capacity: buffer_capacity.max(1),
            buffer_window_secs: buffer_window_secs as f64,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.tick_buffer_capacity, config.tick_buffer_window_secs)
    }

    /// Subscribe to a symbol's tick channel, creating it if needed.
    pub fn subscribe(&self, symbol: &str) -> TickSubscription {
        let channel = tick_channel(symbol);
        let (sender, receiver) = mpsc::unbounded_channel();

        let mut channels = self.channels.write();
        let entry = channels.entry(channel.clone()).or_insert_with(|| {
            info!(channel = %channel, "tick channel created");
            Channel::default()
        });
        entry.senders.push(sender);
        entry.subscribers += 1;

        TickSubscription { channel, receiver }
    }

    /// Release one subscription. The channel is dropped with its last
    /// subscriber, which ends any receiver still attached to it.
    pub fn unsubscribe(&self, symbol: &str) {
        let channel = tick_channel(symbol);
        let mut channels = self.channels.write();
        if let Some(entry) = channels.get_mut(&channel) {
            entry.subscribers = entry.subscribers.saturating_sub(1);
            entry.senders.retain(|sender| !sender.is_closed());
            if entry.subscribers == 0 {
                channels.remove(&channel);
                info!(channel = %channel, "tick channel removed");
            }
        }
    }

    /// Append a raw tick to the symbol's buffer and deliver it to every
    /// subscriber. Returns the number of subscribers that received it.
    pub fn publish(&self, symbol: &str, raw: impl Into<RawTickText>) -> usize {
        let raw: RawTickText = raw.into();
        let timestamp = serde_json::from_str::<RawTick>(&raw)
            .ok()
            .and_then(|t| t.timestamp);

        self.buffer(symbol, BufferedTick {
            timestamp,
            raw: raw.clone(),
        });

        let channels = self.channels.read();
        match channels.get(&tick_channel(symbol)) {
            Some(entry) => entry
                .senders
                .iter()
                .filter(|sender| sender.send(raw.clone()).is_ok())
                .count(),
            None => {
                debug!(symbol = %symbol, "tick published with no subscribers");
                0
            }
        }
    }

    fn buffer(&self, symbol: &str, tick: BufferedTick) {
        let mut buffers = self.buffers.lock();
        let ring = buffers.entry(buffer_key(symbol)).or_default();

        if let Some(newest) = tick.timestamp {
            let cutoff = newest - self.buffer_window_secs;
            while ring
                .front()
                .and_then(|t| t.timestamp)
                .is_some_and(|ts| ts < cutoff)
            {
                ring.pop_front();
            }
        }

        ring.push_back(tick);
        while ring.len() > self.buffer_capacity {
            ring.pop_front();
        }
    }

    /// Snapshot of the symbol's recent-tick buffer, oldest first.
    pub async fn recent_ticks(&self, symbol: &str) -> Vec<RawTickText> {
        let buffers = self.buffers.lock();
        buffers
            .get(&buffer_key(symbol))
            .map(|ring| ring.iter().map(|t| t.raw.clone()).collect())
            .unwrap_or_default()
    }

    #[cfg(test)]
    pub fn subscriber_count(&self, symbol: &str) -> usize {
        self.channels
            .read()
            .get(&tick_channel(symbol))
            .map_or(0, |c| c.subscribers)
    }

    #[cfg(test)]
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }

    /// Drop every channel; subscribers observe the end of their stream.
    pub fn close(&self) {
        let mut channels = self.channels.write();
        let count = channels.len();
        channels.clear();
        info!(channels = count, "tick bus closed");
    }
}
