// =============================================================================
// Connection Manager — registry of connections and per-symbol groups
// =============================================================================
//
// Explicitly constructed service: `new` → `start` → `stop`. The manager owns
// the connection registry and the group registry; groups own their live sets
// and are only ever mutated from their own task (see `subscription_group`).
//
// Groups are destroyed exclusively by the periodic cleanup cycle, never on
// last-leave, so rapid reconnects do not thrash upstream subscriptions.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::market_data::tick_bus::TickBus;
use crate::market_data::upstream::spawn_upstream_feed;
use crate::runtime_config::ServerConfig;
use crate::streaming::backfill::{send_backfill, BackfillSettings};
use crate::streaming::client::{ClientHandle, ConnectionId};
use crate::streaming::subscription_group::{GroupHandle, GroupMailbox};
use crate::types::{GranularityKey, ViewKey, ViewType};

/// Registry record for one accepted connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub symbol: String,
    pub granularity: GranularityKey,
    pub view: ViewType,
    pub joined_at: DateTime<Utc>,
}

/// Snapshot for the health surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConnectionMetrics {
    pub active_groups: usize,
    pub active_connections: usize,
    pub live_connections: usize,
}

struct GroupEntry {
    handle: GroupHandle,
    /// Joins that have prepared this group but not yet attached.
    pending: usize,
}

impl GroupEntry {
    fn is_idle(&self) -> bool {
        self.pending == 0 && self.handle.live_count() == 0
    }
}

pub struct ConnectionManager {
    config: ServerConfig,
    bus: Arc<TickBus>,
    connections: RwLock<HashMap<ConnectionId, ConnectionInfo>>,
    groups: Mutex<HashMap<String, GroupEntry>>,
    cleanup_task: Mutex<Option<JoinHandle<()>>>,
    upstream_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    pub fn new(config: ServerConfig, bus: Arc<TickBus>) -> Self {
        Self {
            config,
            bus,
            connections: RwLock::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            cleanup_task: Mutex::new(None),
            upstream_task: Mutex::new(None),
        }
    }

    pub fn bus(&self) -> &Arc<TickBus> {
        &self.bus
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Spawn the periodic cleanup cycle and, when configured, the upstream
    /// feed client. Calling it twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut cleanup = self.cleanup_task.lock();
        if cleanup.is_some() {
            warn!("connection manager already started");
            return;
        }

        let period = self.config.cleanup_interval();
        let manager = Arc::clone(self);
        *cleanup = Some(tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                manager.cleanup_once().await;
            }
        }));
        info!(period_secs = period.as_secs(), "cleanup cycle started");

        if let Some(url) = &self.config.upstream_url {
            let handle = spawn_upstream_feed(
                url.clone(),
                Arc::clone(&self.bus),
                self.config.upstream_reconnect_delay(),
            );
            *self.upstream_task.lock() = Some(handle);
        } else {
            info!("no upstream url configured, ticks must be published in-process");
        }
    }

    /// Cancel the cleanup cycle, tear down every group, then release the
    /// upstream client.
    pub async fn stop(&self) {
        if let Some(task) = self.cleanup_task.lock().take() {
            task.abort();
        }

        let groups: Vec<GroupEntry> = self.groups.lock().drain().map(|(_, entry)| entry).collect();
        let count = groups.len();
        for entry in groups {
            let symbol = entry.handle.symbol().to_string();
            entry.handle.shutdown().await;
            self.bus.unsubscribe(&symbol);
        }

        if let Some(task) = self.upstream_task.lock().take() {
            task.abort();
        }
        self.bus.close();
        self.connections.write().clear();

        info!(groups = count, "connection manager stopped");
    }

    // ── Join / leave ────────────────────────────────────────────────────────

    /// Register `client`, backfill it, and promote it to its group's live
    /// set. Returns false when the client went away or the group could not
    /// take it; the caller is expected to run `leave` either way.
    pub async fn join(
        &self,
        client: ClientHandle,
        symbol: &str,
        interval: &str,
        timezone: &str,
        view: ViewType,
    ) -> bool {
        let id = client.id();
        let granularity = GranularityKey::new(interval, timezone);
        let view_key = ViewKey::new(view, granularity.clone());

        self.connections.write().insert(
            id,
            ConnectionInfo {
                symbol: symbol.to_string(),
                granularity: granularity.clone(),
                view,
                joined_at: Utc::now(),
            },
        );
        info!(symbol = %symbol, connection = %id, view = %view_key, "connection registered");

        let mailbox = self.prepare_group(symbol, &view_key);

        let settings = BackfillSettings {
            chunk_size: self.config.backfill_chunk_size,
            interval_defaults: self.config.interval_defaults(),
        };
        let outcome = send_backfill(&self.bus, &client, symbol, &granularity, view, settings).await;

        let promoted = if !outcome.attempted() {
            false
        } else if !client.is_open() || !self.connections.read().contains_key(&id) {
            info!(symbol = %symbol, connection = %id, "client left during backfill, not promoting");
            false
        } else {
            let ha_seed = outcome.ha_seed().cloned();
            mailbox.attach(client, view_key, ha_seed).await
        };

        self.finish_pending(symbol, &mailbox);

        if !promoted {
            warn!(symbol = %symbol, connection = %id, "join did not complete");
        }
        promoted
    }

    /// Get or create the symbol's group, reserve it against cleanup, and
    /// make sure the requested aggregator exists.
    fn prepare_group(&self, symbol: &str, view: &ViewKey) -> GroupMailbox {
        let mut groups = self.groups.lock();

        let stale = groups.get(symbol).is_some_and(|entry| entry.handle.is_finished());
        if stale {
            // The old task is gone; its receiver went with it.
            warn!(symbol = %symbol, "replacing subscription group whose listener has exited");
            groups.remove(symbol);
            self.bus.unsubscribe(symbol);
        }

        let entry = groups.entry(symbol.to_string()).or_insert_with(|| {
            let ticks = self.bus.subscribe(symbol);
            info!(symbol = %symbol, channel = %ticks.channel(), "subscription group created");
            GroupEntry {
                handle: GroupHandle::spawn(symbol, ticks, self.config.interval_defaults()),
                pending: 0,
            }
        });

        entry.pending += 1;
        if !entry.handle.mailbox().ensure_view(view.clone()) {
            warn!(symbol = %symbol, "group rejected view request");
        }
        entry.handle.mailbox().clone()
    }

    fn finish_pending(&self, symbol: &str, mailbox: &GroupMailbox) {
        let mut groups = self.groups.lock();
        if let Some(entry) = groups.get_mut(symbol) {
            if entry.handle.mailbox().same_group(mailbox) {
                entry.pending = entry.pending.saturating_sub(1);
            }
        }
    }

    /// Drop a connection from the registry and its group's live set.
    /// Unknown ids are ignored.
    pub fn leave(&self, id: ConnectionId) {
        let Some(info) = self.connections.write().remove(&id) else {
            return;
        };

        if let Some(entry) = self.groups.lock().get(&info.symbol) {
            entry.handle.mailbox().detach(id);
        }
        info!(
            symbol = %info.symbol,
            connection = %id,
            key = %info.granularity,
            view = %info.view,
            connected_secs = (Utc::now() - info.joined_at).num_seconds(),
            "connection left"
        );
    }

    // ── Cleanup ─────────────────────────────────────────────────────────────

    /// One cleanup pass: destroy idle groups and groups whose listener has
    /// exited. Returns the number of groups removed.
    pub async fn cleanup_once(&self) -> usize {
        let doomed: Vec<GroupEntry> = {
            let mut groups = self.groups.lock();
            let symbols: Vec<String> = groups
                .iter()
                .filter(|(_, entry)| entry.is_idle() || entry.handle.is_finished())
                .map(|(symbol, _)| symbol.clone())
                .collect();
            symbols.iter().filter_map(|symbol| groups.remove(symbol)).collect()
        };

        let removed = doomed.len();
        for entry in doomed {
            let symbol = entry.handle.symbol().to_string();
            if entry.handle.is_finished() && entry.handle.live_count() > 0 {
                error!(symbol = %symbol, "reaping group whose listener died with live connections");
            }
            entry.handle.shutdown().await;
            self.bus.unsubscribe(&symbol);
            info!(symbol = %symbol, "subscription group destroyed");
        }

        if removed > 0 {
            info!(removed, remaining = self.groups.lock().len(), "cleanup cycle finished");
        }
        removed
    }

    // ── Metrics ─────────────────────────────────────────────────────────────

    pub fn metrics(&self) -> ConnectionMetrics {
        let groups = self.groups.lock();
        ConnectionMetrics {
            active_groups: groups.len(),
            active_connections: self.connections.read().len(),
            live_connections: groups.values().map(|entry| entry.handle.live_count()).sum(),
        }
    }

    #[cfg(test)]
    pub fn connection(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.connections.read().get(&id).cloned()
    }
}
