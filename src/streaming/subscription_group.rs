// =============================================================================
// Subscription Group — one task per symbol, owning all of its mutable state
// =============================================================================
//
// The group task is the only place aggregators, Heikin-Ashi transforms and the
// live connection set are touched. Everything else (join, leave, shutdown)
// reaches it through `GroupCommand` messages, which are drained ahead of ticks
// so that a connection attached before a tick always sees that tick.
//
// Per tick:
//   1. feed the tick to every aggregator (one per granularity key)
//   2. derive the HA pair for keys that also carry a transform
//   3. serialize one payload per view key
//   4. hand each live connection the payload for its view key
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::market_data::aggregator::{resolve_timezone, Aggregator};
use crate::market_data::heikin_ashi::HeikinAshiTransform;
use crate::market_data::tick_bus::TickSubscription;
use crate::streaming::client::{ClientHandle, ConnectionId, DeliveryError};
use crate::types::{
    Bar, GranularityKey, HeikinAshiBar, Interval, IntervalDefaults, LivePayload, Tick, ViewKey, ViewType,
};

/// Completed bars kept per HA view while it waits for its first seed.
const UNSEEDED_BAR_LIMIT: usize = 512;

/// Messages accepted by a group task.
#[derive(Debug)]
pub enum GroupCommand {
    /// Make sure the aggregator (and HA transform, for the HA view) behind
    /// `view` exists.
    EnsureView { view: ViewKey },
    /// Promote a connection to the live set. The ack reports whether it was
    /// added.
    Attach {
        client: ClientHandle,
        view: ViewKey,
        ha_seed: Option<HeikinAshiBar>,
        ack: oneshot::Sender<bool>,
    },
    Detach { id: ConnectionId },
}

struct LiveConnection {
    client: ClientHandle,
    view: ViewKey,
}

/// HA state for one granularity. Until the first HA connection attaches, the
/// completed bars are remembered so the transform can be rebuilt on top of
/// that connection's backfill seed.
struct HeikinAshiView {
    transform: HeikinAshiTransform,
    unseeded: Option<VecDeque<Bar>>,
}

impl HeikinAshiView {
    fn new() -> Self {
        Self {
            transform: HeikinAshiTransform::new(),
            unseeded: Some(VecDeque::new()),
        }
    }

    fn advance(&mut self, completed: &Bar) -> HeikinAshiBar {
        if let Some(pending) = self.unseeded.as_mut() {
            if pending.len() == UNSEEDED_BAR_LIMIT {
                pending.pop_front();
            }
            pending.push_back(completed.clone());
        }
        self.transform.advance(completed)
    }

    fn peek(&self, current: &Bar) -> HeikinAshiBar {
        self.transform.peek(current)
    }

    /// Pin the running series at the first attach. With a seed, bars the live
    /// path completed after the seed's bar are replayed on top of it, so the
    /// live stream continues the joiner's backfill. Returns whether it reseeded.
    fn settle(&mut self, seed: Option<&HeikinAshiBar>) -> bool {
        let (Some(pending), Some(seed)) = (self.unseeded.take(), seed) else {
            return false;
        };

        let mut transform = HeikinAshiTransform::new();
        transform.seed_from_history(std::slice::from_ref(seed));
        for bar in pending.iter().filter(|bar| bar.bar_start > seed.bar_start) {
            transform.advance(bar);
        }
        self.transform = transform;
        true
    }
}

// ── Group state ─────────────────────────────────────────────────────────────

pub struct SubscriptionGroup {
    symbol: String,
    interval_defaults: IntervalDefaults,
    aggregators: HashMap<GranularityKey, Aggregator>,
    heikin_ashi: HashMap<GranularityKey, HeikinAshiView>,
    live: HashMap<ConnectionId, LiveConnection>,
    live_count: Arc<AtomicUsize>,
}

impl SubscriptionGroup {
    pub fn new(symbol: &str, interval_defaults: IntervalDefaults) -> Self {
        Self {
            symbol: symbol.to_string(),
            interval_defaults,
            aggregators: HashMap::new(),
            heikin_ashi: HashMap::new(),
            live: HashMap::new(),
            live_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[cfg(test)]
    pub fn live_len(&self) -> usize {
        self.live.len()
    }

    #[cfg(test)]
    pub fn aggregator_count(&self) -> usize {
        self.aggregators.len()
    }

    #[cfg(test)]
    pub fn heikin_ashi_count(&self) -> usize {
        self.heikin_ashi.len()
    }

    fn ensure_view(&mut self, view: &ViewKey) {
        let key = &view.granularity;
        if !self.aggregators.contains_key(key) {
            let interval = Interval::parse_or_default(&key.interval, self.interval_defaults);
            let tz = resolve_timezone(&key.timezone);
            self.aggregators.insert(key.clone(), Aggregator::new(interval, tz));
            info!(symbol = %self.symbol, key = %key, ?interval, "aggregator created");
        }

        if view.view == ViewType::HeikinAshi && !self.heikin_ashi.contains_key(key) {
            self.heikin_ashi.insert(key.clone(), HeikinAshiView::new());
            info!(symbol = %self.symbol, key = %key, "heikin-ashi transform created");
        }
    }

    fn attach(&mut self, client: ClientHandle, view: ViewKey, ha_seed: Option<HeikinAshiBar>) -> bool {
        if !client.is_open() {
            debug!(symbol = %self.symbol, connection = %client.id(), "attach skipped, client already closed");
            return false;
        }

        self.ensure_view(&view);
        if view.view == ViewType::HeikinAshi {
            if let Some(ha) = self.heikin_ashi.get_mut(&view.granularity) {
                if ha.settle(ha_seed.as_ref()) {
                    debug!(symbol = %self.symbol, key = %view.granularity, "heikin-ashi view reseeded from backfill");
                }
            }
        }

        let id = client.id();
        info!(symbol = %self.symbol, connection = %id, view = %view, "connection live");
        self.live.insert(id, LiveConnection { client, view });
        self.publish_live_count();
        true
    }

    fn detach(&mut self, id: ConnectionId) {
        if self.live.remove(&id).is_some() {
            info!(symbol = %self.symbol, connection = %id, "connection removed from live set");
            self.publish_live_count();
        }
    }

    fn publish_live_count(&self) {
        self.live_count.store(self.live.len(), Ordering::Relaxed);
    }

    pub fn handle_command(&mut self, command: GroupCommand) {
        match command {
            GroupCommand::EnsureView { view } => self.ensure_view(&view),
            GroupCommand::Attach {
                client,
                view,
                ha_seed,
                ack,
            } => {
                let added = self.attach(client, view, ha_seed);
                // The joiner may have given up waiting; nothing to do then.
                let _ = ack.send(added);
            }
            GroupCommand::Detach { id } => self.detach(id),
        }
    }

    /// Run one tick through every aggregator and return the serialized
    /// payload for each view key.
    pub fn process_tick(&mut self, tick: &Tick) -> HashMap<ViewKey, String> {
        let mut payloads = HashMap::new();

        for (key, aggregator) in self.aggregators.iter_mut() {
            let completed = match aggregator.update(tick) {
                Ok(completed) => completed,
                Err(e) => {
                    error!(symbol = %self.symbol, key = %key, error = %e, "resampler failed on tick");
                    continue;
                }
            };
            let current = aggregator.current_bar().cloned();

            let plain_view = if aggregator.is_tick_based() {
                ViewType::Tick
            } else {
                ViewType::Regular
            };

            if let Some(view) = self.heikin_ashi.get_mut(key) {
                let ha = LivePayload {
                    completed_bar: completed.as_ref().map(|bar| view.advance(bar)),
                    current_bar: current.as_ref().map(|bar| view.peek(bar)),
                };
                encode_into(&mut payloads, ViewKey::new(ViewType::HeikinAshi, key.clone()), &ha, &self.symbol);
            }

            let plain = LivePayload {
                completed_bar: completed,
                current_bar: current,
            };
            encode_into(&mut payloads, ViewKey::new(plain_view, key.clone()), &plain, &self.symbol);
        }

        payloads
    }

    /// Deliver each live connection the payload for its view key. A closed
    /// client is dropped from the live set; a lagging one just misses this
    /// update.
    pub fn fan_out(&mut self, payloads: &HashMap<ViewKey, String>) {
        let mut closed = Vec::new();

        for (id, connection) in &self.live {
            let Some(payload) = payloads.get(&connection.view) else {
                continue;
            };
            match connection.client.try_send(payload.clone()) {
                Ok(()) => {}
                Err(DeliveryError::Lagging) => {
                    warn!(symbol = %self.symbol, connection = %id, "client lagging, live update dropped");
                }
                Err(DeliveryError::Closed) => closed.push(*id),
            }
        }

        for id in closed {
            self.live.remove(&id);
            info!(symbol = %self.symbol, connection = %id, "closed connection pruned from live set");
        }
        self.publish_live_count();
    }

    fn on_raw_tick(&mut self, raw: &str) {
        let tick = match Tick::parse(raw) {
            Ok(tick) => tick,
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "dropping malformed tick");
                return;
            }
        };
        let payloads = self.process_tick(&tick);
        if !self.live.is_empty() {
            self.fan_out(&payloads);
        }
    }

    /// Listen until the tick channel closes or every command sender is gone.
    pub async fn run(mut self, mut ticks: TickSubscription, mut commands: mpsc::UnboundedReceiver<GroupCommand>) {
        info!(symbol = %self.symbol, channel = %ticks.channel(), "subscription group listening");

        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!(symbol = %self.symbol, "command channel closed, group stopping");
                        break;
                    }
                },

                tick = ticks.recv() => match tick {
                    Some(raw) => self.on_raw_tick(&raw),
                    None => {
                        error!(symbol = %self.symbol, channel = %ticks.channel(), "FATAL: tick channel closed, group listener exiting");
                        break;
                    }
                },
            }
        }
    }
}

fn encode_into<B: serde::Serialize>(
    payloads: &mut HashMap<ViewKey, String>,
    key: ViewKey,
    payload: &LivePayload<B>,
    symbol: &str,
) {
    match serde_json::to_string(payload) {
        Ok(json) => {
            payloads.insert(key, json);
        }
        Err(e) => error!(symbol = %symbol, view = %key, error = %e, "failed to encode live payload"),
    }
}

// ── Task handle ─────────────────────────────────────────────────────────────

/// Cloneable sender side of a group task.
#[derive(Debug, Clone)]
pub struct GroupMailbox {
    commands: mpsc::UnboundedSender<GroupCommand>,
}

impl GroupMailbox {
    pub fn ensure_view(&self, view: ViewKey) -> bool {
        self.commands.send(GroupCommand::EnsureView { view }).is_ok()
    }

    /// Ask the group to promote `client`; false if the group is gone or the
    /// client closed first.
    pub async fn attach(&self, client: ClientHandle, view: ViewKey, ha_seed: Option<HeikinAshiBar>) -> bool {
        let (ack, done) = oneshot::channel();
        let command = GroupCommand::Attach {
            client,
            view,
            ha_seed,
            ack,
        };
        if self.commands.send(command).is_err() {
            return false;
        }
        done.await.unwrap_or(false)
    }

    pub fn detach(&self, id: ConnectionId) {
        // A stopped group has already dropped its live set.
        let _ = self.commands.send(GroupCommand::Detach { id });
    }

    pub fn same_group(&self, other: &GroupMailbox) -> bool {
        self.commands.same_channel(&other.commands)
    }
}

/// Owner's handle on a running group task.
pub struct GroupHandle {
    symbol: String,
    mailbox: GroupMailbox,
    live: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl GroupHandle {
    pub fn spawn(symbol: &str, ticks: TickSubscription, interval_defaults: IntervalDefaults) -> Self {
        let group = SubscriptionGroup::new(symbol, interval_defaults);
        let live = Arc::clone(&group.live_count);
        let (commands, inbox) = mpsc::unbounded_channel();
        let task = tokio::spawn(group.run(ticks, inbox));

        Self {
            symbol: symbol.to_string(),
            mailbox: GroupMailbox { commands },
            live,
            task,
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn mailbox(&self) -> &GroupMailbox {
        &self.mailbox
    }

    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the listener and wait until the cancellation is observed.
    pub async fn shutdown(self) {
        self.task.abort();
        match self.task.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => error!(symbol = %self.symbol, error = %e, "group task panicked"),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::tick_bus::TickBus;

    fn view(kind: ViewType, interval: &str) -> ViewKey {
        ViewKey::new(kind, GranularityKey::new(interval, "UTC"))
    }

    fn attach(group: &mut SubscriptionGroup, view: ViewKey) -> mpsc::Receiver<String> {
        let (client, rx) = ClientHandle::channel(64);
        let (ack, _done) = oneshot::channel();
        group.handle_command(GroupCommand::Attach {
            client,
            view,
            ha_seed: None,
            ack,
        });
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<LivePayload<Bar>> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[test]
    fn aggregators_are_shared_per_granularity() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        group.handle_command(GroupCommand::EnsureView { view: view(ViewType::Regular, "1m") });
        group.handle_command(GroupCommand::EnsureView { view: view(ViewType::HeikinAshi, "1m") });
        group.handle_command(GroupCommand::EnsureView { view: view(ViewType::Regular, "5m") });
        assert_eq!(group.aggregator_count(), 2);
        assert_eq!(group.heikin_ashi_count(), 1);
    }

    #[test]
    fn connections_only_receive_their_own_granularity() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        let mut one_minute = attach(&mut group, view(ViewType::Regular, "1m"));
        let mut five_minute = attach(&mut group, view(ViewType::Regular, "5m"));

        for (i, ts) in [0.0, 30.0, 61.0, 125.0].into_iter().enumerate() {
            group.on_raw_tick(&format!(r#"{{"price":{},"volume":1,"timestamp":{ts}}}"#, 100 + i));
        }

        let fast = drain(&mut one_minute);
        let slow = drain(&mut five_minute);
        assert_eq!(fast.len(), 4);
        assert_eq!(slow.len(), 4);

        let fast_completed: Vec<f64> = fast.iter().filter_map(|p| p.completed_bar.as_ref()).map(|b| b.bar_start).collect();
        assert_eq!(fast_completed, vec![0.0, 60.0]);
        assert!(slow.iter().all(|p| p.completed_bar.is_none()));
        assert!(slow.iter().all(|p| p.current_bar.as_ref().unwrap().bar_start == 0.0));
    }

    #[test]
    fn tick_interval_routes_to_tick_view() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        let mut rx = attach(&mut group, view(ViewType::Tick, "2tick"));

        group.on_raw_tick(r#"{"price":1,"volume":1,"timestamp":1}"#);
        group.on_raw_tick(r#"{"price":2,"volume":1,"timestamp":2}"#);

        let payloads = drain(&mut rx);
        assert_eq!(payloads.len(), 2);
        assert_eq!(payloads[1].completed_bar.as_ref().unwrap().close, 2.0);
    }

    #[test]
    fn malformed_tick_is_skipped_without_state_change() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        let mut rx = attach(&mut group, view(ViewType::Regular, "1m"));

        group.on_raw_tick(r#"{"price":"oops"}"#);
        assert!(drain(&mut rx).is_empty());

        group.on_raw_tick(r#"{"price":5,"volume":1,"timestamp":1}"#);
        assert_eq!(drain(&mut rx)[0].current_bar.as_ref().unwrap().open, 5.0);
    }

    #[test]
    fn heikin_ashi_view_is_seeded_and_smoothed() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        let (client, mut rx) = ClientHandle::channel(8);
        let (ack, _done) = oneshot::channel();
        let seed = HeikinAshiBar {
            open: 10.0,
            high: 12.0,
            low: 9.0,
            close: 11.0,
            volume: Some(1.0),
            bar_start: 0.0,
            regular_open: None,
            regular_close: None,
        };
        group.handle_command(GroupCommand::Attach {
            client,
            view: view(ViewType::HeikinAshi, "1m"),
            ha_seed: Some(seed),
            ack,
        });

        group.on_raw_tick(r#"{"price":20,"volume":1,"timestamp":60}"#);
        let payload: LivePayload<HeikinAshiBar> = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let current = payload.current_bar.unwrap();
        assert_eq!(current.open, 10.5);
        assert_eq!(current.close, 20.0);
    }

    #[test]
    fn heikin_ashi_reseeds_when_live_bar_completes_during_replay() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        group.handle_command(GroupCommand::EnsureView { view: view(ViewType::HeikinAshi, "1m") });

        // A live bar completes before the joiner attaches, priming the
        // transform from its own open/close.
        group.on_raw_tick(r#"{"price":10,"volume":1,"timestamp":0}"#);
        group.on_raw_tick(r#"{"price":20,"volume":1,"timestamp":61}"#);

        let seed = HeikinAshiBar {
            open: 4.0,
            high: 6.0,
            low: 4.0,
            close: 6.0,
            volume: Some(1.0),
            bar_start: -60.0,
            regular_open: None,
            regular_close: None,
        };
        let (client, mut rx) = ClientHandle::channel(8);
        let (ack, mut done) = oneshot::channel();
        group.handle_command(GroupCommand::Attach {
            client,
            view: view(ViewType::HeikinAshi, "1m"),
            ha_seed: Some(seed.clone()),
            ack,
        });
        assert_eq!(done.try_recv(), Ok(true));

        let mut expected = HeikinAshiTransform::new();
        expected.seed_from_history(std::slice::from_ref(&seed));
        let continued = expected.advance(&Bar::opening(&Tick::new(10.0, 1, 0.0), 0.0));

        group.on_raw_tick(r#"{"price":30,"volume":1,"timestamp":62}"#);
        let payload: LivePayload<HeikinAshiBar> = serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        let current = payload.current_bar.unwrap();
        assert_eq!(current.open, (continued.open + continued.close) / 2.0);
        assert_eq!(current.open, 7.5);
    }

    #[test]
    fn closed_client_is_pruned_and_refused() {
        let mut group = SubscriptionGroup::new("ESU5", IntervalDefaults::default());
        let rx = attach(&mut group, view(ViewType::Regular, "1m"));
        assert_eq!(group.live_len(), 1);

        drop(rx);
        group.on_raw_tick(r#"{"price":1,"volume":1,"timestamp":1}"#);
        assert_eq!(group.live_len(), 0);

        let (client, closed) = ClientHandle::channel(1);
        drop(closed);
        let (ack, mut done) = oneshot::channel();
        group.handle_command(GroupCommand::Attach {
            client,
            view: view(ViewType::Regular, "1m"),
            ha_seed: None,
            ack,
        });
        assert_eq!(done.try_recv(), Ok(false));
    }

    #[tokio::test]
    async fn spawned_group_streams_in_publish_order() {
        let bus = TickBus::new(100, 3_600);
        let handle = GroupHandle::spawn("ESU5", bus.subscribe("ESU5"), IntervalDefaults::default());
        let (client, mut rx) = ClientHandle::channel(64);

        assert!(handle.mailbox().ensure_view(view(ViewType::Regular, "1m")));
        assert!(handle.mailbox().attach(client, view(ViewType::Regular, "1m"), None).await);
        assert_eq!(handle.live_count(), 1);

        for i in 0..5 {
            bus.publish("ESU5", format!(r#"{{"price":{i},"volume":1,"timestamp":{i}}}"#));
        }
        for i in 0..5 {
            let payload: LivePayload<Bar> = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(payload.current_bar.unwrap().close, i as f64);
        }

        handle.shutdown().await;
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn burst_published_without_yielding_is_aggregated_in_full() {
        let bus = TickBus::new(100, 3_600);
        let handle = GroupHandle::spawn("ESU5", bus.subscribe("ESU5"), IntervalDefaults::default());
        let (client, mut rx) = ClientHandle::channel(64);
        assert!(handle.mailbox().attach(client, view(ViewType::Regular, "1m"), None).await);

        for i in 0..5 {
            bus.publish("ESU5", format!(r#"{{"price":{i},"volume":1,"timestamp":{i}}}"#));
        }
        bus.publish("ESU5", r#"{"price":9,"volume":1,"timestamp":90}"#.to_string());

        let mut payloads = Vec::new();
        for _ in 0..6 {
            let payload: LivePayload<Bar> = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            payloads.push(payload);
        }
        let completed = payloads[5].completed_bar.as_ref().unwrap();
        assert_eq!(completed.open, 0.0);
        assert_eq!(completed.close, 4.0);
        assert_eq!(completed.volume, Some(5.0));

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn group_exits_when_channel_closes() {
        let bus = TickBus::new(10, 60);
        let handle = GroupHandle::spawn("ESU5", bus.subscribe("ESU5"), IntervalDefaults::default());
        let (client, mut rx) = ClientHandle::channel(8);
        assert!(handle.mailbox().attach(client, view(ViewType::Regular, "1m"), None).await);

        bus.close();
        assert!(rx.recv().await.is_none());
        assert!(!handle.mailbox().attach(ClientHandle::channel(1).0, view(ViewType::Regular, "1m"), None).await);
    }
}
