//! Runtime peer: wires a [`Coordinator`] to a transport and Tokio timers.
//!
//! A running peer owns four background tasks:
//! - heartbeat: every `heartbeat_interval`, starting immediately
//! - election: first after `initial_election_delay`, then every
//!   `leader_check_interval`
//! - sweep: wakes when the next member would go stale and evicts it
//! - bootstrap: one `announce` after `announce_delay` (the `request_status`
//!   half is sent synchronously by [`Peer::start`])
//!
//! The coordinator lock is never held while sending, emitting events or
//! running handlers, so callbacks may call back into the peer freely.
//! Outcomes are queued while the lock is held and applied by one thread at a
//! time, so subscribers observe events in the order the state changed.

use crate::config::{BeaconConfig, ConfigError};
use crate::coordinator::{Coordinator, Outcome, PeerStats, RouterError};
use crate::events::{BeaconEvent, EventBus, Subscription};
use crate::handlers::{Delivery, HandlerRegistration, HandlerRegistry};
use crate::protocol::{Message, ProtocolError};
use crate::transport::{MessageCallback, Transport, TransportError, TransportSubscription};
use crate::{MemberEntry, PeerId};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Router(#[from] RouterError),

    #[error("Payload could not be serialized: {0}")]
    Payload(#[source] serde_json::Error),

    #[error("No Tokio runtime available")]
    NoRuntime,

    #[error("Peer has been stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Wall clock that follows Tokio's (pausable) clock after startup.
struct Clock {
    epoch_ms: u64,
    started: Instant,
}

impl Clock {
    fn new() -> Self {
        let epoch_ms = web_time::SystemTime::now()
            .duration_since(web_time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            epoch_ms,
            started: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch_ms + self.started.elapsed().as_millis() as u64
    }
}

struct Shared {
    local_id: PeerId,
    config: BeaconConfig,
    coordinator: Mutex<Coordinator>,
    handlers: Arc<HandlerRegistry>,
    events: Arc<EventBus>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    stopped: AtomicBool,
    /// Outcomes not yet applied, in the order they were produced
    pending: Mutex<VecDeque<Outcome>>,
    /// Set while some thread is applying `pending`
    draining: AtomicBool,
    /// False once the departure notice went out; guards every send
    outbound_open: Mutex<bool>,
}

impl Shared {
    fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run `f` against the coordinator and act on the result after unlocking.
    fn update(&self, f: impl FnOnce(&mut Coordinator, u64) -> Outcome) {
        if self.is_stopped() {
            return;
        }
        self.commit(f);
    }

    /// Like `update`, but also after stop.
    fn commit(&self, f: impl FnOnce(&mut Coordinator, u64) -> Outcome) {
        {
            let mut coordinator = self.coordinator.lock().unwrap_or_else(|e| e.into_inner());
            let now = self.now_ms();
            let outcome = f(&mut coordinator, now);
            if outcome.is_empty() {
                return;
            }
            // Enqueue under the coordinator lock so queue order is mutation order
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(outcome);
        }
        self.drain();
    }

    /// Apply queued outcomes unless another thread already is.
    ///
    /// Re-entrant calls (a callback that updates the peer) return at once;
    /// the outer drain picks up what they queued.
    fn drain(&self) {
        loop {
            if self.draining.swap(true, Ordering::AcqRel) {
                return;
            }
            loop {
                let next = self
                    .pending
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                let Some(outcome) = next else { break };
                self.apply(outcome);
            }
            self.draining.store(false, Ordering::Release);

            // Something may have been queued after the last pop
            let idle = self
                .pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .is_empty();
            if idle {
                return;
            }
        }
    }

    fn apply(&self, outcome: Outcome) {
        for msg in &outcome.outbound {
            match self.send(msg) {
                Ok(()) => {}
                Err(PeerError::Stopped) => debug!("Dropping {} after departure", msg.kind()),
                Err(e) => warn!("Failed to send {}: {}", msg.kind(), e),
            }
        }
        for event in &outcome.events {
            self.events.emit(event);
        }
        for delivery in &outcome.deliveries {
            self.deliver(delivery);
        }
    }

    fn send(&self, msg: &Message) -> Result<()> {
        let data = msg.to_json()?;
        {
            let open = self.outbound_open.lock().unwrap_or_else(|e| e.into_inner());
            if !*open {
                return Err(PeerError::Stopped);
            }
            self.transport.send(&data)?;
        }
        self.record_sent();
        Ok(())
    }

    /// Send `msg` as the last message this peer ever sends.
    fn send_final(&self, msg: &Message) -> Result<()> {
        let data = msg.to_json()?;
        {
            let mut open = self.outbound_open.lock().unwrap_or_else(|e| e.into_inner());
            if !*open {
                return Ok(());
            }
            *open = false;
            self.transport.send(&data)?;
        }
        self.record_sent();
        Ok(())
    }

    fn record_sent(&self) {
        self.coordinator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record_sent(1);
    }

    fn deliver(&self, delivery: &Delivery) {
        if self.is_stopped() {
            return;
        }
        if !self.handlers.dispatch(delivery) {
            debug!(
                "No handler for {:?} from {}",
                delivery.message_type, delivery.sender_id
            );
        }
    }

    fn on_bytes(&self, data: &[u8]) {
        self.update(|coordinator, now| coordinator.receive(data, now));
    }
}

/// A running participant in a beacon channel.
///
/// Dropping the peer stops it (see [`Peer::stop`]).
pub struct Peer {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    subscription: Mutex<Option<TransportSubscription>>,
}

impl Peer {
    /// Start a peer with a freshly generated ID.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: BeaconConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        Self::start_with_id(PeerId::generate(), config, transport)
    }

    /// Start a peer with a fixed ID.
    pub fn start_with_id(
        local_id: PeerId,
        config: BeaconConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| PeerError::NoRuntime)?;

        let clock = Clock::new();
        let coordinator = Coordinator::new(local_id.clone(), &config, clock.now_ms());
        let shared = Arc::new(Shared {
            local_id,
            config,
            coordinator: Mutex::new(coordinator),
            handlers: Arc::new(HandlerRegistry::new()),
            events: Arc::new(EventBus::new()),
            transport,
            clock,
            stopped: AtomicBool::new(false),
            pending: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            outbound_open: Mutex::new(true),
        });

        let weak: Weak<Shared> = Arc::downgrade(&shared);
        let on_message: MessageCallback = Arc::new(move |data: &[u8]| {
            if let Some(shared) = weak.upgrade() {
                shared.on_bytes(data);
            }
        });
        let subscription = shared.transport.subscribe(on_message)?;

        info!(
            "Peer {} joining channel {:?} over {} transport",
            shared.local_id,
            shared.config.channel_name,
            shared.transport.name()
        );

        shared.update(|coordinator, now| coordinator.bootstrap(now));

        let tasks = vec![
            runtime.spawn(heartbeat_loop(Arc::clone(&shared))),
            runtime.spawn(election_loop(Arc::clone(&shared))),
            runtime.spawn(sweep_loop(Arc::clone(&shared))),
            runtime.spawn(announce_after_delay(Arc::clone(&shared))),
        ];

        Ok(Self {
            shared,
            tasks: Mutex::new(tasks),
            subscription: Mutex::new(Some(subscription)),
        })
    }

    /// This peer's ID, stable for its lifetime.
    pub fn self_id(&self) -> &PeerId {
        &self.shared.local_id
    }

    pub fn config(&self) -> &BeaconConfig {
        &self.shared.config
    }

    /// Whether this peer currently believes it leads.
    pub fn is_leader(&self) -> bool {
        self.with_coordinator(Coordinator::is_leader)
    }

    /// Leader according to the local table.
    pub fn leader(&self) -> Option<PeerId> {
        self.with_coordinator(Coordinator::leader)
    }

    /// Membership snapshot ordered by peer ID.
    pub fn members(&self) -> Vec<MemberEntry> {
        self.with_coordinator(Coordinator::members)
    }

    pub fn server_connected(&self) -> bool {
        self.with_coordinator(Coordinator::server_connected)
    }

    /// Set the peer-local server flag. Independent of leadership.
    pub fn set_server_connected(&self, connected: bool) {
        self.shared.commit(|coordinator, _| Outcome {
            events: coordinator.set_server_connected(connected).into_iter().collect(),
            ..Outcome::default()
        });
    }

    pub fn stats(&self) -> PeerStats {
        self.with_coordinator(Coordinator::stats)
    }

    /// Whether [`stop`](Self::stop) has run.
    pub fn is_stopped(&self) -> bool {
        self.shared.is_stopped()
    }

    /// Broadcast an application message to every other peer.
    pub fn broadcast<T: Serialize + ?Sized>(&self, message_type: &str, payload: &T) -> Result<()> {
        let payload = serde_json::to_value(payload).map_err(PeerError::Payload)?;
        self.send_built(|c, now| c.broadcast(message_type, payload, now))
    }

    /// Send an application message to whichever peer currently leads.
    ///
    /// Every peer receives it; only one that believes it leads acts on it.
    pub fn send_to_leader<T: Serialize + ?Sized>(
        &self,
        message_type: &str,
        payload: &T,
    ) -> Result<()> {
        let payload = serde_json::to_value(payload).map_err(PeerError::Payload)?;
        self.send_built(|c, now| c.send_to_leader(message_type, payload, now))
    }

    /// Register the handler for `message_type`, replacing any previous one.
    ///
    /// Covers both broadcasts and leader-directed messages of that type.
    pub fn register_handler(
        &self,
        message_type: impl Into<String>,
        handler: impl Fn(&Delivery) + Send + Sync + 'static,
    ) -> HandlerRegistration {
        self.shared.handlers.register(message_type, handler)
    }

    /// Register a handler that receives the payload deserialized as `T`.
    pub fn register_typed<T, F>(
        &self,
        message_type: impl Into<String>,
        handler: F,
    ) -> HandlerRegistration
    where
        T: DeserializeOwned,
        F: Fn(T, &Delivery) + Send + Sync + 'static,
    {
        self.shared.handlers.register_typed(message_type, handler)
    }

    /// Subscribe to membership and role events.
    pub fn subscribe(
        &self,
        callback: impl Fn(&BeaconEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.events.subscribe(callback)
    }

    /// Leave the channel.
    ///
    /// Broadcasts `tab_left`, stops the timers and releases the transport
    /// subscription. Idempotent; messages arriving afterwards are ignored.
    pub fn stop(&self) {
        if self.shared.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        let farewell = self.with_coordinator(|c| c.tab_left(self.shared.now_ms()));
        if let Err(e) = self.shared.send_final(&farewell) {
            debug!("Could not send departure notice: {}", e);
        }

        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        drop(
            self.subscription
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );

        info!("Peer {} left channel {:?}", self.shared.local_id, self.shared.config.channel_name);
    }

    fn with_coordinator<R>(&self, f: impl FnOnce(&Coordinator) -> R) -> R {
        let coordinator = self.shared.coordinator.lock().unwrap_or_else(|e| e.into_inner());
        f(&*coordinator)
    }

    fn send_built(
        &self,
        build: impl FnOnce(&Coordinator, u64) -> std::result::Result<Message, RouterError>,
    ) -> Result<()> {
        if self.is_stopped() {
            return Err(PeerError::Stopped);
        }
        let msg = self.with_coordinator(|c| build(c, self.shared.now_ms()))?;
        self.shared.send(&msg)
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.shared.local_id)
            .field("channel", &self.shared.config.channel_name)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

async fn heartbeat_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.heartbeat_interval());
    loop {
        interval.tick().await;
        shared.update(|coordinator, now| coordinator.tick_heartbeat(now));
    }
}

async fn election_loop(shared: Arc<Shared>) {
    let start = Instant::now() + shared.config.initial_election_delay();
    let mut interval = tokio::time::interval_at(start, shared.config.leader_check_interval());
    loop {
        interval.tick().await;
        shared.update(|coordinator, now| coordinator.run_election(now));
    }
}

async fn sweep_loop(shared: Arc<Shared>) {
    let idle = shared.config.stale_threshold();
    loop {
        let wait = {
            let coordinator = shared.coordinator.lock().unwrap_or_else(|e| e.into_inner());
            let now = shared.now_ms();
            coordinator
                .next_expiry()
                .map(|at| Duration::from_millis(at.saturating_sub(now)))
                .unwrap_or(idle)
        };
        tokio::time::sleep(wait).await;
        shared.update(|coordinator, now| coordinator.sweep(now));
    }
}

async fn announce_after_delay(shared: Arc<Shared>) {
    tokio::time::sleep(shared.config.announce_delay()).await;
    shared.update(|coordinator, now| Outcome {
        outbound: vec![coordinator.announce(now)],
        ..Outcome::default()
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageKind;
    use crate::transport::MemoryBus;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn config() -> BeaconConfig {
        BeaconConfig::new("unit")
    }

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_start_requires_runtime() {
        let bus = MemoryBus::new();
        let err = Peer::start(config(), Arc::new(bus.endpoint("unit"))).unwrap_err();
        assert!(matches!(err, PeerError::NoRuntime));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let bus = MemoryBus::new();
        let bad = BeaconConfig::new("");
        let err = Peer::start(bad, Arc::new(bus.endpoint("unit"))).unwrap_err();
        assert!(matches!(err, PeerError::Config(ConfigError::EmptyChannel)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lone_peer_elects_itself() {
        let bus = MemoryBus::new();
        let peer = Peer::start_with_id(id("solo"), config(), Arc::new(bus.endpoint("unit")))
            .unwrap();

        assert!(!peer.is_leader());
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert!(peer.is_leader());
        assert_eq!(peer.leader(), Some(id("solo")));
        assert_eq!(peer.members().len(), 1);
        assert_eq!(peer.stats().elections_initiated, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_role_event_emitted() {
        let bus = MemoryBus::new();
        let peer = Peer::start_with_id(id("solo"), config(), Arc::new(bus.endpoint("unit")))
            .unwrap();

        let roles = Arc::new(AtomicUsize::new(0));
        let roles_clone = Arc::clone(&roles);
        let _sub = peer.subscribe(move |event| {
            if matches!(event, BeaconEvent::RoleChanged { is_leader: true }) {
                roles_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(roles.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent() {
        let bus = MemoryBus::new();
        let peer = Peer::start(config(), Arc::new(bus.endpoint("unit"))).unwrap();
        assert_eq!(bus.listener_count("unit"), 1);

        peer.stop();
        peer.stop();
        assert!(peer.is_stopped());
        assert_eq!(bus.listener_count("unit"), 0);
        assert!(matches!(
            peer.broadcast("ping", &()),
            Err(PeerError::Stopped)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_broadcast_rejects_reserved_type() {
        let bus = MemoryBus::new();
        let peer = Peer::start(config(), Arc::new(bus.endpoint("unit"))).unwrap();
        assert!(matches!(
            peer.broadcast("tab_left", &()),
            Err(PeerError::Router(RouterError::ReservedMessageType(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_connected_flag() {
        let bus = MemoryBus::new();
        let peer = Peer::start(config(), Arc::new(bus.endpoint("unit"))).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        let _sub = peer.subscribe(move |event| {
            if matches!(event, BeaconEvent::ServerConnectedChanged { .. }) {
                seen_clone.fetch_add(1, Ordering::SeqCst);
            }
        });

        peer.set_server_connected(true);
        peer.set_server_connected(true);
        assert!(peer.server_connected());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_follow_mutation_order() {
        let bus = MemoryBus::new();
        let peer = Arc::new(
            Peer::start_with_id(id("solo"), config(), Arc::new(bus.endpoint("unit"))).unwrap(),
        );

        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let weak = Arc::downgrade(&peer);
        let _sub = peer.subscribe(move |event| {
            log_clone.lock().unwrap().push(event.clone());
            // Changing state from inside a callback must not jump ahead of
            // events that are already queued
            if matches!(event, BeaconEvent::LeaderChanged { .. }) {
                if let Some(peer) = weak.upgrade() {
                    peer.set_server_connected(true);
                }
            }
        });

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                BeaconEvent::LeaderChanged {
                    leader: Some(id("solo"))
                },
                BeaconEvent::RoleChanged { is_leader: true },
                BeaconEvent::ServerConnectedChanged { connected: true },
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_sent_after_departure() {
        let bus = MemoryBus::new();
        let peer = Peer::start_with_id(id("aaa"), config(), Arc::new(bus.endpoint("unit")))
            .unwrap();

        let listener = bus.endpoint("unit");
        let kinds = Arc::new(Mutex::new(Vec::new()));
        let kinds_clone = Arc::clone(&kinds);
        let _listening = listener
            .subscribe(Arc::new(move |data: &[u8]| {
                let msg = Message::from_json(data).unwrap();
                kinds_clone.lock().unwrap().push(msg.kind());
            }))
            .unwrap();

        peer.stop();
        let sent = peer.stats().messages_sent;

        // A timer that got past the stop check before stop() ran
        peer.shared.commit(|coordinator, now| coordinator.tick_heartbeat(now));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*kinds.lock().unwrap(), vec![MessageKind::TabLeft]);
        assert_eq!(peer.stats().messages_sent, sent);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_timer_evicts_without_election() {
        let bus = MemoryBus::new();
        let config = config().with_leader_check_interval(Duration::from_secs(60));
        let peer = Peer::start_with_id(id("bbb"), config, Arc::new(bus.endpoint("unit")))
            .unwrap();

        let other = bus.endpoint("unit");
        let hello = Message::heartbeat(id("aaa"), 0, None).to_json().unwrap();
        other.send(&hello).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peer.members().len(), 2);

        // Elections are a minute apart; only the sweep timer can evict
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(peer.members().len(), 1);
        assert_eq!(peer.stats().members_evicted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeats_counted() {
        let bus = MemoryBus::new();
        let peer = Peer::start(config(), Arc::new(bus.endpoint("unit"))).unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        // request_status, announce, 3 heartbeats (0, 1000, 2000), leader_elected
        assert_eq!(peer.stats().messages_sent, 6);
    }
}
