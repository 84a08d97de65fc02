//! Coordinator: routes protocol messages and drives elections.
//!
//! The coordinator owns the membership table and is completely IO-free. Every
//! entry point takes `now` in milliseconds and returns an [`Outcome`]
//! describing what the caller must do next:
//!
//! - `outbound`: messages to hand to the transport
//! - `events`: notifications for the host
//! - `deliveries`: application messages for registered handlers
//!
//! Inbound routing:
//!
//! | kind                | effect                                            |
//! |---------------------|---------------------------------------------------|
//! | `heartbeat`         | refresh sender, reconcile its leader claim        |
//! | `announce`          | refresh sender, reconcile its leader claim        |
//! | `request_status`    | refresh sender, reply with `announce`             |
//! | `leader_elected`    | refresh sender, reconcile the announced leader    |
//! | `tab_left`          | evict sender                                      |
//! | `message_to_leader` | refresh sender, deliver only if we lead           |
//! | anything else       | refresh sender, deliver as an application message |
//!
//! Messages we sent ourselves are ignored, so transports that loop back are
//! harmless.
//!
//! Leader claims are settled by [`election::reconcile`]. A leader that keeps
//! its role against a higher announced leader answers with its own
//! `leader_elected`, so crossed announcements settle within one round trip.

use crate::cluster::{
    election, ClaimOutcome, FailureDetector, MemberEntry, MembershipTable, Upsert,
};
use crate::config::BeaconConfig;
use crate::events::{BeaconEvent, LeaveReason};
use crate::handlers::{Delivery, Route};
use crate::protocol::{Message, MessageBody, MessageKind};
use crate::PeerId;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, trace};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RouterError {
    #[error("Message type cannot be empty")]
    EmptyMessageType,

    #[error("Message type {0:?} is reserved for the protocol")]
    ReservedMessageType(String),
}

/// Counters for one peer's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStats {
    /// Messages handed to the transport
    pub messages_sent: u64,
    /// Valid messages from other peers
    pub messages_received: u64,
    /// Inbound messages that failed to decode
    pub messages_dropped: u64,
    /// Elections this peer decided and broadcast
    pub elections_initiated: u64,
    /// Members removed because they went stale
    pub members_evicted: u64,
}

/// Side effects requested by the coordinator.
#[derive(Debug, Default)]
pub struct Outcome {
    pub outbound: Vec<Message>,
    pub events: Vec<BeaconEvent>,
    pub deliveries: Vec<Delivery>,
}

impl Outcome {
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && self.deliveries.is_empty()
    }
}

/// Leader and role before a mutation, for change detection.
struct RoleSnapshot {
    leader: Option<PeerId>,
    is_leader: bool,
}

/// Protocol state for one peer.
pub struct Coordinator {
    table: MembershipTable,
    detector: FailureDetector,
    server_connected: bool,
    stats: PeerStats,
}

impl Coordinator {
    /// Create a coordinator for `local_id`, registering ourselves at `now_ms`.
    pub fn new(local_id: PeerId, config: &BeaconConfig, now_ms: u64) -> Self {
        Self {
            table: MembershipTable::new(local_id, now_ms),
            detector: FailureDetector::new(config.stale_threshold()),
            server_connected: false,
            stats: PeerStats::default(),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        self.table.local_peer_id()
    }

    /// Whether our own entry is flagged leader.
    pub fn is_leader(&self) -> bool {
        self.table.is_local_leader()
    }

    /// Current leader as seen locally.
    pub fn leader(&self) -> Option<PeerId> {
        self.table.leader().map(|m| m.id.clone())
    }

    /// Membership snapshot ordered by peer ID.
    pub fn members(&self) -> Vec<MemberEntry> {
        self.table.snapshot()
    }

    pub fn table(&self) -> &MembershipTable {
        &self.table
    }

    pub fn server_connected(&self) -> bool {
        self.server_connected
    }

    /// Set the host-controlled server flag. Returns an event if it changed.
    pub fn set_server_connected(&mut self, connected: bool) -> Option<BeaconEvent> {
        if self.server_connected == connected {
            return None;
        }
        self.server_connected = connected;
        Some(BeaconEvent::ServerConnectedChanged { connected })
    }

    pub fn stats(&self) -> PeerStats {
        self.stats
    }

    /// Record that `count` messages reached the transport.
    pub fn record_sent(&mut self, count: u64) {
        self.stats.messages_sent += count;
    }

    // ------------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------------

    /// Decode raw transport bytes and route them.
    ///
    /// Undecodable input is counted and dropped.
    pub fn receive(&mut self, data: &[u8], now_ms: u64) -> Outcome {
        match Message::from_json(data) {
            Ok(msg) => self.handle_message(msg, now_ms),
            Err(e) => {
                self.stats.messages_dropped += 1;
                debug!("Dropping undecodable message ({} bytes): {}", data.len(), e);
                Outcome::default()
            }
        }
    }

    /// Route one decoded message.
    pub fn handle_message(&mut self, msg: Message, now_ms: u64) -> Outcome {
        if msg.sender_id == *self.local_id() {
            trace!("Ignoring our own {} message", msg.kind());
            return Outcome::default();
        }
        self.stats.messages_received += 1;

        let before = self.role_snapshot();
        let mut outcome = Outcome::default();
        let sender = msg.sender_id;

        if let MessageBody::TabLeft = msg.body {
            if let Some(entry) = self.table.evict(&sender) {
                info!("Peer {} left{}", entry.id, if entry.is_leader { " (was leader)" } else { "" });
                outcome.events.push(BeaconEvent::MemberLeft {
                    peer_id: entry.id,
                    reason: LeaveReason::Departed,
                });
            }
            self.push_role_changes(before, &mut outcome);
            return outcome;
        }

        self.touch(&sender, now_ms, &mut outcome);

        match msg.body {
            MessageBody::Heartbeat { leader_id } | MessageBody::Announce { leader_id } => {
                if let Some(claim) = leader_id {
                    self.reconcile_claim(&sender, &claim);
                }
            }
            MessageBody::RequestStatus => {
                outcome.outbound.push(self.announce(now_ms));
            }
            MessageBody::LeaderElected { leader_id } => {
                debug!("{} announced leader {}", sender, leader_id);
                if let ClaimOutcome::Kept { leader } = self.reconcile_claim(&sender, &leader_id) {
                    if leader == *self.local_id() {
                        info!("Asserting leadership over announced leader {}", leader_id);
                        outcome
                            .outbound
                            .push(Message::leader_elected(leader.clone(), now_ms, leader));
                    }
                }
            }
            MessageBody::MessageToLeader {
                message_type,
                payload,
            } => {
                if self.is_leader() {
                    outcome.deliveries.push(Delivery {
                        sender_id: sender,
                        message_type,
                        payload,
                        timestamp: msg.timestamp,
                        route: Route::Leader,
                    });
                } else {
                    trace!("Not leader; ignoring leader-directed {:?}", message_type);
                }
            }
            MessageBody::Application {
                message_type,
                payload,
            } => {
                outcome.deliveries.push(Delivery {
                    sender_id: sender,
                    message_type,
                    payload,
                    timestamp: msg.timestamp,
                    route: Route::Broadcast,
                });
            }
            MessageBody::TabLeft => {}
        }

        self.push_role_changes(before, &mut outcome);
        outcome
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    /// Sweep stale peers and elect a leader if none is known.
    pub fn run_election(&mut self, now_ms: u64) -> Outcome {
        let before = self.role_snapshot();
        let mut outcome = Outcome::default();

        let round = election::run(&mut self.table, &self.detector, now_ms);
        self.push_evictions(round.evicted, &mut outcome);

        if round.outcome.is_new() {
            let winner = round.outcome.leader().clone();
            self.stats.elections_initiated += 1;
            info!("Elected {} as leader among {} peer(s)", winner, self.table.len());
            outcome
                .outbound
                .push(Message::leader_elected(self.local_id().clone(), now_ms, winner));
        }

        self.push_role_changes(before, &mut outcome);
        outcome
    }

    /// Sweep stale peers without electing.
    pub fn sweep(&mut self, now_ms: u64) -> Outcome {
        let before = self.role_snapshot();
        let mut outcome = Outcome::default();
        let evicted = self.detector.sweep(&mut self.table, now_ms);
        self.push_evictions(evicted, &mut outcome);
        self.push_role_changes(before, &mut outcome);
        outcome
    }

    /// Heartbeat tick: refresh ourselves and emit a heartbeat naming our leader.
    pub fn tick_heartbeat(&mut self, now_ms: u64) -> Outcome {
        let local = self.local_id().clone();
        self.table.upsert(&local, now_ms);
        Outcome {
            outbound: vec![Message::heartbeat(local, now_ms, self.leader())],
            ..Outcome::default()
        }
    }

    /// Earliest time a current member becomes stale.
    pub fn next_expiry(&self) -> Option<u64> {
        self.detector.next_expiry(&self.table)
    }

    // ------------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------------

    pub fn request_status(&self, now_ms: u64) -> Message {
        Message::request_status(self.local_id().clone(), now_ms)
    }

    pub fn announce(&self, now_ms: u64) -> Message {
        Message::announce(self.local_id().clone(), now_ms, self.leader())
    }

    pub fn tab_left(&self, now_ms: u64) -> Message {
        Message::tab_left(self.local_id().clone(), now_ms)
    }

    /// Build an application broadcast.
    pub fn broadcast(
        &self,
        message_type: &str,
        payload: Value,
        now_ms: u64,
    ) -> Result<Message, RouterError> {
        check_application_type(message_type)?;
        Ok(Message::new(
            self.local_id().clone(),
            now_ms,
            MessageBody::application(message_type, payload),
        ))
    }

    /// Build a leader-directed message.
    ///
    /// The medium has no unicast, so this is a broadcast that only the peer
    /// believing itself leader acts on. A leader does not receive its own
    /// message, so it will not be handled locally either.
    pub fn send_to_leader(
        &self,
        message_type: &str,
        payload: Value,
        now_ms: u64,
    ) -> Result<Message, RouterError> {
        check_application_type(message_type)?;
        Ok(Message::message_to_leader(
            self.local_id().clone(),
            now_ms,
            message_type,
            payload,
        ))
    }

    // ------------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------------

    fn touch(&mut self, id: &PeerId, now_ms: u64, outcome: &mut Outcome) {
        match self.table.upsert(id, now_ms) {
            Upsert::Inserted => {
                info!("Peer {} joined", id);
                outcome.events.push(BeaconEvent::MemberJoined {
                    peer_id: id.clone(),
                });
            }
            Upsert::Refreshed => {
                let last_seen = self.table.get(id).map(|m| m.last_seen).unwrap_or(now_ms);
                outcome.events.push(BeaconEvent::MemberSeen {
                    peer_id: id.clone(),
                    last_seen,
                });
            }
            Upsert::Unchanged => {}
        }
    }

    fn reconcile_claim(&mut self, sender: &PeerId, claim: &PeerId) -> ClaimOutcome {
        let outcome = election::reconcile(&mut self.table, sender, claim);
        match &outcome {
            ClaimOutcome::Adopted(leader) => {
                debug!("Following {} as leader (claimed by {})", leader, sender)
            }
            ClaimOutcome::Cleared => {
                debug!("Leader {} backs unknown peer {}; dropping it", sender, claim)
            }
            ClaimOutcome::Kept { leader } => {
                trace!("Keeping leader {} over {}'s claim for {}", leader, sender, claim)
            }
            ClaimOutcome::Unchanged => {}
        }
        outcome
    }

    fn push_evictions(&mut self, evicted: Vec<MemberEntry>, outcome: &mut Outcome) {
        for entry in evicted {
            self.stats.members_evicted += 1;
            info!("Peer {} went stale", entry.id);
            outcome.events.push(BeaconEvent::MemberLeft {
                peer_id: entry.id,
                reason: LeaveReason::Stale,
            });
        }
    }

    fn role_snapshot(&self) -> RoleSnapshot {
        RoleSnapshot {
            leader: self.leader(),
            is_leader: self.is_leader(),
        }
    }

    fn push_role_changes(&self, before: RoleSnapshot, outcome: &mut Outcome) {
        let leader = self.leader();
        if leader != before.leader {
            outcome.events.push(BeaconEvent::LeaderChanged { leader });
        }
        let is_leader = self.is_leader();
        if is_leader != before.is_leader {
            if is_leader {
                info!("This peer is now the leader");
            } else {
                info!("This peer is no longer the leader");
            }
            outcome.events.push(BeaconEvent::RoleChanged { is_leader });
        }
    }

    /// Bootstrap burst: ask everyone to announce.
    pub fn bootstrap(&self, now_ms: u64) -> Outcome {
        Outcome {
            outbound: vec![self.request_status(now_ms)],
            ..Outcome::default()
        }
    }
}

fn check_application_type(message_type: &str) -> Result<(), RouterError> {
    if message_type.is_empty() {
        return Err(RouterError::EmptyMessageType);
    }
    if MessageKind::is_reserved(message_type) {
        return Err(RouterError::ReservedMessageType(message_type.to_string()));
    }
    Ok(())
}
