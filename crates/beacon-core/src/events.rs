//! Event infrastructure for beacon-core.
//!
//! Provides `BeaconEvent` for membership/role changes and `EventBus` for
//! subscriptions. Every mutation of the membership table or of the local role
//! produces exactly one event, so hosts can subscribe instead of polling.

use crate::PeerId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Why a member left the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum LeaveReason {
    /// Peer announced its departure
    Departed,
    /// Peer went silent past the stale threshold
    Stale,
}

/// Events emitted as the local view of the channel changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BeaconEvent {
    /// A peer was heard from for the first time.
    MemberJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A known peer's `last_seen` moved forward.
    MemberSeen {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        /// New last-seen time in milliseconds since Unix epoch.
        #[serde(rename = "lastSeen")]
        last_seen: u64,
    },
    /// A peer was removed from the table.
    MemberLeft {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        reason: LeaveReason,
    },
    /// The leader flag moved. `None` when no entry is flagged.
    LeaderChanged { leader: Option<PeerId> },
    /// The local peer gained or lost leadership.
    RoleChanged {
        #[serde(rename = "isLeader")]
        is_leader: bool,
    },
    /// The host-controlled server-connected flag changed.
    ServerConnectedChanged { connected: bool },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
#[must_use = "dropping the subscription immediately unsubscribes"]
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(&BeaconEvent) + Send + Sync>;

/// Event bus for publishing beacon events to subscribers.
///
/// Thread-safe for use in multi-threaded Tokio runtime.
/// Wrap in `Arc` to enable subscriptions.
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self {
            callbacks: RwLock::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    ///
    /// Requires `self` to be wrapped in `Arc`.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(&BeaconEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // Use try_write to avoid deadlock if Drop runs during panic unwinding
        // while a read lock is held (e.g., during emit).
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: &BeaconEvent) {
        // Clone the callback list to prevent deadlock if a callback calls subscribe.
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event);
        }
    }
}
