//! Application message handlers.
//!
//! One handler per message type; registering again for the same type
//! replaces the previous handler. Registration returns a guard that
//! unregisters on drop, following the same disposer pattern as
//! [`crate::events::Subscription`].

use crate::PeerId;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// How an application message reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Broadcast to every peer
    Broadcast,
    /// Sent to whichever peer leads; only the leader dispatches these
    Leader,
}

/// An application message ready for a handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Peer that sent the message
    pub sender_id: PeerId,
    /// Application-defined message type
    pub message_type: String,
    /// Opaque JSON payload
    pub payload: Value,
    /// Sender's timestamp (ms since epoch)
    pub timestamp: u64,
    /// Whether this was leader-directed or a plain broadcast
    pub route: Route,
}

type Handler = Arc<dyn Fn(&Delivery) + Send + Sync>;

/// Guard for a registered handler. Unregisters when dropped.
///
/// If the handler was already replaced by a newer registration for the same
/// type, dropping this guard leaves the newer handler in place.
#[must_use = "dropping the registration immediately unregisters the handler"]
pub struct HandlerRegistration {
    registry: Weak<HandlerRegistry>,
    message_type: String,
    id: u64,
}

impl HandlerRegistration {
    /// Message type this registration covers.
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    /// Unregister now. Equivalent to dropping the guard.
    pub fn unregister(self) {}
}

impl Drop for HandlerRegistration {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.message_type, self.id);
        }
    }
}

/// Registry of application handlers keyed by message type.
///
/// Wrap in `Arc` to enable registrations.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, (u64, Handler)>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `message_type`, replacing any previous one.
    pub fn register(
        self: &Arc<Self>,
        message_type: impl Into<String>,
        handler: impl Fn(&Delivery) + Send + Sync + 'static,
    ) -> HandlerRegistration {
        let message_type = message_type.into();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let previous = self
            .handlers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(message_type.clone(), (id, Arc::new(handler)));
        if previous.is_some() {
            tracing::debug!("Replaced handler for message type {:?}", message_type);
        }
        HandlerRegistration {
            registry: Arc::downgrade(self),
            message_type,
            id,
        }
    }

    /// Register a handler whose payload is deserialized into `T`.
    ///
    /// Payloads that do not match `T` are dropped.
    pub fn register_typed<T, F>(
        self: &Arc<Self>,
        message_type: impl Into<String>,
        handler: F,
    ) -> HandlerRegistration
    where
        T: DeserializeOwned,
        F: Fn(T, &Delivery) + Send + Sync + 'static,
    {
        self.register(message_type, move |delivery: &Delivery| {
            match serde_json::from_value::<T>(delivery.payload.clone()) {
                Ok(payload) => handler(payload, delivery),
                Err(e) => tracing::debug!(
                    "Dropping {:?} from {}: payload does not match schema: {}",
                    delivery.message_type,
                    delivery.sender_id,
                    e
                ),
            }
        })
    }

    fn remove(&self, message_type: &str, id: u64) {
        // try_write so a guard dropped during unwinding cannot deadlock a dispatch
        if let Ok(mut handlers) = self.handlers.try_write() {
            if handlers.get(message_type).is_some_and(|(current, _)| *current == id) {
                handlers.remove(message_type);
            }
        }
    }

    /// Whether a handler is registered for `message_type`.
    pub fn contains(&self, message_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(message_type)
    }

    /// Invoke the handler for the delivery's type.
    ///
    /// Returns false if no handler was registered. The lock is released
    /// before the handler runs, so handlers may register or send freely.
    pub fn dispatch(&self, delivery: &Delivery) -> bool {
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&delivery.message_type)
            .map(|(_, handler)| Arc::clone(handler));

        match handler {
            Some(handler) => {
                handler(delivery);
                true
            }
            None => false,
        }
    }
}
