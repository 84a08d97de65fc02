//! Broadcast transport abstraction.
//!
//! A transport is an unreliable, unordered, at-most-once broadcast medium
//! scoped to one channel. Peers need exactly three things from it:
//! - `send`: fire-and-forget to every other endpoint on the channel
//! - `subscribe`: a callback for every message from any other endpoint
//! - releasing the subscription (drop the returned handle)
//!
//! Implementations:
//! - [`MemoryBus`]: in-process channels, used by tests and embedders
//! - UDP multicast and directory-backed store (in `beacon-daemon`)

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Transport closed")]
    Closed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Callback invoked with the raw bytes of every inbound message.
pub type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Handle for an active transport subscription.
///
/// Releases the subscription when dropped.
#[must_use = "dropping the subscription immediately releases it"]
pub struct TransportSubscription {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl TransportSubscription {
    /// Create a subscription that runs `release` exactly once.
    pub fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release now. Equivalent to dropping the handle.
    pub fn release(self) {}
}

impl Drop for TransportSubscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Point-to-multipoint message channel.
pub trait Transport: Send + Sync {
    /// Short name for logs (e.g. "memory", "udp", "store").
    fn name(&self) -> &'static str;

    /// Send to every other endpoint. No delivery guarantee.
    fn send(&self, data: &[u8]) -> Result<()>;

    /// Deliver every inbound message to `on_message` until released.
    ///
    /// Implementations may or may not loop back our own messages.
    fn subscribe(&self, on_message: MessageCallback) -> Result<TransportSubscription>;
}

// ============================================================================
// In-memory bus
// ============================================================================

struct Listener {
    endpoint: u64,
    subscription: u64,
    connected: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// In-process broadcast medium shared by several [`MemoryTransport`]s.
///
/// Delivery is asynchronous: each subscription gets its own queue drained
/// by a Tokio task, so senders never run receivers' callbacks inline.
#[derive(Default)]
pub struct MemoryBus {
    channels: Mutex<HashMap<String, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl MemoryBus {
    /// Create a new bus. Wrap in `Arc` to hand out endpoints.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Create an endpoint on `channel`.
    pub fn endpoint(self: &Arc<Self>, channel: impl Into<String>) -> MemoryTransport {
        MemoryTransport {
            bus: Arc::downgrade(self),
            channel: channel.into(),
            endpoint: self.next_id.fetch_add(1, Ordering::Relaxed),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Number of live subscriptions on `channel`.
    pub fn listener_count(&self, channel: &str) -> usize {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }

    fn publish(&self, channel: &str, from: u64, data: &[u8]) {
        let channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        let Some(listeners) = channels.get(channel) else {
            return;
        };
        for listener in listeners {
            if listener.endpoint == from || !listener.connected.load(Ordering::SeqCst) {
                continue;
            }
            // A closed queue means the subscriber is going away; nothing to do
            let _ = listener.tx.send(data.to_vec());
        }
    }

    fn add_listener(&self, channel: &str, listener: Listener) {
        self.channels
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(channel.to_string())
            .or_default()
            .push(listener);
    }

    fn remove_listener(&self, channel: &str, subscription: u64) {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listeners) = channels.get_mut(channel) {
            listeners.retain(|l| l.subscription != subscription);
            if listeners.is_empty() {
                channels.remove(channel);
            }
        }
    }
}

/// One endpoint on a [`MemoryBus`] channel.
pub struct MemoryTransport {
    bus: Weak<MemoryBus>,
    channel: String,
    endpoint: u64,
    connected: Arc<AtomicBool>,
}

impl MemoryTransport {
    /// Channel this endpoint is attached to.
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Simulate a crash or network loss: from now on this endpoint's sends
    /// vanish and nothing is delivered to it. No departure notice is sent.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Undo [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        self.connected.store(true, Ordering::SeqCst);
    }

    /// Whether the endpoint currently sends and receives.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn send(&self, data: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        let bus = self.bus.upgrade().ok_or(TransportError::Closed)?;
        bus.publish(&self.channel, self.endpoint, data);
        Ok(())
    }

    fn subscribe(&self, on_message: MessageCallback) -> Result<TransportSubscription> {
        let bus = self.bus.upgrade().ok_or(TransportError::Closed)?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| TransportError::Unavailable(e.to_string()))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = bus.next_id.fetch_add(1, Ordering::Relaxed);
        bus.add_listener(
            &self.channel,
            Listener {
                endpoint: self.endpoint,
                subscription,
                connected: Arc::clone(&self.connected),
                tx,
            },
        );

        let task = runtime.spawn(async move {
            while let Some(data) = rx.recv().await {
                on_message(&data);
            }
        });

        let weak_bus = Arc::downgrade(&bus);
        let channel = self.channel.clone();
        Ok(TransportSubscription::new(move || {
            task.abort();
            if let Some(bus) = weak_bus.upgrade() {
                bus.remove_listener(&channel, subscription);
            }
        }))
    }
}
