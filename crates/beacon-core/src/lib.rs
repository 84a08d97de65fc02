//! beacon-core: leader election and failure detection over an unreliable broadcast medium.
//!
//! This crate provides the core functionality for:
//! - Tracking which peers on a channel are alive (membership + staleness sweep)
//! - Electing exactly one leader with a deterministic lowest-ID rule
//! - Routing application messages to every peer or to the current leader
//! - A Tokio runtime (`Peer`) that drives it all over any `Transport`

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod handlers;
pub mod peer;
pub mod peer_id;
pub mod protocol;
pub mod transport;

pub use cluster::{FailureDetector, MemberEntry, MembershipTable};
pub use config::{BeaconConfig, ConfigError};
pub use coordinator::{Coordinator, Outcome, PeerStats, RouterError};
pub use events::{BeaconEvent, EventBus, LeaveReason, Subscription};
pub use handlers::{Delivery, HandlerRegistration, HandlerRegistry, Route};
pub use peer::{Peer, PeerError};
pub use peer_id::{PeerId, PeerIdError};
pub use protocol::{Message, MessageBody, MessageKind, ProtocolError};
pub use transport::{
    MemoryBus, MemoryTransport, MessageCallback, Transport, TransportError, TransportSubscription,
};
