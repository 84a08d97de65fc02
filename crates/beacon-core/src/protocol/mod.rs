//! Wire protocol for beacon peers.
//!
//! - Typed messages and kinds (`message`)
//! - Flat JSON envelope with per-kind validation (`envelope`)

pub mod envelope;
pub mod message;

pub use envelope::{ProtocolError, MAX_MESSAGE_SIZE};
pub use message::{Message, MessageBody, MessageKind};
