//! PeerId: Unique identifier for a peer on a beacon channel.
//!
//! A short random base-36 token generated once per peer. Ordering is plain
//! lexicographic byte order, which is what the election tie-break relies on.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Length of generated peer IDs.
pub const GENERATED_LEN: usize = 9;

/// Longest peer ID accepted off the wire.
pub const MAX_LEN: usize = 64;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerIdError {
    #[error("Peer ID cannot be empty")]
    Empty,
    #[error("Peer ID longer than {MAX_LEN} characters")]
    TooLong,
    #[error("Invalid character in peer ID: {0:?}")]
    InvalidChar(char),
}

/// A unique identifier for a peer.
///
/// Stable for the lifetime of the peer and totally ordered, so every peer
/// that sees the same live set picks the same smallest ID.
///
/// # Examples
/// ```
/// use beacon_core::PeerId;
///
/// let peer_id = PeerId::generate();
/// assert_eq!(peer_id.as_str().len(), 9);
///
/// let a: PeerId = "a1b2c3".parse().unwrap();
/// let b: PeerId = "b1".parse().unwrap();
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Generate a new random base-36 peer ID.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let id = (0..GENERATED_LEN)
            .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
            .collect();
        Self(id)
    }

    /// Borrow the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(PeerIdError::Empty);
        }
        if s.len() > MAX_LEN {
            return Err(PeerIdError::TooLong);
        }
        if let Some(c) = s
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(PeerIdError::InvalidChar(c));
        }
        Ok(Self(s.to_string()))
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// Serialize as a plain string so the wire format stays human readable
impl serde::Serialize for PeerId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for PeerId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
