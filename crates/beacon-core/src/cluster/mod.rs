//! Cluster membership, failure detection and leader election.
//!
//! All three pieces are pure and clock-free: callers pass `now` in
//! milliseconds, which keeps the protocol deterministic under test.

pub mod election;
pub mod failure;
pub mod membership;

pub use election::{pick_winner, reconcile, ClaimOutcome, ElectionOutcome, ElectionRound};
pub use failure::FailureDetector;
pub use membership::{MemberEntry, MembershipTable, Upsert};
