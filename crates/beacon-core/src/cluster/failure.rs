//! Staleness-based failure detection.
//!
//! There is no ping/ack here: every peer heartbeats on a timer, and any
//! foreign entry whose last message is at least `stale_threshold` old is
//! considered gone. The detector is pure; the caller supplies `now` and acts
//! on the returned evictions.

use super::membership::{MemberEntry, MembershipTable};
use std::time::Duration;

/// Failure detector for the membership table.
#[derive(Debug, Clone)]
pub struct FailureDetector {
    /// Silence after which a peer is evicted
    stale_threshold_ms: u64,
}

impl FailureDetector {
    /// Create a new failure detector.
    pub fn new(stale_threshold: Duration) -> Self {
        Self {
            stale_threshold_ms: stale_threshold.as_millis() as u64,
        }
    }

    /// Get the stale threshold in milliseconds.
    pub fn stale_threshold_ms(&self) -> u64 {
        self.stale_threshold_ms
    }

    /// Evict every stale entry.
    pub fn sweep(&self, table: &mut MembershipTable, now_ms: u64) -> Vec<MemberEntry> {
        let evicted = table.sweep_stale(now_ms, self.stale_threshold_ms);
        for entry in &evicted {
            tracing::debug!(
                "Evicting stale peer {} (silent for {}ms{})",
                entry.id,
                entry.age(now_ms),
                if entry.is_leader { ", was leader" } else { "" }
            );
        }
        evicted
    }

    /// Earliest time at which some current foreign entry becomes stale.
    ///
    /// Sweeping at that time evicts it unless it was heard from again.
    pub fn next_expiry(&self, table: &MembershipTable) -> Option<u64> {
        table
            .snapshot()
            .iter()
            .filter(|m| m.id != *table.local_peer_id())
            .map(|m| m.last_seen.saturating_add(self.stale_threshold_ms))
            .min()
    }
}
