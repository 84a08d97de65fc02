//! Membership table for tracking live peers.
//!
//! The table is the single source of local truth. It tracks:
//! - Every peer we have heard from (plus ourselves)
//! - Which of them we believe is leader
//! - When each was last heard from, in local milliseconds

use crate::PeerId;
use serde::Serialize;
use std::collections::HashMap;

/// A single entry in the membership table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberEntry {
    /// Peer's unique identifier
    pub id: PeerId,
    /// Whether we believe this peer is the leader
    pub is_leader: bool,
    /// Local time we last heard from this peer (ms since epoch)
    pub last_seen: u64,
}

impl MemberEntry {
    fn new(id: PeerId, last_seen: u64) -> Self {
        Self {
            id,
            is_leader: false,
            last_seen,
        }
    }

    /// Milliseconds since this peer was last heard from.
    pub fn age(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen)
    }
}

/// Result of an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    /// Peer was not known before
    Inserted,
    /// Peer was known and `last_seen` moved forward
    Refreshed,
    /// Peer was known and the timestamp was not newer
    Unchanged,
}

/// Membership table keyed by peer ID.
///
/// The local peer is registered on construction and can never be removed.
/// Foreign entries only appear through `upsert`, i.e. after a message from
/// that peer was observed.
#[derive(Debug, Clone)]
pub struct MembershipTable {
    /// Our own peer ID
    local_peer_id: PeerId,
    /// All known members indexed by peer ID (including ourselves)
    members: HashMap<PeerId, MemberEntry>,
}

impl MembershipTable {
    /// Create a table containing only the local peer.
    pub fn new(local_peer_id: PeerId, now_ms: u64) -> Self {
        let mut members = HashMap::new();
        members.insert(
            local_peer_id.clone(),
            MemberEntry::new(local_peer_id.clone(), now_ms),
        );
        Self {
            local_peer_id,
            members,
        }
    }

    /// Get our local peer ID.
    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    /// Insert a peer or move its `last_seen` forward.
    ///
    /// Time never moves backwards and the leader flag is left untouched.
    pub fn upsert(&mut self, id: &PeerId, last_seen: u64) -> Upsert {
        match self.members.get_mut(id) {
            Some(entry) if last_seen > entry.last_seen => {
                entry.last_seen = last_seen;
                Upsert::Refreshed
            }
            Some(_) => Upsert::Unchanged,
            None => {
                self.members
                    .insert(id.clone(), MemberEntry::new(id.clone(), last_seen));
                Upsert::Inserted
            }
        }
    }

    /// Flag `id` as leader and clear the flag on every other entry.
    ///
    /// If `id` is not in the table no entry ends up flagged. Returns true if
    /// any flag changed.
    pub fn mark_leader(&mut self, id: &PeerId) -> bool {
        let mut changed = false;
        for entry in self.members.values_mut() {
            let is_leader = entry.id == *id;
            if entry.is_leader != is_leader {
                entry.is_leader = is_leader;
                changed = true;
            }
        }
        changed
    }

    /// Clear every leader flag. Returns true if one was set.
    pub fn clear_leader(&mut self) -> bool {
        let mut changed = false;
        for entry in self.members.values_mut().filter(|m| m.is_leader) {
            entry.is_leader = false;
            changed = true;
        }
        changed
    }

    /// Remove a member.
    ///
    /// Returns the removed entry if it existed. The local entry is never removed.
    pub fn evict(&mut self, id: &PeerId) -> Option<MemberEntry> {
        if *id == self.local_peer_id {
            return None;
        }
        self.members.remove(id)
    }

    /// Remove every foreign entry with `now - last_seen >= stale_threshold`.
    ///
    /// Returns the evicted entries sorted by ID.
    pub fn sweep_stale(&mut self, now_ms: u64, stale_threshold_ms: u64) -> Vec<MemberEntry> {
        let stale: Vec<PeerId> = self
            .members
            .values()
            .filter(|m| m.id != self.local_peer_id && m.age(now_ms) >= stale_threshold_ms)
            .map(|m| m.id.clone())
            .collect();

        let mut evicted: Vec<MemberEntry> = stale
            .iter()
            .filter_map(|id| self.members.remove(id))
            .collect();
        evicted.sort_by(|a, b| a.id.cmp(&b.id));
        evicted
    }

    /// The entry currently flagged as leader, if any.
    ///
    /// Should two entries be flagged the smallest ID is returned, so callers
    /// get a stable answer during a split-brain window.
    pub fn leader(&self) -> Option<&MemberEntry> {
        self.members
            .values()
            .filter(|m| m.is_leader)
            .min_by(|a, b| a.id.cmp(&b.id))
    }

    /// Whether the local entry is flagged as leader.
    pub fn is_local_leader(&self) -> bool {
        self.members
            .get(&self.local_peer_id)
            .map(|m| m.is_leader)
            .unwrap_or(false)
    }

    /// Get a member by peer ID.
    pub fn get(&self, id: &PeerId) -> Option<&MemberEntry> {
        self.members.get(id)
    }

    /// Check if a peer is in the table.
    pub fn contains(&self, id: &PeerId) -> bool {
        self.members.contains_key(id)
    }

    /// Iterate over all member IDs (including ourselves).
    pub fn ids(&self) -> impl Iterator<Item = &PeerId> {
        self.members.keys()
    }

    /// Snapshot of all entries ordered by peer ID.
    pub fn snapshot(&self) -> Vec<MemberEntry> {
        let mut entries: Vec<MemberEntry> = self.members.values().cloned().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }

    /// Number of members (including ourselves).
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Always false: the local entry is permanent.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_id() -> PeerId {
        "m0local".parse().unwrap()
    }

    fn peer_a() -> PeerId {
        "a1b2c3d4e".parse().unwrap()
    }

    fn peer_b() -> PeerId {
        "b0000000z".parse().unwrap()
    }

    fn peer_c() -> PeerId {
        "c99999999".parse().unwrap()
    }

    // ==================== Basic operations ====================

    #[test]
    fn test_new_table_contains_self() {
        let table = MembershipTable::new(local_id(), 100);

        assert_eq!(table.local_peer_id(), &local_id());
        assert_eq!(table.len(), 1);
        let me = table.get(&local_id()).unwrap();
        assert!(!me.is_leader);
        assert_eq!(me.last_seen, 100);
    }

    #[test]
    fn test_upsert_inserts_unknown_peer() {
        let mut table = MembershipTable::new(local_id(), 0);

        assert_eq!(table.upsert(&peer_a(), 50), Upsert::Inserted);
        let entry = table.get(&peer_a()).unwrap();
        assert!(!entry.is_leader);
        assert_eq!(entry.last_seen, 50);
    }

    #[test]
    fn test_upsert_moves_time_forward() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 50);

        assert_eq!(table.upsert(&peer_a(), 80), Upsert::Refreshed);
        assert_eq!(table.get(&peer_a()).unwrap().last_seen, 80);
    }

    #[test]
    fn test_upsert_never_moves_time_backwards() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 80);

        assert_eq!(table.upsert(&peer_a(), 20), Upsert::Unchanged);
        assert_eq!(table.get(&peer_a()).unwrap().last_seen, 80);
    }

    #[test]
    fn test_upsert_keeps_leader_flag() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 10);
        table.mark_leader(&peer_a());

        table.upsert(&peer_a(), 20);
        assert!(table.get(&peer_a()).unwrap().is_leader);
    }

    #[test]
    fn test_evict() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 10);

        let removed = table.evict(&peer_a());
        assert_eq!(removed.map(|e| e.id), Some(peer_a()));
        assert!(!table.contains(&peer_a()));
        assert!(table.evict(&peer_a()).is_none());
    }

    #[test]
    fn test_evict_self_ignored() {
        let mut table = MembershipTable::new(local_id(), 0);
        assert!(table.evict(&local_id()).is_none());
        assert!(table.contains(&local_id()));
    }

    // ==================== Leadership ====================

    #[test]
    fn test_mark_leader_single_winner() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 0);
        table.upsert(&peer_b(), 0);
        table.mark_leader(&peer_b());

        assert!(table.mark_leader(&peer_a()));
        let flagged: Vec<_> = table.snapshot().into_iter().filter(|m| m.is_leader).collect();
        assert_eq!(flagged.len(), 1);
        assert_eq!(flagged[0].id, peer_a());
        assert_eq!(table.leader().map(|m| m.id.clone()), Some(peer_a()));
    }

    #[test]
    fn test_mark_leader_idempotent() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 0);

        assert!(table.mark_leader(&peer_a()));
        let before = table.snapshot();
        assert!(!table.mark_leader(&peer_a()));
        assert_eq!(table.snapshot(), before);
    }

    #[test]
    fn test_mark_unknown_leader_clears_flags() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 0);
        table.mark_leader(&peer_a());

        assert!(table.mark_leader(&peer_c()));
        assert!(table.leader().is_none());
        assert!(!table.contains(&peer_c()));
    }

    #[test]
    fn test_clear_leader() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 0);
        assert!(!table.clear_leader());

        table.mark_leader(&peer_a());
        assert!(table.clear_leader());
        assert!(table.leader().is_none());
        assert!(table.contains(&peer_a()));
    }

    #[test]
    fn test_is_local_leader() {
        let mut table = MembershipTable::new(local_id(), 0);
        assert!(!table.is_local_leader());
        table.mark_leader(&local_id());
        assert!(table.is_local_leader());
    }

    #[test]
    fn test_evicting_leader_clears_known_leader() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 0);
        table.mark_leader(&peer_a());

        table.evict(&peer_a());
        assert!(table.leader().is_none());
    }

    // ==================== Staleness ====================

    #[test]
    fn test_sweep_stale_boundary() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 1000);
        table.upsert(&peer_b(), 1001);

        // peer_a is exactly at the threshold, peer_b one ms short of it
        let evicted = table.sweep_stale(4000, 3000);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].id, peer_a());
        assert!(table.contains(&peer_b()));
    }

    #[test]
    fn test_sweep_never_evicts_self() {
        let mut table = MembershipTable::new(local_id(), 0);
        let evicted = table.sweep_stale(u64::MAX, 1);
        assert!(evicted.is_empty());
        assert!(table.contains(&local_id()));
    }

    #[test]
    fn test_sweep_tolerates_future_timestamps() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_a(), 10_000);

        // Clock went backwards: age saturates to zero, nothing evicted
        assert!(table.sweep_stale(5_000, 3000).is_empty());
    }

    #[test]
    fn test_snapshot_sorted() {
        let mut table = MembershipTable::new(local_id(), 0);
        table.upsert(&peer_c(), 0);
        table.upsert(&peer_a(), 0);
        table.upsert(&peer_b(), 0);

        let ids: Vec<PeerId> = table.snapshot().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![peer_a(), peer_b(), peer_c(), local_id()]);
    }
}
