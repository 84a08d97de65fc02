//! Lowest-ID leader election.
//!
//! Every peer runs the same pure function over its own membership table:
//!
//! 1. Refresh our own entry (we are always alive to ourselves)
//! 2. Sweep stale peers so departed ones are never candidates
//! 3. If some entry is already flagged leader, stop
//! 4. Otherwise the lexicographically smallest live ID wins
//!
//! Peers with the same live set always pick the same winner, so concurrent
//! elections converge without any negotiation round.
//!
//! Views can still diverge: announcements cross, or a partition heals with a
//! leader on each side. Every heartbeat and announce carries the sender's
//! leader, and [`reconcile`] folds that claim into the local table so that
//! disagreements settle on the lowest claimed ID.

use super::failure::FailureDetector;
use super::membership::{MemberEntry, MembershipTable};
use crate::PeerId;

/// What an election run decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// A leader was already known; nothing to broadcast
    LeaderKnown(PeerId),
    /// No leader was known and `winner` was just chosen
    Elected(PeerId),
}

impl ElectionOutcome {
    /// The peer that leads after this run.
    pub fn leader(&self) -> &PeerId {
        match self {
            Self::LeaderKnown(id) | Self::Elected(id) => id,
        }
    }

    /// Whether this run chose a new leader (and should broadcast it).
    pub fn is_new(&self) -> bool {
        matches!(self, Self::Elected(_))
    }
}

/// Result of one election run.
#[derive(Debug, Clone)]
pub struct ElectionRound {
    /// Peers evicted by the pre-election sweep
    pub evicted: Vec<MemberEntry>,
    /// Election decision
    pub outcome: ElectionOutcome,
}

/// How a peer's leader claim changed the local view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The claim matches our leader, or names a peer we do not know
    Unchanged,
    /// We now follow the claimed leader
    Adopted(PeerId),
    /// Our leader no longer claims to lead and named nobody we know
    Cleared,
    /// Our leader wins over the claim; `leader` is it
    Kept { leader: PeerId },
}

/// Fold `sender`'s claim that `claim` leads into `table`.
///
/// - No local leader: follow a known claimed leader
/// - Our leader names someone else: follow that peer if known, otherwise
///   clear the flag so the next election runs
/// - Any other conflict: the lower ID wins, provided we know it
///
/// Unknown peers are never adopted, so claims about departed peers cannot
/// bring them back.
pub fn reconcile(table: &mut MembershipTable, sender: &PeerId, claim: &PeerId) -> ClaimOutcome {
    let known = table.contains(claim);
    let Some(current) = table.leader().map(|m| m.id.clone()) else {
        if known {
            table.mark_leader(claim);
            return ClaimOutcome::Adopted(claim.clone());
        }
        return ClaimOutcome::Unchanged;
    };

    if current == *claim {
        return ClaimOutcome::Unchanged;
    }
    if current == *sender {
        if known {
            table.mark_leader(claim);
            return ClaimOutcome::Adopted(claim.clone());
        }
        table.clear_leader();
        return ClaimOutcome::Cleared;
    }
    if known && *claim < current {
        table.mark_leader(claim);
        return ClaimOutcome::Adopted(claim.clone());
    }
    ClaimOutcome::Kept { leader: current }
}

/// Deterministic tie-break: the smallest ID wins.
pub fn pick_winner<'a>(candidates: impl IntoIterator<Item = &'a PeerId>) -> Option<&'a PeerId> {
    candidates.into_iter().min()
}

/// Run one election over `table`.
///
/// Mutates the table: refreshes the local entry, evicts stale peers and,
/// when a new leader is chosen, flags it.
pub fn run(table: &mut MembershipTable, detector: &FailureDetector, now_ms: u64) -> ElectionRound {
    let local = table.local_peer_id().clone();
    table.upsert(&local, now_ms);

    let evicted = detector.sweep(table, now_ms);

    if let Some(leader) = table.leader() {
        return ElectionRound {
            evicted,
            outcome: ElectionOutcome::LeaderKnown(leader.id.clone()),
        };
    }

    // The local entry is permanent, so there is always a candidate
    let winner = pick_winner(table.ids()).cloned().unwrap_or(local);
    table.mark_leader(&winner);

    tracing::debug!(
        "No leader known among {} peer(s); elected {}",
        table.len(),
        winner
    );

    ElectionRound {
        evicted,
        outcome: ElectionOutcome::Elected(winner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    fn detector() -> FailureDetector {
        FailureDetector::new(Duration::from_millis(3000))
    }

    fn table_with(local: &str, others: &[(&str, u64)]) -> MembershipTable {
        let mut table = MembershipTable::new(id(local), 0);
        for (peer, seen) in others {
            table.upsert(&id(peer), *seen);
        }
        table
    }

    #[test]
    fn test_pick_winner_smallest() {
        let ids = [id("kk"), id("b7"), id("b10"), id("z")];
        assert_eq!(pick_winner(&ids), Some(&id("b10")));
    }

    #[test]
    fn test_pick_winner_empty() {
        let ids: [PeerId; 0] = [];
        assert_eq!(pick_winner(&ids), None);
    }

    #[test]
    fn test_elects_smallest_live_peer() {
        let mut table = table_with("ccc", &[("aaa", 100), ("bbb", 100)]);

        let round = run(&mut table, &detector(), 500);
        assert_eq!(round.outcome, ElectionOutcome::Elected(id("aaa")));
        assert!(round.evicted.is_empty());
        assert!(table.get(&id("aaa")).unwrap().is_leader);
        assert!(!table.is_local_leader());
    }

    #[test]
    fn test_elects_self_when_alone() {
        let mut table = table_with("solo", &[]);

        let round = run(&mut table, &detector(), 500);
        assert_eq!(round.outcome, ElectionOutcome::Elected(id("solo")));
        assert!(table.is_local_leader());
    }

    #[test]
    fn test_no_election_when_leader_known() {
        let mut table = table_with("aaa", &[("bbb", 100)]);
        table.mark_leader(&id("bbb"));

        let round = run(&mut table, &detector(), 500);
        assert_eq!(round.outcome, ElectionOutcome::LeaderKnown(id("bbb")));
        assert!(!round.outcome.is_new());
        // Known leader stands even though "aaa" is smaller
        assert!(!table.is_local_leader());
    }

    #[test]
    fn test_stale_peers_never_win() {
        let mut table = table_with("ccc", &[("aaa", 0), ("bbb", 3500)]);

        let round = run(&mut table, &detector(), 4000);
        assert_eq!(round.evicted.len(), 1);
        assert_eq!(round.evicted[0].id, id("aaa"));
        assert_eq!(round.outcome, ElectionOutcome::Elected(id("bbb")));
    }

    #[test]
    fn test_stale_leader_triggers_reelection() {
        let mut table = table_with("ccc", &[("aaa", 0), ("bbb", 3500)]);
        table.mark_leader(&id("aaa"));

        let round = run(&mut table, &detector(), 4000);
        assert!(round.evicted[0].is_leader);
        assert_eq!(round.outcome, ElectionOutcome::Elected(id("bbb")));
    }

    #[test]
    fn test_refreshes_self_before_sweep() {
        let mut table = table_with("me", &[]);
        run(&mut table, &detector(), 9000);
        assert_eq!(table.get(&id("me")).unwrap().last_seen, 9000);
    }

    #[test]
    fn test_determinism_across_peers() {
        let ids = ["p4", "p1", "p3", "p2"];
        let winners: Vec<PeerId> = ids
            .iter()
            .map(|local| {
                let others: Vec<(&str, u64)> = ids
                    .iter()
                    .filter(|o| *o != local)
                    .map(|o| (*o, 100))
                    .collect();
                let mut table = table_with(local, &others);
                run(&mut table, &detector(), 200).outcome.leader().clone()
            })
            .collect();

        assert!(winners.iter().all(|w| *w == id("p1")));
    }

    #[test]
    fn test_reconcile_adopts_claim_when_leaderless() {
        let mut table = table_with("ccc", &[("bbb", 100)]);
        let outcome = reconcile(&mut table, &id("bbb"), &id("bbb"));
        assert_eq!(outcome, ClaimOutcome::Adopted(id("bbb")));
        assert_eq!(table.leader().map(|m| m.id.clone()), Some(id("bbb")));
    }

    #[test]
    fn test_reconcile_ignores_unknown_claim() {
        let mut table = table_with("ccc", &[("bbb", 100)]);
        assert_eq!(reconcile(&mut table, &id("bbb"), &id("aaa")), ClaimOutcome::Unchanged);
        assert!(table.leader().is_none());

        table.mark_leader(&id("bbb"));
        let outcome = reconcile(&mut table, &id("ccc"), &id("aaa"));
        assert_eq!(outcome, ClaimOutcome::Kept { leader: id("bbb") });
    }

    #[test]
    fn test_reconcile_lower_claim_wins() {
        let mut table = table_with("bbb", &[("aaa", 100)]);
        table.mark_leader(&id("bbb"));

        let outcome = reconcile(&mut table, &id("aaa"), &id("aaa"));
        assert_eq!(outcome, ClaimOutcome::Adopted(id("aaa")));
        assert!(!table.is_local_leader());
    }

    #[test]
    fn test_reconcile_higher_claim_loses() {
        let mut table = table_with("aaa", &[("bbb", 100)]);
        table.mark_leader(&id("aaa"));

        let outcome = reconcile(&mut table, &id("bbb"), &id("bbb"));
        assert_eq!(outcome, ClaimOutcome::Kept { leader: id("aaa") });
        assert!(table.is_local_leader());
    }

    #[test]
    fn test_reconcile_follows_leader_that_defers() {
        let mut table = table_with("ccc", &[("aaa", 100), ("bbb", 100)]);
        table.mark_leader(&id("aaa"));

        // Our leader now backs a higher ID; it knows better than we do
        let outcome = reconcile(&mut table, &id("aaa"), &id("bbb"));
        assert_eq!(outcome, ClaimOutcome::Adopted(id("bbb")));
    }

    #[test]
    fn test_reconcile_clears_leader_that_defers_to_unknown() {
        let mut table = table_with("ccc", &[("bbb", 100)]);
        table.mark_leader(&id("bbb"));

        let outcome = reconcile(&mut table, &id("bbb"), &id("aaa"));
        assert_eq!(outcome, ClaimOutcome::Cleared);
        assert!(table.leader().is_none());

        let round = run(&mut table, &detector(), 200);
        assert_eq!(round.outcome, ElectionOutcome::Elected(id("bbb")));
    }

    #[test]
    fn test_rerun_is_idempotent() {
        let mut table = table_with("bbb", &[("aaa", 100)]);
        let first = run(&mut table, &detector(), 200);
        let snapshot = table.snapshot();

        let second = run(&mut table, &detector(), 200);
        assert_eq!(first.outcome.leader(), second.outcome.leader());
        assert_eq!(table.snapshot(), snapshot);
    }
}
