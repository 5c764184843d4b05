// Quorum expressions and their pure evaluation against a known remote-lease
// set. Kept free of any actor/async concerns so it can be unit tested in
// isolation, same as the rest of the predicate logic in this crate.

use std::collections::BTreeSet;

use crate::lease::{have_lease, LeaseRef, LeaseSnapshot, NodeId};

/// Recursive quorum expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumExpr {
    /// Every quorum-node holds a remote lease.
    All,
    /// Strictly more than half of quorum-nodes hold a remote lease.
    Majority,
    /// No remote requirement; only the local lease must exist.
    Follower,
    /// `all` evaluated against an explicit node set.
    AllOf(BTreeSet<NodeId>),
    /// `majority` evaluated against an explicit node set.
    MajorityOf(BTreeSet<NodeId>),
    /// Conjunction of sub-expressions.
    List(Vec<QuorumExpr>),
}

impl QuorumExpr {
    pub fn all_of(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self::AllOf(nodes.into_iter().collect())
    }

    pub fn majority_of(nodes: impl IntoIterator<Item = NodeId>) -> Self {
        Self::MajorityOf(nodes.into_iter().collect())
    }
}

/// A quorum expression requires leader status unless it is `follower` or a
/// list whose every element does not require leader.
pub fn requires_leader(expr: &QuorumExpr) -> bool {
    match expr {
        QuorumExpr::Follower => false,
        QuorumExpr::List(exprs) => exprs.iter().any(requires_leader),
        QuorumExpr::All | QuorumExpr::Majority | QuorumExpr::AllOf(_) | QuorumExpr::MajorityOf(_) => {
            true
        }
    }
}

fn satisfies_majority(held: usize, total: usize) -> bool {
    held * 2 > total
}

/// Pure evaluation of a quorum expression against the currently-held remote
/// leases and the known active membership.
pub fn have_quorum(
    expr: &QuorumExpr,
    remote_leases: &BTreeSet<NodeId>,
    quorum_nodes: &BTreeSet<NodeId>,
) -> bool {
    match expr {
        QuorumExpr::Follower => true,
        QuorumExpr::All => quorum_nodes.iter().all(|n| remote_leases.contains(n)),
        QuorumExpr::Majority => {
            let held = quorum_nodes.iter().filter(|n| remote_leases.contains(*n)).count();
            satisfies_majority(held, quorum_nodes.len())
        }
        QuorumExpr::AllOf(nodes) => nodes.iter().all(|n| remote_leases.contains(n)),
        QuorumExpr::MajorityOf(nodes) => {
            let held = nodes.iter().filter(|n| remote_leases.contains(*n)).count();
            satisfies_majority(held, nodes.len())
        }
        QuorumExpr::List(exprs) => exprs.iter().all(|e| have_quorum(e, remote_leases, quorum_nodes)),
    }
}

/// Whether, given the quorum's leader requirement, the local node is
/// currently acting as leader. Always true for quorums that don't require
/// leader status ("requires-leader-ok").
pub fn requires_leader_ok(expr: &QuorumExpr, snapshot: &LeaseSnapshot) -> bool {
    if !requires_leader(expr) {
        return true;
    }
    have_lease(&LeaseRef::Leader, snapshot)
}

/// The full admission predicate: `have_lease ∧ requires-leader-ok ∧ have_quorum`.
pub fn admission_predicate(
    lease: &LeaseRef,
    quorum: &QuorumExpr,
    snapshot: &LeaseSnapshot,
    remote_leases: &BTreeSet<NodeId>,
    quorum_nodes: &BTreeSet<NodeId>,
) -> bool {
    have_lease(lease, snapshot)
        && requires_leader_ok(quorum, snapshot)
        && have_quorum(quorum, remote_leases, quorum_nodes)
}

/// The "unsafe" fallback predicate taken on quorum-timeout: skip `have_quorum`
/// entirely but never skip the local lease / leader precondition.
pub fn unsafe_admission_predicate(
    lease: &LeaseRef,
    quorum: &QuorumExpr,
    snapshot: &LeaseSnapshot,
) -> bool {
    have_lease(lease, snapshot) && requires_leader_ok(quorum, snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nodes: &[&str]) -> BTreeSet<NodeId> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn majority_over_two_nodes_requires_both() {
        let nodes = set(&["n1", "n2"]);
        assert!(!have_quorum(&QuorumExpr::Majority, &set(&["n1"]), &nodes));
        assert!(have_quorum(&QuorumExpr::Majority, &set(&["n1", "n2"]), &nodes));
    }

    #[test]
    fn majority_over_one_node_requires_that_node() {
        let nodes = set(&["n1"]);
        assert!(!have_quorum(&QuorumExpr::Majority, &BTreeSet::new(), &nodes));
        assert!(have_quorum(&QuorumExpr::Majority, &set(&["n1"]), &nodes));
    }

    #[test]
    fn majority_of_empty_set_is_never_satisfied() {
        let expr = QuorumExpr::majority_of(Vec::<NodeId>::new());
        assert!(!have_quorum(&expr, &BTreeSet::new(), &BTreeSet::new()));
    }

    #[test]
    fn follower_requires_no_remote_leases() {
        assert!(have_quorum(&QuorumExpr::Follower, &BTreeSet::new(), &set(&["n1", "n2"])));
    }

    #[test]
    fn list_is_conjunction() {
        let expr = QuorumExpr::List(vec![
            QuorumExpr::all_of(["n1".to_string()]),
            QuorumExpr::all_of(["n2".to_string()]),
        ]);
        assert!(have_quorum(&expr, &set(&["n1", "n2"]), &BTreeSet::new()));
        assert!(!have_quorum(&expr, &set(&["n1"]), &BTreeSet::new()));
    }

    #[test]
    fn requires_leader_follows_documented_rule() {
        assert!(!requires_leader(&QuorumExpr::Follower));
        assert!(requires_leader(&QuorumExpr::All));
        assert!(requires_leader(&QuorumExpr::Majority));
        assert!(requires_leader(&QuorumExpr::all_of(["n1".to_string()])));

        let all_non_leader = QuorumExpr::List(vec![QuorumExpr::Follower, QuorumExpr::Follower]);
        assert!(!requires_leader(&all_non_leader));

        let mixed = QuorumExpr::List(vec![QuorumExpr::Follower, QuorumExpr::Majority]);
        assert!(requires_leader(&mixed));
    }
}
