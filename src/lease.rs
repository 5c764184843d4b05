// Lease identities: the local node's lease from the leader, and the set of
// remote leases the leader-acquirer currently holds on other nodes.

use std::fmt;

/// Cluster node identifier.
pub type NodeId = String;

/// Opaque epoch token issued by whichever node granted a lease.
///
/// Equality is structural; the bytes themselves are never interpreted by the
/// coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EpochToken(Vec<u8>);

impl EpochToken {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for EpochToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "epoch({} bytes)", self.0.len())
    }
}

/// A granted local lease: which node granted it, fenced by an epoch token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseHolder {
    pub node: NodeId,
    pub epoch: EpochToken,
}

impl LeaseHolder {
    pub fn new(node: impl Into<NodeId>, epoch: EpochToken) -> Self {
        Self { node: node.into(), epoch }
    }
}

/// The lease an activity was admitted under: either the `leader` sentinel
/// (always re-checked against current leader status) or a specific holder,
/// fencing the activity to the exact epoch it started with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseRef {
    /// Admitted as "whoever is currently leader"; re-evaluated against the
    /// live local lease on every admission check.
    Leader,
    /// Admitted under a specific `(node, epoch)` pair; fenced against
    /// rotation even if a new lease happens to be granted to the same node.
    Local(LeaseHolder),
}

impl fmt::Display for LeaseRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Leader => write!(f, "leader"),
            Self::Local(holder) => write!(f, "local({})", holder.node),
        }
    }
}

/// Everything the quorum evaluator needs to answer `have_lease`/`have_quorum`.
#[derive(Debug, Clone, Default)]
pub struct LeaseSnapshot {
    pub self_node: NodeId,
    pub local_lease_holder: Option<LeaseHolder>,
    pub acquirer_registered: bool,
}

/// `have_lease(expected, state)` from the quorum evaluator.
pub fn have_lease(expected: &LeaseRef, snapshot: &LeaseSnapshot) -> bool {
    match expected {
        LeaseRef::Leader => {
            snapshot.acquirer_registered
                && snapshot
                    .local_lease_holder
                    .as_ref()
                    .is_some_and(|holder| holder.node == snapshot.self_node)
        }
        LeaseRef::Local(expected_holder) => {
            snapshot.local_lease_holder.as_ref() == Some(expected_holder)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holder(node: &str) -> LeaseHolder {
        LeaseHolder::new(node, EpochToken::new(vec![1, 2, 3]))
    }

    #[test]
    fn leader_sentinel_requires_acquirer_and_self_node() {
        let mut snap = LeaseSnapshot {
            self_node: "n1".into(),
            local_lease_holder: Some(holder("n1")),
            acquirer_registered: true,
        };
        assert!(have_lease(&LeaseRef::Leader, &snap));

        snap.acquirer_registered = false;
        assert!(!have_lease(&LeaseRef::Leader, &snap));

        snap.acquirer_registered = true;
        snap.local_lease_holder = Some(holder("n2"));
        assert!(!have_lease(&LeaseRef::Leader, &snap));
    }

    #[test]
    fn fenced_lease_requires_exact_match() {
        let snap = LeaseSnapshot {
            self_node: "n1".into(),
            local_lease_holder: Some(holder("n1")),
            acquirer_registered: true,
        };
        assert!(have_lease(&LeaseRef::Local(holder("n1")), &snap));

        let rotated = LeaseHolder::new("n1", EpochToken::new(vec![9]));
        assert!(!have_lease(&LeaseRef::Local(rotated), &snap));
    }
}
