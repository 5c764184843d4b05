// Membership tracker: maintains the current "quorum node set"
// from membership events. Kept as a pure function so the actor can decide,
// without duplicating set-comparison logic, whether a re-evaluation sweep
// over live activities is actually warranted.

use std::collections::BTreeSet;

use crate::lease::NodeId;

/// Applies a new membership snapshot, returning the updated set and whether
/// it actually differs from the previous one.
pub fn apply(current: &BTreeSet<NodeId>, new_members: BTreeSet<NodeId>) -> (BTreeSet<NodeId>, bool) {
    let changed = *current != new_members;
    (new_members, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(nodes: &[&str]) -> BTreeSet<NodeId> {
        nodes.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn unchanged_membership_reports_no_change() {
        let current = set(&["n1", "n2"]);
        let (updated, changed) = apply(&current, set(&["n1", "n2"]));
        assert!(!changed);
        assert_eq!(updated, current);
    }

    #[test]
    fn changed_membership_reports_change() {
        let current = set(&["n1", "n2"]);
        let (updated, changed) = apply(&current, set(&["n1", "n2", "n3"]));
        assert!(changed);
        assert_eq!(updated, set(&["n1", "n2", "n3"]));
    }
}
