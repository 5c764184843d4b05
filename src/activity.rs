// Activity identity: domains, domain tokens, name paths, options, and the
// context token propagated into nested activities.

use std::fmt;
use std::time::Duration;

use rand::RngCore;

use crate::lease::LeaseRef;

/// A mutual-exclusion class. At most one activity-tree per domain is live.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Domain(pub String);

impl From<&str> for Domain {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier distinguishing one activity-tree within a domain from
/// another. Freshly minted (random) for top-level `run_activity`/
/// `start_activity` calls; inherited verbatim by nested activities.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DomainToken(Vec<u8>);

impl DomainToken {
    pub fn fresh() -> Self {
        let mut bytes = vec![0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }
}

impl fmt::Display for DomainToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex_encode(&self.0))
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The ordered path of nested activity names, e.g. `["rebalance", "plan"]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NamePath(pub Vec<String>);

impl NamePath {
    pub fn new(name: impl Into<String>) -> Self {
        Self(vec![name.into()])
    }

    /// The parent's path with `child` appended.
    pub fn child(&self, child: impl Into<String>) -> Self {
        let mut path = self.0.clone();
        path.push(child.into());
        Self(path)
    }
}

impl fmt::Display for NamePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

/// Per-activity options.
#[derive(Debug, Clone, Default)]
pub struct ActivityOptions {
    /// Max time to wait for the admission predicate. `None` uses the
    /// coordinator's configured default.
    pub quorum_timeout: Option<Duration>,
    /// Caller's total wait bound. `None` uses quorum_timeout + 5s.
    pub timeout: Option<Duration>,
    /// Suppress the log line on normal termination.
    pub quiet: bool,
    /// Permit admission on quorum-timeout if the local-lease/leader
    /// precondition still holds. Inheritable to nested activities.
    pub unsafe_mode: bool,
}

impl ActivityOptions {
    pub fn unsafe_mode() -> Self {
        Self { unsafe_mode: true, ..Self::default() }
    }
}

/// Opaque handle identifying a live activity (or a registered collaborator)
/// inside the coordinator. Minted by the coordinator at admission time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub(crate) u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// How a supervised activity body ended, as reported by the worker itself
/// (or by `ActivityGuard`'s drop-time fallback). Distinct from
/// `TerminationReason`, which is the coordinator's own account of *why* an
/// activity is gone, including forced-shutdown reasons the worker never sees.
#[derive(Debug, Clone)]
pub enum ActivityOutcome {
    /// The body returned (or the registered process finished) normally.
    Normal,
    /// The body panicked or returned an error, carrying its display text.
    Error(String),
}

/// The context propagated into an activity's execution so nested activities
/// can re-enter the coordinator correctly.
#[derive(Debug, Clone)]
pub struct ActivityToken {
    /// The lease the outer activity was admitted under.
    pub lease: LeaseRef,
    pub domain: Domain,
    pub domain_token: DomainToken,
    pub name: NamePath,
    /// Whether the activity that owns this token was admitted `unsafe`;
    /// the only option inherited by nested activities.
    pub inherited_unsafe: bool,
}

impl ActivityToken {
    /// A fresh top-level token for a caller not already inside an activity.
    pub fn fresh(domain: Domain, name: NamePath, unsafe_mode: bool) -> Self {
        Self {
            lease: LeaseRef::Leader,
            domain_token: DomainToken::fresh(),
            domain,
            name,
            inherited_unsafe: unsafe_mode,
        }
    }

    /// Builds the options a nested call should actually run with: the
    /// parent's `unsafe` is inherited (OR'd), everything else in `requested`
    /// passes through unchanged.
    pub fn merge_options(&self, requested: ActivityOptions) -> ActivityOptions {
        ActivityOptions { unsafe_mode: self.inherited_unsafe || requested.unsafe_mode, ..requested }
    }

    /// The name path a nested call should run with.
    pub fn child_name(&self, child: impl Into<String>) -> NamePath {
        self.name.child(child)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_may_not_become_safe_when_parent_unsafe() {
        let token = ActivityToken::fresh(Domain::from("d"), NamePath::new("root"), true);
        let merged = token.merge_options(ActivityOptions::default());
        assert!(merged.unsafe_mode);
    }

    #[test]
    fn child_may_opt_into_unsafe_even_if_parent_safe() {
        let token = ActivityToken::fresh(Domain::from("d"), NamePath::new("root"), false);
        let merged = token.merge_options(ActivityOptions::unsafe_mode());
        assert!(merged.unsafe_mode);
    }

    #[test]
    fn name_path_appends_child() {
        let path = NamePath::new("rebalance").child("plan");
        assert_eq!(path.to_string(), "rebalance/plan");
    }
}
