// Error and termination-reason types. One variant per logical error shape,
// with `#[error(...)]` messages carrying the structured fields.

use thiserror::Error;

use crate::activity::{Domain, NamePath, WorkerId};
use crate::lease::{LeaseHolder, LeaseRef, NodeId};
use crate::quorum::QuorumExpr;

/// Which collaborator role a registration/report call is acting as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollaboratorRole {
    Agent,
    Acquirer,
}

impl std::fmt::Display for CollaboratorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Agent => write!(f, "agent"),
            Self::Acquirer => write!(f, "acquirer"),
        }
    }
}

/// Why a live activity was forcibly terminated, or why it ended on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The body returned normally.
    Normal,
    /// The body panicked or returned an error; carries a display-formatted
    /// message (the body's own exit reason, not interpreted further).
    Error(String),
    /// The agent died, or the local lease expired out from under the activity.
    LocalLeaseExpired,
    /// The activity's quorum no longer holds, either because a specific
    /// remote lease was lost or because the membership tracker's node set
    /// changed out from under an `all`/`majority` quorum.
    QuorumLost { detail: String },
    /// The acquirer (or, degenerately, the agent) process died.
    LeaderProcessDied { role: CollaboratorRole },
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Error(msg) => write!(f, "error: {msg}"),
            Self::LocalLeaseExpired => write!(f, "local-lease-expired"),
            Self::QuorumLost { detail } => write!(f, "quorum-lost({detail})"),
            Self::LeaderProcessDied { role } => write!(f, "leader-process-died({role})"),
        }
    }
}

/// Top-level coordinator error: admission failures and invariant violations.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CoordinatorError {
    #[error(
        "no quorum: required lease {required_lease}, required quorum {required_quorum:?}, \
         observed local lease {observed_local_lease:?}, observed remote leases {observed_remote_leases:?}"
    )]
    NoQuorum {
        required_lease: LeaseRef,
        required_quorum: QuorumExpr,
        observed_local_lease: Option<LeaseHolder>,
        observed_remote_leases: Vec<NodeId>,
    },

    #[error("domain conflict: domain {domain} is already running activity {existing_name} under a different domain token")]
    DomainConflict { domain: Domain, existing_name: NamePath },

    #[error("nested activity domain {child} does not match parent activity domain {parent}")]
    DomainMismatch { parent: Domain, child: Domain },

    #[error("wrong identity for {role}: expected {expected:?}, got {supplied}")]
    WrongPid { role: CollaboratorRole, supplied: WorkerId, expected: Option<WorkerId> },

    #[error("{0} is already registered")]
    AlreadyRegistered(CollaboratorRole),

    #[error("local lease grant received while a lease is already held")]
    UnexpectedGrant,

    #[error("local lease expiry does not match the currently held lease")]
    StaleExpiry,

    /// Reserved for the remote-target branch of bypass dispatch (§4.7):
    /// shipping a body to another node requires a named function reference,
    /// not an arbitrary closure. No remote dispatch is wired up in this
    /// crate (RPC transport is an external collaborator, §1), so nothing
    /// here constructs this variant yet, but it belongs to the crate's
    /// error vocabulary.
    #[error("only named function references may be shipped as activity bodies across nodes")]
    NonLocalFunctionDisallowed,

    #[error("the coordinator actor is no longer running")]
    ActorGone,

    #[error("caller timed out waiting for admission after {0:?} (quorum_timeout should have fired first)")]
    CallerTimeout(std::time::Duration),

    #[error("no such activity: {0}")]
    UnknownActivity(WorkerId),
}

/// What `run_activity` returns when the activity was started but then
/// forcibly shut down for a named precondition-loss reason.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("activity {name} in domain {domain} failed: {reason}")]
pub struct ActivityFailure {
    pub domain: Domain,
    pub name: NamePath,
    pub reason: TerminationReason,
}

/// Error type returned by `run_activity`: either the call never started
/// (admission failure) or it started and was later torn down.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RunActivityError {
    #[error(transparent)]
    Admission(#[from] CoordinatorError),
    #[error(transparent)]
    Failed(#[from] ActivityFailure),

    /// The activity's result channel closed without a value — the body
    /// panicked, or the actor was torn down outside the normal termination
    /// paths above. Not one of the named precondition-loss reasons, so it
    /// is reported as-is rather than folded into `Failed`.
    #[error("{0}")]
    BodyAborted(String),
}
