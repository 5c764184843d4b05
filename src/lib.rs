//! Cluster leader-activity coordinator: gates administrative "activities" on
//! (a) the local node holding a valid short-lived local lease from the
//! current leader and (b) a quorum of remote leases being held by the
//! leader-acquirer, supervising running activities and cancelling them
//! whenever either precondition stops holding.
//!
//! The coordinator itself is a single in-process actor (`actor.rs`); callers
//! only ever see [`CoordinatorHandle`] and the types it exchanges.

mod actor;
mod collaborators;
mod command;
mod membership;
mod registry;

pub mod activity;
pub mod bypass;
pub mod config;
pub mod error;
pub mod handle;
pub mod lease;
pub mod quorum;

pub use activity::{
    ActivityOptions, ActivityOutcome, ActivityToken, Domain, DomainToken, NamePath, WorkerId,
};
pub use bypass::{AlwaysCurrent, ClusterCompatSource};
pub use config::{ConfigError, CoordinatorConfig};
pub use error::{ActivityFailure, CollaboratorRole, CoordinatorError, RunActivityError, TerminationReason};
pub use handle::{AcquirerHandle, AgentHandle, CoordinatorHandle, RegisteredActivity, StartedActivity};
pub use lease::{EpochToken, LeaseHolder, LeaseRef, NodeId};
pub use quorum::QuorumExpr;
