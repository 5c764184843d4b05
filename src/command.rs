// Internal message types exchanged between `CoordinatorHandle` and the
// single actor task that owns all coordinator state (`actor.rs`). None of
// this is public; callers only ever see `handle.rs`'s async methods.

use std::collections::BTreeSet;
use std::future::Future;
use std::pin::Pin;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityOptions, ActivityOutcome, ActivityToken, Domain, DomainToken, NamePath, WorkerId};
use crate::error::{CollaboratorRole, CoordinatorError, TerminationReason};
use crate::lease::{LeaseHolder, LeaseRef, NodeId};
use crate::quorum::QuorumExpr;

pub(crate) type BoxActivityFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub(crate) type ActivityBody =
    Box<dyn FnOnce(ActivityToken, CancellationToken) -> BoxActivityFuture + Send>;

/// What the admission predicate should do once satisfied.
pub(crate) enum AdmissionKind {
    /// `start_activity`: spawn `body` under a fresh worker once admitted.
    Start { body: ActivityBody },
    /// `register_process`: hand the admitted context back to the calling
    /// task, which continues inline and reports its own completion.
    Register,
    /// `switch_quorum`: the activity already exists; just swap its quorum
    /// in place once the *new* quorum is itself admissible.
    Switch { worker_id: WorkerId },
}

/// A fully-resolved admission request (domain/name/lease already derived
/// from the parent token, if any — see `handle.rs`'s nested-activity
/// resolution).
pub(crate) struct AdmissionRequest {
    pub lease: LeaseRef,
    pub quorum: QuorumExpr,
    pub domain: Domain,
    pub domain_token: DomainToken,
    pub name: NamePath,
    pub options: ActivityOptions,
    pub kind: AdmissionKind,
}

/// What the actor hands back once an admission request is resolved.
pub(crate) enum AdmissionOutcome {
    Started { worker_id: WorkerId, reason_rx: oneshot::Receiver<TerminationReason> },
    Registered { token: ActivityToken, worker_id: WorkerId, cancel: CancellationToken },
    Switched,
}

pub(crate) enum LeaseEvent {
    Acquired(NodeId),
    Lost(NodeId),
    LocalGranted(LeaseHolder),
    LocalExpired(LeaseHolder),
}

pub(crate) type AdmissionReply = oneshot::Sender<Result<AdmissionOutcome, CoordinatorError>>;

pub(crate) enum Command {
    Admit { request: AdmissionRequest, reply: AdmissionReply },
    AdmissionTimeout { id: u64 },
    RegisterCollaborator { role: CollaboratorRole, reply: oneshot::Sender<Result<WorkerId, CoordinatorError>> },
    CollaboratorFinished { role: CollaboratorRole, worker_id: WorkerId },
    LeaseEvent {
        worker_id: WorkerId,
        role: CollaboratorRole,
        event: LeaseEvent,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
    },
    ActivityFinished { worker_id: WorkerId, outcome: ActivityOutcome },
    UpdateMembership { nodes: BTreeSet<NodeId> },
}
