// The coordinator actor: a single `tokio::task` owning all coordinator
// state, driven by a `tokio::sync::mpsc` command channel. Every mutation to
// collaborator slots, lease sets, the activity registry, and the
// deferred-wait queue happens here, in strict command arrival order, which
// is what makes cross-activity invariants enforceable: no two admission
// decisions are ever computed against inconsistent state.
//
// Callers never touch this type directly; `handle.rs`'s `CoordinatorHandle`
// sends `Command`s and awaits `oneshot` replies, the same request/reply shape
// used elsewhere for single-writer actors, generalized here to per-request
// deferred replies instead of a single shared slot.

use std::collections::BTreeSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{ActivityOutcome, Domain, DomainToken, NamePath, WorkerId};
use crate::collaborators::CollaboratorSlot;
use crate::command::{
    AdmissionKind, AdmissionOutcome, AdmissionReply, AdmissionRequest, Command, LeaseEvent,
};
use crate::config::CoordinatorConfig;
use crate::error::{CollaboratorRole, CoordinatorError, TerminationReason};
use crate::lease::{LeaseHolder, LeaseRef, LeaseSnapshot, NodeId};
use crate::membership;
use crate::quorum::{admission_predicate, requires_leader, unsafe_admission_predicate, QuorumExpr};
use crate::registry::{ActivityEntry, ActivityRegistry};

/// A start/register/switch request that couldn't be admitted immediately,
/// waiting for a state change or its own quorum timeout.
struct PendingAdmission {
    id: u64,
    lease: LeaseRef,
    quorum: QuorumExpr,
    domain: Domain,
    domain_token: DomainToken,
    name: NamePath,
    options: crate::activity::ActivityOptions,
    kind: AdmissionKind,
    reply: AdmissionReply,
    unsafe_mode: bool,
    timer: JoinHandle<()>,
}

/// Owns every piece of mutable coordinator state.
struct CoordinatorState {
    self_node: NodeId,
    config: Arc<RwLock<CoordinatorConfig>>,
    agent: CollaboratorSlot,
    acquirer: CollaboratorSlot,
    local_lease_holder: Option<LeaseHolder>,
    remote_leases: BTreeSet<NodeId>,
    quorum_nodes: BTreeSet<NodeId>,
    registry: ActivityRegistry,
    pending: Vec<PendingAdmission>,
    next_worker_id: u64,
    next_pending_id: u64,
}

impl CoordinatorState {
    fn snapshot(&self) -> LeaseSnapshot {
        LeaseSnapshot {
            self_node: self.self_node.clone(),
            local_lease_holder: self.local_lease_holder.clone(),
            acquirer_registered: self.acquirer.is_registered(),
        }
    }

    fn fresh_worker_id(&mut self) -> WorkerId {
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        WorkerId(id)
    }

    fn fresh_pending_id(&mut self) -> u64 {
        let id = self.next_pending_id;
        self.next_pending_id += 1;
        id
    }

    fn quorum_timeout_for(&self, options: &crate::activity::ActivityOptions) -> Duration {
        options
            .quorum_timeout
            .unwrap_or_else(|| self.config.read().unwrap().default_quorum_timeout(options.unsafe_mode))
    }

    /// The full admission predicate against current state.
    fn predicate_holds(&self, lease: &LeaseRef, quorum: &QuorumExpr) -> bool {
        admission_predicate(lease, quorum, &self.snapshot(), &self.remote_leases, &self.quorum_nodes)
    }

    /// The unsafe fallback predicate: lease/leader only, quorum skipped.
    fn unsafe_predicate_holds(&self, lease: &LeaseRef, quorum: &QuorumExpr) -> bool {
        unsafe_admission_predicate(lease, quorum, &self.snapshot())
    }

    /// Dispatches an admitted request: the domain-conflict check happens
    /// here, at the moment of actual admission, because a second pending
    /// request for the same domain may become admissible in the same
    /// state-change sweep that just seated the first.
    fn dispatch(&mut self, req: ResolvedRequest, reply: AdmissionReply, command_tx: &mpsc::Sender<Command>) {
        match req.kind {
            AdmissionKind::Start { body } => {
                if let Some(existing) = self.registry.domain_conflict(&req.domain, &req.domain_token) {
                    error!(domain = %req.domain, existing = %existing, "domain conflict on start");
                    let _ = reply.send(Err(CoordinatorError::DomainConflict {
                        domain: req.domain.clone(),
                        existing_name: existing.clone(),
                    }));
                    return;
                }

                let worker_id = self.fresh_worker_id();
                let token = crate::activity::ActivityToken {
                    lease: req.lease.clone(),
                    domain: req.domain.clone(),
                    domain_token: req.domain_token.clone(),
                    name: req.name.clone(),
                    inherited_unsafe: req.options.unsafe_mode,
                };
                let cancel = CancellationToken::new();
                let (reason_tx, reason_rx) = oneshot::channel();

                info!(domain = %req.domain, name = %req.name, %worker_id, "activity admitted");

                self.registry.insert(ActivityEntry {
                    worker_id,
                    domain: req.domain,
                    domain_token: req.domain_token,
                    name: req.name,
                    quorum: req.quorum,
                    lease: req.lease,
                    options: req.options,
                    cancel: cancel.clone(),
                    pending_reason: None,
                    reason_tx: Some(reason_tx),
                });

                let tx = command_tx.clone();
                let worker_cancel = cancel.clone();
                tokio::spawn(async move {
                    let mut body_task = tokio::spawn(body(token, worker_cancel.clone()));
                    let outcome = tokio::select! {
                        joined = &mut body_task => match joined {
                            Ok(()) => ActivityOutcome::Normal,
                            Err(join_err) if join_err.is_panic() => {
                                ActivityOutcome::Error(panic_message(join_err))
                            }
                            Err(_) => ActivityOutcome::Normal,
                        },
                        _ = worker_cancel.cancelled() => {
                            body_task.abort();
                            ActivityOutcome::Normal
                        }
                    };
                    let _ = tx.send(Command::ActivityFinished { worker_id, outcome }).await;
                });

                let _ = reply.send(Ok(AdmissionOutcome::Started { worker_id, reason_rx }));
            }
            AdmissionKind::Register => {
                if let Some(existing) = self.registry.domain_conflict(&req.domain, &req.domain_token) {
                    error!(domain = %req.domain, existing = %existing, "domain conflict on register");
                    let _ = reply.send(Err(CoordinatorError::DomainConflict {
                        domain: req.domain.clone(),
                        existing_name: existing.clone(),
                    }));
                    return;
                }

                let worker_id = self.fresh_worker_id();
                let token = crate::activity::ActivityToken {
                    lease: req.lease.clone(),
                    domain: req.domain.clone(),
                    domain_token: req.domain_token.clone(),
                    name: req.name.clone(),
                    inherited_unsafe: req.options.unsafe_mode,
                };
                let cancel = CancellationToken::new();

                info!(domain = %req.domain, name = %req.name, %worker_id, "process adopted");

                self.registry.insert(ActivityEntry {
                    worker_id,
                    domain: req.domain,
                    domain_token: req.domain_token,
                    name: req.name,
                    quorum: req.quorum,
                    lease: req.lease,
                    options: req.options,
                    cancel: cancel.clone(),
                    pending_reason: None,
                    // registered processes observe forced termination via `cancel`, not a `run_activity` reply.
                    reason_tx: None,
                });

                let _ = reply.send(Ok(AdmissionOutcome::Registered { token, worker_id, cancel }));
            }
            AdmissionKind::Switch { worker_id } => match self.registry.get_mut(worker_id) {
                Some(entry) => {
                    debug!(%worker_id, "quorum switched");
                    entry.quorum = req.quorum;
                    let _ = reply.send(Ok(AdmissionOutcome::Switched));
                }
                None => {
                    let _ = reply.send(Err(CoordinatorError::UnknownActivity(worker_id)));
                }
            },
        }
    }

    /// Forces a live activity down for a named precondition-loss reason.
    /// Reports the reason immediately via `reason_tx` so `run_activity` can
    /// return without waiting for the worker to actually unwind.
    fn terminate(&mut self, worker_id: WorkerId, reason: TerminationReason) {
        if let Some(entry) = self.registry.get_mut(worker_id) {
            warn!(domain = %entry.domain, name = %entry.name, %reason, "activity terminated");
            entry.pending_reason = Some(reason.clone());
            entry.cancel.cancel();
            if let Some(tx) = entry.reason_tx.take() {
                let _ = tx.send(reason);
            }
        }
    }

    fn terminate_all(&mut self, reason: TerminationReason) {
        for worker_id in self.registry.worker_ids() {
            self.terminate(worker_id, reason.clone());
        }
    }

    fn terminate_matching(&mut self, reason: TerminationReason, mut predicate: impl FnMut(&ActivityEntry) -> bool) {
        let ids: Vec<WorkerId> =
            self.registry.iter().filter(|e| predicate(e)).map(|e| e.worker_id).collect();
        for worker_id in ids {
            self.terminate(worker_id, reason.clone());
        }
    }

    /// Re-evaluates every live activity's admission predicate; anything that
    /// no longer holds is terminated. Activities already mid-teardown
    /// (`pending_reason.is_some()`) are left alone.
    fn reevaluate_live_activities(&mut self, reason: impl Fn(&ActivityEntry) -> TerminationReason) {
        let snapshot = self.snapshot();
        let failing: Vec<WorkerId> = self
            .registry
            .iter()
            .filter(|e| e.pending_reason.is_none())
            .filter(|e| {
                !admission_predicate(&e.lease, &e.quorum, &snapshot, &self.remote_leases, &self.quorum_nodes)
            })
            .map(|e| e.worker_id)
            .collect();
        for worker_id in failing {
            let reason = self.registry.get(worker_id).map(&reason).unwrap_or(TerminationReason::LocalLeaseExpired);
            self.terminate(worker_id, reason);
        }
    }

    /// Re-scans the deferred-wait queue in registration order, dispatching
    /// every request whose predicate now holds.
    fn recheck_pending(&mut self, command_tx: &mpsc::Sender<Command>) {
        let mut i = 0;
        while i < self.pending.len() {
            if self.predicate_holds(&self.pending[i].lease, &self.pending[i].quorum) {
                let pending = self.pending.remove(i);
                pending.timer.abort();
                debug!(domain = %pending.domain, name = %pending.name, "deferred admission satisfied");
                let (resolved, reply) = pending.into_parts();
                self.dispatch(resolved, reply, command_tx);
            } else {
                i += 1;
            }
        }
    }

    fn handle_admit(&mut self, request: AdmissionRequest, reply: AdmissionReply, command_tx: &mpsc::Sender<Command>) {
        if matches!(request.kind, AdmissionKind::Start { .. } | AdmissionKind::Register) {
            if let Some(existing) = self.registry.domain_conflict(&request.domain, &request.domain_token) {
                error!(domain = %request.domain, existing = %existing, "domain conflict on admission");
                let _ = reply.send(Err(CoordinatorError::DomainConflict {
                    domain: request.domain,
                    existing_name: existing.clone(),
                }));
                return;
            }
        }

        if self.predicate_holds(&request.lease, &request.quorum) {
            self.dispatch(ResolvedRequest::from(request), reply, command_tx);
            return;
        }

        debug!(domain = %request.domain, name = %request.name, "admission deferred, awaiting quorum");

        let id = self.fresh_pending_id();
        let timeout = self.quorum_timeout_for(&request.options);
        let tx = command_tx.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let _ = tx.send(Command::AdmissionTimeout { id }).await;
        });

        self.pending.push(PendingAdmission {
            id,
            lease: request.lease,
            quorum: request.quorum,
            domain: request.domain,
            domain_token: request.domain_token,
            name: request.name,
            unsafe_mode: request.options.unsafe_mode,
            options: request.options,
            kind: request.kind,
            reply,
            timer,
        });
    }

    fn handle_admission_timeout(&mut self, id: u64, command_tx: &mpsc::Sender<Command>) {
        let Some(index) = self.pending.iter().position(|p| p.id == id) else {
            return;
        };
        let pending = self.pending.remove(index);

        if pending.unsafe_mode && self.unsafe_predicate_holds(&pending.lease, &pending.quorum) {
            debug!(domain = %pending.domain, name = %pending.name, "unsafe admission on quorum timeout");
            let (resolved, reply) = pending.into_parts();
            self.dispatch(resolved, reply, command_tx);
            return;
        }

        let observed_remote_leases: Vec<NodeId> = self.remote_leases.iter().cloned().collect();
        warn!(domain = %pending.domain, name = %pending.name, "no quorum, admission timed out");
        let _ = pending.reply.send(Err(CoordinatorError::NoQuorum {
            required_lease: pending.lease,
            required_quorum: pending.quorum,
            observed_local_lease: self.local_lease_holder.clone(),
            observed_remote_leases,
        }));
    }

    fn handle_register_collaborator(&mut self, role: CollaboratorRole, reply: oneshot::Sender<Result<WorkerId, CoordinatorError>>) {
        let worker_id = self.fresh_worker_id();
        let slot = match role {
            CollaboratorRole::Agent => &mut self.agent,
            CollaboratorRole::Acquirer => &mut self.acquirer,
        };
        let result = slot.register(worker_id, role).map(|()| worker_id);
        match &result {
            Ok(_) => info!(%role, %worker_id, "collaborator registered"),
            Err(err) => error!(%role, %worker_id, %err, "collaborator registration rejected"),
        }
        let _ = reply.send(result);
    }

    fn handle_collaborator_finished(&mut self, role: CollaboratorRole, worker_id: WorkerId, command_tx: &mpsc::Sender<Command>) {
        match role {
            CollaboratorRole::Agent => {
                if self.agent.clear_if(worker_id) {
                    warn!(%worker_id, "lease agent died, local lease implicitly gone");
                    self.local_lease_holder = None;
                    self.terminate_all(TerminationReason::LocalLeaseExpired);
                }
            }
            CollaboratorRole::Acquirer => {
                if self.acquirer.clear_if(worker_id) {
                    warn!(%worker_id, "lease acquirer died");
                    self.remote_leases.clear();
                    self.terminate_matching(
                        TerminationReason::LeaderProcessDied { role: CollaboratorRole::Acquirer },
                        |e| requires_leader(&e.quorum),
                    );
                }
            }
        }
        self.recheck_pending(command_tx);
    }

    fn handle_lease_event(
        &mut self,
        worker_id: WorkerId,
        role: CollaboratorRole,
        event: LeaseEvent,
        reply: oneshot::Sender<Result<(), CoordinatorError>>,
        command_tx: &mpsc::Sender<Command>,
    ) {
        let slot = match role {
            CollaboratorRole::Agent => &self.agent,
            CollaboratorRole::Acquirer => &self.acquirer,
        };
        if let Err(err) = slot.check(worker_id, role) {
            error!(%role, %worker_id, %err, "lease event from unregistered or wrong-identity caller");
            let _ = reply.send(Err(err));
            return;
        }

        match event {
            LeaseEvent::Acquired(node) => {
                debug!(%node, "remote lease acquired");
                self.remote_leases.insert(node);
                let _ = reply.send(Ok(()));
                self.recheck_pending(command_tx);
            }
            LeaseEvent::Lost(node) => {
                debug!(%node, "remote lease lost");
                self.remote_leases.remove(&node);
                let detail = format!("lease_lost({node})");
                self.reevaluate_live_activities(|_| TerminationReason::QuorumLost { detail: detail.clone() });
                let _ = reply.send(Ok(()));
                self.recheck_pending(command_tx);
            }
            LeaseEvent::LocalGranted(holder) => {
                if self.local_lease_holder.is_some() {
                    error!(node = %holder.node, "local lease granted while one is already held");
                    let _ = reply.send(Err(CoordinatorError::UnexpectedGrant));
                    return;
                }
                info!(node = %holder.node, "local lease granted");
                self.local_lease_holder = Some(holder);
                let _ = reply.send(Ok(()));
                self.recheck_pending(command_tx);
            }
            LeaseEvent::LocalExpired(holder) => {
                if self.local_lease_holder.as_ref() != Some(&holder) {
                    error!(node = %holder.node, "local lease expiry does not match the currently held lease");
                    let _ = reply.send(Err(CoordinatorError::StaleExpiry));
                    return;
                }
                warn!(node = %holder.node, "local lease expired");
                self.local_lease_holder = None;
                let _ = reply.send(Ok(()));
                self.terminate_all(TerminationReason::LocalLeaseExpired);
            }
        }
    }

    fn handle_activity_finished(&mut self, worker_id: WorkerId, outcome: ActivityOutcome) {
        let Some(entry) = self.registry.remove(worker_id) else {
            return;
        };
        match (&entry.pending_reason, &outcome) {
            (Some(reason), _) => {
                debug!(domain = %entry.domain, name = %entry.name, %reason, "activity teardown confirmed");
            }
            (None, ActivityOutcome::Normal) => {
                if !entry.options.quiet {
                    info!(domain = %entry.domain, name = %entry.name, "activity finished normally");
                }
            }
            (None, ActivityOutcome::Error(message)) => {
                warn!(domain = %entry.domain, name = %entry.name, error = %message, "activity exited with error");
            }
        }
    }

    fn handle_update_membership(&mut self, nodes: BTreeSet<NodeId>, command_tx: &mpsc::Sender<Command>) {
        let (updated, changed) = membership::apply(&self.quorum_nodes, nodes);
        self.quorum_nodes = updated;
        if changed {
            debug!(count = self.quorum_nodes.len(), "quorum membership changed");
            self.reevaluate_live_activities(|_| TerminationReason::QuorumLost {
                detail: "membership-changed".to_string(),
            });
            self.recheck_pending(command_tx);
        }
    }
}

/// A `PendingAdmission` or fresh `AdmissionRequest` stripped down to what
/// `dispatch` needs; lets `recheck_pending` and `handle_admit` share one
/// dispatch path without juggling two near-identical structs.
struct ResolvedRequest {
    lease: LeaseRef,
    quorum: QuorumExpr,
    domain: Domain,
    domain_token: DomainToken,
    name: NamePath,
    options: crate::activity::ActivityOptions,
    kind: AdmissionKind,
}

impl From<AdmissionRequest> for ResolvedRequest {
    fn from(r: AdmissionRequest) -> Self {
        Self {
            lease: r.lease,
            quorum: r.quorum,
            domain: r.domain,
            domain_token: r.domain_token,
            name: r.name,
            options: r.options,
            kind: r.kind,
        }
    }
}

impl PendingAdmission {
    /// Splits a pending entry into its dispatch-ready request and its reply
    /// channel in one move, so callers never have to partially move `reply`
    /// out before handing the rest of the struct to `dispatch`.
    fn into_parts(self) -> (ResolvedRequest, AdmissionReply) {
        (
            ResolvedRequest {
                lease: self.lease,
                quorum: self.quorum,
                domain: self.domain,
                domain_token: self.domain_token,
                name: self.name,
                options: self.options,
                kind: self.kind,
            },
            self.reply,
        )
    }
}

/// Renders a panicking activity body's payload as a log-friendly string.
fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "activity body panicked".to_string()),
        Err(err) => err.to_string(),
    }
}

/// Spawns the coordinator actor and returns the command channel used to
/// drive it. `handle.rs` wraps this sender in the public `CoordinatorHandle`.
pub(crate) fn spawn(self_node: NodeId, config: Arc<RwLock<CoordinatorConfig>>) -> mpsc::Sender<Command> {
    let (tx, rx) = mpsc::channel(256);
    let tx_for_loop = tx.clone();
    tokio::spawn(async move {
        run(self_node, config, rx, tx_for_loop).await;
    });
    tx
}

async fn run(
    self_node: NodeId,
    config: Arc<RwLock<CoordinatorConfig>>,
    mut rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
) {
    let mut state = CoordinatorState {
        self_node,
        config,
        agent: CollaboratorSlot::default(),
        acquirer: CollaboratorSlot::default(),
        local_lease_holder: None,
        remote_leases: BTreeSet::new(),
        quorum_nodes: BTreeSet::new(),
        registry: ActivityRegistry::default(),
        pending: Vec::new(),
        next_worker_id: 0,
        next_pending_id: 0,
    };

    while let Some(command) = rx.recv().await {
        match command {
            Command::Admit { request, reply } => state.handle_admit(request, reply, &command_tx),
            Command::AdmissionTimeout { id } => state.handle_admission_timeout(id, &command_tx),
            Command::RegisterCollaborator { role, reply } => state.handle_register_collaborator(role, reply),
            Command::CollaboratorFinished { role, worker_id } => {
                state.handle_collaborator_finished(role, worker_id, &command_tx)
            }
            Command::LeaseEvent { worker_id, role, event, reply } => {
                state.handle_lease_event(worker_id, role, event, reply, &command_tx)
            }
            Command::ActivityFinished { worker_id, outcome } => state.handle_activity_finished(worker_id, outcome),
            Command::UpdateMembership { nodes } => state.handle_update_membership(nodes, &command_tx),
        }
    }
}
