// Public entry point. `CoordinatorHandle` is a cheap, `Clone`-able wrapper
// around the actor's command channel, generalized to per-request deferred
// replies (see `actor.rs`). Nested-activity context is an explicit
// `ActivityToken` parameter throughout, never thread-local state.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, RwLock};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::activity::{
    ActivityOptions, ActivityOutcome, ActivityToken, Domain, DomainToken, NamePath, WorkerId,
};
use crate::actor;
use crate::bypass::{self, AlwaysCurrent, ClusterCompatSource};
use crate::command::{
    AdmissionKind, AdmissionOutcome, AdmissionRequest, BoxActivityFuture, Command, LeaseEvent,
};
use crate::config::CoordinatorConfig;
use crate::error::{ActivityFailure, CollaboratorRole, CoordinatorError, RunActivityError};
use crate::lease::{LeaseHolder, LeaseRef, NodeId};
use crate::quorum::QuorumExpr;

/// Handle to a running coordinator actor. Cloning shares the same actor.
#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::Sender<Command>,
    config: Arc<RwLock<CoordinatorConfig>>,
    compat: Arc<dyn ClusterCompatSource>,
}

impl CoordinatorHandle {
    /// Spawns the actor with the default compat source (bypass never engages
    /// purely on compat version; only `bypass_forced` can trigger it).
    pub fn spawn(self_node: impl Into<NodeId>, config: CoordinatorConfig) -> Self {
        Self::spawn_with_compat(self_node, config, Arc::new(AlwaysCurrent))
    }

    /// Spawns the actor with a caller-supplied compat source, so rolling
    /// upgrade tests can flip bypass eligibility without touching config.
    pub fn spawn_with_compat(
        self_node: impl Into<NodeId>,
        config: CoordinatorConfig,
        compat: Arc<dyn ClusterCompatSource>,
    ) -> Self {
        let config = Arc::new(RwLock::new(config));
        let tx = actor::spawn(self_node.into(), config.clone());
        Self { tx, config, compat }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config.read().unwrap().clone()
    }

    /// Applies an in-place update to the live config ("the
    /// coordinator re-reads its stored config on every bypass-eligibility
    /// check so a config update takes effect without restart").
    pub fn update_config(&self, f: impl FnOnce(&mut CoordinatorConfig)) {
        f(&mut self.config.write().unwrap());
    }

    fn bypassed(&self) -> bool {
        bypass::is_bypassed(&self.config.read().unwrap(), self.compat.compat_version())
    }

    /// The outer bound on the caller's total wait for an admission reply:
    /// `options.timeout` if set, else `quorum_timeout + 5s` from config. This
    /// is a safety net against an unresponsive actor — the coordinator's own
    /// per-request timer (`quorum_timeout`) is expected to fire first and
    /// resolve the request with `no_quorum` or an unsafe admission.
    fn caller_timeout(&self, options: &ActivityOptions) -> std::time::Duration {
        if let Some(timeout) = options.timeout {
            return timeout;
        }
        let quorum_timeout = options
            .quorum_timeout
            .unwrap_or_else(|| self.config.read().unwrap().default_quorum_timeout(options.unsafe_mode));
        self.config.read().unwrap().default_caller_timeout(quorum_timeout)
    }

    /// Awaits an admission reply, bounded by `caller_timeout`.
    async fn await_admission(
        &self,
        reply_rx: oneshot::Receiver<Result<AdmissionOutcome, CoordinatorError>>,
        options: &ActivityOptions,
    ) -> Result<AdmissionOutcome, CoordinatorError> {
        let bound = self.caller_timeout(options);
        match tokio::time::timeout(bound, reply_rx).await {
            Ok(received) => received.map_err(|_| CoordinatorError::ActorGone)?,
            Err(_) => Err(CoordinatorError::CallerTimeout(bound)),
        }
    }

    // ---- collaborator registration ----

    pub async fn register_agent(&self) -> Result<AgentHandle, CoordinatorError> {
        let worker_id = self.register_collaborator(CollaboratorRole::Agent).await?;
        Ok(AgentHandle { tx: self.tx.clone(), worker_id, reported_dead: false })
    }

    pub async fn register_acquirer(&self) -> Result<AcquirerHandle, CoordinatorError> {
        let worker_id = self.register_collaborator(CollaboratorRole::Acquirer).await?;
        Ok(AcquirerHandle { tx: self.tx.clone(), worker_id, reported_dead: false })
    }

    async fn register_collaborator(&self, role: CollaboratorRole) -> Result<WorkerId, CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::RegisterCollaborator { role, reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }

    /// Membership tracker entry point.
    pub async fn update_membership(&self, nodes: BTreeSet<NodeId>) -> Result<(), CoordinatorError> {
        self.send(Command::UpdateMembership { nodes }).await
    }

    async fn send(&self, command: Command) -> Result<(), CoordinatorError> {
        self.tx.send(command).await.map_err(|_| CoordinatorError::ActorGone)
    }

    // ---- activity supervisor ----

    /// Asynchronous start: returns the worker identity immediately, the
    /// caller observes termination via the returned handle.
    pub async fn start_activity<F, Fut>(
        &self,
        ctx: Option<&ActivityToken>,
        domain: impl Into<Domain>,
        domain_token: Option<DomainToken>,
        name: impl Into<String>,
        quorum: QuorumExpr,
        options: ActivityOptions,
        body: F,
    ) -> Result<StartedActivity, CoordinatorError>
    where
        F: FnOnce(ActivityToken, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: crate::command::ActivityBody =
            Box::new(move |token, cancel| Box::pin(body(token, cancel)) as BoxActivityFuture);
        self.start_activity_boxed(ctx, domain.into(), domain_token, name, quorum, options, boxed).await
    }

    async fn start_activity_boxed(
        &self,
        ctx: Option<&ActivityToken>,
        domain: Domain,
        domain_token: Option<DomainToken>,
        name: impl Into<String>,
        quorum: QuorumExpr,
        options: ActivityOptions,
        body: crate::command::ActivityBody,
    ) -> Result<StartedActivity, CoordinatorError> {
        if self.bypassed() {
            let token = resolve_bypass_token(ctx, &domain, name, options.unsafe_mode)?;
            let domain = token.domain.clone();
            let name = token.name.clone();
            let cancel = CancellationToken::new();
            let join = tokio::spawn(body(token, cancel));
            return Ok(StartedActivity::Bypassed { domain, name, join });
        }

        let (lease, domain_token, full_name, merged_options) =
            self.resolve_request(ctx, &domain, domain_token, name, &options)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdmissionRequest {
            lease,
            quorum,
            domain: domain.clone(),
            domain_token,
            name: full_name.clone(),
            options: merged_options.clone(),
            kind: AdmissionKind::Start { body },
        };
        self.send(Command::Admit { request, reply: reply_tx }).await?;
        match self.await_admission(reply_rx, &merged_options).await? {
            AdmissionOutcome::Started { worker_id, reason_rx } => {
                Ok(StartedActivity::Supervised { worker_id, domain, name: full_name, reason_rx })
            }
            _ => unreachable!("Start admission always resolves to AdmissionOutcome::Started"),
        }
    }

    /// Synchronous start-and-wait: runs `body` to completion and returns its
    /// value, or a structured error if admission failed or the activity was
    /// torn down for a named precondition-loss reason.
    pub async fn run_activity<F, Fut, T>(
        &self,
        ctx: Option<&ActivityToken>,
        domain: impl Into<Domain>,
        name: impl Into<String>,
        quorum: QuorumExpr,
        options: ActivityOptions,
        body: F,
    ) -> Result<T, RunActivityError>
    where
        F: FnOnce(ActivityToken, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let domain = domain.into();
        let name = name.into();
        let (result_tx, result_rx) = oneshot::channel::<T>();
        let boxed: crate::command::ActivityBody = Box::new(move |token, cancel| {
            Box::pin(async move {
                let value = body(token, cancel).await;
                let _ = result_tx.send(value);
            }) as BoxActivityFuture
        });

        let started =
            self.start_activity_boxed(ctx, domain, None, name, quorum, options, boxed).await?;

        match started {
            StartedActivity::Bypassed { join, .. } => match result_rx.await {
                Ok(value) => {
                    let _ = join.await;
                    Ok(value)
                }
                Err(_) => Err(body_aborted()),
            },
            StartedActivity::Supervised { domain, name, reason_rx, .. } => {
                tokio::select! {
                    res = result_rx => res.map_err(|_| body_aborted()),
                    reason = reason_rx => {
                        let reason = reason.map_err(|_| body_aborted())?;
                        Err(RunActivityError::Failed(ActivityFailure { domain, name, reason }))
                    }
                }
            }
        }
    }

    /// Adopts the calling worker as an activity; no spawn happens, the
    /// caller continues inline and must report its own completion through
    /// the returned `RegisteredActivity` (or let it drop, which reports
    /// `Normal` — see `ActivityGuard`).
    pub async fn register_process(
        &self,
        ctx: Option<&ActivityToken>,
        domain: impl Into<Domain>,
        domain_token: Option<DomainToken>,
        name: impl Into<String>,
        quorum: QuorumExpr,
        options: ActivityOptions,
    ) -> Result<RegisteredActivity, CoordinatorError> {
        let domain = domain.into();
        if self.bypassed() {
            let token = resolve_bypass_token(ctx, &domain, name, options.unsafe_mode)?;
            return Ok(RegisteredActivity { token, guard: None });
        }

        let (lease, domain_token, full_name, merged_options) =
            self.resolve_request(ctx, &domain, domain_token, name, &options)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdmissionRequest {
            lease,
            quorum,
            domain,
            domain_token,
            name: full_name,
            options: merged_options.clone(),
            kind: AdmissionKind::Register,
        };
        self.send(Command::Admit { request, reply: reply_tx }).await?;
        match self.await_admission(reply_rx, &merged_options).await? {
            AdmissionOutcome::Registered { token, worker_id, cancel } => Ok(RegisteredActivity {
                token,
                guard: Some(ActivityGuard { worker_id, cancel, tx: self.tx.clone(), reported: false }),
            }),
            _ => unreachable!("Register admission always resolves to AdmissionOutcome::Registered"),
        }
    }

    /// Changes the current activity's quorum; itself an admission wait
    /// against the *new* quorum.
    pub async fn switch_quorum(
        &self,
        worker_id: WorkerId,
        ctx: &ActivityToken,
        new_quorum: QuorumExpr,
        options: ActivityOptions,
    ) -> Result<(), CoordinatorError> {
        if self.bypassed() {
            return Ok(());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let request = AdmissionRequest {
            lease: ctx.lease.clone(),
            quorum: new_quorum,
            domain: ctx.domain.clone(),
            domain_token: ctx.domain_token.clone(),
            name: ctx.name.clone(),
            options: options.clone(),
            kind: AdmissionKind::Switch { worker_id },
        };
        self.send(Command::Admit { request, reply: reply_tx }).await?;
        match self.await_admission(reply_rx, &options).await? {
            AdmissionOutcome::Switched => Ok(()),
            _ => unreachable!("Switch admission always resolves to AdmissionOutcome::Switched"),
        }
    }

    /// Resolves a request's lease/domain-token/name/options against the
    /// caller's activity-token, if any. A present `ctx` pins the
    /// domain-token and lease to the parent's (ignoring any caller-supplied
    /// `domain_token`, since a nested call always joins the same tree) and
    /// fences the lease to the exact one the parent was admitted under.
    fn resolve_request(
        &self,
        ctx: Option<&ActivityToken>,
        domain: &Domain,
        domain_token: Option<DomainToken>,
        name: impl Into<String>,
        options: &ActivityOptions,
    ) -> Result<(LeaseRef, DomainToken, NamePath, ActivityOptions), CoordinatorError> {
        match ctx {
            Some(token) => {
                if token.domain != *domain {
                    return Err(CoordinatorError::DomainMismatch {
                        parent: token.domain.clone(),
                        child: domain.clone(),
                    });
                }
                Ok((
                    token.lease.clone(),
                    token.domain_token.clone(),
                    token.child_name(name),
                    token.merge_options(options.clone()),
                ))
            }
            None => Ok((
                LeaseRef::Leader,
                domain_token.unwrap_or_else(DomainToken::fresh),
                NamePath::new(name),
                options.clone(),
            )),
        }
    }
}

fn body_aborted() -> RunActivityError {
    RunActivityError::BodyAborted("activity body ended without producing a result".to_string())
}

/// Bypass mode builds a token directly, without ever touching actor state
/// (`register_process`/`switch_quorum` are no-ops, `start_activity`
/// just runs the body).
fn resolve_bypass_token(
    ctx: Option<&ActivityToken>,
    domain: &Domain,
    name: impl Into<String>,
    unsafe_mode: bool,
) -> Result<ActivityToken, CoordinatorError> {
    match ctx {
        Some(token) => {
            if token.domain != *domain {
                return Err(CoordinatorError::DomainMismatch {
                    parent: token.domain.clone(),
                    child: domain.clone(),
                });
            }
            Ok(ActivityToken {
                lease: token.lease.clone(),
                domain: domain.clone(),
                domain_token: token.domain_token.clone(),
                name: token.child_name(name),
                inherited_unsafe: token.inherited_unsafe || unsafe_mode,
            })
        }
        None => Ok(ActivityToken::fresh(domain.clone(), NamePath::new(name), unsafe_mode)),
    }
}

/// Outcome of `start_activity`: either the admission protocol handed the
/// request to the supervisor, or bypass mode ran it outside the coordinator
/// entirely.
pub enum StartedActivity {
    Supervised {
        worker_id: WorkerId,
        domain: Domain,
        name: NamePath,
        reason_rx: oneshot::Receiver<crate::error::TerminationReason>,
    },
    Bypassed { domain: Domain, name: NamePath, join: JoinHandle<()> },
}

impl StartedActivity {
    pub fn worker_id(&self) -> Option<WorkerId> {
        match self {
            Self::Supervised { worker_id, .. } => Some(*worker_id),
            Self::Bypassed { .. } => None,
        }
    }
}

/// The adopted activity-token plus (outside bypass mode) the guard the
/// caller uses to report its own completion.
pub struct RegisteredActivity {
    pub token: ActivityToken,
    guard: Option<ActivityGuard>,
}

impl RegisteredActivity {
    /// Cancelled by the coordinator when this activity is forcibly torn
    /// down; a default (never-cancelled) token in bypass mode.
    pub fn cancel_token(&self) -> CancellationToken {
        self.guard.as_ref().map(|g| g.cancel.clone()).unwrap_or_default()
    }

    pub fn finish(self, outcome: ActivityOutcome) {
        if let Some(guard) = self.guard {
            guard.finish(outcome);
        }
    }
}

/// Reports this activity's completion to the coordinator exactly once. If
/// the caller drops the guard without reporting, the drop-time fallback
/// assumes normal completion (see `ActivityOutcome`).
struct ActivityGuard {
    worker_id: WorkerId,
    cancel: CancellationToken,
    tx: mpsc::Sender<Command>,
    reported: bool,
}

impl ActivityGuard {
    fn finish(mut self, outcome: ActivityOutcome) {
        self.report(outcome);
    }

    fn report(&mut self, outcome: ActivityOutcome) {
        if !self.reported {
            self.reported = true;
            let _ = self.tx.try_send(Command::ActivityFinished { worker_id: self.worker_id, outcome });
        }
    }
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.report(ActivityOutcome::Normal);
    }
}

/// Collaborator handle for the registered lease-agent. Dropping
/// it without calling `die()` is treated as the monitor firing.
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    worker_id: WorkerId,
    reported_dead: bool,
}

impl AgentHandle {
    pub async fn local_lease_granted(&self, holder: LeaseHolder) -> Result<(), CoordinatorError> {
        self.lease_event(LeaseEvent::LocalGranted(holder)).await
    }

    pub async fn local_lease_expired(&self, holder: LeaseHolder) -> Result<(), CoordinatorError> {
        self.lease_event(LeaseEvent::LocalExpired(holder)).await
    }

    async fn lease_event(&self, event: LeaseEvent) -> Result<(), CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::LeaseEvent {
                worker_id: self.worker_id,
                role: CollaboratorRole::Agent,
                event,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        reply_rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }

    /// Explicitly notifies the coordinator that this agent has died.
    pub async fn die(mut self) {
        self.mark_dead();
        let _ = self
            .tx
            .send(Command::CollaboratorFinished { role: CollaboratorRole::Agent, worker_id: self.worker_id })
            .await;
    }

    fn mark_dead(&mut self) {
        self.reported_dead = true;
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        if !self.reported_dead {
            let _ = self
                .tx
                .try_send(Command::CollaboratorFinished { role: CollaboratorRole::Agent, worker_id: self.worker_id });
        }
    }
}

/// Collaborator handle for the registered lease-acquirer.
pub struct AcquirerHandle {
    tx: mpsc::Sender<Command>,
    worker_id: WorkerId,
    reported_dead: bool,
}

impl AcquirerHandle {
    pub async fn lease_acquired(&self, node: NodeId) -> Result<(), CoordinatorError> {
        self.lease_event(LeaseEvent::Acquired(node)).await
    }

    pub async fn lease_lost(&self, node: NodeId) -> Result<(), CoordinatorError> {
        self.lease_event(LeaseEvent::Lost(node)).await
    }

    async fn lease_event(&self, event: LeaseEvent) -> Result<(), CoordinatorError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(Command::LeaseEvent {
                worker_id: self.worker_id,
                role: CollaboratorRole::Acquirer,
                event,
                reply: reply_tx,
            })
            .await
            .map_err(|_| CoordinatorError::ActorGone)?;
        reply_rx.await.map_err(|_| CoordinatorError::ActorGone)?
    }

    pub async fn die(mut self) {
        self.mark_dead();
        let _ = self
            .tx
            .send(Command::CollaboratorFinished { role: CollaboratorRole::Acquirer, worker_id: self.worker_id })
            .await;
    }

    fn mark_dead(&mut self) {
        self.reported_dead = true;
    }
}

impl Drop for AcquirerHandle {
    fn drop(&mut self) {
        if !self.reported_dead {
            let _ = self.tx.try_send(Command::CollaboratorFinished {
                role: CollaboratorRole::Acquirer,
                worker_id: self.worker_id,
            });
        }
    }
}
