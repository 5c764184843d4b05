// In-memory activity registry: the coordinator's single source of truth for
// which activities are live. Owned exclusively by the actor task (see
// `actor.rs`) and mutated through plain `&mut self` methods.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::activity::{ActivityOptions, Domain, DomainToken, NamePath, WorkerId};
use crate::error::TerminationReason;
use crate::lease::LeaseRef;
use crate::quorum::QuorumExpr;

/// A live activity, as recorded by the coordinator.
pub struct ActivityEntry {
    pub worker_id: WorkerId,
    pub domain: Domain,
    pub domain_token: DomainToken,
    pub name: NamePath,
    pub quorum: QuorumExpr,
    pub lease: LeaseRef,
    pub options: ActivityOptions,
    pub cancel: CancellationToken,
    /// Set by the actor when it decides to forcibly terminate this activity,
    /// so the completion handler logs and reports
    /// the real reason instead of treating the exit as normal.
    pub pending_reason: Option<TerminationReason>,
    /// Notified with the termination reason the moment the coordinator
    /// forces a shutdown, so `run_activity` can return promptly without
    /// waiting for the worker to actually finish unwinding.
    pub reason_tx: Option<oneshot::Sender<TerminationReason>>,
}

/// In-memory set of live activities.
#[derive(Default)]
pub struct ActivityRegistry {
    activities: HashMap<WorkerId, ActivityEntry>,
}

impl ActivityRegistry {
    pub fn insert(&mut self, entry: ActivityEntry) {
        self.activities.insert(entry.worker_id, entry);
    }

    pub fn remove(&mut self, worker_id: WorkerId) -> Option<ActivityEntry> {
        self.activities.remove(&worker_id)
    }

    pub fn get(&self, worker_id: WorkerId) -> Option<&ActivityEntry> {
        self.activities.get(&worker_id)
    }

    pub fn get_mut(&mut self, worker_id: WorkerId) -> Option<&mut ActivityEntry> {
        self.activities.get_mut(&worker_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ActivityEntry> {
        self.activities.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ActivityEntry> {
        self.activities.values_mut()
    }

    pub fn len(&self) -> usize {
        self.activities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.activities.is_empty()
    }

    /// Invariant 4: within a single domain all live activities share one
    /// domain-token. Returns the conflicting activity's name, if any.
    pub fn domain_conflict(&self, domain: &Domain, domain_token: &DomainToken) -> Option<&NamePath> {
        self.activities
            .values()
            .find(|a| &a.domain == domain && &a.domain_token != domain_token)
            .map(|a| &a.name)
    }

    pub fn worker_ids(&self) -> Vec<WorkerId> {
        self.activities.keys().copied().collect()
    }
}
