// Collaborator interface: the single-slot registrations for the
// in-process lease-agent and lease-acquirer.

use crate::activity::WorkerId;
use crate::error::{CollaboratorRole, CoordinatorError};

/// A single-registration slot for one collaborator role.
#[derive(Default)]
pub struct CollaboratorSlot {
    registered: Option<WorkerId>,
}

impl CollaboratorSlot {
    /// Register succeeds only when the slot is empty.
    pub fn register(&mut self, worker_id: WorkerId, role: CollaboratorRole) -> Result<(), CoordinatorError> {
        if self.registered.is_some() {
            return Err(CoordinatorError::AlreadyRegistered(role));
        }
        self.registered = Some(worker_id);
        Ok(())
    }

    /// Only the currently-registered worker of this role may push events.
    pub fn check(&self, worker_id: WorkerId, role: CollaboratorRole) -> Result<(), CoordinatorError> {
        if self.registered != Some(worker_id) {
            return Err(CoordinatorError::WrongPid {
                role,
                supplied: worker_id,
                expected: self.registered,
            });
        }
        Ok(())
    }

    /// Clears the slot when the registered collaborator dies. Returns
    /// `true` if it was this worker that was actually registered (a
    /// `ActivityFinished` notice can race a fresh registration).
    pub fn clear_if(&mut self, worker_id: WorkerId) -> bool {
        if self.registered == Some(worker_id) {
            self.registered = None;
            true
        } else {
            false
        }
    }

    pub fn is_registered(&self) -> bool {
        self.registered.is_some()
    }

    pub fn current(&self) -> Option<WorkerId> {
        self.registered
    }
}
