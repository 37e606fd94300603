use crate::protocols::Objective;

/// Decides whether objectives proposed by peers are approved.
pub trait PolicyMaker: Send {
    fn should_approve(&self, objective: &Objective) -> bool;
}

/// Approves everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct PermissivePolicy;

impl PolicyMaker for PermissivePolicy {
    fn should_approve(&self, _: &Objective) -> bool {
        true
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RejectAllPolicy;

impl PolicyMaker for RejectAllPolicy {
    fn should_approve(&self, objective: &Objective) -> bool {
        tracing::debug!(objective = %objective.id(), "policy rejects");
        false
    }
}
