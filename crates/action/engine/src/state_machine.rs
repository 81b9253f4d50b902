//! Status state machine: the only legal mutation path for instances
//!
//! Every status change, whether requested by an actor or fired by a
//! trigger cascade, goes through [`StateMachine::apply`], which checks
//! the transition table, checks completion preconditions, and appends
//! to the scope's audit trail. Terminal statuses admit nothing.

use action_types::{
    ActionError, ActionResult, ActionStatus, InstanceId, RoleRef, ScopeDocument,
    TransitionRecord,
};
use chrono::Utc;
use tracing::debug;

/// Validates and applies status transitions
#[derive(Clone, Copy, Debug, Default)]
pub struct StateMachine;

impl StateMachine {
    pub fn new() -> Self {
        Self
    }

    /// The statuses reachable in one step from `from`
    pub fn allowed_from(&self, from: ActionStatus) -> &'static [ActionStatus] {
        use ActionStatus::*;
        match from {
            Potential => &[Active, Canceled],
            Active => &[Staged, Endorsed, Completed, Canceled, Failed],
            Staged => &[Endorsed, Completed, Canceled],
            Endorsed => &[Completed, Canceled],
            Completed | Canceled | Failed => &[],
        }
    }

    pub fn can_transition(&self, from: ActionStatus, to: ActionStatus) -> bool {
        self.allowed_from(from).contains(&to)
    }

    /// Apply a validated transition and record it in the audit trail.
    /// Returns the prior status.
    pub fn apply(
        &self,
        doc: &mut ScopeDocument,
        instance_id: &InstanceId,
        to: ActionStatus,
        actor: Option<RoleRef>,
        triggered_by: Option<InstanceId>,
    ) -> ActionResult<ActionStatus> {
        let instance = doc
            .instance(instance_id)
            .ok_or_else(|| ActionError::InstanceNotFound(instance_id.clone()))?;
        let from = instance.status;

        if !self.can_transition(from, to) {
            return Err(ActionError::Validation(format!(
                "action {} cannot move from {from} to {to}",
                instance.display_identifier()
            )));
        }
        if to == ActionStatus::Completed && !instance.completion_preconditions_met() {
            return Err(ActionError::Validation(format!(
                "action {} has unanswered questions or unresolved reviews",
                instance.display_identifier()
            )));
        }

        let now = Utc::now();
        let instance = doc
            .instance_mut(instance_id)
            .ok_or_else(|| ActionError::InstanceNotFound(instance_id.clone()))?;
        instance.status = to;
        instance.updated_at = now;
        debug!(instance = %instance_id, %from, %to, "applied transition");

        doc.record_transition(TransitionRecord {
            instance: instance_id.clone(),
            from,
            to,
            actor,
            triggered_by,
            at: now,
        });
        doc.refresh_status();
        Ok(from)
    }
}
