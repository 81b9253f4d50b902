//! Error taxonomy for the action layer

use crate::{InstanceId, ScopeId, TemplateId};

/// Errors surfaced by action operations
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    /// Malformed transition, reference, or template; request rejected
    /// synchronously with no state change.
    #[error("validation error: {0}")]
    Validation(String),

    /// Concurrent write lost after bounded internal retries
    #[error("conflict: {0}")]
    Conflict(String),

    /// A lock was held past its bounded wait
    #[error("locked: {key} (retry after {retry_after_ms}ms)")]
    Locked { key: String, retry_after_ms: u64 },

    #[error("scope not found: {0}")]
    ScopeNotFound(ScopeId),

    #[error("instance not found: {0}")]
    InstanceNotFound(InstanceId),

    #[error("template not found: {0}")]
    TemplateNotFound(TemplateId),

    /// A symbolic reference matched no persisted instance yet; callers
    /// retry after the expander has run.
    #[error("reference not resolved: {0}")]
    ReferenceNotFound(String),

    /// A symbolic reference matched more than one instance
    #[error("ambiguous reference: {0}")]
    AmbiguousReference(String),

    /// A cascaded trigger failed after the triggering mutation had
    /// already committed. The direct mutation stands; callers can
    /// inspect which instance failed and retry just that one.
    #[error("triggered action {instance} failed: {source}")]
    TriggeredAction {
        instance: InstanceId,
        #[source]
        source: Box<ActionError>,
    },

    /// A payment or notification collaborator failed; never swallowed,
    /// never rolls back an already-committed triggering transition.
    #[error("external collaborator error: {0}")]
    ExternalCollaborator(String),

    /// Storage backend failure outside the conflict/lock taxonomy
    #[error("storage error: {0}")]
    Storage(String),
}

/// Result type alias for action operations
pub type ActionResult<T> = Result<T, ActionError>;
