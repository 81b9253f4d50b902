//! Masthead action engine
//!
//! The engine turns a static template tree into live, uniquely
//! identified action instances as a scope progresses, resolves symbolic
//! references to concrete instances, and cascades status changes across
//! dependent actions under optimistic concurrency.
//!
//! # Components
//!
//! - [`Resolver`]: rewrites symbolic, templated references into
//!   concrete instance lookups.
//! - [`TemplateExpander`]: walks the template tree and deterministically
//!   instantiates action instances with hierarchical identifiers.
//! - [`AudienceCalculator`]: derives the role set allowed to see and
//!   act on each instance ("snapshot unless inherited").
//! - [`StateMachine`]: validates status transitions.
//! - [`TriggerEngine`]: detects satisfied `activate_on`/`complete_on`
//!   predicates and cascades effects through a bounded worklist.
//! - [`Coordinator`]: serializes mutation per scope, commits the direct
//!   mutation before cascade side effects, and exposes the public
//!   `submit`/`resolve`/`get_scope` surface.
//!
//! A cascade failure never rolls back the triggering action's committed
//! transition; it is reported as a distinct `TriggeredAction` error
//! naming the instance that failed.

#![deny(unsafe_code)]

mod audience;
mod coordinator;
mod expander;
mod resolver;
mod state_machine;
mod trigger;

pub use audience::AudienceCalculator;
pub use coordinator::{ActionPatch, Coordinator, CoordinatorConfig, SubmitOutcome};
pub use expander::TemplateExpander;
pub use resolver::{ResolvedNode, Resolver};
pub use state_machine::StateMachine;
pub use trigger::{CascadeEffect, TriggerEngine};

use action_store::StoreError;
use action_types::ActionError;

/// Map collaborator failures into the caller-facing taxonomy.
pub(crate) fn from_store(err: StoreError) -> ActionError {
    match err {
        StoreError::RevisionConflict { scope, .. } => {
            ActionError::Conflict(format!("concurrent write on scope {scope}"))
        }
        StoreError::LockTimeout { key, waited_ms } => ActionError::Locked {
            key,
            retry_after_ms: waited_ms,
        },
        StoreError::PaymentDeclined(msg) | StoreError::DispatchFailed(msg) => {
            ActionError::ExternalCollaborator(msg)
        }
        StoreError::NotFound(msg) => ActionError::Storage(format!("not found: {msg}")),
        StoreError::Serialization(msg) | StoreError::Backend(msg) => ActionError::Storage(msg),
    }
}
