//! Action Domain Types for Masthead
//!
//! Editorial workflows in Masthead are graphs of typed actions with
//! dependencies, fan-out/fan-in, cycles, and role-scoped visibility.
//!
//! # Key Concepts
//!
//! - **ActionTemplate**: An immutable blueprint node within a workflow
//!   specification tree. Authored once, never mutated.
//! - **ActionInstance**: A concrete, persisted unit of work pointing
//!   back at its template via `instance_of`.
//! - **ScopeDocument**: The enclosing unit of work (a project) owning
//!   its instances; the unit of mutation and locking.
//! - **SymbolicReference**: A templated locator used before an instance
//!   concretely exists.
//! - **TriggerPredicate**: A condition (`activate_on`/`complete_on`)
//!   causing an automatic status transition of a related instance.
//!
//! # Design Principles
//!
//! 1. Template/instance duality: two distinct types connected by an
//!    explicit foreign key, never shared inheritance.
//! 2. Re-entry is a new instance at `cycle + 1`, never in-place
//!    mutation of prior-cycle history.
//! 3. Audience bindings travel as explicit `ScopeContext` snapshots,
//!    never ambient state.
//! 4. Terminal instances are retained forever for audit.

#![deny(unsafe_code)]

mod errors;
mod ids;
mod instance;
mod reference;
mod scope;
mod template;
mod validate;

pub use errors::*;
pub use ids::*;
pub use instance::*;
pub use reference::*;
pub use scope::*;
pub use template::*;
pub use validate::validate;
