//! Masthead collaborator abstractions.
//!
//! The action engine consumes external services through narrow traits:
//! - versioned scope-document storage with optimistic concurrency
//! - a mutual-exclusion lock service
//! - fire-and-forget notification/worker dispatch
//! - a payment gateway for release fees
//!
//! Design stance:
//! - The engine never sees a backend, only these contracts.
//! - The in-memory adapters are the deterministic reference
//!   implementations used by tests.

#![deny(unsafe_code)]

mod error;
pub mod memory;
mod traits;

pub use error::{StoreError, StoreResult};
pub use traits::{
    ChargeSpec, Dispatcher, DocumentStore, JobId, JobSpec, LockHandle, LockManager,
    PaymentGateway, PaymentReceipt, Revision,
};
