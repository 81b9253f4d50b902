//! Collaborator contracts consumed by the action engine
//!
//! The engine is written against these traits only. Production
//! deployments bind them to real services; the in-memory adapters in
//! [`crate::memory`] are the deterministic reference implementations.

use crate::StoreResult;
use action_types::{InstanceId, LockKey, ScopeDocument, ScopeId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::time::Duration;

/// Opaque optimistic-concurrency token for a stored scope document.
///
/// Tokens are monotonically increasing per document; a `put` with a
/// stale token fails with a revision conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Revision(pub u64);

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Versioned document storage for scope documents.
///
/// No schema is assumed beyond "JSON-like tree keyed by id"; the store
/// round-trips whole documents under optimistic concurrency.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new scope document; fails if the id already exists.
    async fn create(&self, doc: ScopeDocument) -> StoreResult<Revision>;

    /// Read a document together with its current revision token.
    async fn get(&self, id: &ScopeId) -> StoreResult<(ScopeDocument, Revision)>;

    /// Write a document back. Succeeds only when `expected` matches the
    /// stored revision; returns the new token.
    async fn put(&self, doc: ScopeDocument, expected: Revision) -> StoreResult<Revision>;

    /// Remove a document.
    async fn delete(&self, id: &ScopeId) -> StoreResult<()>;
}

/// A held lock. Dropping the handle releases the lock; `LockManager::release`
/// exists for call sites that want the release to read explicitly.
pub struct LockHandle {
    key: LockKey,
    _guard: Box<dyn Any + Send>,
}

impl LockHandle {
    /// Wrap a backend-specific guard object.
    pub fn new(key: LockKey, guard: Box<dyn Any + Send>) -> Self {
        Self { key, _guard: guard }
    }

    pub fn key(&self) -> &LockKey {
        &self.key
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle").field("key", &self.key).finish()
    }
}

/// Mutual-exclusion primitive serializing scope mutation and guarding
/// named resources (e.g. release slugs).
#[async_trait]
pub trait LockManager: Send + Sync {
    /// Acquire a lock, waiting cooperatively up to `wait_timeout`.
    /// `ttl` bounds how long a holder may keep the lock before a
    /// distributed backend may reclaim it; advisory for local backends.
    async fn acquire(
        &self,
        key: &LockKey,
        ttl: Duration,
        wait_timeout: Duration,
    ) -> StoreResult<LockHandle>;

    /// Release a held lock. Equivalent to dropping the handle.
    async fn release(&self, handle: LockHandle);
}

/// A job handed to the notification/worker collaborator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Job kind, e.g. "notify-activation"
    pub kind: String,
    /// Idempotency key: a later identical dispatch replaces, never
    /// duplicates, so a timed-out dispatch is safe to re-post.
    pub dedupe_key: String,
    /// Collaborator-defined payload
    pub payload: serde_json::Value,
}

impl JobSpec {
    pub fn new(
        kind: impl Into<String>,
        dedupe_key: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind: kind.into(),
            dedupe_key: dedupe_key.into(),
            payload,
        }
    }
}

/// Identifier of a dispatched job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobId(pub String);

/// Fire-and-forget notification / worker dispatch
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, job: JobSpec) -> StoreResult<JobId>;
}

/// A charge requested by a release action's completion
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChargeSpec {
    pub scope: ScopeId,
    pub instance: InstanceId,
    pub amount_cents: u64,
    pub memo: String,
}

/// Proof of a successful charge
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PaymentReceipt {
    pub receipt_id: String,
    pub amount_cents: u64,
    pub charged_at: DateTime<Utc>,
}

/// Payment collaborator, invoked synchronously inside a trigger cascade
/// when an action's completion requires a purchase.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn charge(&self, spec: ChargeSpec) -> StoreResult<PaymentReceipt>;
}
