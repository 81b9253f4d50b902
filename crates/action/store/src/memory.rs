//! In-memory reference implementations of the collaborator contracts.
//!
//! These adapters are deterministic and test-friendly. Production
//! deployments bind the traits to a versioned document database, a
//! distributed lock service, a job queue, and a payment provider.

use crate::traits::{
    ChargeSpec, Dispatcher, DocumentStore, JobId, JobSpec, LockHandle, LockManager,
    PaymentGateway, PaymentReceipt, Revision,
};
use crate::{StoreError, StoreResult};
use action_types::{LockKey, ScopeDocument, ScopeId};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// In-memory versioned document store.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    docs: RwLock<HashMap<ScopeId, (ScopeDocument, u64)>>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn create(&self, doc: ScopeDocument) -> StoreResult<Revision> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Backend("document lock poisoned".to_string()))?;
        if guard.contains_key(&doc.id) {
            return Err(StoreError::RevisionConflict {
                scope: doc.id.to_string(),
                expected: 0,
                actual: guard[&doc.id].1,
            });
        }
        guard.insert(doc.id.clone(), (doc, 1));
        Ok(Revision(1))
    }

    async fn get(&self, id: &ScopeId) -> StoreResult<(ScopeDocument, Revision)> {
        let guard = self
            .docs
            .read()
            .map_err(|_| StoreError::Backend("document lock poisoned".to_string()))?;
        guard
            .get(id)
            .map(|(doc, rev)| (doc.clone(), Revision(*rev)))
            .ok_or_else(|| StoreError::NotFound(format!("scope {id}")))
    }

    async fn put(&self, doc: ScopeDocument, expected: Revision) -> StoreResult<Revision> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Backend("document lock poisoned".to_string()))?;
        let entry = guard
            .get_mut(&doc.id)
            .ok_or_else(|| StoreError::NotFound(format!("scope {}", doc.id)))?;
        if entry.1 != expected.0 {
            return Err(StoreError::RevisionConflict {
                scope: doc.id.to_string(),
                expected: expected.0,
                actual: entry.1,
            });
        }
        entry.0 = doc;
        entry.1 += 1;
        Ok(Revision(entry.1))
    }

    async fn delete(&self, id: &ScopeId) -> StoreResult<()> {
        let mut guard = self
            .docs
            .write()
            .map_err(|_| StoreError::Backend("document lock poisoned".to_string()))?;
        guard
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(format!("scope {id}")))
    }
}

/// In-memory lock manager built on per-key tokio mutexes.
///
/// `ttl` is advisory here; the handle's guard is held until release.
#[derive(Default)]
pub struct InMemoryLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl InMemoryLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_for(&self, key: &LockKey) -> StoreResult<Arc<tokio::sync::Mutex<()>>> {
        let mut guard = self
            .locks
            .lock()
            .map_err(|_| StoreError::Backend("lock table poisoned".to_string()))?;
        Ok(guard
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone())
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn acquire(
        &self,
        key: &LockKey,
        _ttl: Duration,
        wait_timeout: Duration,
    ) -> StoreResult<LockHandle> {
        let mutex = self.entry_for(key)?;
        match tokio::time::timeout(wait_timeout, mutex.lock_owned()).await {
            Ok(guard) => Ok(LockHandle::new(key.clone(), Box::new(guard))),
            Err(_) => Err(StoreError::LockTimeout {
                key: key.to_string(),
                waited_ms: wait_timeout.as_millis() as u64,
            }),
        }
    }

    async fn release(&self, handle: LockHandle) {
        drop(handle);
    }
}

/// Dispatcher that records jobs and dedupes by `dedupe_key`.
#[derive(Default)]
pub struct RecordingDispatcher {
    jobs: Mutex<Vec<JobSpec>>,
    seen: Mutex<HashMap<String, JobId>>,
}

impl RecordingDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever dispatched, in order, duplicates excluded
    pub fn recorded(&self) -> Vec<JobSpec> {
        self.jobs.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(&self, job: JobSpec) -> StoreResult<JobId> {
        let mut seen = self
            .seen
            .lock()
            .map_err(|_| StoreError::Backend("dispatcher lock poisoned".to_string()))?;
        if let Some(existing) = seen.get(&job.dedupe_key) {
            // Idempotent replay of a previously dispatched job
            return Ok(existing.clone());
        }
        let id = JobId(format!("job-{}", Uuid::new_v4()));
        seen.insert(job.dedupe_key.clone(), id.clone());
        self.jobs
            .lock()
            .map_err(|_| StoreError::Backend("dispatcher lock poisoned".to_string()))?
            .push(job);
        Ok(id)
    }
}

/// Payment gateway whose outcome is scriptable per test.
#[derive(Default)]
pub struct FlakyPaymentGateway {
    failing: Mutex<bool>,
    charges: Mutex<Vec<ChargeSpec>>,
}

impl FlakyPaymentGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent charges fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        if let Ok(mut guard) = self.failing.lock() {
            *guard = failing;
        }
    }

    /// Charges that were accepted
    pub fn charged(&self) -> Vec<ChargeSpec> {
        self.charges.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PaymentGateway for FlakyPaymentGateway {
    async fn charge(&self, spec: ChargeSpec) -> StoreResult<PaymentReceipt> {
        let failing = self
            .failing
            .lock()
            .map(|g| *g)
            .map_err(|_| StoreError::Backend("payment lock poisoned".to_string()))?;
        if failing {
            return Err(StoreError::PaymentDeclined(format!(
                "charge of {} cents for instance {} declined",
                spec.amount_cents, spec.instance
            )));
        }
        let receipt = PaymentReceipt {
            receipt_id: format!("rcpt-{}", Uuid::new_v4()),
            amount_cents: spec.amount_cents,
            charged_at: Utc::now(),
        };
        self.charges
            .lock()
            .map_err(|_| StoreError::Backend("payment lock poisoned".to_string()))?
            .push(spec);
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_types::{ActionTemplate, ScopeDocument};
    use std::collections::HashMap as Map;

    fn make_doc(id: &str) -> ScopeDocument {
        ScopeDocument::new(
            ScopeId::new(id),
            vec![ActionTemplate::task("draft", "Draft")],
            Map::new(),
        )
    }

    #[tokio::test]
    async fn put_with_stale_revision_conflicts() {
        let store = InMemoryDocumentStore::new();
        let rev1 = store.create(make_doc("p1")).await.unwrap();

        let (doc, rev) = store.get(&ScopeId::new("p1")).await.unwrap();
        assert_eq!(rev, rev1);

        let rev2 = store.put(doc.clone(), rev).await.unwrap();
        assert_eq!(rev2, Revision(2));

        // Writing again with the stale token must conflict
        let result = store.put(doc, rev1).await;
        assert!(matches!(result, Err(StoreError::RevisionConflict { .. })));
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let store = InMemoryDocumentStore::new();
        store.create(make_doc("p1")).await.unwrap();
        assert!(matches!(
            store.create(make_doc("p1")).await,
            Err(StoreError::RevisionConflict { .. })
        ));
    }

    #[tokio::test]
    async fn lock_blocks_then_times_out() {
        let locks = InMemoryLockManager::new();
        let key = LockKey::new("scope:p1");

        let held = locks
            .acquire(&key, Duration::from_secs(30), Duration::from_millis(50))
            .await
            .unwrap();

        let result = locks
            .acquire(&key, Duration::from_secs(30), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(StoreError::LockTimeout { .. })));

        locks.release(held).await;
        assert!(locks
            .acquire(&key, Duration::from_secs(30), Duration::from_millis(50))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn dispatcher_dedupes_by_key() {
        let dispatcher = RecordingDispatcher::new();
        let job = JobSpec::new("notify", "inst-1:active", serde_json::json!({}));

        let first = dispatcher.dispatch(job.clone()).await.unwrap();
        let second = dispatcher.dispatch(job).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(dispatcher.recorded().len(), 1);
    }

    #[tokio::test]
    async fn payment_outcome_is_scriptable() {
        let payments = FlakyPaymentGateway::new();
        let spec = ChargeSpec {
            scope: ScopeId::new("p1"),
            instance: action_types::InstanceId::new("i1"),
            amount_cents: 500,
            memo: "release fee".into(),
        };

        payments.set_failing(true);
        assert!(matches!(
            payments.charge(spec.clone()).await,
            Err(StoreError::PaymentDeclined(_))
        ));

        payments.set_failing(false);
        let receipt = payments.charge(spec).await.unwrap();
        assert_eq!(receipt.amount_cents, 500);
        assert_eq!(payments.charged().len(), 1);
    }
}
