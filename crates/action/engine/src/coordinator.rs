//! Coordinator: the public mutation surface for scopes
//!
//! All writes to a scope go through here. The coordinator serializes
//! mutation per scope with a lock, applies the requested change under
//! optimistic concurrency with bounded retries, commits it, and then
//! runs the trigger cascade as a second commit. A cascade failure is
//! reported as `TriggeredAction` and never rolls back the direct
//! mutation; effects applied before the failing step stay committed.

use crate::{from_store, AudienceCalculator, Resolver, StateMachine, TemplateExpander, TriggerEngine};
use crate::trigger::CascadeEffect;
use action_store::{
    ChargeSpec, Dispatcher, DocumentStore, LockHandle, LockManager, PaymentGateway, Revision,
    StoreError,
};
use action_types::{
    validate, ActionError, ActionInstance, ActionKind, ActionReference, ActionResult,
    ActionStatus, ActionTemplate, Audience, InstanceId, LockKey, RoleRef, ScopeDocument,
    ScopeId, TemplateId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Tunables for locking and commit retries
#[derive(Clone, Copy, Debug)]
pub struct CoordinatorConfig {
    /// How long a holder may keep a lock before a distributed backend
    /// may reclaim it
    pub lock_ttl: Duration,
    /// How long to wait for a contended lock before failing `Locked`
    pub lock_wait: Duration,
    /// Attempts per commit when the revision token goes stale
    pub max_commit_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
            max_commit_retries: 3,
        }
    }
}

/// One requested mutation of a single action instance
#[derive(Clone, Debug)]
pub struct ActionPatch {
    pub scope: ScopeId,
    pub target: ActionReference,
    /// Requested status transition, if any
    pub status: Option<ActionStatus>,
    /// Result payload recorded on the instance (a decision's branch key)
    pub result: Option<serde_json::Value>,
    /// Question answers by position
    pub question_answers: Vec<(u32, String)>,
    /// Review verdicts by position
    pub review_verdicts: Vec<(u32, String)>,
}

impl ActionPatch {
    pub fn new(scope: ScopeId, target: ActionReference) -> Self {
        Self {
            scope,
            target,
            status: None,
            result: None,
            question_answers: Vec::new(),
            review_verdicts: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: ActionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn answer_question(mut self, index: u32, answer: impl Into<String>) -> Self {
        self.question_answers.push((index, answer.into()));
        self
    }

    pub fn resolve_review(mut self, index: u32, verdict: impl Into<String>) -> Self {
        self.review_verdicts.push((index, verdict.into()));
        self
    }
}

/// What a submit did: the instance it acted on and every cascaded effect
#[derive(Clone, Debug)]
pub struct SubmitOutcome {
    pub instance: InstanceId,
    pub effects: Vec<CascadeEffect>,
}

/// Serializes and applies scope mutations
pub struct Coordinator {
    store: Arc<dyn DocumentStore>,
    locks: Arc<dyn LockManager>,
    payments: Arc<dyn PaymentGateway>,
    trigger: TriggerEngine,
    expander: TemplateExpander,
    audience: AudienceCalculator,
    machine: StateMachine,
    resolver: Resolver,
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        locks: Arc<dyn LockManager>,
        dispatcher: Arc<dyn Dispatcher>,
        payments: Arc<dyn PaymentGateway>,
    ) -> Self {
        Self {
            store,
            locks: locks.clone(),
            payments: payments.clone(),
            trigger: TriggerEngine::new(dispatcher, payments, locks),
            expander: TemplateExpander::new(),
            audience: AudienceCalculator::new(),
            machine: StateMachine::new(),
            resolver: Resolver::new(),
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.trigger = self
            .trigger
            .with_lock_bounds(config.lock_ttl, config.lock_wait);
        self.config = config;
        self
    }

    // ── Public operations ────────────────────────────────────────────

    /// Validate a template tree, create its scope document, and expand
    /// and activate the initial stage set.
    #[instrument(skip(self, templates, bindings), fields(scope = %scope_id))]
    pub async fn instantiate(
        &self,
        scope_id: ScopeId,
        templates: Vec<ActionTemplate>,
        bindings: HashMap<Audience, Vec<RoleRef>>,
    ) -> ActionResult<ScopeDocument> {
        validate(&templates)?;
        let mut doc = ScopeDocument::new(scope_id, templates, bindings);
        let created = self.expander.instantiate_scope(&mut doc);
        let ctx = action_types::ScopeContext::snapshot_of(&doc);
        self.audience.seed(&mut doc, &created, &ctx);
        self.trigger.settle(&mut doc).await?;
        doc.refresh_status();

        self.store
            .create(doc.clone())
            .await
            .map_err(from_store)?;
        info!(scope = %doc.id, instances = doc.instances.len(), "scope instantiated");
        Ok(doc)
    }

    /// Read a scope document.
    pub async fn get_scope(&self, scope_id: &ScopeId) -> ActionResult<ScopeDocument> {
        Ok(self.load(scope_id).await?.0)
    }

    /// Resolve a reference against the current state of a scope.
    pub async fn resolve(
        &self,
        scope_id: &ScopeId,
        reference: &ActionReference,
    ) -> ActionResult<ActionInstance> {
        let (doc, _) = self.load(scope_id).await?;
        self.resolver.resolve(reference, &doc).map(Clone::clone)
    }

    /// Apply one mutation on behalf of an actor: answers, verdicts, a
    /// result payload, and an optional status transition. The direct
    /// mutation commits first; the trigger cascade commits separately.
    #[instrument(skip(self, patch), fields(scope = %patch.scope, actor = %actor))]
    pub async fn submit(&self, patch: ActionPatch, actor: &RoleRef) -> ActionResult<SubmitOutcome> {
        let scope_lock = self.lock(LockKey::for_scope(&patch.scope)).await?;

        let result = self.submit_locked(&patch, actor).await;

        self.locks.release(scope_lock).await;
        result
    }

    /// Grant a role direct participation on an instance.
    pub async fn authorize(
        &self,
        scope_id: &ScopeId,
        reference: &ActionReference,
        role: RoleRef,
    ) -> ActionResult<()> {
        let scope_lock = self.lock(LockKey::for_scope(scope_id)).await?;
        let result = async {
            let (mut doc, rev) = self.load(scope_id).await?;
            let id = self.resolver.resolve(reference, &doc)?.id.clone();
            self.audience.authorize(&mut doc, &id, role)?;
            self.commit(doc, rev).await?;
            Ok(())
        }
        .await;
        self.locks.release(scope_lock).await;
        result
    }

    /// Withdraw a role's active grants on an instance (soft-ended).
    pub async fn deauthorize(
        &self,
        scope_id: &ScopeId,
        reference: &ActionReference,
        role: &RoleRef,
    ) -> ActionResult<()> {
        let scope_lock = self.lock(LockKey::for_scope(scope_id)).await?;
        let result = async {
            let (mut doc, rev) = self.load(scope_id).await?;
            let id = self.resolver.resolve(reference, &doc)?.id.clone();
            self.audience.deauthorize(&mut doc, &id, role)?;
            self.commit(doc, rev).await?;
            Ok(())
        }
        .await;
        self.locks.release(scope_lock).await;
        result
    }

    /// Replace the roles bound to an audience and re-expand grants on
    /// live instances of live-audience templates. Returns how many
    /// instances changed.
    #[instrument(skip(self, roles), fields(scope = %scope_id, audience = %audience))]
    pub async fn rebind_audience(
        &self,
        scope_id: &ScopeId,
        audience: Audience,
        roles: Vec<RoleRef>,
    ) -> ActionResult<usize> {
        let scope_lock = self.lock(LockKey::for_scope(scope_id)).await?;
        let result = async {
            let (mut doc, rev) = self.load(scope_id).await?;
            doc.role_bindings.insert(audience, roles);
            let touched = self.audience.refresh_live(&mut doc);
            self.commit(doc, rev).await?;
            Ok(touched)
        }
        .await;
        self.locks.release(scope_lock).await;
        result
    }

    // ── Submit internals ─────────────────────────────────────────────

    async fn submit_locked(
        &self,
        patch: &ActionPatch,
        actor: &RoleRef,
    ) -> ActionResult<SubmitOutcome> {
        let mut release_lock: Option<LockHandle> = None;
        let mut charged = false;

        // Commit the direct mutation under bounded revision retries.
        let mut attempt = 0;
        let instance_id = loop {
            let (mut doc, rev) = self.load(&patch.scope).await?;
            let id = self
                .apply_patch(&mut doc, patch, actor, &mut release_lock, &mut charged)
                .await?;
            match self.store.put(doc, rev).await {
                Ok(_) => break id,
                Err(StoreError::RevisionConflict { .. }) => {
                    attempt += 1;
                    if attempt >= self.config.max_commit_retries {
                        if let Some(handle) = release_lock.take() {
                            self.locks.release(handle).await;
                        }
                        return Err(ActionError::Conflict(format!(
                            "scope {} kept changing during {attempt} commit attempts",
                            patch.scope
                        )));
                    }
                    warn!(scope = %patch.scope, attempt, "revision conflict, retrying");
                }
                Err(other) => {
                    if let Some(handle) = release_lock.take() {
                        self.locks.release(handle).await;
                    }
                    return Err(from_store(other));
                }
            }
        };

        // Cascade phase: a second read-modify-commit. Effects applied
        // before a failing step are persisted alongside the error.
        let (mut doc, rev) = self.load(&patch.scope).await?;
        let cascade = self.trigger.cascade(&mut doc, &instance_id).await;
        self.commit(doc, rev).await?;

        if let Some(handle) = release_lock.take() {
            self.locks.release(handle).await;
        }

        let effects = cascade?;
        debug!(instance = %instance_id, effects = effects.len(), "submit committed");
        Ok(SubmitOutcome {
            instance: instance_id,
            effects,
        })
    }

    /// Apply a patch to an in-memory document. Charges a direct
    /// release fee (once) before the transition so a declined payment
    /// fails the request with nothing committed.
    async fn apply_patch(
        &self,
        doc: &mut ScopeDocument,
        patch: &ActionPatch,
        actor: &RoleRef,
        release_lock: &mut Option<LockHandle>,
        charged: &mut bool,
    ) -> ActionResult<InstanceId> {
        let id = match self.resolver.resolve(&patch.target, doc) {
            Ok(instance) => instance.id.clone(),
            Err(ActionError::ReferenceNotFound(reason)) => self
                .expand_on_demand(doc, &patch.target)
                .ok_or(ActionError::ReferenceNotFound(reason))??,
            Err(other) => return Err(other),
        };
        let resolved = doc
            .instance(&id)
            .ok_or_else(|| ActionError::InstanceNotFound(id.clone()))?;
        let template_id = resolved.instance_of.clone();

        let restricted = resolved.agent.is_some() || !resolved.active_participants().is_empty();
        if restricted && !resolved.is_visible_to(actor) {
            return Err(ActionError::Validation(format!(
                "role {actor} is not a participant of action {}",
                resolved.display_identifier()
            )));
        }

        let template = doc
            .find_template(&template_id)
            .ok_or_else(|| ActionError::TemplateNotFound(template_id.clone()))?
            .clone();

        {
            let instance = doc
                .instance_mut(&id)
                .ok_or_else(|| ActionError::InstanceNotFound(id.clone()))?;
            for (index, answer) in &patch.question_answers {
                instance
                    .questions
                    .get_mut(*index as usize)
                    .ok_or_else(|| {
                        ActionError::Validation(format!("no question at position {index}"))
                    })?
                    .answer(answer.clone());
            }
            for (index, verdict) in &patch.review_verdicts {
                instance
                    .reviews
                    .get_mut(*index as usize)
                    .ok_or_else(|| {
                        ActionError::Validation(format!("no review at position {index}"))
                    })?
                    .resolve(verdict.clone());
            }
            if let Some(result) = &patch.result {
                instance.result = Some(result.clone());
            }
        }

        if let Some(to) = patch.status {
            if to == ActionStatus::Completed && template.kind == ActionKind::Decide {
                let key = doc
                    .instance(&id)
                    .and_then(|i| i.result.as_ref())
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
                let Some(key) = key else {
                    return Err(ActionError::Validation(format!(
                        "decision {template_id} needs a string result to complete"
                    )));
                };
                // An undeclared branch key must fail here, before the
                // completion is committed.
                if !template.potential_results.iter().any(|b| b.key == key) {
                    return Err(ActionError::Validation(format!(
                        "decision '{template_id}' has no result branch '{key}'"
                    )));
                }
            }

            if to == ActionStatus::Completed {
                if let Some(requirement) = &template.release_requirement {
                    if release_lock.is_none() {
                        *release_lock =
                            Some(self.lock(LockKey::for_release(&requirement.slug)).await?);
                    }
                    if let (Some(fee), false) = (requirement.fee_cents, *charged) {
                        let identifier = doc
                            .instance(&id)
                            .map(|i| i.display_identifier())
                            .unwrap_or_default();
                        self.payments
                            .charge(ChargeSpec {
                                scope: doc.id.clone(),
                                instance: id.clone(),
                                amount_cents: fee,
                                memo: format!(
                                    "release '{}' for action {identifier}",
                                    requirement.slug
                                ),
                            })
                            .await
                            .map_err(from_store)?;
                        *charged = true;
                    }
                }
            }

            self.machine.apply(doc, &id, to, Some(actor.clone()), None)?;
        }

        Ok(id)
    }

    /// On-demand fan-out: a symbolic reference carrying an explicit
    /// repetition index that is unexpanded but within the template's
    /// `max_instances` creates the repetition instead of failing.
    /// Returns `None` when the reference does not qualify, so the
    /// original resolution error stands.
    fn expand_on_demand(
        &self,
        doc: &mut ScopeDocument,
        target: &ActionReference,
    ) -> Option<ActionResult<InstanceId>> {
        let ActionReference::Symbolic(symbolic) = target else {
            return None;
        };
        let index = symbolic.instance?;
        let (fans_out, max_instances) = {
            let template = doc.find_template(&symbolic.template)?;
            (template.fans_out(), template.max_instances)
        };
        if !fans_out || index >= max_instances {
            return None;
        }
        let cycle = symbolic
            .cycle
            .or_else(|| doc.highest_cycle(&symbolic.template, 0))
            .unwrap_or(0);
        Some(self.create_repetition(doc, &symbolic.template, index, cycle))
    }

    fn create_repetition(
        &self,
        doc: &mut ScopeDocument,
        template_id: &TemplateId,
        index: u32,
        cycle: u32,
    ) -> ActionResult<InstanceId> {
        let created = self
            .expander
            .expand_repetition(doc, template_id, index, cycle)?;
        let ctx = action_types::ScopeContext::snapshot_of(doc);
        self.audience
            .seed(doc, std::slice::from_ref(&created), &ctx);

        // The new repetition activates exactly when a cascade would
        // have activated it.
        let activate = match doc
            .find_template(template_id)
            .and_then(|t| t.activate_on.clone())
        {
            Some(predicate) => self.trigger.satisfied(doc, &predicate, cycle),
            None => true,
        };
        if activate {
            self.machine
                .apply(doc, &created, ActionStatus::Active, None, None)?;
        }
        debug!(template = %template_id, index, cycle, "expanded fan-out repetition on demand");
        Ok(created)
    }

    // ── Collaborator helpers ─────────────────────────────────────────

    async fn lock(&self, key: LockKey) -> ActionResult<LockHandle> {
        self.locks
            .acquire(&key, self.config.lock_ttl, self.config.lock_wait)
            .await
            .map_err(from_store)
    }

    async fn load(&self, scope_id: &ScopeId) -> ActionResult<(ScopeDocument, Revision)> {
        self.store.get(scope_id).await.map_err(|e| match e {
            StoreError::NotFound(_) => ActionError::ScopeNotFound(scope_id.clone()),
            other => from_store(other),
        })
    }

    async fn commit(&self, doc: ScopeDocument, rev: Revision) -> ActionResult<Revision> {
        self.store.put(doc, rev).await.map_err(from_store)
    }
}
