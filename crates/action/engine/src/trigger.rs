//! Trigger cascade: automatic transitions driven by status predicates
//!
//! After any committed transition, the engine walks a bounded worklist:
//! each changed instance may expand new instances, activate waiting
//! ones, endorse its targets, and auto-complete instances whose
//! `complete_on` predicate now holds. Every cascaded transition records
//! the instance that triggered it.
//!
//! A failed cascade step never rolls back transitions already applied;
//! the error names the instance that failed so callers can retry it.

use crate::{from_store, AudienceCalculator, StateMachine, TemplateExpander};
use action_store::{ChargeSpec, Dispatcher, JobSpec, LockManager, PaymentGateway};
use action_types::{
    ActionError, ActionInstance, ActionKind, ActionResult, ActionStatus, InstanceId, LockKey,
    ScopeContext, ScopeDocument, TemplateId, TriggerPredicate,
};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Upper bound on transitions applied by one cascade. A legal template
/// tree stays far below this; hitting it means a predicate loop.
const MAX_CASCADE_STEPS: usize = 256;

/// One observable outcome of a cascade, in application order
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CascadeEffect {
    /// A new instance was expanded from a template
    Expanded(InstanceId),
    /// A waiting instance became active
    Activated(InstanceId),
    /// An instance was endorsed by an endorsement action
    Endorsed(InstanceId),
    /// An instance auto-completed via its `complete_on` predicate
    Completed(InstanceId),
    /// A release action published its slug (and charged its fee)
    ReleasePublished { instance: InstanceId, slug: String },
}

/// Cascades status changes through a scope's instances
pub struct TriggerEngine {
    expander: TemplateExpander,
    audience: AudienceCalculator,
    machine: StateMachine,
    dispatcher: Arc<dyn Dispatcher>,
    payments: Arc<dyn PaymentGateway>,
    locks: Arc<dyn LockManager>,
    lock_ttl: Duration,
    lock_wait: Duration,
}

impl TriggerEngine {
    pub fn new(
        dispatcher: Arc<dyn Dispatcher>,
        payments: Arc<dyn PaymentGateway>,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            expander: TemplateExpander::new(),
            audience: AudienceCalculator::new(),
            machine: StateMachine::new(),
            dispatcher,
            payments,
            locks,
            lock_ttl: Duration::from_secs(30),
            lock_wait: Duration::from_secs(5),
        }
    }

    /// Bounds for the release-slug lock taken by cascaded completions
    pub fn with_lock_bounds(mut self, ttl: Duration, wait: Duration) -> Self {
        self.lock_ttl = ttl;
        self.lock_wait = wait;
        self
    }

    /// Cascade the consequences of a just-committed transition on
    /// `origin`. A canceled origin fires none of its own consequences
    /// (no expansion, endorsement, or publication), but instances whose
    /// predicates watch for the cancellation still fire.
    pub async fn cascade(
        &self,
        doc: &mut ScopeDocument,
        origin: &InstanceId,
    ) -> ActionResult<Vec<CascadeEffect>> {
        self.run(doc, VecDeque::from([Some(origin.clone())])).await
    }

    /// Expand and activate everything currently pending, without a
    /// triggering instance. Used when a scope is first instantiated
    /// and after rebinding.
    pub async fn settle(&self, doc: &mut ScopeDocument) -> ActionResult<Vec<CascadeEffect>> {
        self.run(doc, VecDeque::from([None])).await
    }

    async fn run(
        &self,
        doc: &mut ScopeDocument,
        mut queue: VecDeque<Option<InstanceId>>,
    ) -> ActionResult<Vec<CascadeEffect>> {
        let mut effects = Vec::new();
        let mut steps = 0usize;
        while let Some(source) = queue.pop_front() {
            steps += 1;
            if steps > MAX_CASCADE_STEPS {
                warn!(scope = %doc.id, steps, "trigger cascade exceeded step bound");
                return Err(ActionError::Validation(format!(
                    "trigger cascade exceeded {MAX_CASCADE_STEPS} steps in scope {}",
                    doc.id
                )));
            }
            self.step(doc, source, &mut queue, &mut effects).await?;
        }
        Ok(effects)
    }

    async fn step(
        &self,
        doc: &mut ScopeDocument,
        source: Option<InstanceId>,
        queue: &mut VecDeque<Option<InstanceId>>,
        effects: &mut Vec<CascadeEffect>,
    ) -> ActionResult<()> {
        // Consequences tied to the source itself: expansion of its
        // children or selected branch, and endorsement of its targets.
        if let Some(source_id) = &source {
            let snapshot = doc.instance(source_id).cloned();
            if let Some(src) = snapshot {
                if src.status == ActionStatus::Completed {
                    let mut created = Vec::new();
                    if let Some(key) = self.decision_key(doc, &src) {
                        created.extend(self.expander.expand_branch(doc, source_id, &key)?);
                    }
                    created.extend(self.expander.expand_ready(doc));
                    if !created.is_empty() {
                        let ctx = ScopeContext::snapshot_of(doc);
                        self.audience.seed(doc, &created, &ctx);
                        effects.extend(created.into_iter().map(CascadeEffect::Expanded));
                    }

                    if self.template_kind(doc, &src.instance_of) == Some(ActionKind::Endorse) {
                        self.endorse_targets(doc, &src, queue, effects)?;
                    }

                    // A release completed directly (fee already charged
                    // by the caller) still publishes its slug. Dispatch
                    // is idempotent via the dedupe key.
                    if let Some(requirement) = doc
                        .find_template(&src.instance_of)
                        .and_then(|t| t.release_requirement.clone())
                    {
                        let effect = CascadeEffect::ReleasePublished {
                            instance: source_id.clone(),
                            slug: requirement.slug.clone(),
                        };
                        if !effects.contains(&effect) {
                            self.dispatcher
                                .dispatch(JobSpec::new(
                                    "publish-release",
                                    format!("release:{}", requirement.slug),
                                    json!({
                                        "scope": doc.id.0,
                                        "instance": source_id.0,
                                        "slug": requirement.slug,
                                    }),
                                ))
                                .await
                                .map_err(|e| ActionError::TriggeredAction {
                                    instance: source_id.clone(),
                                    source: Box::new(from_store(e)),
                                })?;
                            effects.push(effect);
                        }
                    }
                }
            }
        }

        // Activation scan: waiting instances whose predicate now holds.
        // An absent activate_on means "available as soon as expanded".
        let to_activate: Vec<InstanceId> = doc
            .instances
            .iter()
            .filter(|i| i.status == ActionStatus::Potential)
            .filter(|i| match self.activate_predicate(doc, &i.instance_of) {
                Some(predicate) => self.satisfied(doc, &predicate, i.cycle),
                None => true,
            })
            .map(|i| i.id.clone())
            .collect();

        for id in to_activate {
            self.machine
                .apply(doc, &id, ActionStatus::Active, None, source.clone())?;
            self.notify_activation(doc, &id).await?;
            queue.push_back(Some(id.clone()));
            effects.push(CascadeEffect::Activated(id));
        }

        // Acknowledgements complete as soon as they activate.
        let to_acknowledge: Vec<InstanceId> = doc
            .instances
            .iter()
            .filter(|i| {
                i.status == ActionStatus::Active
                    && i.completion_preconditions_met()
                    && self.template_kind(doc, &i.instance_of) == Some(ActionKind::Acknowledge)
                    && self.complete_predicate(doc, &i.instance_of).is_none()
            })
            .map(|i| i.id.clone())
            .collect();

        for id in to_acknowledge {
            self.machine
                .apply(doc, &id, ActionStatus::Completed, None, source.clone())?;
            queue.push_back(Some(id.clone()));
            effects.push(CascadeEffect::Completed(id));
        }

        // Completion scan: live instances whose complete_on now holds.
        let to_complete: Vec<InstanceId> = doc
            .instances
            .iter()
            .filter(|i| {
                matches!(
                    i.status,
                    ActionStatus::Active | ActionStatus::Staged | ActionStatus::Endorsed
                ) && i.completion_preconditions_met()
            })
            .filter(|i| {
                self.complete_predicate(doc, &i.instance_of)
                    .is_some_and(|p| self.satisfied(doc, &p, i.cycle))
            })
            .map(|i| i.id.clone())
            .collect();

        for id in to_complete {
            self.complete_cascaded(doc, &id, source.clone(), effects)
                .await?;
            queue.push_back(Some(id));
        }

        Ok(())
    }

    /// Complete one instance inside a cascade, charging its release fee
    /// first when one is declared. A declined charge aborts this step
    /// with the failing instance named; the instance stays untouched.
    /// Release completions take the same slug lock as direct ones.
    async fn complete_cascaded(
        &self,
        doc: &mut ScopeDocument,
        id: &InstanceId,
        source: Option<InstanceId>,
        effects: &mut Vec<CascadeEffect>,
    ) -> ActionResult<()> {
        let instance = doc
            .instance(id)
            .ok_or_else(|| ActionError::InstanceNotFound(id.clone()))?;
        let identifier = instance.display_identifier();
        let release = doc
            .find_template(&instance.instance_of)
            .and_then(|t| t.release_requirement.clone());

        let Some(requirement) = release else {
            self.machine
                .apply(doc, id, ActionStatus::Completed, None, source)?;
            effects.push(CascadeEffect::Completed(id.clone()));
            return Ok(());
        };

        let slug_lock = self
            .locks
            .acquire(
                &LockKey::for_release(&requirement.slug),
                self.lock_ttl,
                self.lock_wait,
            )
            .await
            .map_err(|e| ActionError::TriggeredAction {
                instance: id.clone(),
                source: Box::new(from_store(e)),
            })?;

        let result = async {
            if let Some(fee) = requirement.fee_cents {
                let spec = ChargeSpec {
                    scope: doc.id.clone(),
                    instance: id.clone(),
                    amount_cents: fee,
                    memo: format!("release '{}' for action {identifier}", requirement.slug),
                };
                self.payments.charge(spec).await.map_err(|e| {
                    ActionError::TriggeredAction {
                        instance: id.clone(),
                        source: Box::new(from_store(e)),
                    }
                })?;
            }

            self.machine
                .apply(doc, id, ActionStatus::Completed, None, source)?;
            effects.push(CascadeEffect::Completed(id.clone()));

            self.dispatcher
                .dispatch(JobSpec::new(
                    "publish-release",
                    format!("release:{}", requirement.slug),
                    json!({
                        "scope": doc.id.0,
                        "instance": id.0,
                        "slug": requirement.slug,
                    }),
                ))
                .await
                .map_err(|e| ActionError::TriggeredAction {
                    instance: id.clone(),
                    source: Box::new(from_store(e)),
                })?;
            effects.push(CascadeEffect::ReleasePublished {
                instance: id.clone(),
                slug: requirement.slug.clone(),
            });
            Ok(())
        }
        .await;

        self.locks.release(slug_lock).await;
        result
    }

    /// Mark the templates named by a completed endorsement's activation
    /// predicate as Endorsed.
    fn endorse_targets(
        &self,
        doc: &mut ScopeDocument,
        endorsement: &ActionInstance,
        queue: &mut VecDeque<Option<InstanceId>>,
        effects: &mut Vec<CascadeEffect>,
    ) -> ActionResult<()> {
        let Some(predicate) = self.activate_predicate(doc, &endorsement.instance_of) else {
            return Ok(());
        };
        let mut targets = Vec::new();
        collect_targets(&predicate, &mut targets);

        for template_id in targets {
            let candidate = self
                .observed(doc, &template_id, endorsement.cycle)
                .filter(|i| matches!(i.status, ActionStatus::Active | ActionStatus::Staged))
                .map(|i| i.id.clone());
            if let Some(target_id) = candidate {
                self.machine.apply(
                    doc,
                    &target_id,
                    ActionStatus::Endorsed,
                    None,
                    Some(endorsement.id.clone()),
                )?;
                queue.push_back(Some(target_id.clone()));
                effects.push(CascadeEffect::Endorsed(target_id));
            }
        }
        Ok(())
    }

    async fn notify_activation(
        &self,
        doc: &ScopeDocument,
        id: &InstanceId,
    ) -> ActionResult<()> {
        let instance = doc
            .instance(id)
            .ok_or_else(|| ActionError::InstanceNotFound(id.clone()))?;
        self.dispatcher
            .dispatch(JobSpec::new(
                "notify-activation",
                format!("{id}:active"),
                json!({
                    "scope": doc.id.0,
                    "instance": id.0,
                    "identifier": instance.display_identifier(),
                }),
            ))
            .await
            .map_err(|e| ActionError::TriggeredAction {
                instance: id.clone(),
                source: Box::new(from_store(e)),
            })?;
        Ok(())
    }

    // ── Predicate evaluation ─────────────────────────────────────────

    /// Whether a predicate holds, observed from the given cycle.
    pub fn satisfied(
        &self,
        doc: &ScopeDocument,
        predicate: &TriggerPredicate,
        observer_cycle: u32,
    ) -> bool {
        match predicate {
            TriggerPredicate::StatusReached { template, status } => {
                self.reached(doc, template, *status, observer_cycle)
            }
            TriggerPredicate::Endorsed { template } => {
                self.reached(doc, template, ActionStatus::Endorsed, observer_cycle)
            }
            TriggerPredicate::AllOf { predicates } => predicates
                .iter()
                .all(|p| self.satisfied(doc, p, observer_cycle)),
            TriggerPredicate::AnyOf { predicates } => predicates
                .iter()
                .any(|p| self.satisfied(doc, p, observer_cycle)),
        }
    }

    /// Every fan-out sibling at the observed cycle must have reached
    /// the target status. No instances means not reached.
    fn reached(
        &self,
        doc: &ScopeDocument,
        template: &TemplateId,
        target: ActionStatus,
        observer_cycle: u32,
    ) -> bool {
        let cycle = self.observed_cycle(doc, template, observer_cycle);
        let Some(cycle) = cycle else { return false };
        let siblings: Vec<&ActionInstance> = doc
            .instances
            .iter()
            .filter(|i| &i.instance_of == template && i.cycle == cycle)
            .collect();
        !siblings.is_empty()
            && siblings
                .iter()
                .all(|i| self.instance_reached(doc, i, target))
    }

    fn instance_reached(
        &self,
        doc: &ScopeDocument,
        instance: &ActionInstance,
        target: ActionStatus,
    ) -> bool {
        // Endorsed sits off the completion rank path, so a completed
        // instance counts as endorsed only if the audit trail shows it
        // actually passed through Endorsed.
        if target == ActionStatus::Endorsed {
            return instance.status == ActionStatus::Endorsed
                || doc
                    .transitions
                    .iter()
                    .any(|t| t.instance == instance.id && t.to == ActionStatus::Endorsed);
        }
        match (rank(instance.status), rank(target)) {
            (Some(current), Some(wanted)) => current >= wanted,
            // Canceled and Failed are matched exactly, never by rank
            _ => instance.status == target,
        }
    }

    /// Which cycle of a template a predicate observes: the observer's
    /// own cycle when instances exist there, otherwise the most recent.
    fn observed_cycle(
        &self,
        doc: &ScopeDocument,
        template: &TemplateId,
        observer_cycle: u32,
    ) -> Option<u32> {
        let cycles: Vec<u32> = doc
            .instances
            .iter()
            .filter(|i| &i.instance_of == template)
            .map(|i| i.cycle)
            .collect();
        if cycles.contains(&observer_cycle) {
            Some(observer_cycle)
        } else {
            cycles.into_iter().max()
        }
    }

    fn observed<'a>(
        &self,
        doc: &'a ScopeDocument,
        template: &TemplateId,
        observer_cycle: u32,
    ) -> Option<&'a ActionInstance> {
        let cycle = self.observed_cycle(doc, template, observer_cycle)?;
        doc.instances
            .iter()
            .filter(|i| &i.instance_of == template && i.cycle == cycle)
            .max_by_key(|i| i.created_at)
    }

    // ── Template lookups ─────────────────────────────────────────────

    fn template_kind(&self, doc: &ScopeDocument, id: &TemplateId) -> Option<ActionKind> {
        doc.find_template(id).map(|t| t.kind)
    }

    fn activate_predicate(
        &self,
        doc: &ScopeDocument,
        id: &TemplateId,
    ) -> Option<TriggerPredicate> {
        doc.find_template(id).and_then(|t| t.activate_on.clone())
    }

    fn complete_predicate(
        &self,
        doc: &ScopeDocument,
        id: &TemplateId,
    ) -> Option<TriggerPredicate> {
        doc.find_template(id).and_then(|t| t.complete_on.clone())
    }

    /// The branch key recorded by a completed decision, if any
    fn decision_key(&self, doc: &ScopeDocument, instance: &ActionInstance) -> Option<String> {
        if self.template_kind(doc, &instance.instance_of) != Some(ActionKind::Decide) {
            return None;
        }
        instance
            .result
            .as_ref()
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }
}

fn rank(status: ActionStatus) -> Option<u8> {
    match status {
        ActionStatus::Potential => Some(0),
        ActionStatus::Active => Some(1),
        ActionStatus::Staged => Some(2),
        ActionStatus::Endorsed => Some(3),
        ActionStatus::Completed => Some(4),
        ActionStatus::Canceled | ActionStatus::Failed => None,
    }
}

fn collect_targets(predicate: &TriggerPredicate, out: &mut Vec<TemplateId>) {
    match predicate {
        TriggerPredicate::StatusReached { template, .. }
        | TriggerPredicate::Endorsed { template } => out.push(template.clone()),
        TriggerPredicate::AllOf { predicates } | TriggerPredicate::AnyOf { predicates } => {
            for p in predicates {
                collect_targets(p, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_store::memory::{FlakyPaymentGateway, InMemoryLockManager, RecordingDispatcher};
    use action_types::{ActionTemplate, ReleaseRequirement, ScopeId};
    use std::collections::HashMap;

    fn engine() -> (TriggerEngine, Arc<RecordingDispatcher>, Arc<FlakyPaymentGateway>) {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let payments = Arc::new(FlakyPaymentGateway::new());
        let locks = Arc::new(InMemoryLockManager::new());
        (
            TriggerEngine::new(dispatcher.clone(), payments.clone(), locks),
            dispatcher,
            payments,
        )
    }

    fn make_doc(templates: Vec<ActionTemplate>) -> ScopeDocument {
        ScopeDocument::new(ScopeId::new("proj-1"), templates, HashMap::new())
    }

    fn staged(template: &str) -> TriggerPredicate {
        TriggerPredicate::StatusReached {
            template: TemplateId::new(template),
            status: ActionStatus::Staged,
        }
    }

    fn completed(template: &str) -> TriggerPredicate {
        TriggerPredicate::StatusReached {
            template: TemplateId::new(template),
            status: ActionStatus::Completed,
        }
    }

    async fn instantiate(engine: &TriggerEngine, doc: &mut ScopeDocument) -> Vec<CascadeEffect> {
        let expander = TemplateExpander::new();
        expander.instantiate_scope(doc);
        engine.settle(doc).await.unwrap()
    }

    fn only_instance_of(doc: &ScopeDocument, template: &str) -> InstanceId {
        let found = doc.instances_of(&TemplateId::new(template));
        assert_eq!(found.len(), 1, "expected one instance of {template}");
        found[0].id.clone()
    }

    #[tokio::test]
    async fn test_settle_activates_and_notifies() {
        let (engine, dispatcher, _) = engine();
        let mut doc = make_doc(vec![ActionTemplate::task("draft", "Draft")]);

        let effects = instantiate(&engine, &mut doc).await;
        let id = only_instance_of(&doc, "draft");
        assert_eq!(effects, vec![CascadeEffect::Activated(id.clone())]);
        assert_eq!(doc.instance(&id).unwrap().status, ActionStatus::Active);

        let jobs = dispatcher.recorded();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].kind, "notify-activation");
        assert_eq!(jobs[0].dedupe_key, format!("{id}:active"));
    }

    #[tokio::test]
    async fn test_completion_expands_and_activates_children() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![ActionTemplate::task("stage", "Stage")
            .with_child(ActionTemplate::task("draft", "Draft"))]);
        instantiate(&engine, &mut doc).await;

        let stage = only_instance_of(&doc, "stage");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &stage, ActionStatus::Staged, None, None).unwrap();
        machine.apply(&mut doc, &stage, ActionStatus::Completed, None, None).unwrap();

        let effects = engine.cascade(&mut doc, &stage).await.unwrap();
        let child = only_instance_of(&doc, "draft");
        assert_eq!(
            effects,
            vec![
                CascadeEffect::Expanded(child.clone()),
                CascadeEffect::Activated(child.clone()),
            ]
        );
        assert_eq!(doc.instance(&child).unwrap().status, ActionStatus::Active);
        // Cascaded activation is attributed to the triggering instance
        let record = doc.transitions.last().unwrap();
        assert_eq!(record.triggered_by, Some(stage));
    }

    #[tokio::test]
    async fn test_activate_on_waits_for_predicate() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![ActionTemplate::task("stage", "Stage")
            .with_child(ActionTemplate::task("draft", "Draft"))
            .with_child(
                ActionTemplate::new("review", action_types::ActionKind::Review, "Review")
                    .with_activate_on(staged("draft")),
            )]);
        instantiate(&engine, &mut doc).await;
        let stage = only_instance_of(&doc, "stage");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &stage, ActionStatus::Completed, None, None).unwrap();
        engine.cascade(&mut doc, &stage).await.unwrap();

        let review = only_instance_of(&doc, "review");
        assert_eq!(doc.instance(&review).unwrap().status, ActionStatus::Potential);

        let draft = only_instance_of(&doc, "draft");
        machine.apply(&mut doc, &draft, ActionStatus::Staged, None, None).unwrap();
        let effects = engine.cascade(&mut doc, &draft).await.unwrap();
        assert!(effects.contains(&CascadeEffect::Activated(review.clone())));
        assert_eq!(doc.instance(&review).unwrap().status, ActionStatus::Active);
    }

    #[tokio::test]
    async fn test_complete_on_requires_every_sibling() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![ActionTemplate::task("stage", "Stage")
            .with_child(ActionTemplate::task("review", "Review").with_fan_out(2, 2))
            .with_child(
                ActionTemplate::new(
                    "sign-off",
                    action_types::ActionKind::Acknowledge,
                    "Sign off",
                )
                .with_complete_on(completed("review")),
            )]);
        instantiate(&engine, &mut doc).await;
        let stage = only_instance_of(&doc, "stage");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &stage, ActionStatus::Completed, None, None).unwrap();
        engine.cascade(&mut doc, &stage).await.unwrap();

        let reviews: Vec<InstanceId> = doc
            .instances_of(&TemplateId::new("review"))
            .iter()
            .map(|i| i.id.clone())
            .collect();
        assert_eq!(reviews.len(), 2);
        let sign_off = only_instance_of(&doc, "sign-off");

        machine.apply(&mut doc, &reviews[0], ActionStatus::Completed, None, None).unwrap();
        engine.cascade(&mut doc, &reviews[0]).await.unwrap();
        assert_ne!(doc.instance(&sign_off).unwrap().status, ActionStatus::Completed);

        machine.apply(&mut doc, &reviews[1], ActionStatus::Completed, None, None).unwrap();
        let effects = engine.cascade(&mut doc, &reviews[1]).await.unwrap();
        assert!(effects.contains(&CascadeEffect::Completed(sign_off.clone())));
        assert_eq!(doc.instance(&sign_off).unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_endorse_pathway() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![
            ActionTemplate::task("draft", "Draft")
                .with_complete_on(TriggerPredicate::Endorsed {
                    template: TemplateId::new("draft"),
                }),
            ActionTemplate::new("vouch", ActionKind::Endorse, "Vouch for draft")
                .with_activate_on(staged("draft")),
        ]);
        instantiate(&engine, &mut doc).await;
        let draft = only_instance_of(&doc, "draft");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &draft, ActionStatus::Staged, None, None).unwrap();
        engine.cascade(&mut doc, &draft).await.unwrap();

        let vouch = only_instance_of(&doc, "vouch");
        assert_eq!(doc.instance(&vouch).unwrap().status, ActionStatus::Active);

        machine.apply(&mut doc, &vouch, ActionStatus::Completed, None, None).unwrap();
        let effects = engine.cascade(&mut doc, &vouch).await.unwrap();
        assert!(effects.contains(&CascadeEffect::Endorsed(draft.clone())));
        // Endorsement satisfied the draft's complete_on in the same cascade
        assert!(effects.contains(&CascadeEffect::Completed(draft.clone())));
        assert_eq!(doc.instance(&draft).unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_release_charge_and_publish() {
        let (engine, dispatcher, payments) = engine();
        let mut doc = make_doc(vec![
            ActionTemplate::task("approve", "Approve"),
            ActionTemplate::new("publish", ActionKind::Release, "Publish issue")
                .with_complete_on(completed("approve"))
                .with_release_requirement(ReleaseRequirement {
                    slug: "issue-12".into(),
                    fee_cents: Some(2500),
                }),
        ]);
        instantiate(&engine, &mut doc).await;
        let approve = only_instance_of(&doc, "approve");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &approve, ActionStatus::Completed, None, None).unwrap();

        let publish = only_instance_of(&doc, "publish");
        let effects = engine.cascade(&mut doc, &approve).await.unwrap();
        assert!(effects.contains(&CascadeEffect::ReleasePublished {
            instance: publish.clone(),
            slug: "issue-12".into(),
        }));
        assert_eq!(doc.instance(&publish).unwrap().status, ActionStatus::Completed);

        let charges = payments.charged();
        assert_eq!(charges.len(), 1);
        assert_eq!(charges[0].amount_cents, 2500);
        assert!(dispatcher
            .recorded()
            .iter()
            .any(|j| j.kind == "publish-release" && j.dedupe_key == "release:issue-12"));
    }

    #[tokio::test]
    async fn test_declined_charge_names_failing_instance() {
        let (engine, _, payments) = engine();
        payments.set_failing(true);
        let mut doc = make_doc(vec![
            ActionTemplate::task("approve", "Approve"),
            ActionTemplate::new("publish", ActionKind::Release, "Publish issue")
                .with_complete_on(completed("approve"))
                .with_release_requirement(ReleaseRequirement {
                    slug: "issue-12".into(),
                    fee_cents: Some(2500),
                }),
        ]);
        instantiate(&engine, &mut doc).await;
        let approve = only_instance_of(&doc, "approve");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &approve, ActionStatus::Completed, None, None).unwrap();

        let publish = only_instance_of(&doc, "publish");
        let err = engine.cascade(&mut doc, &approve).await.unwrap_err();
        match err {
            ActionError::TriggeredAction { instance, source } => {
                assert_eq!(instance, publish);
                assert!(matches!(*source, ActionError::ExternalCollaborator(_)));
            }
            other => panic!("expected TriggeredAction, got {other}"),
        }
        // The failed target never completed; the origin is untouched
        assert_eq!(doc.instance(&publish).unwrap().status, ActionStatus::Active);
        assert_eq!(doc.instance(&approve).unwrap().status, ActionStatus::Completed);
    }

    #[tokio::test]
    async fn test_endorsed_target_survives_failed_completion() {
        let (engine, _, payments) = engine();
        payments.set_failing(true);
        let mut doc = make_doc(vec![
            ActionTemplate::new("publish", ActionKind::Release, "Publish")
                .with_complete_on(TriggerPredicate::Endorsed {
                    template: TemplateId::new("publish"),
                })
                .with_release_requirement(ReleaseRequirement {
                    slug: "issue-12".into(),
                    fee_cents: Some(2500),
                }),
            ActionTemplate::new("vouch", ActionKind::Endorse, "Vouch")
                .with_activate_on(staged("publish")),
        ]);
        instantiate(&engine, &mut doc).await;
        let publish = only_instance_of(&doc, "publish");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &publish, ActionStatus::Staged, None, None).unwrap();
        engine.cascade(&mut doc, &publish).await.unwrap();

        let vouch = only_instance_of(&doc, "vouch");
        machine.apply(&mut doc, &vouch, ActionStatus::Completed, None, None).unwrap();
        let err = engine.cascade(&mut doc, &vouch).await.unwrap_err();
        assert!(matches!(err, ActionError::TriggeredAction { .. }));

        // The endorsement itself survives the failed completion, so a
        // later retry does not need the endorser again
        assert_eq!(doc.instance(&publish).unwrap().status, ActionStatus::Endorsed);
        payments.set_failing(false);
        let effects = engine.settle(&mut doc).await.unwrap();
        assert!(effects.contains(&CascadeEffect::Completed(publish.clone())));
    }

    #[tokio::test]
    async fn test_canceled_origin_expands_no_children() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![ActionTemplate::task("stage", "Stage")
            .with_child(ActionTemplate::task("draft", "Draft"))]);
        instantiate(&engine, &mut doc).await;
        let stage = only_instance_of(&doc, "stage");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &stage, ActionStatus::Canceled, None, None).unwrap();

        let effects = engine.cascade(&mut doc, &stage).await.unwrap();
        assert!(effects.is_empty());
        assert!(doc.instances_of(&TemplateId::new("draft")).is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_activates_watching_sibling() {
        let (engine, _, _) = engine();
        let mut doc = make_doc(vec![
            ActionTemplate::task("draft", "Draft"),
            ActionTemplate::task("cleanup", "Clean up").with_activate_on(
                TriggerPredicate::StatusReached {
                    template: TemplateId::new("draft"),
                    status: ActionStatus::Canceled,
                },
            ),
        ]);
        instantiate(&engine, &mut doc).await;
        let draft = only_instance_of(&doc, "draft");
        let cleanup = only_instance_of(&doc, "cleanup");
        assert_eq!(doc.instance(&cleanup).unwrap().status, ActionStatus::Potential);

        let machine = StateMachine::new();
        machine.apply(&mut doc, &draft, ActionStatus::Canceled, None, None).unwrap();
        let effects = engine.cascade(&mut doc, &draft).await.unwrap();

        // The cancellation fires no consequences of its own, but the
        // sibling watching for it activates, attributed to the origin
        assert_eq!(effects, vec![CascadeEffect::Activated(cleanup.clone())]);
        assert_eq!(doc.instance(&cleanup).unwrap().status, ActionStatus::Active);
        let record = doc.transitions.last().unwrap();
        assert_eq!(record.triggered_by, Some(draft));
    }

    #[tokio::test]
    async fn test_cascaded_release_respects_slug_lock() {
        let dispatcher = Arc::new(RecordingDispatcher::new());
        let payments = Arc::new(FlakyPaymentGateway::new());
        let locks = Arc::new(InMemoryLockManager::new());
        let engine = TriggerEngine::new(dispatcher, payments.clone(), locks.clone())
            .with_lock_bounds(Duration::from_secs(30), Duration::from_millis(50));
        let mut doc = make_doc(vec![
            ActionTemplate::task("approve", "Approve"),
            ActionTemplate::new("publish", ActionKind::Release, "Publish issue")
                .with_complete_on(completed("approve"))
                .with_release_requirement(ReleaseRequirement {
                    slug: "issue-12".into(),
                    fee_cents: Some(2500),
                }),
        ]);
        instantiate(&engine, &mut doc).await;
        let approve = only_instance_of(&doc, "approve");
        let machine = StateMachine::new();
        machine.apply(&mut doc, &approve, ActionStatus::Completed, None, None).unwrap();

        let held = locks
            .acquire(
                &LockKey::for_release("issue-12"),
                Duration::from_secs(30),
                Duration::from_millis(50),
            )
            .await
            .unwrap();

        let publish = only_instance_of(&doc, "publish");
        let err = engine.cascade(&mut doc, &approve).await.unwrap_err();
        match err {
            ActionError::TriggeredAction { instance, source } => {
                assert_eq!(instance, publish);
                assert!(matches!(*source, ActionError::Locked { .. }));
            }
            other => panic!("expected TriggeredAction, got {other}"),
        }
        // Neither charged nor completed while the slug was held
        assert!(payments.charged().is_empty());
        assert_eq!(doc.instance(&publish).unwrap().status, ActionStatus::Active);

        locks.release(held).await;
        let effects = engine.settle(&mut doc).await.unwrap();
        assert!(effects.contains(&CascadeEffect::Completed(publish)));
        assert_eq!(payments.charged().len(), 1);
    }
}
