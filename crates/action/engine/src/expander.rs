//! Template expander: instantiates blueprint nodes as live instances
//!
//! Expansion is deterministic and idempotent: an instance is keyed by
//! `(template, scope, instance, cycle)` and never created twice.
//! Hierarchical identifiers are assigned depth-first — stages get an
//! integer in activation order, children get `<parent>.<childIndex>`,
//! fan-out siblings get a trailing repetition index.

use action_types::{
    ActionError, ActionInstance, ActionResult, ActionStatus, ActionTemplate, BranchTarget,
    InstanceId, QuestionInstance, ReviewInstance, ScopeDocument, TemplateId,
};
use tracing::debug;

/// Expands action templates into persisted instances
#[derive(Clone, Copy, Debug, Default)]
pub struct TemplateExpander;

impl TemplateExpander {
    pub fn new() -> Self {
        Self
    }

    /// Instantiate the initial stage set of a fresh scope: every
    /// top-level template with no outstanding requirements.
    pub fn instantiate_scope(&self, doc: &mut ScopeDocument) -> Vec<InstanceId> {
        self.expand_ready(doc)
    }

    /// Expand everything newly unlocked: top-level stages whose
    /// requirements now hold, and children of completed parents.
    /// Safe to call repeatedly; existing coordinates are skipped.
    pub fn expand_ready(&self, doc: &mut ScopeDocument) -> Vec<InstanceId> {
        let mut created = Vec::new();

        // Top-level stages activate in declaration order.
        let stage_templates = doc.templates.clone();
        for template in &stage_templates {
            if doc.at_coordinate(&template.id, 0, 0).is_some() {
                continue;
            }
            if !self.requirements_met(doc, template, 0) {
                continue;
            }
            let base = doc.allocate_stage().to_string();
            created.extend(self.create_instances(doc, template, &base, 0, None));
        }

        // Children expand once their parent instance completes.
        let completed: Vec<(InstanceId, TemplateId, String, u32)> = doc
            .instances
            .iter()
            .filter(|i| i.status == ActionStatus::Completed)
            .map(|i| {
                (
                    i.id.clone(),
                    i.instance_of.clone(),
                    i.identifier.clone(),
                    i.cycle,
                )
            })
            .collect();

        for (parent_id, template_id, parent_identifier, cycle) in completed {
            let Some(template) = doc.find_template(&template_id).cloned() else {
                continue;
            };
            for (index, child) in template.potential_actions.iter().enumerate() {
                if !self.requirements_met(doc, child, cycle) {
                    continue;
                }
                let base = format!("{parent_identifier}.{index}");
                created.extend(self.create_instances(
                    doc,
                    child,
                    &base,
                    cycle,
                    Some(parent_id.clone()),
                ));
            }
        }

        created
    }

    /// Expand the result branch selected by a completed decision.
    /// Unselected branches remain templates, never instantiated.
    pub fn expand_branch(
        &self,
        doc: &mut ScopeDocument,
        decision_id: &InstanceId,
        key: &str,
    ) -> ActionResult<Vec<InstanceId>> {
        let decision = doc
            .instance(decision_id)
            .ok_or_else(|| ActionError::InstanceNotFound(decision_id.clone()))?;
        let decision_identifier = decision.identifier.clone();
        let decision_cycle = decision.cycle;
        let decision_template_id = decision.instance_of.clone();

        let template = doc
            .find_template(&decision_template_id)
            .ok_or_else(|| ActionError::TemplateNotFound(decision_template_id.clone()))?
            .clone();
        let branch = template
            .potential_results
            .iter()
            .find(|b| b.key == key)
            .ok_or_else(|| {
                ActionError::Validation(format!(
                    "decision '{decision_template_id}' has no result branch '{key}'"
                ))
            })?;

        let child_offset = template.potential_actions.len();
        let mut created = Vec::new();
        for (index, target) in branch.targets.iter().enumerate() {
            match target {
                BranchTarget::Template(inline) => {
                    let base = format!("{decision_identifier}.{}", child_offset + index);
                    created.extend(self.create_instances(
                        doc,
                        inline,
                        &base,
                        decision_cycle,
                        Some(decision_id.clone()),
                    ));
                }
                BranchTarget::BackReference(target_id) => {
                    created.extend(self.reenter(doc, target_id, decision_id)?);
                }
            }
        }
        Ok(created)
    }

    /// Re-enter an earlier template coordinate at `cycle + 1`. The
    /// identifier prefix is preserved; prior-cycle instances are left
    /// untouched as immutable history.
    fn reenter(
        &self,
        doc: &mut ScopeDocument,
        target_id: &TemplateId,
        decision_id: &InstanceId,
    ) -> ActionResult<Vec<InstanceId>> {
        let template = doc
            .find_template(target_id)
            .ok_or_else(|| ActionError::TemplateNotFound(target_id.clone()))?
            .clone();

        let next_cycle = doc
            .highest_cycle(target_id, 0)
            .map(|c| c + 1)
            .unwrap_or(0);

        let base = match self.identifier_base(doc, &template) {
            Some(base) => base,
            // A back-reference normally points at an already-run
            // template; a top-level target that never ran gets a
            // fresh stage number.
            None if doc.templates.iter().any(|t| t.id == *target_id) => {
                doc.allocate_stage().to_string()
            }
            None => {
                return Err(ActionError::Validation(format!(
                    "back-reference target '{target_id}' has never been instantiated"
                )))
            }
        };

        debug!(template = %target_id, cycle = next_cycle, "re-entering template coordinate");
        Ok(self.create_instances(doc, &template, &base, next_cycle, Some(decision_id.clone())))
    }

    /// Create one extra fan-out repetition at an explicit index past
    /// `min_instances`, up to the template's `max_instances`. At least
    /// one sibling must already exist at the cycle; its identifier
    /// base and producer carry over.
    pub fn expand_repetition(
        &self,
        doc: &mut ScopeDocument,
        template_id: &TemplateId,
        index: u32,
        cycle: u32,
    ) -> ActionResult<InstanceId> {
        let template = doc
            .find_template(template_id)
            .ok_or_else(|| ActionError::TemplateNotFound(template_id.clone()))?
            .clone();
        if !template.fans_out() || index >= template.max_instances {
            return Err(ActionError::Validation(format!(
                "template '{template_id}' allows at most {} repetitions",
                template.max_instances
            )));
        }
        if doc.at_coordinate(template_id, index, cycle).is_some() {
            return Err(ActionError::Validation(format!(
                "repetition {index} of '{template_id}' already exists at cycle {cycle}"
            )));
        }
        let sibling = doc
            .instances
            .iter()
            .filter(|i| &i.instance_of == template_id && i.cycle == cycle)
            .min_by_key(|i| i.instance)
            .ok_or_else(|| {
                ActionError::Validation(format!(
                    "template '{template_id}' has no expanded repetition at cycle {cycle}"
                ))
            })?;
        let result_of = sibling.result_of.clone();
        let base = sibling
            .identifier
            .rsplit_once('.')
            .map(|(b, _)| b.to_string())
            .unwrap_or_else(|| sibling.identifier.clone());

        Ok(self.create_one(doc, &template, &base, index, cycle, result_of))
    }

    // ── Internal helpers ─────────────────────────────────────────────

    /// Whether every `requires_completion_of` target has a completed
    /// instance at the observing cycle (falling back to any cycle when
    /// the coordinate has not been re-entered).
    fn requirements_met(&self, doc: &ScopeDocument, template: &ActionTemplate, cycle: u32) -> bool {
        template.requires_completion_of.iter().all(|required| {
            let of_template = doc.instances_of(required);
            let at_cycle: Vec<_> = of_template.iter().filter(|i| i.cycle == cycle).collect();
            if at_cycle.is_empty() {
                of_template
                    .iter()
                    .any(|i| i.status == ActionStatus::Completed)
            } else {
                at_cycle.iter().any(|i| i.status == ActionStatus::Completed)
            }
        })
    }

    /// Create the template's fan-out set at distinct instance indices,
    /// skipping coordinates that already exist.
    fn create_instances(
        &self,
        doc: &mut ScopeDocument,
        template: &ActionTemplate,
        base_identifier: &str,
        cycle: u32,
        result_of: Option<InstanceId>,
    ) -> Vec<InstanceId> {
        let mut created = Vec::new();
        for index in 0..template.min_instances {
            if doc.at_coordinate(&template.id, index, cycle).is_some() {
                continue;
            }
            created.push(self.create_one(
                doc,
                template,
                base_identifier,
                index,
                cycle,
                result_of.clone(),
            ));
        }
        created
    }

    fn create_one(
        &self,
        doc: &mut ScopeDocument,
        template: &ActionTemplate,
        base_identifier: &str,
        index: u32,
        cycle: u32,
        result_of: Option<InstanceId>,
    ) -> InstanceId {
        let identifier = if template.fans_out() {
            format!("{base_identifier}.{index}")
        } else {
            base_identifier.to_string()
        };

        let mut instance = ActionInstance::new(template.id.clone(), doc.id.clone(), identifier)
            .with_coordinates(index, cycle);
        if let Some(producer) = result_of {
            instance = instance.with_result_of(producer);
        }
        // Sub-collections are cloned per instance so fan-out
        // siblings never share mutable sub-objects.
        instance.questions = template
            .questions
            .iter()
            .map(|q| QuestionInstance {
                id: q.id.clone(),
                prompt: q.prompt.clone(),
                answer: None,
                answered_at: None,
            })
            .collect();
        instance.reviews = template
            .reviews
            .iter()
            .map(|r| ReviewInstance {
                id: r.id.clone(),
                description: r.description.clone(),
                verdict: None,
                resolved_at: None,
            })
            .collect();

        debug!(
            template = %template.id,
            identifier = %instance.display_identifier(),
            instance = index,
            cycle,
            "instantiated action"
        );
        let id = instance.id.clone();
        doc.instances.push(instance);
        id
    }

    /// The identifier base a template's instances were created under,
    /// if any exist. Fan-out identifiers carry a trailing repetition
    /// index that is not part of the base.
    fn identifier_base(&self, doc: &ScopeDocument, template: &ActionTemplate) -> Option<String> {
        let earliest = doc
            .instances
            .iter()
            .filter(|i| i.instance_of == template.id && i.instance == 0)
            .min_by_key(|i| i.cycle)?;
        if template.fans_out() {
            earliest
                .identifier
                .rsplit_once('.')
                .map(|(base, _)| base.to_string())
        } else {
            Some(earliest.identifier.clone())
        }
    }
}
