//! Template tree validation
//!
//! Validation runs once at authoring time, before a scope is
//! instantiated from the tree. It catches trees that are structurally
//! well-formed but semantically wrong: duplicate ids, dangling
//! references, impossible cardinalities.

use crate::{
    ActionError, ActionKind, ActionResult, ActionTemplate, BranchTarget, TemplateId,
    TriggerPredicate,
};
use std::collections::HashSet;

/// Validate a template tree for semantic correctness
pub fn validate(templates: &[ActionTemplate]) -> ActionResult<()> {
    validate_non_empty(templates)?;
    let declared = validate_unique_ids(templates)?;
    validate_cardinality(templates)?;
    validate_requirements(templates, &declared)?;
    validate_branches(templates, &declared)?;
    validate_predicates(templates, &declared)?;
    Ok(())
}

fn for_each<'a>(templates: &'a [ActionTemplate], f: &mut impl FnMut(&'a ActionTemplate)) {
    for template in templates {
        f(template);
        for_each(&template.potential_actions, f);
        for branch in &template.potential_results {
            for target in &branch.targets {
                if let BranchTarget::Template(inner) = target {
                    f(inner);
                    for_each(&inner.potential_actions, f);
                }
            }
        }
    }
}

fn validate_non_empty(templates: &[ActionTemplate]) -> ActionResult<()> {
    if templates.is_empty() {
        return Err(ActionError::Validation(
            "a workflow must declare at least one stage template".into(),
        ));
    }
    Ok(())
}

fn validate_unique_ids(templates: &[ActionTemplate]) -> ActionResult<HashSet<TemplateId>> {
    let mut declared = HashSet::new();
    let mut duplicate = None;
    for_each(templates, &mut |t| {
        if !declared.insert(t.id.clone()) && duplicate.is_none() {
            duplicate = Some(t.id.clone());
        }
    });
    if let Some(id) = duplicate {
        return Err(ActionError::Validation(format!(
            "duplicate template id '{id}'"
        )));
    }
    Ok(declared)
}

fn validate_cardinality(templates: &[ActionTemplate]) -> ActionResult<()> {
    let mut bad = None;
    for_each(templates, &mut |t| {
        if bad.is_none() && (t.min_instances == 0 || t.min_instances > t.max_instances) {
            bad = Some((t.id.clone(), t.min_instances, t.max_instances));
        }
    });
    if let Some((id, min, max)) = bad {
        return Err(ActionError::Validation(format!(
            "template '{id}' has impossible cardinality [{min}, {max}]"
        )));
    }
    Ok(())
}

fn validate_requirements(
    templates: &[ActionTemplate],
    declared: &HashSet<TemplateId>,
) -> ActionResult<()> {
    let mut dangling = None;
    for_each(templates, &mut |t| {
        for required in &t.requires_completion_of {
            if dangling.is_none() && !declared.contains(required) {
                dangling = Some((t.id.clone(), required.clone()));
            }
        }
    });
    if let Some((id, required)) = dangling {
        return Err(ActionError::Validation(format!(
            "template '{id}' requires completion of undeclared template '{required}'"
        )));
    }
    Ok(())
}

fn validate_branches(
    templates: &[ActionTemplate],
    declared: &HashSet<TemplateId>,
) -> ActionResult<()> {
    let mut problem = None;
    for_each(templates, &mut |t| {
        if problem.is_some() {
            return;
        }
        if t.kind == ActionKind::Decide && t.potential_results.is_empty() {
            problem = Some(format!(
                "decision template '{}' declares no result branches",
                t.id
            ));
            return;
        }
        if t.kind != ActionKind::Decide && !t.potential_results.is_empty() {
            problem = Some(format!(
                "template '{}' declares result branches but is not a decision",
                t.id
            ));
            return;
        }
        for branch in &t.potential_results {
            for target in &branch.targets {
                if let BranchTarget::BackReference(target_id) = target {
                    if !declared.contains(target_id) {
                        problem = Some(format!(
                            "template '{}' branch '{}' back-references undeclared template '{}'",
                            t.id, branch.key, target_id
                        ));
                    }
                }
            }
        }
    });
    match problem {
        Some(message) => Err(ActionError::Validation(message)),
        None => Ok(()),
    }
}

fn predicate_targets<'a>(predicate: &'a TriggerPredicate, out: &mut Vec<&'a TemplateId>) {
    match predicate {
        TriggerPredicate::StatusReached { template, .. }
        | TriggerPredicate::Endorsed { template } => out.push(template),
        TriggerPredicate::AllOf { predicates } | TriggerPredicate::AnyOf { predicates } => {
            for p in predicates {
                predicate_targets(p, out);
            }
        }
    }
}

fn validate_predicates(
    templates: &[ActionTemplate],
    declared: &HashSet<TemplateId>,
) -> ActionResult<()> {
    let mut dangling = None;
    for_each(templates, &mut |t| {
        let mut targets = Vec::new();
        if let Some(p) = &t.activate_on {
            predicate_targets(p, &mut targets);
        }
        if let Some(p) = &t.complete_on {
            predicate_targets(p, &mut targets);
        }
        for target in targets {
            if dangling.is_none() && !declared.contains(target) {
                dangling = Some((t.id.clone(), target.clone()));
            }
        }
        // An endorsement's targets are the templates its activate_on
        // watches; without one it would endorse nothing.
        if dangling.is_none() && t.kind == ActionKind::Endorse && t.activate_on.is_none() {
            dangling = Some((t.id.clone(), t.id.clone()));
        }
    });
    if let Some((id, target)) = dangling {
        if id == target {
            return Err(ActionError::Validation(format!(
                "endorse template '{id}' declares no activate_on predicate naming its target"
            )));
        }
        return Err(ActionError::Validation(format!(
            "template '{id}' trigger targets undeclared template '{target}'"
        )));
    }
    Ok(())
}
