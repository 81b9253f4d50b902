//! Action templates: the immutable blueprint tree of a workflow
//!
//! A template is authored once and never mutated. Live work is tracked by
//! `ActionInstance` records that point back at their template via
//! `instance_of` — an explicit foreign key, not shared inheritance.
//!
//! A template tree may contain back-references: a decision branch that
//! names an earlier template re-enters that template at `cycle + 1`
//! instead of instantiating a fresh subtree.

use crate::{ActionStatus, TemplateId};
use serde::{Deserialize, Serialize};

/// What kind of work an action template describes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ActionKind {
    /// Generic assigned work (write, edit, typeset, ...)
    #[default]
    Task,
    /// Structured review of an object
    Review,
    /// A decision that selects one of several result branches
    Decide,
    /// An endorsement that vouches for another action's completion
    Endorse,
    /// A lightweight acknowledgement, usually auto-completed
    Acknowledge,
    /// Publication of a release; may require a purchase
    Release,
}

/// An abstract audience category, resolved to concrete roles per scope
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Audience(pub String);

impl Audience {
    /// Create an Audience from a known name (e.g. "editor")
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }
}

impl std::fmt::Display for Audience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Names who may see or act on an instance of a template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AudienceSpec {
    /// A concrete role holder, independent of scope bindings
    Role(crate::RoleRef),
    /// An abstract audience, expanded against the scope's bindings
    Audience(Audience),
    /// Every audience currently bound in the scope
    AllAudiences,
}

/// A predicate that fires an automatic status transition on a sibling
/// or descendant instance.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerPredicate {
    /// Satisfied when the named template's instance reaches `status`
    StatusReached {
        template: TemplateId,
        status: ActionStatus,
    },
    /// Satisfied when the named template's instance is endorsed
    Endorsed { template: TemplateId },
    /// Satisfied when every sub-predicate is satisfied
    AllOf { predicates: Vec<TriggerPredicate> },
    /// Satisfied when any sub-predicate is satisfied
    AnyOf { predicates: Vec<TriggerPredicate> },
}

/// One alternative branch of a decision action
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultBranch {
    /// The decision result value that selects this branch
    pub key: String,
    /// Templates expanded when this branch is selected
    pub targets: Vec<BranchTarget>,
}

impl ResultBranch {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            targets: Vec::new(),
        }
    }

    pub fn with_template(mut self, template: ActionTemplate) -> Self {
        self.targets.push(BranchTarget::Template(Box::new(template)));
        self
    }

    pub fn with_back_reference(mut self, template_id: TemplateId) -> Self {
        self.targets.push(BranchTarget::BackReference(template_id));
        self
    }
}

/// Target of a decision branch: a fresh subtree or a re-entry edge
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BranchTarget {
    /// Instantiate this inline sub-template
    Template(Box<ActionTemplate>),
    /// Re-enter an earlier template at the next cycle
    BackReference(TemplateId),
}

/// Declares that completing an instance publishes a named release,
/// optionally charging a fee through the payment collaborator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequirement {
    /// Release slug; guarded by a cross-scope resource lock
    pub slug: String,
    /// Fee in cents, charged synchronously during the completing cascade
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee_cents: Option<u64>,
}

/// Blueprint for a question attached to instances of a template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuestionTemplate {
    pub id: String,
    pub prompt: String,
}

/// Blueprint for a structured review attached to instances of a template
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReviewTemplate {
    pub id: String,
    pub description: String,
}

/// An immutable blueprint node within a workflow specification tree
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTemplate {
    /// Identifier, unique within the template tree
    pub id: TemplateId,
    /// What kind of work this describes
    pub kind: ActionKind,
    /// Human-readable name
    pub name: String,
    /// Who performs the work
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<AudienceSpec>,
    /// Who may see the instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<AudienceSpec>,
    /// Templates whose instances must complete before this one activates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires_completion_of: Vec<TemplateId>,
    /// Ordered child templates, expanded when this instance completes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub potential_actions: Vec<ActionTemplate>,
    /// Alternative branches for decision actions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub potential_results: Vec<ResultBranch>,
    /// Fan-out lower bound (default 1)
    pub min_instances: u32,
    /// Fan-out upper bound (default 1)
    pub max_instances: u32,
    /// Predicate that auto-activates a fresh instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activate_on: Option<TriggerPredicate>,
    /// Predicate that auto-completes an instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_on: Option<TriggerPredicate>,
    /// Release published by completing an instance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub release_requirement: Option<ReleaseRequirement>,
    /// Question blueprints, cloned per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<QuestionTemplate>,
    /// Review blueprints, cloned per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviews: Vec<ReviewTemplate>,
    /// Re-read live audience bindings instead of snapshotting them.
    /// Reserved for stage-starting actions.
    #[serde(default)]
    pub inherit_live_audience: bool,
}

impl ActionTemplate {
    /// Create a template with default cardinality (exactly one instance)
    pub fn new(id: impl Into<String>, kind: ActionKind, name: impl Into<String>) -> Self {
        Self {
            id: TemplateId::new(id),
            kind,
            name: name.into(),
            agent: None,
            participants: Vec::new(),
            requires_completion_of: Vec::new(),
            potential_actions: Vec::new(),
            potential_results: Vec::new(),
            min_instances: 1,
            max_instances: 1,
            activate_on: None,
            complete_on: None,
            release_requirement: None,
            questions: Vec::new(),
            reviews: Vec::new(),
            inherit_live_audience: false,
        }
    }

    /// Shorthand for a generic task template
    pub fn task(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, ActionKind::Task, name)
    }

    /// Shorthand for a decision template
    pub fn decision(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(id, ActionKind::Decide, name)
    }

    pub fn with_agent(mut self, agent: AudienceSpec) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_participant(mut self, spec: AudienceSpec) -> Self {
        self.participants.push(spec);
        self
    }

    pub fn with_requirement(mut self, template_id: TemplateId) -> Self {
        self.requires_completion_of.push(template_id);
        self
    }

    pub fn with_child(mut self, child: ActionTemplate) -> Self {
        self.potential_actions.push(child);
        self
    }

    pub fn with_result_branch(mut self, branch: ResultBranch) -> Self {
        self.potential_results.push(branch);
        self
    }

    pub fn with_fan_out(mut self, min_instances: u32, max_instances: u32) -> Self {
        self.min_instances = min_instances;
        self.max_instances = max_instances;
        self
    }

    pub fn with_activate_on(mut self, predicate: TriggerPredicate) -> Self {
        self.activate_on = Some(predicate);
        self
    }

    pub fn with_complete_on(mut self, predicate: TriggerPredicate) -> Self {
        self.complete_on = Some(predicate);
        self
    }

    pub fn with_release_requirement(mut self, requirement: ReleaseRequirement) -> Self {
        self.release_requirement = Some(requirement);
        self
    }

    pub fn with_question(mut self, id: impl Into<String>, prompt: impl Into<String>) -> Self {
        self.questions.push(QuestionTemplate {
            id: id.into(),
            prompt: prompt.into(),
        });
        self
    }

    pub fn with_review(mut self, id: impl Into<String>, description: impl Into<String>) -> Self {
        self.reviews.push(ReviewTemplate {
            id: id.into(),
            description: description.into(),
        });
        self
    }

    pub fn with_live_audience(mut self) -> Self {
        self.inherit_live_audience = true;
        self
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Whether instances of this template fan out to multiple siblings
    pub fn fans_out(&self) -> bool {
        self.max_instances > 1
    }

    /// Find a template by id anywhere in this subtree (including branches)
    pub fn find(&self, id: &TemplateId) -> Option<&ActionTemplate> {
        if &self.id == id {
            return Some(self);
        }
        for child in &self.potential_actions {
            if let Some(found) = child.find(id) {
                return Some(found);
            }
        }
        for branch in &self.potential_results {
            for target in &branch.targets {
                if let BranchTarget::Template(template) = target {
                    if let Some(found) = template.find(id) {
                        return Some(found);
                    }
                }
            }
        }
        None
    }

    /// Collect every template id declared in this subtree
    pub fn collect_ids(&self, out: &mut Vec<TemplateId>) {
        out.push(self.id.clone());
        for child in &self.potential_actions {
            child.collect_ids(out);
        }
        for branch in &self.potential_results {
            for target in &branch.targets {
                if let BranchTarget::Template(template) = target {
                    template.collect_ids(out);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let template = ActionTemplate::task("draft", "Write draft");
        assert_eq!(template.min_instances, 1);
        assert_eq!(template.max_instances, 1);
        assert!(!template.fans_out());
        assert!(!template.inherit_live_audience);
    }

    #[test]
    fn test_find_in_subtree() {
        let tree = ActionTemplate::task("stage", "Stage")
            .with_child(ActionTemplate::task("draft", "Draft"))
            .with_child(
                ActionTemplate::decision("decide", "Accept?").with_result_branch(
                    ResultBranch::new("revise")
                        .with_template(ActionTemplate::task("revise", "Revise")),
                ),
            );

        assert!(tree.find(&TemplateId::new("draft")).is_some());
        assert!(tree.find(&TemplateId::new("revise")).is_some());
        assert!(tree.find(&TemplateId::new("missing")).is_none());
    }

    #[test]
    fn test_collect_ids_includes_branch_templates() {
        let tree = ActionTemplate::task("stage", "Stage").with_child(
            ActionTemplate::decision("decide", "Accept?").with_result_branch(
                ResultBranch::new("reject")
                    .with_template(ActionTemplate::task("reject", "Reject"))
                    .with_back_reference(TemplateId::new("stage")),
            ),
        );

        let mut ids = Vec::new();
        tree.collect_ids(&mut ids);
        assert_eq!(ids.len(), 3); // stage, decide, reject; back-reference declares nothing
    }

    #[test]
    fn test_serde_round_trip() {
        let template = ActionTemplate::task("review", "Review")
            .with_fan_out(2, 4)
            .with_question("q1", "Is the argument sound?")
            .with_activate_on(TriggerPredicate::StatusReached {
                template: TemplateId::new("draft"),
                status: crate::ActionStatus::Staged,
            });

        let json = serde_json::to_string(&template).unwrap();
        let back: ActionTemplate = serde_json::from_str(&json).unwrap();
        assert_eq!(template, back);
    }
}
