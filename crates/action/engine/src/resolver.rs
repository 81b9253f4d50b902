//! Identifier resolver: rewrites symbolic references to concrete instances
//!
//! Resolution is a pure lookup over a scope document — it never
//! instantiates. A reference to an instance the expander has not yet
//! created fails with `ReferenceNotFound`; callers retry after the
//! cascade that creates it has run.

use action_types::{
    ActionError, ActionInstance, ActionReference, ActionResult, QuestionInstance, ReviewInstance,
    ScopeDocument, SubSelector, SymbolicReference,
};
use tracing::debug;

/// Resolves action references against a scope document
#[derive(Clone, Copy, Debug, Default)]
pub struct Resolver;

/// Result of following a reference's selector chain
#[derive(Clone, Copy, Debug)]
pub enum ResolvedNode<'a> {
    Instance(&'a ActionInstance),
    Review(&'a ActionInstance, &'a ReviewInstance),
    Question(&'a ActionInstance, &'a QuestionInstance),
}

impl Resolver {
    pub fn new() -> Self {
        Self
    }

    /// Resolve a reference to its action instance. Concrete ids pass
    /// through unchanged after an existence check.
    pub fn resolve<'a>(
        &self,
        reference: &ActionReference,
        doc: &'a ScopeDocument,
    ) -> ActionResult<&'a ActionInstance> {
        match reference {
            ActionReference::Concrete(id) => doc
                .instance(id)
                .ok_or_else(|| ActionError::InstanceNotFound(id.clone())),
            ActionReference::Symbolic(sym) => self.resolve_symbolic(sym, doc),
        }
    }

    /// Resolve a symbolic reference by template coordinate.
    pub fn resolve_symbolic<'a>(
        &self,
        sym: &SymbolicReference,
        doc: &'a ScopeDocument,
    ) -> ActionResult<&'a ActionInstance> {
        if sym.scope != doc.id {
            return Err(ActionError::Validation(format!(
                "reference scope '{}' does not match document scope '{}'",
                sym.scope, doc.id
            )));
        }
        let template = doc
            .find_template(&sym.template)
            .ok_or_else(|| ActionError::TemplateNotFound(sym.template.clone()))?;

        // The instance coordinate defaults to 0, but a fanned-out
        // template is ambiguous without one.
        let instance_index = match sym.instance {
            Some(index) => index,
            None if template.fans_out() => {
                return Err(ActionError::Validation(format!(
                    "reference '{sym}' needs an instance index: template '{}' allows up to {} repetitions",
                    template.id, template.max_instances
                )))
            }
            None => 0,
        };

        let candidates: Vec<&ActionInstance> = doc
            .instances
            .iter()
            .filter(|i| i.instance_of == sym.template && i.instance == instance_index)
            .collect();

        let matched: Vec<&ActionInstance> = match sym.cycle {
            Some(cycle) => candidates
                .into_iter()
                .filter(|i| i.cycle == cycle)
                .collect(),
            // Absent cycle means "most recently created", which keeps
            // default resolution robust to re-ordering. Equal creation
            // times fall back to the highest cycle.
            None => candidates
                .into_iter()
                .max_by_key(|i| (i.created_at, i.cycle))
                .into_iter()
                .collect(),
        };

        match matched.as_slice() {
            [] => Err(ActionError::ReferenceNotFound(sym.to_string())),
            [single] => {
                debug!(reference = %sym, instance = %single.id, "resolved symbolic reference");
                Ok(single)
            }
            _ => Err(ActionError::AmbiguousReference(format!(
                "{sym} matches {} instances",
                matched.len()
            ))),
        }
    }

    /// Resolve a reference and follow its selector chain into the
    /// instance's ordered sub-collections.
    pub fn resolve_node<'a>(
        &self,
        sym: &SymbolicReference,
        doc: &'a ScopeDocument,
    ) -> ActionResult<ResolvedNode<'a>> {
        let instance = self.resolve_symbolic(sym, doc)?;
        let mut node = ResolvedNode::Instance(instance);
        for selector in &sym.selectors {
            let ResolvedNode::Instance(current) = node else {
                return Err(ActionError::Validation(format!(
                    "reference '{sym}' selects below a leaf sub-object"
                )));
            };
            node = match selector {
                SubSelector::Review(n) => {
                    let review = current.reviews.get(*n as usize).ok_or_else(|| {
                        ActionError::ReferenceNotFound(format!(
                            "{sym}: instance {} has no review {n}",
                            current.id
                        ))
                    })?;
                    ResolvedNode::Review(current, review)
                }
                SubSelector::Question(n) => {
                    let question = current.questions.get(*n as usize).ok_or_else(|| {
                        ActionError::ReferenceNotFound(format!(
                            "{sym}: instance {} has no question {n}",
                            current.id
                        ))
                    })?;
                    ResolvedNode::Question(current, question)
                }
            };
        }
        Ok(node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use action_types::{
        ActionTemplate, InstanceId, QuestionInstance, ScopeId, TemplateId,
    };
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    fn make_doc() -> ScopeDocument {
        ScopeDocument::new(
            ScopeId::new("proj-1"),
            vec![
                ActionTemplate::task("draft", "Draft"),
                ActionTemplate::task("review", "Review").with_fan_out(2, 3),
            ],
            HashMap::new(),
        )
    }

    fn push_instance(
        doc: &mut ScopeDocument,
        template: &str,
        instance: u32,
        cycle: u32,
        age_secs: i64,
    ) -> InstanceId {
        let mut inst = ActionInstance::new(
            TemplateId::new(template),
            doc.id.clone(),
            format!("1.{instance}"),
        )
        .with_coordinates(instance, cycle);
        inst.created_at = Utc::now() - Duration::seconds(age_secs);
        let id = inst.id.clone();
        doc.instances.push(inst);
        id
    }

    #[test]
    fn test_concrete_pass_through() {
        let mut doc = make_doc();
        let id = push_instance(&mut doc, "draft", 0, 0, 0);

        let resolver = Resolver::new();
        let found = resolver
            .resolve(&ActionReference::Concrete(id.clone()), &doc)
            .unwrap();
        assert_eq!(found.id, id);

        let missing = resolver.resolve(
            &ActionReference::Concrete(InstanceId::new("nope")),
            &doc,
        );
        assert!(matches!(missing, Err(ActionError::InstanceNotFound(_))));
    }

    #[test]
    fn test_not_found_before_expansion() {
        let doc = make_doc();
        let sym = SymbolicReference::parse("draft?scope=proj-1").unwrap();
        let err = Resolver::new().resolve_symbolic(&sym, &doc).unwrap_err();
        assert!(matches!(err, ActionError::ReferenceNotFound(_)));
    }

    #[test]
    fn test_instance_index_required_for_fan_out() {
        let mut doc = make_doc();
        push_instance(&mut doc, "review", 0, 0, 0);

        let sym = SymbolicReference::parse("review?scope=proj-1").unwrap();
        let err = Resolver::new().resolve_symbolic(&sym, &doc).unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));

        let sym = SymbolicReference::parse("review?scope=proj-1&instance=0").unwrap();
        assert!(Resolver::new().resolve_symbolic(&sym, &doc).is_ok());
    }

    #[test]
    fn test_default_cycle_is_most_recently_created() {
        let mut doc = make_doc();
        push_instance(&mut doc, "draft", 0, 0, 100);
        let newest = push_instance(&mut doc, "draft", 0, 2, 10);
        push_instance(&mut doc, "draft", 0, 1, 50);

        let sym = SymbolicReference::parse("draft?scope=proj-1").unwrap();
        let found = Resolver::new().resolve_symbolic(&sym, &doc).unwrap();
        assert_eq!(found.id, newest);
    }

    #[test]
    fn test_explicit_cycle_selects_history() {
        let mut doc = make_doc();
        let oldest = push_instance(&mut doc, "draft", 0, 0, 100);
        push_instance(&mut doc, "draft", 0, 1, 10);

        let sym = SymbolicReference::parse("draft?scope=proj-1&cycle=0").unwrap();
        let found = Resolver::new().resolve_symbolic(&sym, &doc).unwrap();
        assert_eq!(found.id, oldest);
    }

    #[test]
    fn test_resolution_is_idempotent() {
        let mut doc = make_doc();
        push_instance(&mut doc, "draft", 0, 0, 100);
        push_instance(&mut doc, "draft", 0, 1, 10);

        let sym = SymbolicReference::parse("draft?scope=proj-1").unwrap();
        let resolver = Resolver::new();
        let first = resolver.resolve_symbolic(&sym, &doc).unwrap().id.clone();
        let second = resolver.resolve_symbolic(&sym, &doc).unwrap().id.clone();
        assert_eq!(first, second);
    }

    #[test]
    fn test_duplicate_coordinate_is_ambiguous() {
        let mut doc = make_doc();
        push_instance(&mut doc, "draft", 0, 1, 10);
        push_instance(&mut doc, "draft", 0, 1, 10);

        let sym = SymbolicReference::parse("draft?scope=proj-1&cycle=1").unwrap();
        let err = Resolver::new().resolve_symbolic(&sym, &doc).unwrap_err();
        assert!(matches!(err, ActionError::AmbiguousReference(_)));
    }

    #[test]
    fn test_wrong_scope_rejected() {
        let doc = make_doc();
        let sym = SymbolicReference::parse("draft?scope=other").unwrap();
        let err = Resolver::new().resolve_symbolic(&sym, &doc).unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[test]
    fn test_selector_chain() {
        let mut doc = make_doc();
        push_instance(&mut doc, "draft", 0, 0, 0);
        doc.instances[0].questions.push(QuestionInstance {
            id: "q1".into(),
            prompt: "Sound?".into(),
            answer: None,
            answered_at: None,
        });

        let resolver = Resolver::new();
        let sym = SymbolicReference::parse("draft?scope=proj-1&question=0").unwrap();
        match resolver.resolve_node(&sym, &doc).unwrap() {
            ResolvedNode::Question(_, q) => assert_eq!(q.id, "q1"),
            other => panic!("expected question node, got {other:?}"),
        }

        let sym = SymbolicReference::parse("draft?scope=proj-1&review=0").unwrap();
        assert!(matches!(
            resolver.resolve_node(&sym, &doc),
            Err(ActionError::ReferenceNotFound(_))
        ));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            /// Default-cycle resolution always picks the most recently
            /// created instance, regardless of the order instances were
            /// appended to the document.
            #[test]
            fn default_cycle_picks_most_recent(ages in proptest::collection::vec(0i64..1_000_000, 1..12)) {
                let mut doc = make_doc();
                for (cycle, age) in ages.iter().enumerate() {
                    push_instance(&mut doc, "draft", 0, cycle as u32, *age);
                }

                let expected = doc
                    .instances
                    .iter()
                    .max_by_key(|i| (i.created_at, i.cycle))
                    .unwrap()
                    .id
                    .clone();

                let sym = SymbolicReference::parse("draft?scope=proj-1").unwrap();
                let resolver = Resolver::new();
                let first = resolver.resolve_symbolic(&sym, &doc).unwrap().id.clone();
                let second = resolver.resolve_symbolic(&sym, &doc).unwrap().id.clone();

                prop_assert_eq!(&first, &second);
                prop_assert_eq!(first, expected);
            }
        }
    }
}
