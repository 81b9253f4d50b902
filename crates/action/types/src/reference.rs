//! Symbolic action references
//!
//! A symbolic reference locates an instance that may not exist yet,
//! by template coordinate rather than by id:
//!
//! ```text
//! templateId?scope=S&instance=I&cycle=C[&review=R|&question=Q]
//! ```
//!
//! `scope` is mandatory. `instance` defaults to 0 and is required when
//! the template fans out. An absent `cycle` selects the most recently
//! created instance at the coordinate. Trailing `review`/`question`
//! selectors index into the resolved instance's ordered sub-collections
//! and may be chained to any depth.

use crate::{ActionError, ActionResult, InstanceId, ScopeId, TemplateId};
use serde::{Deserialize, Serialize};

/// Selector into an instance's ordered sub-collections
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubSelector {
    /// The Nth review object (0-based)
    Review(u32),
    /// The Nth question (0-based)
    Question(u32),
}

/// A templated locator for an instance that may not exist yet
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolicReference {
    /// The template whose instance is referenced
    pub template: TemplateId,
    /// The scope searched for instances
    pub scope: ScopeId,
    /// Fan-out repetition; defaults to 0 when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<u32>,
    /// Explicit historical cycle; most recent when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cycle: Option<u32>,
    /// Nested selectors applied to the resolved instance, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub selectors: Vec<SubSelector>,
}

impl SymbolicReference {
    pub fn new(template: TemplateId, scope: ScopeId) -> Self {
        Self {
            template,
            scope,
            instance: None,
            cycle: None,
            selectors: Vec::new(),
        }
    }

    pub fn with_instance(mut self, instance: u32) -> Self {
        self.instance = Some(instance);
        self
    }

    pub fn with_cycle(mut self, cycle: u32) -> Self {
        self.cycle = Some(cycle);
        self
    }

    pub fn with_selector(mut self, selector: SubSelector) -> Self {
        self.selectors.push(selector);
        self
    }

    /// Parse the wire form. The query part requires `scope`; unknown
    /// keys are rejected rather than ignored.
    pub fn parse(input: &str) -> ActionResult<Self> {
        let (template, query) = input.split_once('?').ok_or_else(|| {
            ActionError::Validation(format!(
                "symbolic reference '{input}' is missing its '?' query part"
            ))
        })?;

        if template.is_empty() {
            return Err(ActionError::Validation(
                "symbolic reference has an empty template id".into(),
            ));
        }

        let mut scope = None;
        let mut instance = None;
        let mut cycle = None;
        let mut selectors = Vec::new();

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ActionError::Validation(format!("malformed reference parameter '{pair}'"))
            })?;
            match key {
                "scope" => scope = Some(ScopeId::new(value)),
                "instance" => instance = Some(parse_index(key, value)?),
                "cycle" => cycle = Some(parse_index(key, value)?),
                "review" => selectors.push(SubSelector::Review(parse_index(key, value)?)),
                "question" => selectors.push(SubSelector::Question(parse_index(key, value)?)),
                other => {
                    return Err(ActionError::Validation(format!(
                        "unknown reference parameter '{other}'"
                    )))
                }
            }
        }

        let scope = scope.ok_or_else(|| {
            ActionError::Validation(format!(
                "symbolic reference '{input}' is missing the mandatory scope parameter"
            ))
        })?;

        Ok(Self {
            template: TemplateId::new(template),
            scope,
            instance,
            cycle,
            selectors,
        })
    }
}

fn parse_index(key: &str, value: &str) -> ActionResult<u32> {
    value.parse::<u32>().map_err(|_| {
        ActionError::Validation(format!("reference parameter '{key}={value}' is not a number"))
    })
}

impl std::fmt::Display for SymbolicReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}?scope={}", self.template, self.scope)?;
        if let Some(instance) = self.instance {
            write!(f, "&instance={instance}")?;
        }
        if let Some(cycle) = self.cycle {
            write!(f, "&cycle={cycle}")?;
        }
        for selector in &self.selectors {
            match selector {
                SubSelector::Review(n) => write!(f, "&review={n}")?,
                SubSelector::Question(n) => write!(f, "&question={n}")?,
            }
        }
        Ok(())
    }
}

/// Either a concrete instance id or a symbolic locator
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionReference {
    Concrete(InstanceId),
    Symbolic(SymbolicReference),
}

impl ActionReference {
    /// Parse either form: strings with a query part are symbolic,
    /// everything else is treated as a concrete instance id.
    pub fn parse(input: &str) -> ActionResult<Self> {
        if input.contains('?') {
            Ok(Self::Symbolic(SymbolicReference::parse(input)?))
        } else if input.is_empty() {
            Err(ActionError::Validation("empty action reference".into()))
        } else {
            Ok(Self::Concrete(InstanceId::new(input)))
        }
    }
}

impl std::fmt::Display for ActionReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Concrete(id) => write!(f, "{id}"),
            Self::Symbolic(sym) => write!(f, "{sym}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal() {
        let sym = SymbolicReference::parse("draft?scope=proj-1").unwrap();
        assert_eq!(sym.template, TemplateId::new("draft"));
        assert_eq!(sym.scope, ScopeId::new("proj-1"));
        assert_eq!(sym.instance, None);
        assert_eq!(sym.cycle, None);
        assert!(sym.selectors.is_empty());
    }

    #[test]
    fn test_parse_full() {
        let sym =
            SymbolicReference::parse("review?scope=proj-1&instance=2&cycle=1&review=0&question=3")
                .unwrap();
        assert_eq!(sym.instance, Some(2));
        assert_eq!(sym.cycle, Some(1));
        assert_eq!(
            sym.selectors,
            vec![SubSelector::Review(0), SubSelector::Question(3)]
        );
    }

    #[test]
    fn test_display_round_trip() {
        let sym = SymbolicReference::new(TemplateId::new("review"), ScopeId::new("p"))
            .with_instance(1)
            .with_cycle(2)
            .with_selector(SubSelector::Question(0));
        let parsed = SymbolicReference::parse(&sym.to_string()).unwrap();
        assert_eq!(sym, parsed);
    }

    #[test]
    fn test_missing_scope_rejected() {
        let err = SymbolicReference::parse("draft?instance=0").unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[test]
    fn test_unknown_parameter_rejected() {
        let err = SymbolicReference::parse("draft?scope=p&stage=1").unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[test]
    fn test_non_numeric_index_rejected() {
        let err = SymbolicReference::parse("draft?scope=p&cycle=latest").unwrap_err();
        assert!(matches!(err, ActionError::Validation(_)));
    }

    #[test]
    fn test_action_reference_dispatch() {
        assert!(matches!(
            ActionReference::parse("abc-123").unwrap(),
            ActionReference::Concrete(_)
        ));
        assert!(matches!(
            ActionReference::parse("draft?scope=p").unwrap(),
            ActionReference::Symbolic(_)
        ));
        assert!(ActionReference::parse("").is_err());
    }
}
