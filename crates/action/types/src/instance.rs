//! Action instances: concrete, persisted units of work
//!
//! An instance is created by the template expander when its activation
//! preconditions hold, mutated only through validated status transitions,
//! and never deleted — terminal states are retained for audit. Re-entering
//! a branch creates a *new* instance at the same template coordinate with
//! `cycle + 1`; prior-cycle instances remain immutable history.

use crate::{Audience, InstanceId, RoleRef, ScopeId, TemplateId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an action instance
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ActionStatus {
    /// Created but not yet available to work on
    #[default]
    Potential,
    /// Available and assigned
    Active,
    /// Work submitted, awaiting completion preconditions
    Staged,
    /// Vouched for by an endorser; completion still pending
    Endorsed,
    /// Done
    Completed,
    /// Withdrawn before completion
    Canceled,
    /// Ended in error
    Failed,
}

impl ActionStatus {
    /// Terminal statuses admit no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Failed)
    }
}

impl std::fmt::Display for ActionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Potential => "potential",
            Self::Active => "active",
            Self::Staged => "staged",
            Self::Endorsed => "endorsed",
            Self::Completed => "completed",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// One participant grant on an instance.
///
/// Grants are only ever appended or soft-terminated (an `ended_at`
/// marker), never removed, so completed instances keep the audience
/// that was correct when they ran.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParticipantEntry {
    /// The concrete role holder
    pub role: RoleRef,
    /// The audience this grant was expanded from, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audience: Option<Audience>,
    /// When the grant was made
    pub granted_at: DateTime<Utc>,
    /// Set when the grant is withdrawn; the entry itself is retained
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl ParticipantEntry {
    pub fn new(role: RoleRef) -> Self {
        Self {
            role,
            audience: None,
            granted_at: Utc::now(),
            ended_at: None,
        }
    }

    pub fn from_audience(role: RoleRef, audience: Audience) -> Self {
        Self {
            audience: Some(audience),
            ..Self::new(role)
        }
    }

    /// Whether the grant is still in force
    pub fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// A question attached to one instance, cloned from its template
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuestionInstance {
    pub id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<DateTime<Utc>>,
}

impl QuestionInstance {
    pub fn is_answered(&self) -> bool {
        self.answer.is_some()
    }

    pub fn answer(&mut self, text: impl Into<String>) {
        self.answer = Some(text.into());
        self.answered_at = Some(Utc::now());
    }
}

/// A structured review attached to one instance
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReviewInstance {
    pub id: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verdict: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
}

impl ReviewInstance {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn resolve(&mut self, verdict: impl Into<String>) {
        self.verdict = Some(verdict.into());
        self.resolved_at = Some(Utc::now());
    }
}

/// A concrete, persisted unit of work within a scope
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionInstance {
    /// Stable identifier
    pub id: InstanceId,
    /// The blueprint this was instantiated from
    pub instance_of: TemplateId,
    /// The scope that owns this instance
    pub scope_id: ScopeId,
    /// Hierarchical identifier in stage.branch.index form, e.g. "1.0.1".
    /// Stable across cycles; see [`ActionInstance::display_identifier`].
    pub identifier: String,
    /// Lifecycle status
    pub status: ActionStatus,
    /// The role performing the work, if assigned
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<RoleRef>,
    /// Who may see and act on this instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub participants: Vec<ParticipantEntry>,
    /// The instance whose completion produced this one, for fan-out audit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_of: Option<InstanceId>,
    /// Which fan-out repetition this is (0-based)
    pub instance: u32,
    /// How many times the enclosing branch has been re-entered
    pub cycle: u32,
    /// Result payload recorded at completion (e.g. a decision value)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// Questions cloned per instance so fan-out siblings never share state
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub questions: Vec<QuestionInstance>,
    /// Reviews cloned per instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reviews: Vec<ReviewInstance>,
    /// When the instance was created
    pub created_at: DateTime<Utc>,
    /// Last status change
    pub updated_at: DateTime<Utc>,
}

impl ActionInstance {
    /// Create a Potential instance at the given template coordinate
    pub fn new(
        instance_of: TemplateId,
        scope_id: ScopeId,
        identifier: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            instance_of,
            scope_id,
            identifier: identifier.into(),
            status: ActionStatus::Potential,
            agent: None,
            participants: Vec::new(),
            result_of: None,
            instance: 0,
            cycle: 0,
            result: None,
            questions: Vec::new(),
            reviews: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_agent(mut self, agent: RoleRef) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_coordinates(mut self, instance: u32, cycle: u32) -> Self {
        self.instance = instance;
        self.cycle = cycle;
        self
    }

    pub fn with_result_of(mut self, producer: InstanceId) -> Self {
        self.result_of = Some(producer);
        self
    }

    // ── Query methods ────────────────────────────────────────────────

    /// Presentation identifier: the hierarchical identifier, suffixed
    /// with the cycle when the branch has been re-entered.
    pub fn display_identifier(&self) -> String {
        if self.cycle == 0 {
            self.identifier.clone()
        } else {
            format!("{}#{}", self.identifier, self.cycle)
        }
    }

    /// The uniqueness coordinate: at most one persisted instance may
    /// exist per `(instance_of, scope_id, instance, cycle)`.
    pub fn coordinate(&self) -> (&TemplateId, &ScopeId, u32, u32) {
        (&self.instance_of, &self.scope_id, self.instance, self.cycle)
    }

    /// Whether every question has an answer
    pub fn questions_answered(&self) -> bool {
        self.questions.iter().all(QuestionInstance::is_answered)
    }

    /// Whether every review is resolved
    pub fn reviews_resolved(&self) -> bool {
        self.reviews.iter().all(ReviewInstance::is_resolved)
    }

    /// Completion preconditions: nested reviews and questions done
    pub fn completion_preconditions_met(&self) -> bool {
        self.questions_answered() && self.reviews_resolved()
    }

    /// Whether the given role currently participates in this instance
    pub fn is_visible_to(&self, role: &RoleRef) -> bool {
        self.agent.as_ref() == Some(role)
            || self
                .participants
                .iter()
                .any(|p| p.is_active() && &p.role == role)
    }

    /// Active participant roles
    pub fn active_participants(&self) -> Vec<&RoleRef> {
        self.participants
            .iter()
            .filter(|p| p.is_active())
            .map(|p| &p.role)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance() -> ActionInstance {
        ActionInstance::new(
            TemplateId::new("draft"),
            ScopeId::new("proj-1"),
            "1.0",
        )
    }

    #[test]
    fn test_display_identifier_cycle_suffix() {
        let mut inst = make_instance();
        assert_eq!(inst.display_identifier(), "1.0");
        inst.cycle = 2;
        assert_eq!(inst.display_identifier(), "1.0#2");
        assert_eq!(inst.identifier, "1.0"); // underlying identifier preserved
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ActionStatus::Completed.is_terminal());
        assert!(ActionStatus::Canceled.is_terminal());
        assert!(ActionStatus::Failed.is_terminal());
        assert!(!ActionStatus::Endorsed.is_terminal());
        assert!(!ActionStatus::Staged.is_terminal());
    }

    #[test]
    fn test_participant_soft_termination() {
        let mut inst = make_instance();
        inst.participants.push(ParticipantEntry::new(RoleRef::new("ed-1")));
        assert!(inst.is_visible_to(&RoleRef::new("ed-1")));

        inst.participants[0].ended_at = Some(Utc::now());
        assert!(!inst.is_visible_to(&RoleRef::new("ed-1")));
        // The entry is retained for audit
        assert_eq!(inst.participants.len(), 1);
    }

    #[test]
    fn test_completion_preconditions() {
        let mut inst = make_instance();
        inst.questions.push(QuestionInstance {
            id: "q1".into(),
            prompt: "Sound?".into(),
            answer: None,
            answered_at: None,
        });
        inst.reviews.push(ReviewInstance {
            id: "r1".into(),
            description: "Copy edit".into(),
            verdict: None,
            resolved_at: None,
        });
        assert!(!inst.completion_preconditions_met());

        inst.questions[0].answer("Yes");
        assert!(!inst.completion_preconditions_met());

        inst.reviews[0].resolve("approve");
        assert!(inst.completion_preconditions_met());
    }

    #[test]
    fn test_agent_is_visible() {
        let inst = make_instance().with_agent(RoleRef::new("author-1"));
        assert!(inst.is_visible_to(&RoleRef::new("author-1")));
        assert!(!inst.is_visible_to(&RoleRef::new("other")));
    }
}
