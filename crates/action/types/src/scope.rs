//! Scopes: the enclosing unit of work that owns an action tree
//!
//! A scope document is the unit of mutation. It is read, modified, and
//! written back as one logical value under the scope lock, so a
//! transition either fully commits or not at all.
//!
//! Audience bindings are never read from ambient state; computations
//! receive an explicit [`ScopeContext`] snapshot.

use crate::{
    ActionInstance, ActionStatus, ActionTemplate, Audience, InstanceId, RoleRef, ScopeId,
    TemplateId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of the scope itself, rolled up from its stage instances
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ScopeStatus {
    /// No work instantiated yet
    #[default]
    Draft,
    /// At least one live action instance exists
    InProgress,
    /// Every instance has reached a terminal status
    Closed,
}

/// One entry of the append-only transition audit trail
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// The instance that changed
    pub instance: InstanceId,
    pub from: ActionStatus,
    pub to: ActionStatus,
    /// The actor who requested the change, if externally requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<RoleRef>,
    /// The instance whose trigger caused this change, if cascaded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub triggered_by: Option<InstanceId>,
    pub at: DateTime<Utc>,
}

/// The persisted document owning one scope's action tree
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScopeDocument {
    pub id: ScopeId,
    pub status: ScopeStatus,
    /// The immutable template tree this scope was instantiated from.
    /// Top-level entries are stages.
    pub templates: Vec<ActionTemplate>,
    /// Current audience bindings: which roles hold each audience
    pub role_bindings: HashMap<Audience, Vec<RoleRef>>,
    /// Every instance ever created in this scope; never pruned
    pub instances: Vec<ActionInstance>,
    /// Next top-level stage number to allocate (1-based)
    pub next_stage: u32,
    /// Append-only status transition audit trail
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScopeDocument {
    /// Create an empty scope over a template tree
    pub fn new(
        id: ScopeId,
        templates: Vec<ActionTemplate>,
        role_bindings: HashMap<Audience, Vec<RoleRef>>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: ScopeStatus::Draft,
            templates,
            role_bindings,
            instances: Vec::new(),
            next_stage: 1,
            transitions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Allocate the next top-level stage number
    pub fn allocate_stage(&mut self) -> u32 {
        let stage = self.next_stage;
        self.next_stage += 1;
        stage
    }

    /// Find a template anywhere in the scope's tree
    pub fn find_template(&self, id: &TemplateId) -> Option<&ActionTemplate> {
        self.templates.iter().find_map(|t| t.find(id))
    }

    /// Look up an instance by id
    pub fn instance(&self, id: &InstanceId) -> Option<&ActionInstance> {
        self.instances.iter().find(|i| &i.id == id)
    }

    /// Look up an instance by id, mutably
    pub fn instance_mut(&mut self, id: &InstanceId) -> Option<&mut ActionInstance> {
        self.instances.iter_mut().find(|i| &i.id == id)
    }

    /// All instances of a template, in creation order
    pub fn instances_of(&self, template_id: &TemplateId) -> Vec<&ActionInstance> {
        self.instances
            .iter()
            .filter(|i| &i.instance_of == template_id)
            .collect()
    }

    /// The instance at an exact template coordinate, if it exists
    pub fn at_coordinate(
        &self,
        template_id: &TemplateId,
        instance: u32,
        cycle: u32,
    ) -> Option<&ActionInstance> {
        self.instances.iter().find(|i| {
            &i.instance_of == template_id && i.instance == instance && i.cycle == cycle
        })
    }

    /// Highest cycle seen at a template coordinate, if any instance exists
    pub fn highest_cycle(&self, template_id: &TemplateId, instance: u32) -> Option<u32> {
        self.instances
            .iter()
            .filter(|i| &i.instance_of == template_id && i.instance == instance)
            .map(|i| i.cycle)
            .max()
    }

    /// Roles currently bound to an audience
    pub fn bindings_for(&self, audience: &Audience) -> &[RoleRef] {
        self.role_bindings
            .get(audience)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Append a transition record to the audit trail
    pub fn record_transition(&mut self, record: TransitionRecord) {
        self.updated_at = record.at;
        self.transitions.push(record);
    }

    /// Recompute the rolled-up scope status from the instance set
    pub fn refresh_status(&mut self) {
        self.status = if self.instances.is_empty() {
            ScopeStatus::Draft
        } else if self.instances.iter().all(|i| i.status.is_terminal()) {
            ScopeStatus::Closed
        } else {
            ScopeStatus::InProgress
        };
    }
}

/// An explicit snapshot of a scope's audience bindings, passed into
/// every participant computation instead of ambient state.
#[derive(Clone, Debug)]
pub struct ScopeContext {
    pub scope_id: ScopeId,
    pub bindings: HashMap<Audience, Vec<RoleRef>>,
}

impl ScopeContext {
    /// Snapshot the current bindings of a scope document
    pub fn snapshot_of(doc: &ScopeDocument) -> Self {
        Self {
            scope_id: doc.id.clone(),
            bindings: doc.role_bindings.clone(),
        }
    }

    /// Roles bound to an audience in this snapshot
    pub fn binding(&self, audience: &Audience) -> &[RoleRef] {
        self.bindings
            .get(audience)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Every role bound to any audience, deduplicated
    pub fn all_roles(&self) -> Vec<RoleRef> {
        let mut roles: Vec<RoleRef> = self.bindings.values().flatten().cloned().collect();
        roles.sort_by(|a, b| a.0.cmp(&b.0));
        roles.dedup();
        roles
    }
}
