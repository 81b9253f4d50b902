//! Audience calculation: who may see and act on each instance
//!
//! Participant grants are expanded from a template's audience specs
//! against an explicit [`ScopeContext`] snapshot, never against ambient
//! bindings. The snapshot taken at instantiation is what the instance
//! keeps; only templates marked `inherit_live_audience` are re-expanded
//! when the scope's bindings change. Grants are append-only with soft
//! termination, so finished instances keep the audience that was
//! correct when they ran.

use action_types::{
    ActionError, ActionResult, ActionTemplate, AudienceSpec, InstanceId, ParticipantEntry,
    RoleRef, ScopeContext, ScopeDocument,
};
use chrono::Utc;
use tracing::debug;

/// Expands audience specs into participant grants
#[derive(Clone, Copy, Debug, Default)]
pub struct AudienceCalculator;

impl AudienceCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Expand a template's participant specs against a binding snapshot.
    /// Duplicate roles keep their first grant only.
    pub fn participants_for(
        &self,
        template: &ActionTemplate,
        ctx: &ScopeContext,
    ) -> Vec<ParticipantEntry> {
        let mut entries: Vec<ParticipantEntry> = Vec::new();
        let mut push = |entry: ParticipantEntry| {
            if !entries.iter().any(|e| e.role == entry.role) {
                entries.push(entry);
            }
        };

        for spec in &template.participants {
            match spec {
                AudienceSpec::Role(role) => push(ParticipantEntry::new(role.clone())),
                AudienceSpec::Audience(audience) => {
                    for role in ctx.binding(audience) {
                        push(ParticipantEntry::from_audience(
                            role.clone(),
                            audience.clone(),
                        ));
                    }
                }
                AudienceSpec::AllAudiences => {
                    for (audience, roles) in &ctx.bindings {
                        for role in roles {
                            push(ParticipantEntry::from_audience(
                                role.clone(),
                                audience.clone(),
                            ));
                        }
                    }
                }
            }
        }
        entries
    }

    /// Pick the agent role for a template: a concrete role spec wins
    /// outright, an audience spec takes its first bound role.
    pub fn agent_for(&self, template: &ActionTemplate, ctx: &ScopeContext) -> Option<RoleRef> {
        match template.agent.as_ref()? {
            AudienceSpec::Role(role) => Some(role.clone()),
            AudienceSpec::Audience(audience) => ctx.binding(audience).first().cloned(),
            AudienceSpec::AllAudiences => None,
        }
    }

    /// Seed agent and participant grants on freshly created instances.
    pub fn seed(&self, doc: &mut ScopeDocument, created: &[InstanceId], ctx: &ScopeContext) {
        for id in created {
            let Some(instance) = doc.instance(id) else {
                continue;
            };
            let Some(template) = doc.find_template(&instance.instance_of).cloned() else {
                continue;
            };
            let agent = self.agent_for(&template, ctx);
            let participants = self.participants_for(&template, ctx);
            if let Some(instance) = doc.instance_mut(id) {
                instance.agent = agent;
                instance.participants = participants;
            }
        }
    }

    /// Re-expand grants on live instances of `inherit_live_audience`
    /// templates after a rebinding. Grants no longer implied are
    /// soft-ended; new roles get fresh grants. Manual grants (no
    /// audience tag) are never touched. Returns how many instances
    /// changed.
    pub fn refresh_live(&self, doc: &mut ScopeDocument) -> usize {
        let ctx = ScopeContext::snapshot_of(doc);
        let live_templates: Vec<_> = {
            let mut ids = Vec::new();
            for template in &doc.templates {
                collect_live(template, &mut ids);
            }
            ids
        };

        let mut touched = 0;
        for index in 0..doc.instances.len() {
            let (template_id, terminal) = {
                let instance = &doc.instances[index];
                (instance.instance_of.clone(), instance.status.is_terminal())
            };
            if terminal || !live_templates.contains(&template_id) {
                continue;
            }
            let Some(template) = doc.find_template(&template_id).cloned() else {
                continue;
            };
            let desired = self.participants_for(&template, &ctx);
            let instance = &mut doc.instances[index];

            let mut changed = false;
            for entry in instance.participants.iter_mut() {
                if entry.is_active()
                    && entry.audience.is_some()
                    && !desired.iter().any(|d| d.role == entry.role)
                {
                    entry.ended_at = Some(Utc::now());
                    changed = true;
                }
            }
            for entry in desired {
                if !instance
                    .participants
                    .iter()
                    .any(|p| p.is_active() && p.role == entry.role)
                {
                    instance.participants.push(entry);
                    changed = true;
                }
            }
            if changed {
                debug!(instance = %instance.id, "refreshed live audience");
                touched += 1;
            }
        }
        touched
    }

    /// Grant a role direct participation on an instance. Idempotent
    /// for roles that already hold an active grant.
    pub fn authorize(
        &self,
        doc: &mut ScopeDocument,
        instance_id: &InstanceId,
        role: RoleRef,
    ) -> ActionResult<()> {
        let instance = doc
            .instance_mut(instance_id)
            .ok_or_else(|| ActionError::InstanceNotFound(instance_id.clone()))?;
        if instance.participants.iter().any(|p| p.is_active() && p.role == role) {
            return Ok(());
        }
        debug!(instance = %instance_id, role = %role, "authorized participant");
        instance.participants.push(ParticipantEntry::new(role));
        Ok(())
    }

    /// Withdraw a role's active grants. The entries are retained with
    /// an `ended_at` marker.
    pub fn deauthorize(
        &self,
        doc: &mut ScopeDocument,
        instance_id: &InstanceId,
        role: &RoleRef,
    ) -> ActionResult<()> {
        let instance = doc
            .instance_mut(instance_id)
            .ok_or_else(|| ActionError::InstanceNotFound(instance_id.clone()))?;
        let now = Utc::now();
        for entry in instance.participants.iter_mut() {
            if entry.is_active() && &entry.role == role {
                entry.ended_at = Some(now);
            }
        }
        Ok(())
    }
}

fn collect_live(template: &ActionTemplate, out: &mut Vec<action_types::TemplateId>) {
    if template.inherit_live_audience {
        out.push(template.id.clone());
    }
    for child in &template.potential_actions {
        collect_live(child, out);
    }
    for branch in &template.potential_results {
        for target in &branch.targets {
            if let action_types::BranchTarget::Template(inner) = target {
                collect_live(inner, out);
            }
        }
    }
}
