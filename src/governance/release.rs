//! Release coordinator
//!
//! Folds released proposals into an in-memory view of one live role. Nothing
//! here touches storage; the orchestrator persists the final [`LiveRole`] once.

use crate::error::AppError;
use crate::governance::models::{Proposal, ProposalAction, ProposalSubject, Role};
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// The live role as seen by one orchestrator call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveRole {
    /// No live row exists and none was released in this call
    Unborn,
    /// Loaded from storage; `dirty` once a release changed it
    Existing { role: Role, dirty: bool },
    /// Instantiated by a released Create in this call
    Created(Role),
    /// Removed by a released Delete in this call
    Removed(Uuid),
}

impl From<Option<Role>> for LiveRole {
    fn from(role: Option<Role>) -> Self {
        match role {
            Some(role) => LiveRole::Existing { role, dirty: false },
            None => LiveRole::Unborn,
        }
    }
}

impl LiveRole {
    pub fn role(&self) -> Option<&Role> {
        match self {
            LiveRole::Existing { role, .. } | LiveRole::Created(role) => Some(role),
            LiveRole::Unborn | LiveRole::Removed(_) => None,
        }
    }

    fn role_mut(&mut self) -> Option<&mut Role> {
        match self {
            LiveRole::Existing { role, dirty } => {
                *dirty = true;
                Some(role)
            }
            LiveRole::Created(role) => Some(role),
            LiveRole::Unborn | LiveRole::Removed(_) => None,
        }
    }
}

/// Apply `proposal` to `live` if, and only if, it is released
pub fn apply_if_released(live: LiveRole, proposal: &Proposal) -> Result<LiveRole, AppError> {
    if !proposal.is_released() {
        return Ok(live);
    }

    debug!("RELEASE {} {}", proposal.action, proposal.key());

    match &proposal.subject {
        ProposalSubject::Role {
            role_id,
            name,
            description,
            sub_realm_id,
        } => match proposal.action {
            ProposalAction::Create => {
                if let Some(existing) = live.role() {
                    return Err(AppError::InvalidStateTransition(format!(
                        "Role '{}' is already live",
                        existing.id
                    )));
                }
                let now = Utc::now();
                Ok(LiveRole::Created(Role {
                    id: *role_id,
                    name: name.clone(),
                    description: description.clone(),
                    sub_realm_id: *sub_realm_id,
                    function_ids: BTreeSet::new(),
                    child_role_ids: BTreeSet::new(),
                    changed_by: proposal.actor,
                    created_at: now,
                    updated_at: now,
                }))
            }
            ProposalAction::Modify => {
                let mut live = live;
                let role = live
                    .role_mut()
                    .filter(|role| role.id == *role_id)
                    .ok_or_else(|| {
                        AppError::NotFound(format!("Role with ID '{}' not found.", role_id))
                    })?;
                role.name = name.clone();
                role.description = description.clone();
                touch(role, proposal.actor);
                Ok(live)
            }
            ProposalAction::Delete => match live {
                LiveRole::Existing { role, .. } if role.id == *role_id => {
                    Ok(LiveRole::Removed(role.id))
                }
                LiveRole::Created(role) if role.id == *role_id => Ok(LiveRole::Unborn),
                _ => Err(AppError::NotFound(format!(
                    "Role with ID '{}' not found.",
                    role_id
                ))),
            },
        },
        ProposalSubject::RoleFunction {
            role_id,
            function_id,
        } => apply_relation(live, proposal, *role_id, |role| &mut role.function_ids, *function_id),
        ProposalSubject::RoleChildRole {
            parent_role_id,
            child_role_id,
        } => apply_relation(
            live,
            proposal,
            *parent_role_id,
            |role| &mut role.child_role_ids,
            *child_role_id,
        ),
    }
}

fn apply_relation(
    mut live: LiveRole,
    proposal: &Proposal,
    role_id: Uuid,
    links: impl FnOnce(&mut Role) -> &mut BTreeSet<Uuid>,
    linked_id: Uuid,
) -> Result<LiveRole, AppError> {
    let role = live
        .role_mut()
        .filter(|role| role.id == role_id)
        .ok_or_else(|| {
            AppError::InvalidStateTransition(format!(
                "Cannot release {} before role '{}' is live",
                proposal.key(),
                role_id
            ))
        })?;

    match proposal.action {
        ProposalAction::Create => {
            links(role).insert(linked_id);
        }
        ProposalAction::Delete => {
            links(role).remove(&linked_id);
        }
        ProposalAction::Modify => {}
    }
    touch(role, proposal.actor);
    Ok(live)
}

fn touch(role: &mut Role, actor: Uuid) {
    role.changed_by = actor;
    role.updated_at = Utc::now();
}
