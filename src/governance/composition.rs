//! Role composition engine
//!
//! Diffs a submitted role against the live relation sets and opens one
//! proposal per changed relation, enforcing the reference and nesting rules on
//! every relation being added. Those rules are checked again on release.

use crate::error::AppError;
use crate::governance::models::{
    Proposal, ProposalAction, ProposalBundle, ProposalSubject, RoleSubmit, SubjectKey,
};
use crate::governance::release::{apply_if_released, LiveRole};
use crate::governance::state_machine::{self, open_proposal};
use crate::store::GovernanceStore;
use std::collections::BTreeSet;
use tracing::debug;
use uuid::Uuid;

/// Result of comparing a submitted id list with a live id set
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationDiff {
    /// The deduplicated submitted set
    pub desired: BTreeSet<Uuid>,
    /// Ids desired but not live
    pub added: Vec<Uuid>,
    /// Ids live but no longer desired
    pub removed: Vec<Uuid>,
}

impl RelationDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Diff `submitted` against `live`. Both output lists are in id order.
pub fn diff_ids(live: &BTreeSet<Uuid>, submitted: &[Uuid]) -> RelationDiff {
    let desired: BTreeSet<Uuid> = submitted.iter().copied().collect();
    let added = desired.difference(live).copied().collect();
    let removed = live.difference(&desired).copied().collect();

    RelationDiff {
        desired,
        added,
        removed,
    }
}

/// Reject `name` if a role other than `except` holds it, live or in an open
/// create or modify proposal
pub async fn ensure_name_available<S: GovernanceStore>(
    store: &S,
    session: &mut S::Session,
    name: &str,
    except: Option<Uuid>,
) -> Result<(), AppError> {
    if let Some(existing) = store.fetch_role_by_name(session, name).await? {
        if Some(existing.id) != except {
            return Err(AppError::NotProcessable(format!(
                "Role with Name '{}' already exist.",
                name
            )));
        }
    }

    let claimants: BTreeSet<Uuid> = store
        .fetch_role_transients_named(session, name)
        .await?
        .iter()
        .map(|row| row.subject.role_id())
        .filter(|role_id| Some(*role_id) != except)
        .collect();
    for role_id in claimants {
        let rows = store.fetch_transients(session, SubjectKey::Role(role_id)).await?;
        let pending = open_proposal(&rows).filter(|open| {
            open.action != ProposalAction::Delete
                && matches!(&open.subject, ProposalSubject::Role { name: held, .. } if held == name)
        });
        if pending.is_some() {
            return Err(AppError::NotProcessable(format!(
                "Role name '{}' is held by a pending proposal for role '{}'",
                name, role_id
            )));
        }
    }
    Ok(())
}

/// Ledger rows for `key`, rejecting a key that still has an open proposal.
/// Holds the subject's lock for the rest of the session.
pub async fn ensure_no_open_proposal<S: GovernanceStore>(
    store: &S,
    session: &mut S::Session,
    key: SubjectKey,
) -> Result<Vec<Proposal>, AppError> {
    store.lock_subject(session, key).await?;
    let rows = store.fetch_transients(session, key).await?;
    if let Some(open) = open_proposal(&rows) {
        return Err(AppError::NotProcessable(format!(
            "A {} proposal for {} is still {}",
            open.action, key, open.state
        )));
    }
    Ok(rows)
}

/// Opens relation proposals on behalf of one role
pub struct Composer<'a, S: GovernanceStore> {
    store: &'a S,
    role_id: Uuid,
    sub_realm_id: Option<Uuid>,
    actor: Uuid,
    required_approvals: u32,
}

impl<'a, S: GovernanceStore> Composer<'a, S> {
    pub fn new(
        store: &'a S,
        role_id: Uuid,
        sub_realm_id: Option<Uuid>,
        actor: Uuid,
        required_approvals: u32,
    ) -> Self {
        Self {
            store,
            role_id,
            sub_realm_id,
            actor,
            required_approvals,
        }
    }

    /// Open proposals for every function and child role that differs between
    /// the live sets and `submit`, folding releases into `live`.
    pub async fn compose(
        &self,
        session: &mut S::Session,
        live_function_ids: &BTreeSet<Uuid>,
        live_child_role_ids: &BTreeSet<Uuid>,
        submit: &RoleSubmit,
        mut live: LiveRole,
        bundle: &mut ProposalBundle,
    ) -> Result<LiveRole, AppError> {
        let functions = diff_ids(live_function_ids, &submit.function_ids);
        let child_roles = diff_ids(live_child_role_ids, &submit.child_role_ids);

        if functions.is_empty() && child_roles.is_empty() {
            debug!("Role {} relations unchanged", self.role_id);
            return Ok(live);
        }
        debug!(
            "Composing role {}: {} functions (+{} -{}), {} child roles (+{} -{})",
            self.role_id,
            functions.desired.len(),
            functions.added.len(),
            functions.removed.len(),
            child_roles.desired.len(),
            child_roles.added.len(),
            child_roles.removed.len()
        );

        for function_id in functions.added {
            let subject = self.function_subject(function_id);
            let rows = ensure_no_open_proposal(self.store, session, subject.key()).await?;
            self.check_function(session, function_id).await?;
            live = self
                .open(session, rows, subject, ProposalAction::Create, live, bundle)
                .await?;
        }
        for function_id in functions.removed {
            let subject = self.function_subject(function_id);
            let rows = ensure_no_open_proposal(self.store, session, subject.key()).await?;
            live = self
                .open(session, rows, subject, ProposalAction::Delete, live, bundle)
                .await?;
        }

        if !child_roles.added.is_empty() {
            self.check_not_nested(session).await?;
        }
        for child_role_id in child_roles.added {
            let subject = self.child_role_subject(child_role_id);
            let rows = ensure_no_open_proposal(self.store, session, subject.key()).await?;
            self.check_child_role(session, child_role_id).await?;
            live = self
                .open(session, rows, subject, ProposalAction::Create, live, bundle)
                .await?;
        }
        for child_role_id in child_roles.removed {
            let subject = self.child_role_subject(child_role_id);
            let rows = ensure_no_open_proposal(self.store, session, subject.key()).await?;
            live = self
                .open(session, rows, subject, ProposalAction::Delete, live, bundle)
                .await?;
        }

        Ok(live)
    }

    fn function_subject(&self, function_id: Uuid) -> ProposalSubject {
        ProposalSubject::RoleFunction {
            role_id: self.role_id,
            function_id,
        }
    }

    fn child_role_subject(&self, child_role_id: Uuid) -> ProposalSubject {
        ProposalSubject::RoleChildRole {
            parent_role_id: self.role_id,
            child_role_id,
        }
    }

    /// Re-run the reference checks of a relation that is about to be
    /// released. Targets that disappeared since capture are `NotProcessable`.
    pub async fn verify_release(
        &self,
        session: &mut S::Session,
        proposal: &Proposal,
    ) -> Result<(), AppError> {
        if !proposal.is_released() || proposal.action != ProposalAction::Create {
            return Ok(());
        }

        let checked = match &proposal.subject {
            ProposalSubject::RoleFunction { function_id, .. } => {
                self.check_function(session, *function_id).await
            }
            ProposalSubject::RoleChildRole { child_role_id, .. } => {
                match self.check_not_nested(session).await {
                    Ok(()) => self.check_child_role(session, *child_role_id).await,
                    Err(e) => Err(e),
                }
            }
            ProposalSubject::Role { .. } => Ok(()),
        };

        checked.map_err(|e| match e {
            AppError::NotFound(msg) => {
                AppError::NotProcessable(format!("Cannot release {}: {}", proposal.key(), msg))
            }
            other => other,
        })
    }

    /// A role that is itself a child cannot take children
    async fn check_not_nested(&self, session: &mut S::Session) -> Result<(), AppError> {
        let parents = self.store.fetch_parent_role_ids(session, self.role_id).await?;
        match parents.first() {
            Some(parent_id) => Err(AppError::NotProcessable(format!(
                "Role '{}' is a child of role '{}' and cannot hold child roles",
                self.role_id, parent_id
            ))),
            None => Ok(()),
        }
    }

    async fn check_function(&self, session: &mut S::Session, function_id: Uuid) -> Result<(), AppError> {
        let function = self
            .store
            .fetch_function(session, function_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Function with ID '{}' not found.", function_id))
            })?;

        if function.sub_realm_id != self.sub_realm_id {
            return Err(AppError::NotProcessable(format!(
                "Function '{}' does not belong to the sub-realm of role '{}'",
                function.name, self.role_id
            )));
        }
        Ok(())
    }

    async fn check_child_role(
        &self,
        session: &mut S::Session,
        child_role_id: Uuid,
    ) -> Result<(), AppError> {
        if child_role_id == self.role_id {
            return Err(AppError::NotProcessable(format!(
                "Role '{}' cannot be composed of itself",
                self.role_id
            )));
        }

        let child = self
            .store
            .fetch_role(session, child_role_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(format!("Child role with ID '{}' not found.", child_role_id))
            })?;

        if child.sub_realm_id != self.sub_realm_id {
            return Err(AppError::NotProcessable(format!(
                "Child role '{}' does not belong to the sub-realm of role '{}'",
                child.name, self.role_id
            )));
        }
        if child.is_compound() {
            return Err(AppError::NotProcessable(format!(
                "Role '{}' has child roles of its own and cannot be nested",
                child.name
            )));
        }
        Ok(())
    }

    async fn open(
        &self,
        session: &mut S::Session,
        rows: Vec<Proposal>,
        subject: ProposalSubject,
        action: ProposalAction,
        live: LiveRole,
        bundle: &mut ProposalBundle,
    ) -> Result<LiveRole, AppError> {
        let proposal = state_machine::capture(
            rows.last(),
            subject,
            action,
            self.actor,
            self.required_approvals,
        )?;
        let proposal = self.store.append_transient(session, proposal).await?;
        let live = apply_if_released(live, &proposal)?;
        bundle.push_relation(proposal);
        Ok(live)
    }
}
