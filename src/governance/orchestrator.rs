//! Governance orchestrator
//!
//! The facade every caller goes through. Each operation runs inside one store
//! session: it commits when the operation succeeds and rolls back otherwise,
//! returning the error that caused it.

use crate::error::AppError;
use crate::governance::composition::{ensure_name_available, ensure_no_open_proposal, Composer};
use crate::governance::models::{
    Proposal, ProposalAction, ProposalBundle, ProposalSubject, Role, RoleSubmit, RoleTransients,
    SubjectKey,
};
use crate::governance::release::{apply_if_released, LiveRole};
use crate::governance::state_machine::{self, current_wave, has_approved};
use crate::store::GovernanceStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

/// Maker-checker workflow over the role graph
pub struct RoleGovernance<S: GovernanceStore> {
    store: Arc<S>,
}

impl<S: GovernanceStore> Clone for RoleGovernance<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: GovernanceStore> RoleGovernance<S> {
    pub fn new(store: S) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    #[cfg(test)]
    pub fn store(&self) -> &S {
        &self.store
    }

    // =========================================================================
    // OPERATIONS
    // =========================================================================

    /// Propose a new role with its functions and child roles
    pub async fn create(
        &self,
        submit: RoleSubmit,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        info!("Proposing role '{}' (threshold {})", submit.name, required_approvals);
        let mut session = self.store.begin().await?;
        let result = self
            .create_in(&mut session, &submit, actor, required_approvals)
            .await;
        self.finish(session, result).await
    }

    /// Propose changes to an existing role
    pub async fn update(
        &self,
        role_id: Uuid,
        submit: RoleSubmit,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        info!("Proposing update of role {} (threshold {})", role_id, required_approvals);
        let mut session = self.store.begin().await?;
        let result = self
            .update_in(&mut session, role_id, &submit, actor, required_approvals)
            .await;
        self.finish(session, result).await
    }

    /// Propose removal of a role
    pub async fn delete(
        &self,
        role_id: Uuid,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        info!("Proposing deletion of role {} (threshold {})", role_id, required_approvals);
        let mut session = self.store.begin().await?;
        let result = self
            .delete_in(&mut session, role_id, actor, required_approvals)
            .await;
        self.finish(session, result).await
    }

    /// Approve the open proposal of a role and every relation opened with it
    pub async fn approve(
        &self,
        role_id: Uuid,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        info!("Approving role {} by {}", role_id, actor);
        let mut session = self.store.begin().await?;
        let result = self
            .approve_in(&mut session, role_id, actor, required_approvals)
            .await;
        self.finish(session, result).await
    }

    /// Decline the open proposal of a role and every relation opened with it
    pub async fn decline(&self, role_id: Uuid, actor: Uuid) -> Result<ProposalBundle, AppError> {
        info!("Declining role {} by {}", role_id, actor);
        let mut session = self.store.begin().await?;
        let result = self.decline_in(&mut session, role_id, actor).await;
        self.finish(session, result).await
    }

    /// Rows a reviewer must evaluate for the current wave of a role
    pub async fn latest_transients(&self, role_id: Uuid) -> Result<RoleTransients, AppError> {
        let mut session = self.store.begin().await?;
        let result = self.latest_transients_in(&mut session, role_id).await;
        self.finish(session, result).await
    }

    pub async fn get_role(&self, role_id: Uuid) -> Result<Role, AppError> {
        let mut session = self.store.begin().await?;
        let result = self
            .store
            .fetch_role(&mut session, role_id)
            .await
            .and_then(|role| role.ok_or_else(|| role_not_found(role_id)));
        self.finish(session, result).await
    }

    pub async fn list_roles(&self) -> Result<Vec<Role>, AppError> {
        let mut session = self.store.begin().await?;
        let result = self.store.list_roles(&mut session).await;
        self.finish(session, result).await
    }

    // =========================================================================
    // SESSION BOUNDARY
    // =========================================================================

    async fn finish<T>(
        &self,
        session: S::Session,
        result: Result<T, AppError>,
    ) -> Result<T, AppError> {
        match result {
            Ok(value) => {
                self.store.commit(session).await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_error) = self.store.rollback(session).await {
                    error!("Rollback failed after '{}': {}", e, rollback_error);
                }
                Err(e)
            }
        }
    }

    async fn persist(&self, session: &mut S::Session, live: LiveRole) -> Result<(), AppError> {
        match live {
            LiveRole::Created(role) => self.store.create_role(session, &role).await,
            LiveRole::Existing { role, dirty: true } => self.store.update_role(session, &role).await,
            LiveRole::Removed(role_id) => self.store.delete_role(session, role_id).await,
            LiveRole::Existing { dirty: false, .. } | LiveRole::Unborn => Ok(()),
        }
    }

    // =========================================================================
    // OPERATION BODIES
    // =========================================================================

    async fn create_in(
        &self,
        session: &mut S::Session,
        submit: &RoleSubmit,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        let store = self.store.as_ref();

        ensure_name_available(store, session, &submit.name, None).await?;
        if let Some(sub_realm_id) = submit.sub_realm_id {
            store
                .fetch_sub_realm(session, sub_realm_id)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(format!("SubRealm with ID '{}' not found.", sub_realm_id))
                })?;
        }

        let role_id = Uuid::new_v4();
        let subject = ProposalSubject::Role {
            role_id,
            name: submit.name.clone(),
            description: submit.description.clone(),
            sub_realm_id: submit.sub_realm_id,
        };
        let proposal = state_machine::capture(
            None,
            subject,
            ProposalAction::Create,
            actor,
            required_approvals,
        )?;
        let proposal = store.append_transient(session, proposal).await?;
        let live = apply_if_released(LiveRole::Unborn, &proposal)?;

        let mut bundle = ProposalBundle::new(proposal);
        let live = Composer::new(store, role_id, submit.sub_realm_id, actor, required_approvals)
            .compose(
                session,
                &BTreeSet::new(),
                &BTreeSet::new(),
                submit,
                live,
                &mut bundle,
            )
            .await?;

        self.persist(session, live).await?;
        info!("Role {} proposed: {}", role_id, bundle.role.state);
        Ok(bundle)
    }

    async fn update_in(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
        submit: &RoleSubmit,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        let store = self.store.as_ref();

        let rows = ensure_no_open_proposal(store, session, SubjectKey::Role(role_id)).await?;
        let role = store
            .fetch_role(session, role_id)
            .await?
            .ok_or_else(|| role_not_found(role_id))?;
        if submit.name != role.name {
            ensure_name_available(store, session, &submit.name, Some(role_id)).await?;
        }

        let subject = ProposalSubject::Role {
            role_id,
            name: submit.name.clone(),
            description: submit.description.clone(),
            sub_realm_id: role.sub_realm_id,
        };
        let proposal = state_machine::capture(
            rows.last(),
            subject,
            ProposalAction::Modify,
            actor,
            required_approvals,
        )?;
        let proposal = store.append_transient(session, proposal).await?;

        let live_function_ids = role.function_ids.clone();
        let live_child_role_ids = role.child_role_ids.clone();
        let sub_realm_id = role.sub_realm_id;
        let live = apply_if_released(LiveRole::from(Some(role)), &proposal)?;

        let mut bundle = ProposalBundle::new(proposal);
        let live = Composer::new(store, role_id, sub_realm_id, actor, required_approvals)
            .compose(
                session,
                &live_function_ids,
                &live_child_role_ids,
                submit,
                live,
                &mut bundle,
            )
            .await?;

        self.persist(session, live).await?;
        Ok(bundle)
    }

    async fn delete_in(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        let store = self.store.as_ref();

        let rows = ensure_no_open_proposal(store, session, SubjectKey::Role(role_id)).await?;
        let role = store
            .fetch_role(session, role_id)
            .await?
            .ok_or_else(|| role_not_found(role_id))?;

        let subject = ProposalSubject::Role {
            role_id,
            name: role.name.clone(),
            description: role.description.clone(),
            sub_realm_id: role.sub_realm_id,
        };
        let proposal = state_machine::capture(
            rows.last(),
            subject,
            ProposalAction::Delete,
            actor,
            required_approvals,
        )?;
        let proposal = store.append_transient(session, proposal).await?;

        let live = apply_if_released(LiveRole::from(Some(role)), &proposal)?;
        self.persist(session, live).await?;
        Ok(ProposalBundle::new(proposal))
    }

    async fn approve_in(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
        actor: Uuid,
        required_approvals: u32,
    ) -> Result<ProposalBundle, AppError> {
        let store = self.store.as_ref();

        store.lock_subject(session, SubjectKey::Role(role_id)).await?;
        let rows = self.role_rows(session, role_id).await?;
        let wave = current_wave(&rows);
        if has_approved(wave, actor) {
            return Err(AppError::NotProcessable(format!(
                "Principal '{}' has already approved role '{}' in this round",
                actor, role_id
            )));
        }

        let relations = self.relation_wave(session, role_id, wave).await?;
        let latest = wave_latest(wave, role_id)?;
        if latest.is_released() {
            return Ok(bundle_of(latest.clone(), relations.into_values()));
        }

        let approved = state_machine::approve(latest, actor, required_approvals)?;
        let approved = store.append_transient(session, approved).await?;

        let live = LiveRole::from(store.fetch_role(session, role_id).await?);
        let mut live = apply_if_released(live, &approved)?;

        let mut bundle = ProposalBundle::new(approved);
        for relation in relations.into_values() {
            if relation.is_terminal() {
                bundle.push_relation(relation);
                continue;
            }
            let advanced = state_machine::approve(&relation, actor, required_approvals)?;
            if let Some(sub_realm_id) = live.role().map(|role| role.sub_realm_id) {
                Composer::new(store, role_id, sub_realm_id, actor, required_approvals)
                    .verify_release(session, &advanced)
                    .await?;
            }
            let advanced = store.append_transient(session, advanced).await?;
            live = apply_if_released(live, &advanced)?;
            bundle.push_relation(advanced);
        }

        self.persist(session, live).await?;
        info!("Role {} approval recorded: {}", role_id, bundle.role.state);
        Ok(bundle)
    }

    async fn decline_in(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
        actor: Uuid,
    ) -> Result<ProposalBundle, AppError> {
        let store = self.store.as_ref();

        store.lock_subject(session, SubjectKey::Role(role_id)).await?;
        let rows = self.role_rows(session, role_id).await?;
        let wave = current_wave(&rows);
        let relations = self.relation_wave(session, role_id, wave).await?;
        let latest = wave_latest(wave, role_id)?;
        if latest.is_released() {
            return Ok(bundle_of(latest.clone(), relations.into_values()));
        }

        let declined = state_machine::decline(latest, actor)?;
        let declined = store.append_transient(session, declined).await?;

        let mut bundle = ProposalBundle::new(declined);
        for relation in relations.into_values() {
            if relation.is_terminal() {
                bundle.push_relation(relation);
                continue;
            }
            let declined = state_machine::decline(&relation, actor)?;
            bundle.push_relation(store.append_transient(session, declined).await?);
        }

        Ok(bundle)
    }

    async fn latest_transients_in(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
    ) -> Result<RoleTransients, AppError> {
        let rows = self.role_rows(session, role_id).await?;
        let wave = current_wave(&rows);
        let wave_start = wave.first().map_or(0, |row| row.sequence);

        let mut transients = RoleTransients {
            role: wave.to_vec(),
            ..RoleTransients::default()
        };
        for row in self
            .store
            .fetch_relation_transients(session, role_id)
            .await?
            .into_iter()
            .filter(|row| row.sequence >= wave_start)
        {
            match row.key() {
                SubjectKey::RoleChildRole(..) => transients.child_roles.push(row),
                _ => transients.functions.push(row),
            }
        }
        Ok(transients)
    }

    // =========================================================================
    // HELPERS
    // =========================================================================

    async fn role_rows(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
    ) -> Result<Vec<Proposal>, AppError> {
        let rows = self
            .store
            .fetch_transients(session, SubjectKey::Role(role_id))
            .await?;
        if rows.is_empty() {
            return Err(AppError::NotFound(format!(
                "No proposals found for role '{}'",
                role_id
            )));
        }
        Ok(rows)
    }

    /// Latest row per relation key opened since the role wave began
    async fn relation_wave(
        &self,
        session: &mut S::Session,
        role_id: Uuid,
        wave: &[Proposal],
    ) -> Result<BTreeMap<SubjectKey, Proposal>, AppError> {
        let wave_start = wave.first().map_or(0, |row| row.sequence);
        let mut latest = BTreeMap::new();
        for row in self
            .store
            .fetch_relation_transients(session, role_id)
            .await?
            .into_iter()
            .filter(|row| row.sequence >= wave_start)
        {
            latest.insert(row.key(), row);
        }
        Ok(latest)
    }
}

fn role_not_found(role_id: Uuid) -> AppError {
    AppError::NotFound(format!("Role with ID '{}' not found.", role_id))
}

fn wave_latest(wave: &[Proposal], role_id: Uuid) -> Result<&Proposal, AppError> {
    wave.last().ok_or_else(|| {
        AppError::NotFound(format!("No proposals found for role '{}'", role_id))
    })
}

fn bundle_of(role: Proposal, relations: impl IntoIterator<Item = Proposal>) -> ProposalBundle {
    let mut bundle = ProposalBundle::new(role);
    for relation in relations {
        bundle.push_relation(relation);
    }
    bundle
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::models::{Function, ProposalState, SubRealm};
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    struct Fixture {
        governance: RoleGovernance<MemoryStore>,
        maker: Uuid,
        checker: Uuid,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                governance: RoleGovernance::new(MemoryStore::new()),
                maker: Uuid::new_v4(),
                checker: Uuid::new_v4(),
            }
        }

        async fn function(&self, name: &str, sub_realm_id: Option<Uuid>) -> Uuid {
            let id = Uuid::new_v4();
            self.governance
                .store()
                .insert_function(Function {
                    id,
                    name: name.to_string(),
                    sub_realm_id,
                })
                .await;
            id
        }

        async fn sub_realm(&self, name: &str) -> Uuid {
            let id = Uuid::new_v4();
            self.governance
                .store()
                .insert_sub_realm(SubRealm {
                    id,
                    name: name.to_string(),
                })
                .await;
            id
        }

        /// Creates a live role with a zero threshold
        async fn live_role(&self, name: &str, child_role_ids: Vec<Uuid>) -> Uuid {
            let bundle = self
                .governance
                .create(submit(name, vec![], child_role_ids), self.maker, 0)
                .await
                .unwrap();
            bundle.role.subject.role_id()
        }
    }

    fn submit(name: &str, function_ids: Vec<Uuid>, child_role_ids: Vec<Uuid>) -> RoleSubmit {
        RoleSubmit {
            name: name.to_string(),
            description: format!("{} role", name),
            sub_realm_id: None,
            function_ids,
            child_role_ids,
        }
    }

    #[tokio::test]
    async fn test_zero_threshold_create_is_live_immediately() {
        let fx = Fixture::new();
        let f1 = fx.function("F1", None).await;

        let bundle = fx
            .governance
            .create(submit("R1", vec![f1], vec![]), fx.maker, 0)
            .await
            .unwrap();

        assert_eq!(bundle.role.state, ProposalState::Released);
        assert_eq!(bundle.functions.len(), 1);
        assert_eq!(bundle.functions[0].state, ProposalState::Released);

        let role = fx.governance.get_role(bundle.role.subject.role_id()).await.unwrap();
        assert_eq!(role.name, "R1");
        assert_eq!(role.function_ids, BTreeSet::from([f1]));
        assert_eq!(role.changed_by, fx.maker);
    }

    #[tokio::test]
    async fn test_single_approval_releases_role_and_functions() {
        let fx = Fixture::new();
        let f2 = fx.function("F2", None).await;

        let bundle = fx
            .governance
            .create(submit("R2", vec![f2], vec![]), fx.maker, 1)
            .await
            .unwrap();
        let role_id = bundle.role.subject.role_id();
        assert_eq!(bundle.role.state, ProposalState::Captured);
        assert!(fx.governance.list_roles().await.unwrap().is_empty());

        let approved = fx.governance.approve(role_id, fx.checker, 1).await.unwrap();
        assert_eq!(approved.role.state, ProposalState::Released);
        assert_eq!(approved.role.approval_count, 1);
        assert_eq!(approved.functions[0].state, ProposalState::Released);

        let role = fx.governance.get_role(role_id).await.unwrap();
        assert_eq!(role.name, "R2");
        assert_eq!(role.function_ids, BTreeSet::from([f2]));
    }

    #[tokio::test]
    async fn test_nested_child_role_is_rejected_without_residue() {
        let fx = Fixture::new();
        let grandchild = fx.live_role("GC1", vec![]).await;
        let child = fx.live_role("C1", vec![grandchild]).await;
        let parent = fx.live_role("P1", vec![]).await;
        let rows_before = fx.governance.store().transient_count().await;

        let err = fx
            .governance
            .update(parent, submit("P1", vec![], vec![child]), fx.maker, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert_eq!(fx.governance.store().transient_count().await, rows_before);

        let transients = fx.governance.latest_transients(parent).await.unwrap();
        assert_eq!(transients.role.len(), 1);
        assert!(transients.child_roles.is_empty());

        let err = fx
            .governance
            .create(submit("P2", vec![], vec![child]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert_eq!(fx.governance.list_roles().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_repeat_approver_is_rejected() {
        let fx = Fixture::new();
        let bundle = fx
            .governance
            .create(submit("R2", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap();
        let role_id = bundle.role.subject.role_id();

        fx.governance.approve(role_id, fx.checker, 1).await.unwrap();
        let rows_before = fx.governance.store().transient_count().await;

        let err = fx.governance.approve(role_id, fx.checker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert_eq!(fx.governance.store().transient_count().await, rows_before);
    }

    #[tokio::test]
    async fn test_distinct_approvers_reach_threshold() {
        let fx = Fixture::new();
        let second_checker = Uuid::new_v4();
        let bundle = fx
            .governance
            .create(submit("R3", vec![], vec![]), fx.maker, 2)
            .await
            .unwrap();
        let role_id = bundle.role.subject.role_id();

        let first = fx.governance.approve(role_id, fx.checker, 2).await.unwrap();
        assert_eq!(first.role.state, ProposalState::Approved);
        assert_err!(fx.governance.get_role(role_id).await);

        let err = fx.governance.approve(role_id, fx.checker, 2).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        let second = fx.governance.approve(role_id, second_checker, 2).await.unwrap();
        assert_eq!(second.role.state, ProposalState::Released);
        assert_ok!(fx.governance.get_role(role_id).await);

        // A further approval after release is a no-op
        let after = fx.governance.approve(role_id, Uuid::new_v4(), 2).await.unwrap();
        assert_eq!(after.role, second.role);
    }

    #[tokio::test]
    async fn test_decline_cascades_and_never_touches_live_graph() {
        let fx = Fixture::new();
        let f1 = fx.function("F1", None).await;
        let bundle = fx
            .governance
            .create(submit("R4", vec![f1], vec![]), fx.maker, 1)
            .await
            .unwrap();
        let role_id = bundle.role.subject.role_id();

        let declined = fx.governance.decline(role_id, fx.checker).await.unwrap();
        assert_eq!(declined.role.state, ProposalState::Declined);
        assert_eq!(declined.functions[0].state, ProposalState::Declined);
        assert!(fx.governance.list_roles().await.unwrap().is_empty());

        let err = fx.governance.approve(role_id, fx.checker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition(_)));
        let err = fx.governance.decline(role_id, fx.checker).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition(_)));
    }

    #[tokio::test]
    async fn test_open_proposal_blocks_update_and_delete() {
        let fx = Fixture::new();
        let role_id = fx.live_role("R5", vec![]).await;

        fx.governance
            .update(role_id, submit("R5-renamed", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap();

        let err = fx
            .governance
            .update(role_id, submit("R5-again", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        let err = fx.governance.delete(role_id, fx.maker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        // Name stays until the modify proposal is released
        assert_eq!(fx.governance.get_role(role_id).await.unwrap().name, "R5");
        fx.governance.approve(role_id, fx.checker, 1).await.unwrap();
        assert_eq!(fx.governance.get_role(role_id).await.unwrap().name, "R5-renamed");
    }

    #[tokio::test]
    async fn test_update_diffs_functions_and_releases_on_approval() {
        let fx = Fixture::new();
        let kept = fx.function("kept", None).await;
        let dropped = fx.function("dropped", None).await;
        let added = fx.function("added", None).await;

        let bundle = fx
            .governance
            .create(submit("R6", vec![kept, dropped], vec![]), fx.maker, 0)
            .await
            .unwrap();
        let role_id = bundle.role.subject.role_id();

        let proposed = fx
            .governance
            .update(role_id, submit("R6", vec![kept, added], vec![]), fx.maker, 1)
            .await
            .unwrap();
        assert_eq!(proposed.role.action, ProposalAction::Modify);
        assert_eq!(proposed.functions.len(), 2);

        let transients = fx.governance.latest_transients(role_id).await.unwrap();
        assert_eq!(transients.role.len(), 1);
        assert_eq!(transients.functions.len(), 2);

        fx.governance.approve(role_id, fx.checker, 1).await.unwrap();
        let role = fx.governance.get_role(role_id).await.unwrap();
        assert_eq!(role.function_ids, BTreeSet::from([kept, added]));
    }

    #[tokio::test]
    async fn test_delete_removes_role_only_on_release() {
        let fx = Fixture::new();
        let role_id = fx.live_role("R7", vec![]).await;

        let proposed = fx.governance.delete(role_id, fx.maker, 1).await.unwrap();
        assert_eq!(proposed.role.action, ProposalAction::Delete);
        assert_ok!(fx.governance.get_role(role_id).await);

        fx.governance.approve(role_id, fx.checker, 1).await.unwrap();
        let err = fx.governance.get_role(role_id).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_duplicate_name_and_missing_references() {
        let fx = Fixture::new();
        fx.live_role("taken", vec![]).await;

        let err = fx
            .governance
            .create(submit("taken", vec![], vec![]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        let err = fx
            .governance
            .create(submit("ghost-function", vec![Uuid::new_v4()], vec![]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let mut with_realm = submit("ghost-realm", vec![], vec![]);
        with_realm.sub_realm_id = Some(Uuid::new_v4());
        let err = fx.governance.create(with_realm, fx.maker, 0).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = fx.governance.update(Uuid::new_v4(), submit("x", vec![], vec![]), fx.maker, 0).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = fx.governance.approve(Uuid::new_v4(), fx.checker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = fx.governance.latest_transients(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        assert_eq!(fx.governance.list_roles().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tenancy_mismatch_is_not_processable() {
        let fx = Fixture::new();
        let realm = fx.sub_realm("emea").await;
        let foreign_function = fx.function("realm-bound", Some(realm)).await;

        let err = fx
            .governance
            .create(submit("realm-less", vec![foreign_function], vec![]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        let mut in_realm = submit("in-realm", vec![foreign_function], vec![]);
        in_realm.sub_realm_id = Some(realm);
        let bundle = fx.governance.create(in_realm, fx.maker, 0).await.unwrap();
        let role = fx.governance.get_role(bundle.role.subject.role_id()).await.unwrap();
        assert_eq!(role.sub_realm_id, Some(realm));
    }

    #[tokio::test]
    async fn test_update_keeps_creation_sub_realm() {
        let fx = Fixture::new();
        let role_id = fx.live_role("fixed-realm", vec![]).await;

        let mut moved = submit("fixed-realm", vec![], vec![]);
        moved.sub_realm_id = Some(fx.sub_realm("apac").await);
        fx.governance.update(role_id, moved, fx.maker, 0).await.unwrap();

        assert_eq!(fx.governance.get_role(role_id).await.unwrap().sub_realm_id, None);
    }

    #[tokio::test]
    async fn test_self_composition_is_not_processable() {
        let fx = Fixture::new();
        let role_id = fx.live_role("self", vec![]).await;

        let err = fx
            .governance
            .update(role_id, submit("self", vec![], vec![role_id]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
    }

    #[tokio::test]
    async fn test_nil_actor_rolls_back() {
        let fx = Fixture::new();
        let err = fx
            .governance
            .create(submit("anonymous", vec![], vec![]), Uuid::nil(), 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidStateTransition(_)));
        assert_eq!(fx.governance.store().transient_count().await, 0);
    }

    #[tokio::test]
    async fn test_child_of_a_parent_cannot_take_children() {
        let fx = Fixture::new();
        let child = fx.live_role("C", vec![]).await;
        let parent = fx.live_role("P", vec![child]).await;
        let grandchild = fx.live_role("GC", vec![]).await;
        let rows_before = fx.governance.store().transient_count().await;

        let err = fx
            .governance
            .update(child, submit("C", vec![], vec![grandchild]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert_eq!(fx.governance.store().transient_count().await, rows_before);

        assert!(fx.governance.get_role(child).await.unwrap().child_role_ids.is_empty());
        assert_eq!(
            fx.governance.get_role(parent).await.unwrap().child_role_ids,
            BTreeSet::from([child])
        );
    }

    #[tokio::test]
    async fn test_release_rejects_child_that_became_compound() {
        let fx = Fixture::new();
        let child = fx.live_role("C", vec![]).await;
        let parent = fx.live_role("P", vec![]).await;
        let grandchild = fx.live_role("GC", vec![]).await;

        fx.governance
            .update(parent, submit("P", vec![], vec![child]), fx.maker, 1)
            .await
            .unwrap();
        // The link is still pending, so the child may take children meanwhile
        fx.governance
            .update(child, submit("C", vec![], vec![grandchild]), fx.maker, 0)
            .await
            .unwrap();
        let rows_before = fx.governance.store().transient_count().await;

        let err = fx.governance.approve(parent, fx.checker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert_eq!(fx.governance.store().transient_count().await, rows_before);
        assert!(fx.governance.get_role(parent).await.unwrap().child_role_ids.is_empty());

        let declined = fx.governance.decline(parent, fx.checker).await.unwrap();
        assert_eq!(declined.child_roles[0].state, ProposalState::Declined);
    }

    #[tokio::test]
    async fn test_release_rejects_child_deleted_since_capture() {
        let fx = Fixture::new();
        let parent = fx.live_role("Q", vec![]).await;
        let child = fx.live_role("D", vec![]).await;

        fx.governance
            .update(parent, submit("Q", vec![], vec![child]), fx.maker, 1)
            .await
            .unwrap();
        fx.governance.delete(child, fx.maker, 0).await.unwrap();
        assert_err!(fx.governance.get_role(child).await);

        let err = fx.governance.approve(parent, fx.checker, 1).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert!(fx.governance.get_role(parent).await.unwrap().child_role_ids.is_empty());
    }

    #[tokio::test]
    async fn test_update_removes_child_role_on_release() {
        let fx = Fixture::new();
        let child = fx.live_role("member", vec![]).await;
        let parent = fx.live_role("team", vec![child]).await;

        let proposed = fx
            .governance
            .update(parent, submit("team", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap();
        assert_eq!(proposed.child_roles.len(), 1);
        assert_eq!(proposed.child_roles[0].action, ProposalAction::Delete);
        assert_eq!(proposed.child_roles[0].state, ProposalState::Captured);
        assert_eq!(
            fx.governance.get_role(parent).await.unwrap().child_role_ids,
            BTreeSet::from([child])
        );

        let approved = fx.governance.approve(parent, fx.checker, 1).await.unwrap();
        assert_eq!(approved.child_roles[0].state, ProposalState::Released);
        assert!(fx.governance.get_role(parent).await.unwrap().child_role_ids.is_empty());
        assert_ok!(fx.governance.get_role(child).await);
    }

    #[tokio::test]
    async fn test_child_role_tenancy_mismatch_is_not_processable() {
        let fx = Fixture::new();
        let realm = fx.sub_realm("latam").await;
        let mut in_realm = submit("realm-child", vec![], vec![]);
        in_realm.sub_realm_id = Some(realm);
        let child = fx
            .governance
            .create(in_realm, fx.maker, 0)
            .await
            .unwrap()
            .role
            .subject
            .role_id();
        let parent = fx.live_role("realm-less-parent", vec![]).await;

        let err = fx
            .governance
            .update(parent, submit("realm-less-parent", vec![], vec![child]), fx.maker, 0)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        assert!(fx.governance.get_role(parent).await.unwrap().child_role_ids.is_empty());
    }

    #[tokio::test]
    async fn test_declined_update_leaves_live_role_unchanged() {
        let fx = Fixture::new();
        let original = fx.function("read", None).await;
        let replacement = fx.function("write", None).await;
        let role_id = fx
            .governance
            .create(submit("R8", vec![original], vec![]), fx.maker, 0)
            .await
            .unwrap()
            .role
            .subject
            .role_id();
        let before = fx.governance.get_role(role_id).await.unwrap();

        fx.governance
            .update(role_id, submit("R8-renamed", vec![replacement], vec![]), fx.maker, 1)
            .await
            .unwrap();
        let declined = fx.governance.decline(role_id, fx.checker).await.unwrap();
        assert_eq!(declined.role.state, ProposalState::Declined);
        assert!(declined
            .functions
            .iter()
            .all(|row| row.state == ProposalState::Declined));

        assert_eq!(fx.governance.get_role(role_id).await.unwrap(), before);

        // A declined round frees the role for a new proposal
        fx.governance
            .update(role_id, submit("R8-renamed", vec![], vec![]), fx.maker, 0)
            .await
            .unwrap();
        assert_eq!(fx.governance.get_role(role_id).await.unwrap().name, "R8-renamed");
    }

    #[tokio::test]
    async fn test_pending_create_holds_its_name() {
        let fx = Fixture::new();
        let first = fx
            .governance
            .create(submit("auditor", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap()
            .role
            .subject
            .role_id();

        let err = fx
            .governance
            .create(submit("auditor", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        let other = fx.live_role("reviewer", vec![]).await;
        let err = fx
            .governance
            .update(other, submit("auditor", vec![], vec![]), fx.maker, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));

        fx.governance.decline(first, fx.checker).await.unwrap();
        assert_ok!(
            fx.governance
                .create(submit("auditor", vec![], vec![]), fx.maker, 0)
                .await
        );
    }
}
