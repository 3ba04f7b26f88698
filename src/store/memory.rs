//! In-memory governance store
//!
//! A session holds the store's lock for its whole lifetime and works on a
//! private copy, which replaces the shared state only on commit. Sessions are
//! therefore fully serialized.

use crate::error::AppError;
use crate::governance::models::{Function, Proposal, ProposalSubject, Role, SubRealm, SubjectKey};
use crate::store::{CatalogStore, RoleStore, Transactional, TransientLedger};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone, Default)]
struct MemoryState {
    roles: HashMap<Uuid, Role>,
    functions: HashMap<Uuid, Function>,
    sub_realms: HashMap<Uuid, SubRealm>,
    /// All three ledgers, in append order
    transients: Vec<Proposal>,
    last_sequence: i64,
}

impl MemoryState {
    fn name_taken_by_other(&self, role: &Role) -> bool {
        self.roles
            .values()
            .any(|existing| existing.name == role.name && existing.id != role.id)
    }
}

/// Thread-safe in-memory store
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

/// A transaction against a [`MemoryStore`]
pub struct MemorySession {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function in the read-only catalog
    pub async fn insert_function(&self, function: Function) {
        let mut state = self.state.lock().await;
        state.functions.insert(function.id, function);
    }

    /// Register a sub-realm in the read-only catalog
    pub async fn insert_sub_realm(&self, sub_realm: SubRealm) {
        let mut state = self.state.lock().await;
        state.sub_realms.insert(sub_realm.id, sub_realm);
    }

    /// Number of committed ledger rows across all three ledgers
    #[cfg(test)]
    pub async fn transient_count(&self) -> usize {
        self.state.lock().await.transients.len()
    }
}

#[async_trait]
impl Transactional for MemoryStore {
    type Session = MemorySession;

    async fn begin(&self) -> Result<MemorySession, AppError> {
        let guard = self.state.clone().lock_owned().await;
        let working = guard.clone();
        Ok(MemorySession { guard, working })
    }

    async fn commit(&self, session: MemorySession) -> Result<(), AppError> {
        let MemorySession { mut guard, working } = session;
        debug!(
            "Committing in-memory session ({} ledger rows)",
            working.transients.len()
        );
        *guard = working;
        Ok(())
    }

    async fn rollback(&self, session: MemorySession) -> Result<(), AppError> {
        debug!("Rolling back in-memory session");
        drop(session);
        Ok(())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn fetch_role(&self, session: &mut MemorySession, id: Uuid) -> Result<Option<Role>, AppError> {
        Ok(session.working.roles.get(&id).cloned())
    }

    async fn fetch_role_by_name(
        &self,
        session: &mut MemorySession,
        name: &str,
    ) -> Result<Option<Role>, AppError> {
        Ok(session
            .working
            .roles
            .values()
            .find(|role| role.name == name)
            .cloned())
    }

    async fn list_roles(&self, session: &mut MemorySession) -> Result<Vec<Role>, AppError> {
        let mut roles: Vec<Role> = session.working.roles.values().cloned().collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn fetch_parent_role_ids(
        &self,
        session: &mut MemorySession,
        child_role_id: Uuid,
    ) -> Result<Vec<Uuid>, AppError> {
        Ok(session
            .working
            .roles
            .values()
            .filter(|role| role.child_role_ids.contains(&child_role_id))
            .map(|role| role.id)
            .collect())
    }

    async fn create_role(&self, session: &mut MemorySession, role: &Role) -> Result<(), AppError> {
        if session.working.roles.contains_key(&role.id) {
            return Err(AppError::NotProcessable(format!(
                "Role with ID '{}' already exists.",
                role.id
            )));
        }
        if session.working.name_taken_by_other(role) {
            return Err(AppError::NotProcessable(format!(
                "Role with Name '{}' already exist.",
                role.name
            )));
        }
        session.working.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn update_role(&self, session: &mut MemorySession, role: &Role) -> Result<(), AppError> {
        if !session.working.roles.contains_key(&role.id) {
            return Err(AppError::NotFound(format!("Role with ID '{}' not found.", role.id)));
        }
        if session.working.name_taken_by_other(role) {
            return Err(AppError::NotProcessable(format!(
                "Role with name '{}' already exists.",
                role.name
            )));
        }
        session.working.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn delete_role(&self, session: &mut MemorySession, id: Uuid) -> Result<(), AppError> {
        session
            .working
            .roles
            .remove(&id)
            .ok_or_else(|| AppError::NotFound(format!("Role with ID '{}' not found.", id)))?;

        // Links pointing at the removed role go with it
        for role in session.working.roles.values_mut() {
            role.child_role_ids.remove(&id);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn fetch_function(
        &self,
        session: &mut MemorySession,
        id: Uuid,
    ) -> Result<Option<Function>, AppError> {
        Ok(session.working.functions.get(&id).cloned())
    }

    async fn fetch_sub_realm(
        &self,
        session: &mut MemorySession,
        id: Uuid,
    ) -> Result<Option<SubRealm>, AppError> {
        Ok(session.working.sub_realms.get(&id).cloned())
    }
}

#[async_trait]
impl TransientLedger for MemoryStore {
    async fn fetch_transients(
        &self,
        session: &mut MemorySession,
        key: SubjectKey,
    ) -> Result<Vec<Proposal>, AppError> {
        Ok(session
            .working
            .transients
            .iter()
            .filter(|row| row.key() == key)
            .cloned()
            .collect())
    }

    async fn fetch_relation_transients(
        &self,
        session: &mut MemorySession,
        role_id: Uuid,
    ) -> Result<Vec<Proposal>, AppError> {
        Ok(session
            .working
            .transients
            .iter()
            .filter(|row| {
                !matches!(row.subject, ProposalSubject::Role { .. })
                    && row.subject.role_id() == role_id
            })
            .cloned()
            .collect())
    }

    async fn fetch_role_transients_named(
        &self,
        session: &mut MemorySession,
        name: &str,
    ) -> Result<Vec<Proposal>, AppError> {
        Ok(session
            .working
            .transients
            .iter()
            .filter(|row| {
                matches!(&row.subject, ProposalSubject::Role { name: held, .. } if held == name)
            })
            .cloned()
            .collect())
    }

    async fn lock_subject(
        &self,
        _session: &mut MemorySession,
        _key: SubjectKey,
    ) -> Result<(), AppError> {
        // Sessions already hold the whole store
        Ok(())
    }

    async fn append_transient(
        &self,
        session: &mut MemorySession,
        mut proposal: Proposal,
    ) -> Result<Proposal, AppError> {
        session.working.last_sequence += 1;
        proposal.sequence = session.working.last_sequence;
        session.working.transients.push(proposal.clone());
        Ok(proposal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::models::{ProposalAction, ProposalState};
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn role(name: &str) -> Role {
        Role {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: String::new(),
            sub_realm_id: None,
            function_ids: BTreeSet::new(),
            child_role_ids: BTreeSet::new(),
            changed_by: Uuid::new_v4(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn row(subject: ProposalSubject) -> Proposal {
        Proposal {
            id: Uuid::new_v4(),
            sequence: 0,
            subject,
            action: ProposalAction::Create,
            state: ProposalState::Captured,
            approval_count: 0,
            actor: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_rollback_discards_session_writes() {
        let store = MemoryStore::new();

        let mut session = store.begin().await.unwrap();
        store.create_role(&mut session, &role("operator")).await.unwrap();
        store
            .append_transient(&mut session, row(ProposalSubject::RoleFunction {
                role_id: Uuid::new_v4(),
                function_id: Uuid::new_v4(),
            }))
            .await
            .unwrap();
        store.rollback(session).await.unwrap();

        let mut session = store.begin().await.unwrap();
        assert!(store.list_roles(&mut session).await.unwrap().is_empty());
        store.commit(session).await.unwrap();
        assert_eq!(store.transient_count().await, 0);
    }

    #[tokio::test]
    async fn test_commit_publishes_and_sequences_rows() {
        let store = MemoryStore::new();
        let role_id = Uuid::new_v4();
        let function_id = Uuid::new_v4();

        let mut session = store.begin().await.unwrap();
        let first = store
            .append_transient(&mut session, row(ProposalSubject::RoleFunction { role_id, function_id }))
            .await
            .unwrap();
        let second = store
            .append_transient(&mut session, row(ProposalSubject::RoleChildRole {
                parent_role_id: role_id,
                child_role_id: Uuid::new_v4(),
            }))
            .await
            .unwrap();
        store.commit(session).await.unwrap();

        assert!(first.sequence < second.sequence);

        let mut session = store.begin().await.unwrap();
        let relations = store.fetch_relation_transients(&mut session, role_id).await.unwrap();
        assert_eq!(relations.len(), 2);
        let keyed = store
            .fetch_transients(&mut session, SubjectKey::RoleFunction(role_id, function_id))
            .await
            .unwrap();
        assert_eq!(keyed, vec![first]);
        store.rollback(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_role_name_is_not_processable() {
        let store = MemoryStore::new();
        let mut session = store.begin().await.unwrap();
        store.create_role(&mut session, &role("admin")).await.unwrap();

        let err = store.create_role(&mut session, &role("admin")).await.unwrap_err();
        assert!(matches!(err, AppError::NotProcessable(_)));
        store.rollback(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_role_unlinks_it_from_parents() {
        let store = MemoryStore::new();
        let child = role("child");
        let mut parent = role("parent");
        parent.child_role_ids.insert(child.id);

        let mut session = store.begin().await.unwrap();
        store.create_role(&mut session, &child).await.unwrap();
        store.create_role(&mut session, &parent).await.unwrap();
        store.delete_role(&mut session, child.id).await.unwrap();

        let parent = store.fetch_role(&mut session, parent.id).await.unwrap().unwrap();
        assert!(parent.child_role_ids.is_empty());
        store.commit(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_parent_lookup_follows_child_links() {
        let store = MemoryStore::new();
        let child = role("child");
        let mut parent = role("parent");
        parent.child_role_ids.insert(child.id);

        let mut session = store.begin().await.unwrap();
        store.create_role(&mut session, &child).await.unwrap();
        store.create_role(&mut session, &parent).await.unwrap();

        let parents = store.fetch_parent_role_ids(&mut session, child.id).await.unwrap();
        assert_eq!(parents, vec![parent.id]);
        assert!(store
            .fetch_parent_role_ids(&mut session, parent.id)
            .await
            .unwrap()
            .is_empty());
        store.rollback(session).await.unwrap();
    }
}
