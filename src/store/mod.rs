//! Storage contracts for the governance engine
//!
//! Every call takes the caller's `Session` so that one orchestrator operation
//! reads and writes through a single transaction. Only the orchestrator
//! begins, commits or rolls back a session.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::{create_governance_tables, PgStore};

use crate::error::AppError;
use crate::governance::models::{Function, Proposal, Role, SubRealm, SubjectKey};
use async_trait::async_trait;
use uuid::Uuid;

/// Storage backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    InMemory,
    PostgreSQL,
}

/// Begin/commit/rollback shared by every store
#[async_trait]
pub trait Transactional: Send + Sync {
    type Session: Send;

    async fn begin(&self) -> Result<Self::Session, AppError>;

    async fn commit(&self, session: Self::Session) -> Result<(), AppError>;

    async fn rollback(&self, session: Self::Session) -> Result<(), AppError>;
}

/// Live role rows, including their function and child-role links
#[async_trait]
pub trait RoleStore: Transactional {
    async fn fetch_role(&self, session: &mut Self::Session, id: Uuid)
        -> Result<Option<Role>, AppError>;

    async fn fetch_role_by_name(
        &self,
        session: &mut Self::Session,
        name: &str,
    ) -> Result<Option<Role>, AppError>;

    async fn list_roles(&self, session: &mut Self::Session) -> Result<Vec<Role>, AppError>;

    /// Live roles that hold `child_role_id` as a child
    async fn fetch_parent_role_ids(
        &self,
        session: &mut Self::Session,
        child_role_id: Uuid,
    ) -> Result<Vec<Uuid>, AppError>;

    /// Insert a role. A name already in use is `NotProcessable`.
    async fn create_role(&self, session: &mut Self::Session, role: &Role) -> Result<(), AppError>;

    /// Replace a role's definition and link sets
    async fn update_role(&self, session: &mut Self::Session, role: &Role) -> Result<(), AppError>;

    async fn delete_role(&self, session: &mut Self::Session, id: Uuid) -> Result<(), AppError>;
}

/// Read-only lookups into the function and sub-realm catalogs
#[async_trait]
pub trait CatalogStore: Transactional {
    async fn fetch_function(
        &self,
        session: &mut Self::Session,
        id: Uuid,
    ) -> Result<Option<Function>, AppError>;

    async fn fetch_sub_realm(
        &self,
        session: &mut Self::Session,
        id: Uuid,
    ) -> Result<Option<SubRealm>, AppError>;
}

/// The three append-only proposal ledgers
#[async_trait]
pub trait TransientLedger: Transactional {
    /// All rows for one subject key, ordered by sequence
    async fn fetch_transients(
        &self,
        session: &mut Self::Session,
        key: SubjectKey,
    ) -> Result<Vec<Proposal>, AppError>;

    /// All function and child-role rows whose parent is `role_id`, ordered by sequence
    async fn fetch_relation_transients(
        &self,
        session: &mut Self::Session,
        role_id: Uuid,
    ) -> Result<Vec<Proposal>, AppError>;

    /// Role ledger rows carrying `name`, ordered by sequence
    async fn fetch_role_transients_named(
        &self,
        session: &mut Self::Session,
        name: &str,
    ) -> Result<Vec<Proposal>, AppError>;

    /// Serialize sessions on `key` until the session ends
    async fn lock_subject(&self, session: &mut Self::Session, key: SubjectKey)
        -> Result<(), AppError>;

    /// Append a row, returning it with its assigned sequence
    async fn append_transient(
        &self,
        session: &mut Self::Session,
        proposal: Proposal,
    ) -> Result<Proposal, AppError>;
}

/// Everything the governance orchestrator needs from storage
pub trait GovernanceStore: RoleStore + CatalogStore + TransientLedger + 'static {}

impl<T> GovernanceStore for T where T: RoleStore + CatalogStore + TransientLedger + 'static {}
