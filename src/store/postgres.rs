//! PostgreSQL governance store
//!
//! A session owns one pooled connection with an open `BEGIN` block. Role rows,
//! their link tables and the three transient ledgers all go through it.

use crate::error::AppError;
use crate::governance::models::{
    Function, Proposal, ProposalAction, ProposalState, ProposalSubject, Role, SubRealm, SubjectKey,
};
use crate::store::{CatalogStore, RoleStore, Transactional, TransientLedger};
use async_trait::async_trait;
use deadpool_postgres::{Object, Pool};
use postgres_types::ToSql;
use std::collections::{BTreeSet, HashMap};
use tokio_postgres::error::SqlState;
use tokio_postgres::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

// =============================================================================
// QUERIES
// =============================================================================

const SELECT_ROLE_COLUMNS: &str = r#"
    SELECT id, name, description, sub_realm_id, changed_by, created_at, updated_at
    FROM roles
"#;

const INSERT_ROLE: &str = r#"
    INSERT INTO roles (id, name, description, sub_realm_id, changed_by, created_at, updated_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7)
"#;

const UPDATE_ROLE: &str = r#"
    UPDATE roles
    SET name = $2, description = $3, changed_by = $4, updated_at = $5
    WHERE id = $1
"#;

const INSERT_ROLE_TRANSIENT: &str = r#"
    INSERT INTO role_transients
        (id, role_id, name, description, sub_realm_id, action, r_state, approval_count, changed_by, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
    RETURNING sequence
"#;

const INSERT_ROLE_FUNCTION_TRANSIENT: &str = r#"
    INSERT INTO role_function_transients
        (id, role_id, function_id, action, r_state, approval_count, changed_by, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING sequence
"#;

const INSERT_ROLE_ROLE_TRANSIENT: &str = r#"
    INSERT INTO role_role_transients
        (id, parent_role_id, child_role_id, action, r_state, approval_count, changed_by, created_at)
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
    RETURNING sequence
"#;

const SELECT_ROLE_TRANSIENTS: &str = r#"
    SELECT id, sequence, role_id, name, description, sub_realm_id, action, r_state, approval_count, changed_by, created_at
    FROM role_transients
    WHERE role_id = $1
    ORDER BY sequence
"#;

const SELECT_ROLE_TRANSIENTS_BY_NAME: &str = r#"
    SELECT id, sequence, role_id, name, description, sub_realm_id, action, r_state, approval_count, changed_by, created_at
    FROM role_transients
    WHERE name = $1
    ORDER BY sequence
"#;

/// Transaction-scoped advisory lock keyed by the subject's text form
const LOCK_SUBJECT: &str = "SELECT pg_advisory_xact_lock(hashtextextended($1, 0))";

const SELECT_ROLE_FUNCTION_TRANSIENTS: &str = r#"
    SELECT id, sequence, role_id, function_id, action, r_state, approval_count, changed_by, created_at
    FROM role_function_transients
    WHERE role_id = $1 AND ($2::uuid IS NULL OR function_id = $2)
    ORDER BY sequence
"#;

const SELECT_ROLE_ROLE_TRANSIENTS: &str = r#"
    SELECT id, sequence, parent_role_id, child_role_id, action, r_state, approval_count, changed_by, created_at
    FROM role_role_transients
    WHERE parent_role_id = $1 AND ($2::uuid IS NULL OR child_role_id = $2)
    ORDER BY sequence
"#;

/// Schema for the live role graph, its catalogs and the transient ledgers
const GOVERNANCE_SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sub_realms (
        id UUID PRIMARY KEY,
        name VARCHAR(255) UNIQUE NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS functions (
        id UUID PRIMARY KEY,
        name VARCHAR(255) NOT NULL,
        sub_realm_id UUID REFERENCES sub_realms(id)
    )",
    "CREATE TABLE IF NOT EXISTS roles (
        id UUID PRIMARY KEY,
        name VARCHAR(255) UNIQUE NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        sub_realm_id UUID REFERENCES sub_realms(id),
        changed_by UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMPTZ NOT NULL DEFAULT CURRENT_TIMESTAMP
    )",
    "CREATE TABLE IF NOT EXISTS role_functions (
        role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        function_id UUID NOT NULL REFERENCES functions(id) ON DELETE CASCADE,
        PRIMARY KEY (role_id, function_id)
    )",
    "CREATE TABLE IF NOT EXISTS role_child_roles (
        parent_role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        child_role_id UUID NOT NULL REFERENCES roles(id) ON DELETE CASCADE,
        PRIMARY KEY (parent_role_id, child_role_id)
    )",
    "CREATE SEQUENCE IF NOT EXISTS transient_sequence",
    "CREATE TABLE IF NOT EXISTS role_transients (
        id UUID PRIMARY KEY,
        sequence BIGINT NOT NULL DEFAULT nextval('transient_sequence'),
        role_id UUID NOT NULL,
        name VARCHAR(255) NOT NULL,
        description TEXT NOT NULL,
        sub_realm_id UUID,
        action VARCHAR(16) NOT NULL,
        r_state VARCHAR(16) NOT NULL,
        approval_count INTEGER NOT NULL DEFAULT 0,
        changed_by UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS role_function_transients (
        id UUID PRIMARY KEY,
        sequence BIGINT NOT NULL DEFAULT nextval('transient_sequence'),
        role_id UUID NOT NULL,
        function_id UUID NOT NULL,
        action VARCHAR(16) NOT NULL,
        r_state VARCHAR(16) NOT NULL,
        approval_count INTEGER NOT NULL DEFAULT 0,
        changed_by UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS role_role_transients (
        id UUID PRIMARY KEY,
        sequence BIGINT NOT NULL DEFAULT nextval('transient_sequence'),
        parent_role_id UUID NOT NULL,
        child_role_id UUID NOT NULL,
        action VARCHAR(16) NOT NULL,
        r_state VARCHAR(16) NOT NULL,
        approval_count INTEGER NOT NULL DEFAULT 0,
        changed_by UUID NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_role_transients_role_id ON role_transients(role_id, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_role_transients_name ON role_transients(name)",
    "CREATE INDEX IF NOT EXISTS idx_role_child_roles_child_id ON role_child_roles(child_role_id)",
    "CREATE INDEX IF NOT EXISTS idx_role_function_transients_role_id ON role_function_transients(role_id, function_id, sequence)",
    "CREATE INDEX IF NOT EXISTS idx_role_role_transients_parent_id ON role_role_transients(parent_role_id, child_role_id, sequence)",
];

/// Create governance tables if they don't exist
pub async fn create_governance_tables(pool: &Pool) -> Result<(), AppError> {
    let client = pool.get().await?;

    for statement in GOVERNANCE_SCHEMA {
        client.execute(*statement, &[]).await?;
    }

    info!("✅ Governance tables initialized");
    Ok(())
}

// =============================================================================
// SESSION
// =============================================================================

/// A transaction on one pooled connection
pub struct PgSession {
    client: Option<Object>,
}

impl PgSession {
    fn client(&self) -> Result<&Object, AppError> {
        self.client
            .as_ref()
            .ok_or_else(|| AppError::Internal("Session already finished".to_string()))
    }

    async fn finish(mut self, statement: &str) -> Result<(), AppError> {
        let client = self
            .client
            .take()
            .ok_or_else(|| AppError::Internal("Session already finished".to_string()))?;
        client.batch_execute(statement).await?;
        Ok(())
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // An unfinished transaction must never go back to the pool
        if let Some(client) = self.client.take() {
            warn!("Dropping unfinished database session; discarding its connection");
            drop(Object::take(client));
        }
    }
}

/// PostgreSQL-backed governance store
#[derive(Clone)]
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn load_links(
        client: &Object,
        role_ids: &[Uuid],
    ) -> Result<(HashMap<Uuid, BTreeSet<Uuid>>, HashMap<Uuid, BTreeSet<Uuid>>), AppError> {
        let mut functions: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();
        let mut children: HashMap<Uuid, BTreeSet<Uuid>> = HashMap::new();

        let rows = client
            .query(
                "SELECT role_id, function_id FROM role_functions WHERE role_id = ANY($1)",
                &[&role_ids],
            )
            .await?;
        for row in rows {
            functions
                .entry(row.get("role_id"))
                .or_default()
                .insert(row.get("function_id"));
        }

        let rows = client
            .query(
                "SELECT parent_role_id, child_role_id FROM role_child_roles WHERE parent_role_id = ANY($1)",
                &[&role_ids],
            )
            .await?;
        for row in rows {
            children
                .entry(row.get("parent_role_id"))
                .or_default()
                .insert(row.get("child_role_id"));
        }

        Ok((functions, children))
    }

    async fn roles_from_rows(client: &Object, rows: Vec<Row>) -> Result<Vec<Role>, AppError> {
        let ids: Vec<Uuid> = rows.iter().map(|row| row.get("id")).collect();
        let (mut functions, mut children) = Self::load_links(client, &ids).await?;

        Ok(rows
            .iter()
            .map(|row| {
                let id: Uuid = row.get("id");
                Role {
                    id,
                    name: row.get("name"),
                    description: row.get("description"),
                    sub_realm_id: row.get("sub_realm_id"),
                    function_ids: functions.remove(&id).unwrap_or_default(),
                    child_role_ids: children.remove(&id).unwrap_or_default(),
                    changed_by: row.get("changed_by"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                }
            })
            .collect())
    }

    async fn insert_links(client: &Object, role: &Role) -> Result<(), AppError> {
        for function_id in &role.function_ids {
            client
                .execute(
                    "INSERT INTO role_functions (role_id, function_id) VALUES ($1, $2)",
                    &[&role.id, function_id],
                )
                .await?;
        }
        for child_role_id in &role.child_role_ids {
            client
                .execute(
                    "INSERT INTO role_child_roles (parent_role_id, child_role_id) VALUES ($1, $2)",
                    &[&role.id, child_role_id],
                )
                .await?;
        }
        Ok(())
    }
}

/// Translate a unique-name violation into a business-rule error
fn map_role_write_error(e: tokio_postgres::Error, role: &Role) -> AppError {
    if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
        AppError::NotProcessable(format!("Role with Name '{}' already exist.", role.name))
    } else {
        AppError::Database(e)
    }
}

fn lifecycle_from_row(row: &Row) -> Result<(ProposalAction, ProposalState, u32), AppError> {
    let action: String = row.get("action");
    let state: String = row.get("r_state");
    let approval_count: i32 = row.get("approval_count");

    let action = action.parse::<ProposalAction>().map_err(AppError::Internal)?;
    let state = state.parse::<ProposalState>().map_err(AppError::Internal)?;
    let approval_count = u32::try_from(approval_count)
        .map_err(|_| AppError::Internal(format!("Negative approval count {}", approval_count)))?;

    Ok((action, state, approval_count))
}

fn proposal_from_row(row: &Row, subject: ProposalSubject) -> Result<Proposal, AppError> {
    let (action, state, approval_count) = lifecycle_from_row(row)?;
    Ok(Proposal {
        id: row.get("id"),
        sequence: row.get("sequence"),
        subject,
        action,
        state,
        approval_count,
        actor: row.get("changed_by"),
        created_at: row.get("created_at"),
    })
}

fn role_transient_from_row(row: &Row) -> Result<Proposal, AppError> {
    proposal_from_row(
        row,
        ProposalSubject::Role {
            role_id: row.get("role_id"),
            name: row.get("name"),
            description: row.get("description"),
            sub_realm_id: row.get("sub_realm_id"),
        },
    )
}

fn role_function_transient_from_row(row: &Row) -> Result<Proposal, AppError> {
    proposal_from_row(
        row,
        ProposalSubject::RoleFunction {
            role_id: row.get("role_id"),
            function_id: row.get("function_id"),
        },
    )
}

fn role_role_transient_from_row(row: &Row) -> Result<Proposal, AppError> {
    proposal_from_row(
        row,
        ProposalSubject::RoleChildRole {
            parent_role_id: row.get("parent_role_id"),
            child_role_id: row.get("child_role_id"),
        },
    )
}

#[async_trait]
impl Transactional for PgStore {
    type Session = PgSession;

    async fn begin(&self) -> Result<PgSession, AppError> {
        let client = self.pool.get().await?;
        client.batch_execute("BEGIN").await?;
        Ok(PgSession {
            client: Some(client),
        })
    }

    async fn commit(&self, session: PgSession) -> Result<(), AppError> {
        debug!("Committing database session");
        session.finish("COMMIT").await
    }

    async fn rollback(&self, session: PgSession) -> Result<(), AppError> {
        debug!("Rolling back database session");
        session.finish("ROLLBACK").await
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn fetch_role(&self, session: &mut PgSession, id: Uuid) -> Result<Option<Role>, AppError> {
        let client = session.client()?;
        let rows = client
            .query(format!("{} WHERE id = $1", SELECT_ROLE_COLUMNS).as_str(), &[&id])
            .await?;
        Ok(Self::roles_from_rows(client, rows).await?.into_iter().next())
    }

    async fn fetch_role_by_name(
        &self,
        session: &mut PgSession,
        name: &str,
    ) -> Result<Option<Role>, AppError> {
        let client = session.client()?;
        let rows = client
            .query(format!("{} WHERE name = $1", SELECT_ROLE_COLUMNS).as_str(), &[&name])
            .await?;
        Ok(Self::roles_from_rows(client, rows).await?.into_iter().next())
    }

    async fn list_roles(&self, session: &mut PgSession) -> Result<Vec<Role>, AppError> {
        let client = session.client()?;
        let rows = client
            .query(format!("{} ORDER BY name", SELECT_ROLE_COLUMNS).as_str(), &[])
            .await?;
        Self::roles_from_rows(client, rows).await
    }

    async fn fetch_parent_role_ids(
        &self,
        session: &mut PgSession,
        child_role_id: Uuid,
    ) -> Result<Vec<Uuid>, AppError> {
        let rows = session
            .client()?
            .query(
                "SELECT parent_role_id FROM role_child_roles WHERE child_role_id = $1",
                &[&child_role_id],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get("parent_role_id")).collect())
    }

    async fn create_role(&self, session: &mut PgSession, role: &Role) -> Result<(), AppError> {
        let client = session.client()?;
        client
            .execute(
                INSERT_ROLE,
                &[
                    &role.id,
                    &role.name,
                    &role.description,
                    &role.sub_realm_id,
                    &role.changed_by,
                    &role.created_at,
                    &role.updated_at,
                ],
            )
            .await
            .map_err(|e| map_role_write_error(e, role))?;
        Self::insert_links(client, role).await
    }

    async fn update_role(&self, session: &mut PgSession, role: &Role) -> Result<(), AppError> {
        let client = session.client()?;
        let updated = client
            .execute(
                UPDATE_ROLE,
                &[
                    &role.id,
                    &role.name,
                    &role.description,
                    &role.changed_by,
                    &role.updated_at,
                ],
            )
            .await
            .map_err(|e| map_role_write_error(e, role))?;
        if updated == 0 {
            return Err(AppError::NotFound(format!("Role with ID '{}' not found.", role.id)));
        }

        client
            .execute("DELETE FROM role_functions WHERE role_id = $1", &[&role.id])
            .await?;
        client
            .execute("DELETE FROM role_child_roles WHERE parent_role_id = $1", &[&role.id])
            .await?;
        Self::insert_links(client, role).await
    }

    async fn delete_role(&self, session: &mut PgSession, id: Uuid) -> Result<(), AppError> {
        let client = session.client()?;
        let deleted = client
            .execute("DELETE FROM roles WHERE id = $1", &[&id])
            .await?;
        if deleted == 0 {
            return Err(AppError::NotFound(format!("Role with ID '{}' not found.", id)));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn fetch_function(
        &self,
        session: &mut PgSession,
        id: Uuid,
    ) -> Result<Option<Function>, AppError> {
        let row = session
            .client()?
            .query_opt("SELECT id, name, sub_realm_id FROM functions WHERE id = $1", &[&id])
            .await?;
        Ok(row.map(|row| Function {
            id: row.get("id"),
            name: row.get("name"),
            sub_realm_id: row.get("sub_realm_id"),
        }))
    }

    async fn fetch_sub_realm(
        &self,
        session: &mut PgSession,
        id: Uuid,
    ) -> Result<Option<SubRealm>, AppError> {
        let row = session
            .client()?
            .query_opt("SELECT id, name FROM sub_realms WHERE id = $1", &[&id])
            .await?;
        Ok(row.map(|row| SubRealm {
            id: row.get("id"),
            name: row.get("name"),
        }))
    }
}

#[async_trait]
impl TransientLedger for PgStore {
    async fn fetch_transients(
        &self,
        session: &mut PgSession,
        key: SubjectKey,
    ) -> Result<Vec<Proposal>, AppError> {
        let client = session.client()?;
        match key {
            SubjectKey::Role(role_id) => client
                .query(SELECT_ROLE_TRANSIENTS, &[&role_id])
                .await?
                .iter()
                .map(role_transient_from_row)
                .collect(),
            SubjectKey::RoleFunction(role_id, function_id) => client
                .query(SELECT_ROLE_FUNCTION_TRANSIENTS, &[&role_id, &Some(function_id)])
                .await?
                .iter()
                .map(role_function_transient_from_row)
                .collect(),
            SubjectKey::RoleChildRole(parent_role_id, child_role_id) => client
                .query(SELECT_ROLE_ROLE_TRANSIENTS, &[&parent_role_id, &Some(child_role_id)])
                .await?
                .iter()
                .map(role_role_transient_from_row)
                .collect(),
        }
    }

    async fn fetch_relation_transients(
        &self,
        session: &mut PgSession,
        role_id: Uuid,
    ) -> Result<Vec<Proposal>, AppError> {
        let client = session.client()?;
        let any_relation: Option<Uuid> = None;

        let mut proposals = client
            .query(SELECT_ROLE_FUNCTION_TRANSIENTS, &[&role_id, &any_relation])
            .await?
            .iter()
            .map(role_function_transient_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        for row in client
            .query(SELECT_ROLE_ROLE_TRANSIENTS, &[&role_id, &any_relation])
            .await?
        {
            proposals.push(role_role_transient_from_row(&row)?);
        }

        proposals.sort_by_key(|proposal| proposal.sequence);
        Ok(proposals)
    }

    async fn fetch_role_transients_named(
        &self,
        session: &mut PgSession,
        name: &str,
    ) -> Result<Vec<Proposal>, AppError> {
        session
            .client()?
            .query(SELECT_ROLE_TRANSIENTS_BY_NAME, &[&name])
            .await?
            .iter()
            .map(role_transient_from_row)
            .collect()
    }

    async fn lock_subject(&self, session: &mut PgSession, key: SubjectKey) -> Result<(), AppError> {
        let lock_key = key.to_string();
        debug!("Locking {}", lock_key);
        session
            .client()?
            .execute(LOCK_SUBJECT, &[&lock_key])
            .await?;
        Ok(())
    }

    async fn append_transient(
        &self,
        session: &mut PgSession,
        mut proposal: Proposal,
    ) -> Result<Proposal, AppError> {
        let client = session.client()?;
        let action = proposal.action.as_str();
        let state = proposal.state.as_str();
        let approval_count = proposal.approval_count as i32;

        let row = match &proposal.subject {
            ProposalSubject::Role {
                role_id,
                name,
                description,
                sub_realm_id,
            } => {
                let params: [&(dyn ToSql + Sync); 10] = [
                    &proposal.id,
                    role_id,
                    name,
                    description,
                    sub_realm_id,
                    &action,
                    &state,
                    &approval_count,
                    &proposal.actor,
                    &proposal.created_at,
                ];
                client.query_one(INSERT_ROLE_TRANSIENT, &params).await?
            }
            ProposalSubject::RoleFunction {
                role_id,
                function_id,
            } => {
                let params: [&(dyn ToSql + Sync); 8] = [
                    &proposal.id,
                    role_id,
                    function_id,
                    &action,
                    &state,
                    &approval_count,
                    &proposal.actor,
                    &proposal.created_at,
                ];
                client.query_one(INSERT_ROLE_FUNCTION_TRANSIENT, &params).await?
            }
            ProposalSubject::RoleChildRole {
                parent_role_id,
                child_role_id,
            } => {
                let params: [&(dyn ToSql + Sync); 8] = [
                    &proposal.id,
                    parent_role_id,
                    child_role_id,
                    &action,
                    &state,
                    &approval_count,
                    &proposal.actor,
                    &proposal.created_at,
                ];
                client.query_one(INSERT_ROLE_ROLE_TRANSIENT, &params).await?
            }
        };

        proposal.sequence = row.get("sequence");
        Ok(proposal)
    }
}
