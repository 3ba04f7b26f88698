//! Governance data models
//!
//! The live role aggregate, the read-only catalog entities it references, and
//! the proposal records kept in the transient ledgers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// LIVE ROLE GRAPH
// =============================================================================

/// A live role, as currently enforced by the authorization graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    /// Tenancy partition; `None` for realm-less roles
    pub sub_realm_id: Option<Uuid>,
    /// Functions granted directly to this role
    pub function_ids: BTreeSet<Uuid>,
    /// Roles composed into this one (one level deep)
    pub child_role_ids: BTreeSet<Uuid>,
    /// Principal whose released proposal last touched the role
    pub changed_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Role {
    /// A compound role is composed of child roles
    pub fn is_compound(&self) -> bool {
        !self.child_role_ids.is_empty()
    }
}

/// A grantable function (read-only from the governance engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Function {
    pub id: Uuid,
    pub name: String,
    pub sub_realm_id: Option<Uuid>,
}

/// A tenancy partition (read-only from the governance engine)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubRealm {
    pub id: Uuid,
    pub name: String,
}

/// The desired state of a role as submitted by a maker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleSubmit {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sub_realm_id: Option<Uuid>,
    #[serde(default)]
    pub function_ids: Vec<Uuid>,
    #[serde(default)]
    pub child_role_ids: Vec<Uuid>,
}

// =============================================================================
// PROPOSALS
// =============================================================================

/// Lifecycle state of a single proposal row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalState {
    Captured,
    Approved,
    /// Terminal accept: the change has been applied to the live graph
    Released,
    /// Terminal reject
    Declined,
}

impl ProposalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProposalState::Released | ProposalState::Declined)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalState::Captured => "captured",
            ProposalState::Approved => "approved",
            ProposalState::Released => "released",
            ProposalState::Declined => "declined",
        }
    }
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "captured" => Ok(ProposalState::Captured),
            "approved" => Ok(ProposalState::Approved),
            "released" => Ok(ProposalState::Released),
            "declined" => Ok(ProposalState::Declined),
            other => Err(format!("Unknown proposal state '{}'", other)),
        }
    }
}

/// What a proposal does to its subject once released
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalAction {
    Create,
    Modify,
    Delete,
}

impl ProposalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalAction::Create => "create",
            ProposalAction::Modify => "modify",
            ProposalAction::Delete => "delete",
        }
    }
}

impl fmt::Display for ProposalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProposalAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(ProposalAction::Create),
            "modify" => Ok(ProposalAction::Modify),
            "delete" => Ok(ProposalAction::Delete),
            other => Err(format!("Unknown proposal action '{}'", other)),
        }
    }
}

/// The thing a proposal changes. Each kind lives in its own ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ProposalSubject {
    /// The role definition itself
    Role {
        role_id: Uuid,
        name: String,
        description: String,
        sub_realm_id: Option<Uuid>,
    },
    /// A function granted to a role
    RoleFunction { role_id: Uuid, function_id: Uuid },
    /// A child role composed into a parent role
    RoleChildRole { parent_role_id: Uuid, child_role_id: Uuid },
}

impl ProposalSubject {
    /// The relation key that at most one in-flight proposal may hold
    pub fn key(&self) -> SubjectKey {
        match self {
            ProposalSubject::Role { role_id, .. } => SubjectKey::Role(*role_id),
            ProposalSubject::RoleFunction { role_id, function_id } => {
                SubjectKey::RoleFunction(*role_id, *function_id)
            }
            ProposalSubject::RoleChildRole {
                parent_role_id,
                child_role_id,
            } => SubjectKey::RoleChildRole(*parent_role_id, *child_role_id),
        }
    }

    /// The role whose graph this subject belongs to
    pub fn role_id(&self) -> Uuid {
        self.key().role_id()
    }
}

/// Identity of a changed relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SubjectKey {
    Role(Uuid),
    RoleFunction(Uuid, Uuid),
    RoleChildRole(Uuid, Uuid),
}

impl SubjectKey {
    pub fn role_id(&self) -> Uuid {
        match self {
            SubjectKey::Role(id)
            | SubjectKey::RoleFunction(id, _)
            | SubjectKey::RoleChildRole(id, _) => *id,
        }
    }
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::Role(role_id) => write!(f, "role {}", role_id),
            SubjectKey::RoleFunction(role_id, function_id) => {
                write!(f, "function {} of role {}", function_id, role_id)
            }
            SubjectKey::RoleChildRole(parent_id, child_id) => {
                write!(f, "child role {} of role {}", child_id, parent_id)
            }
        }
    }
}

/// One lifecycle-stamped row in a transient ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: Uuid,
    /// Ledger position, assigned on append. Zero until stored.
    pub sequence: i64,
    pub subject: ProposalSubject,
    pub action: ProposalAction,
    pub state: ProposalState,
    pub approval_count: u32,
    /// Principal who caused this row (capturer, approver or decliner)
    pub actor: Uuid,
    pub created_at: DateTime<Utc>,
}

impl Proposal {
    pub fn key(&self) -> SubjectKey {
        self.subject.key()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_released(&self) -> bool {
        self.state == ProposalState::Released
    }
}

/// The role proposal plus every relation proposal an operation touched
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalBundle {
    pub role: Proposal,
    pub functions: Vec<Proposal>,
    pub child_roles: Vec<Proposal>,
}

impl ProposalBundle {
    pub fn new(role: Proposal) -> Self {
        Self {
            role,
            functions: Vec::new(),
            child_roles: Vec::new(),
        }
    }

    /// Files a relation proposal under its kind
    pub fn push_relation(&mut self, proposal: Proposal) {
        match proposal.subject {
            ProposalSubject::RoleChildRole { .. } => self.child_roles.push(proposal),
            _ => self.functions.push(proposal),
        }
    }
}

/// Every ledger row a reviewer must evaluate for the current wave of a role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleTransients {
    pub role: Vec<Proposal>,
    pub functions: Vec<Proposal>,
    pub child_roles: Vec<Proposal>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_keys_are_per_relation() {
        let role_id = Uuid::new_v4();
        let function_id = Uuid::new_v4();

        let subject = ProposalSubject::RoleFunction {
            role_id,
            function_id,
        };

        assert_eq!(subject.key(), SubjectKey::RoleFunction(role_id, function_id));
        assert_eq!(subject.role_id(), role_id);
        assert_ne!(subject.key(), SubjectKey::RoleChildRole(role_id, function_id));
    }

    #[test]
    fn test_state_text_round_trips() {
        for state in [
            ProposalState::Captured,
            ProposalState::Approved,
            ProposalState::Released,
            ProposalState::Declined,
        ] {
            assert_eq!(state.as_str().parse::<ProposalState>(), Ok(state));
        }
        assert!("pending".parse::<ProposalState>().is_err());
    }

    #[test]
    fn test_subject_serializes_with_kind_tag() {
        let subject = ProposalSubject::RoleChildRole {
            parent_role_id: Uuid::nil(),
            child_role_id: Uuid::nil(),
        };

        let json = serde_json::to_value(&subject).unwrap();
        assert_eq!(json["kind"], "roleChildRole");
        assert!(json.get("parentRoleId").is_some());
    }
}
