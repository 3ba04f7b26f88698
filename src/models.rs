//! Data models and DTOs (Data Transfer Objects)
//!
//! Request/response structures used by the HTTP API. Domain types live in
//! `governance::models`.

use crate::governance::models::{Role, RoleSubmit};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Desired state of a role plus the approval threshold for this change
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequest {
    #[validate(length(min = 1, max = 255, message = "Role name must be between 1 and 255 characters"))]
    pub name: String,

    #[validate(length(max = 1024, message = "Description must be at most 1024 characters"))]
    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub sub_realm_id: Option<Uuid>,

    #[serde(default)]
    pub function_ids: Vec<Uuid>,

    #[serde(default)]
    pub child_role_ids: Vec<Uuid>,

    pub required_approvals: u32,
}

impl RoleRequest {
    /// Split into the governed submission and its threshold
    pub fn into_submit(self) -> (RoleSubmit, u32) {
        let submit = RoleSubmit {
            name: self.name,
            description: self.description,
            sub_realm_id: self.sub_realm_id,
            function_ids: self.function_ids,
            child_role_ids: self.child_role_ids,
        };
        (submit, self.required_approvals)
    }
}

/// Approval threshold, as a JSON body or a query string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdParams {
    pub required_approvals: u32,
}

/// Response containing the live roles
#[derive(Debug, Serialize)]
pub struct RoleListResponse {
    pub roles: Vec<Role>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_request_defaults_and_validation() {
        let request: RoleRequest =
            serde_json::from_str(r#"{"name": "auditor", "requiredApprovals": 2}"#).unwrap();
        assert!(request.validate().is_ok());

        let (submit, required) = request.into_submit();
        assert_eq!(required, 2);
        assert!(submit.function_ids.is_empty());
        assert!(submit.child_role_ids.is_empty());
        assert_eq!(submit.sub_realm_id, None);

        let empty: RoleRequest =
            serde_json::from_str(r#"{"name": "", "requiredApprovals": 0}"#).unwrap();
        assert!(empty.validate().is_err());
    }

    #[test]
    fn test_role_request_requires_threshold() {
        let missing = serde_json::from_str::<RoleRequest>(r#"{"name": "auditor"}"#);
        assert!(missing.is_err());
    }
}
