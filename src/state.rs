//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::auth::JwtDecoder;
use crate::governance::RoleGovernance;
use crate::store::GovernanceStore;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState<S: GovernanceStore> {
    /// Maker-checker workflow over the configured store
    pub governance: RoleGovernance<S>,

    /// Validates Bearer tokens carrying the acting principal
    pub jwt: JwtDecoder,
}

impl<S: GovernanceStore> AppState<S> {
    pub fn new(store: S, jwt_secret: &str) -> Self {
        Self {
            governance: RoleGovernance::new(store),
            jwt: JwtDecoder::new(jwt_secret),
        }
    }
}

/// Type alias for shared state
pub type SharedState<S> = Arc<AppState<S>>;
