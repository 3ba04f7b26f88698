//! Maker-checker governance of the role graph
//!
//! Every change to a role, its granted functions or its child roles is held as
//! a proposal until enough distinct principals approve it.

pub mod composition;
pub mod models;
pub mod orchestrator;
pub mod release;
pub mod state_machine;

pub use models::{ProposalBundle, Role, RoleTransients};
pub use orchestrator::RoleGovernance;
