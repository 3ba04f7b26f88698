//! Authentication of the acting principal
//!
//! Requests carry a Bearer JWT whose `sub` claim names the principal that
//! makes, approves or declines a proposal. Tokens are issued elsewhere.

mod jwt;
mod middleware;

pub use jwt::{Claims, JwtDecoder};
pub use middleware::auth_middleware;
