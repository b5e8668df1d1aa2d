//! # Domain Value Objects
//!
//! Immutable value types that represent domain concepts without identity.
//!
//! ## Value Objects
//!
//! - **ChatId / UserId / MessageId**: backend-assigned identifiers
//! - **Credential**: opaque bearer token, redacted in debug output
//! - **Topic / Destination**: wire-level naming contract

mod credential;
mod ids;
mod topic;

pub use credential::*;
pub use ids::*;
pub use topic::*;
