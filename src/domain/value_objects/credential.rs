//! Bearer credential supplied by the authentication collaborator.

use std::fmt;

/// Opaque bearer token presented when a session connects.
///
/// The raw value never appears in `Debug` output so it cannot leak into logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw bearer token.
    pub fn bearer(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token value.
    pub fn token(&self) -> &str {
        &self.0
    }

    /// Value for an `Authorization` header.
    pub fn authorization_header(&self) -> String {
        format!("Bearer {}", self.0)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}
