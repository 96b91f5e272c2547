//! Directory credentials.
//!
//! Service credentials are used for public (search) contexts. Login credentials
//! supplied by end users are carried as [`SecretString`] and never logged.

use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;

/// Service account used to bind public directory contexts.
///
/// An empty bind DN means the provider searches anonymously.
#[derive(Debug, Serialize)]
pub struct ServiceCredentials {
    /// Bind distinguished name
    pub bind_dn: String,

    /// Bind password
    #[serde(skip_serializing)]
    pub bind_password: SecretString,
}

impl ServiceCredentials {
    /// Create new service credentials.
    #[must_use]
    pub fn new(bind_dn: impl Into<String>, bind_password: SecretString) -> Self {
        Self {
            bind_dn: bind_dn.into(),
            bind_password,
        }
    }

    /// Credentials for anonymous searches.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::new("", SecretString::from(String::new()))
    }

    /// Get the bind DN.
    #[must_use]
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Get the bind password.
    #[must_use]
    pub fn bind_password(&self) -> &str {
        self.bind_password.expose_secret()
    }

    /// Returns true when no service account is configured.
    #[must_use]
    pub fn is_anonymous(&self) -> bool {
        self.bind_dn.trim().is_empty()
    }
}

/// Returns true if the credential is empty.
///
/// Directories commonly treat a bind with an empty password as an anonymous
/// bind that succeeds, so an empty credential must never reach a bind.
#[must_use]
pub fn is_blank(credential: &SecretString) -> bool {
    credential.expose_secret().is_empty()
}
