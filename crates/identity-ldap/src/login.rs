//! Credential verification through private, user-bound contexts.

use std::sync::Arc;

use identity_core::credentials::is_blank;
use identity_core::{Error, Result};
use secrecy::SecretString;
use tracing::{debug, info, warn};

use crate::cache::LookupBy;
use crate::principal::{Principal, PrincipalKind};
use crate::resolver::EntryResolver;

/// Verifies end-user credentials by binding as the user.
///
/// Neither credentials nor outcomes are cached; every call binds.
#[derive(Debug, Clone)]
pub struct LoginVerifier {
    resolver: Arc<EntryResolver>,
}

impl LoginVerifier {
    /// Creates a verifier resolving identifiers through `resolver`.
    #[must_use]
    pub fn new(resolver: Arc<EntryResolver>) -> Self {
        Self { resolver }
    }

    /// Returns true when `credential` is valid for the user behind `identifier`.
    ///
    /// The identifier may be a logical key (`{ldap}alice`), a DN or a login
    /// name. Every failure, transient or not, yields `false`.
    pub async fn login(&self, identifier: &str, credential: &SecretString) -> bool {
        match self.authenticate(identifier, credential).await {
            Ok(user) => user.is_some(),
            Err(err) => {
                warn!(
                    provider = %self.resolver.provider_key(),
                    identifier = %identifier,
                    error = %err,
                    "login failed, directory unavailable"
                );
                false
            }
        }
    }

    /// Returns true when `credential` binds as `dn`.
    pub async fn login_dn(&self, dn: &str, credential: &SecretString) -> bool {
        if is_blank(credential) {
            debug!(
                provider = %self.resolver.provider_key(),
                dn = %dn,
                "rejecting empty credential"
            );
            return false;
        }
        match self.verify(dn, credential).await {
            Ok(verified) => verified,
            Err(err) => {
                warn!(
                    provider = %self.resolver.provider_key(),
                    dn = %dn,
                    error = %err,
                    "login failed, directory unavailable"
                );
                false
            }
        }
    }

    /// Verifies the credential and returns the authenticated user.
    ///
    /// `Ok(None)` covers blank credentials, unknown identifiers and refused
    /// binds.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn authenticate(
        &self,
        identifier: &str,
        credential: &SecretString,
    ) -> Result<Option<Arc<Principal>>> {
        let identifier = identifier.trim();
        if is_blank(credential) {
            debug!(
                provider = %self.resolver.provider_key(),
                identifier = %identifier,
                "rejecting empty credential"
            );
            return Ok(None);
        }

        let by = LookupBy::of_identifier(self.resolver.provider_key(), identifier);
        if by == LookupBy::Dn {
            return self.authenticate_dn(identifier, credential).await;
        }

        let Some(user) = self.resolver.lookup(PrincipalKind::User, by, identifier).await? else {
            info!(
                provider = %self.resolver.provider_key(),
                identifier = %identifier,
                "login for unknown user"
            );
            return Ok(None);
        };

        Ok(self
            .verify(user.dn().as_str(), credential)
            .await?
            .then_some(user))
    }

    /// Verifies the credential against `dn` and resolves the bound user.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn authenticate_dn(
        &self,
        dn: &str,
        credential: &SecretString,
    ) -> Result<Option<Arc<Principal>>> {
        if is_blank(credential) || !self.verify(dn, credential).await? {
            return Ok(None);
        }
        self.resolver.lookup(PrincipalKind::User, LookupBy::Dn, dn).await
    }

    async fn verify(&self, dn: &str, credential: &SecretString) -> Result<bool> {
        match self
            .resolver
            .user_connection()
            .verify_bind(dn, credential)
            .await
        {
            Ok(()) => {
                debug!(provider = %self.resolver.provider_key(), dn = %dn, "credential verified");
                Ok(true)
            }
            Err(Error::BindFailed(message) | Error::NotFound(message)) => {
                info!(
                    provider = %self.resolver.provider_key(),
                    dn = %dn,
                    reason = %message,
                    "credential rejected"
                );
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{entry, resolver_with, FakeDirectory};

    const ALICE_DN: &str = "cn=alice,ou=People,dc=example,dc=com";

    fn directory() -> FakeDirectory {
        FakeDirectory::new()
            .with_entry(entry(
                ALICE_DN,
                &[("objectClass", vec!["person"]), ("cn", vec!["alice", "alice.smith"])],
            ))
            .with_account(ALICE_DN, "wonderland")
    }

    fn verifier(directory: &FakeDirectory) -> LoginVerifier {
        LoginVerifier::new(Arc::new(resolver_with(directory)))
    }

    fn secret(value: &str) -> SecretString {
        SecretString::from(value.to_string())
    }

    #[tokio::test]
    async fn empty_credential_never_binds() {
        let directory = directory();
        let verifier = verifier(&directory);

        assert!(!verifier.login("alice", &secret("")).await);
        assert!(!verifier.login_dn(ALICE_DN, &secret("")).await);
        assert_eq!(directory.bind_count(), 0);
        assert_eq!(directory.connect_count(), 0);
    }

    #[tokio::test]
    async fn login_by_name_key_and_dn() {
        let directory = directory();
        let verifier = verifier(&directory);

        assert!(verifier.login("alice", &secret("wonderland")).await);
        assert!(verifier.login("{ldap}alice", &secret("wonderland")).await);
        assert!(verifier.login(ALICE_DN, &secret("wonderland")).await);
        assert!(verifier.login_dn(ALICE_DN, &secret("wonderland")).await);

        assert!(!verifier.login("alice", &secret("looking-glass")).await);
        assert!(!verifier.login("{corp}alice", &secret("wonderland")).await);
        assert!(!verifier.login("mallory", &secret("wonderland")).await);
    }

    #[tokio::test]
    async fn multi_valued_key_attribute_logs_in_with_first_value() {
        let directory = directory();
        let verifier = verifier(&directory);

        let user = verifier
            .authenticate("alice.smith", &secret("wonderland"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(user.name(), "alice");
        assert_eq!(user.key(), "{ldap}alice");
    }

    #[tokio::test]
    async fn outcomes_are_not_cached() {
        let directory = directory();
        let verifier = verifier(&directory);

        assert!(verifier.login("alice", &secret("wonderland")).await);
        assert!(verifier.login("alice", &secret("wonderland")).await);
        // One service bind for the lookup, then one user bind per login.
        assert_eq!(directory.bind_count(), 3);
        assert_eq!(directory.connect_count(), directory.unbind_count());
    }

    #[tokio::test]
    async fn transient_failure_is_false_and_error_from_authenticate() {
        let directory = directory();
        let verifier = verifier(&directory);
        directory.fail_searches(Error::ServiceUnavailable("busy".to_string()));

        assert!(!verifier.login("alice", &secret("wonderland")).await);
        assert!(verifier
            .authenticate("alice", &secret("wonderland"))
            .await
            .unwrap_err()
            .is_transient());
    }
}
