//! The provider facade handed to the host identity framework.

use std::sync::Arc;

use identity_core::{CacheStats, Result};
use secrecy::SecretString;
use tracing::info;

use crate::cache::{DualLayerCache, LookupBy};
use crate::config::ProviderConfig;
use crate::connection::{LdapConnector, RealLdapConnector};
use crate::filter::SearchCriteria;
use crate::groups::GroupResolver;
use crate::login::LoginVerifier;
use crate::principal::{MemberRef, Principal, PrincipalKind};
use crate::resolver::EntryResolver;

/// One configured LDAP directory.
///
/// Cloning is cheap; clones share the cache and the configuration.
#[derive(Debug, Clone)]
pub struct LdapProvider {
    config: Arc<ProviderConfig>,
    resolver: Arc<EntryResolver>,
    groups: GroupResolver,
    login: LoginVerifier,
}

impl LdapProvider {
    /// Creates a provider talking to the directory through `ldap3`, with
    /// in-memory caches sized from the configuration.
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        let users: Arc<dyn LdapConnector> =
            Arc::new(RealLdapConnector::new(config.user().connection.clone()));
        let groups: Arc<dyn LdapConnector> =
            Arc::new(RealLdapConnector::new(config.group().connection.clone()));
        let cache = Arc::new(DualLayerCache::in_memory(config.key(), config.cache()));
        Self::with_parts(config, users, groups, cache)
    }

    /// Creates a provider from explicit connectors and cache.
    #[must_use]
    pub fn with_parts(
        config: ProviderConfig,
        user_connector: Arc<dyn LdapConnector>,
        group_connector: Arc<dyn LdapConnector>,
        cache: Arc<DualLayerCache>,
    ) -> Self {
        let resolver = Arc::new(EntryResolver::new(
            &config,
            user_connector,
            group_connector,
            cache,
        ));
        let groups = GroupResolver::new(resolver.clone(), config.group());
        let login = LoginVerifier::new(resolver.clone());
        info!(
            provider = %config.key(),
            priority = config.priority(),
            url = %config.user().connection.url(),
            pooled = config.user().connection.pooled(),
            "ldap provider ready"
        );
        Self {
            config: Arc::new(config),
            resolver,
            groups,
            login,
        }
    }

    /// Provider key, the prefix of every logical key this provider issues.
    #[must_use]
    pub fn key(&self) -> &str {
        self.config.key()
    }

    /// Ordering among providers; higher is tried first.
    #[must_use]
    pub fn priority(&self) -> i32 {
        self.config.priority()
    }

    /// Configuration the provider was built from.
    #[must_use]
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Whether `key` carries this provider's prefix.
    #[must_use]
    pub fn owns_key(&self, key: &str) -> bool {
        LookupBy::of_identifier(self.key(), key) == LookupBy::Key
    }

    /// Looks a user up by logical key.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_user_by_key(&self, key: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::User, LookupBy::Key, key).await
    }

    /// Looks a user up by login name.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_user_by_name(&self, name: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::User, LookupBy::Name, name).await
    }

    /// Looks a user up by DN.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_user_by_dn(&self, dn: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::User, LookupBy::Dn, dn).await
    }

    /// Looks a group up by logical key.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_group_by_key(&self, key: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::Group, LookupBy::Key, key).await
    }

    /// Looks a group up by name.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_group_by_name(&self, name: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::Group, LookupBy::Name, name).await
    }

    /// Looks a group up by DN.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_group_by_dn(&self, dn: &str) -> Result<Option<Arc<Principal>>> {
        self.resolver.lookup(PrincipalKind::Group, LookupBy::Dn, dn).await
    }

    /// Looks a logical key up as a user, then as a group.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn lookup_by_key(&self, key: &str) -> Result<Option<Arc<Principal>>> {
        if let Some(user) = self.lookup_user_by_key(key).await? {
            return Ok(Some(user));
        }
        self.lookup_group_by_key(key).await
    }

    /// Users matching `criteria`, at most the user count limit.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn search_users(&self, criteria: &SearchCriteria) -> Result<Vec<Arc<Principal>>> {
        self.resolver.search(PrincipalKind::User, criteria).await
    }

    /// Groups matching `criteria`, at most the group count limit.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn search_groups(&self, criteria: &SearchCriteria) -> Result<Vec<Arc<Principal>>> {
        self.resolver.search(PrincipalKind::Group, criteria).await
    }

    /// See [`LoginVerifier::login`].
    pub async fn login(&self, identifier: &str, credential: &SecretString) -> bool {
        self.login.login(identifier, credential).await
    }

    /// See [`LoginVerifier::login_dn`].
    pub async fn login_dn(&self, dn: &str, credential: &SecretString) -> bool {
        self.login.login_dn(dn, credential).await
    }

    /// See [`LoginVerifier::authenticate`].
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn authenticate(
        &self,
        identifier: &str,
        credential: &SecretString,
    ) -> Result<Option<Arc<Principal>>> {
        self.login.authenticate(identifier, credential).await
    }

    /// See [`LoginVerifier::authenticate_dn`].
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn authenticate_dn(
        &self,
        dn: &str,
        credential: &SecretString,
    ) -> Result<Option<Arc<Principal>>> {
        self.login.authenticate_dn(dn, credential).await
    }

    /// The named group with its members loaded.
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn get_group_members(&self, group_name: &str) -> Result<Option<Arc<Principal>>> {
        self.groups.get_group_members(group_name).await
    }

    /// See [`GroupResolver::is_member`].
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn is_member(&self, member: &Principal, group: &Arc<Principal>) -> Result<bool> {
        self.groups.is_member(member, group).await
    }

    /// See [`GroupResolver::user_memberships`].
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn user_memberships(&self, user: &Principal) -> Result<Vec<Arc<Principal>>> {
        self.groups.user_memberships(user).await
    }

    /// See [`GroupResolver::recursive_user_members`].
    ///
    /// # Errors
    ///
    /// Returns the transient error when the directory cannot answer.
    pub async fn recursive_user_members(&self, group: &Arc<Principal>) -> Result<Vec<MemberRef>> {
        self.groups.recursive_user_members(group).await
    }

    /// Drops cached state for a user given by key, DN or name.
    pub fn invalidate_user(&self, id: &str) {
        self.invalidate(PrincipalKind::User, id);
    }

    /// Drops cached state for a group given by key, DN or name.
    pub fn invalidate_group(&self, id: &str) {
        self.invalidate(PrincipalKind::Group, id);
    }

    /// Drops everything this provider cached.
    pub fn flush_cache(&self) {
        self.resolver.cache().flush();
    }

    /// Cache counters.
    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.resolver.cache().stats()
    }

    fn invalidate(&self, kind: PrincipalKind, id: &str) {
        let by = LookupBy::of_identifier(self.key(), id);
        self.resolver.cache().invalidate(kind, by, id);
    }
}
